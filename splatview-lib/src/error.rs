use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ViewerError>;

#[derive(Debug, Error)]
pub enum ViewerError {
    #[error("No GPU context available: {0}")]
    NoContext(String),

    #[error("Failed to compile {stage} shader: {log}")]
    ShaderCompile { stage: &'static str, log: String },

    #[error("Failed to link shader program: {0}")]
    ShaderLink(String),

    #[error("Renderer is not ready (state: {0})")]
    NotReady(&'static str),

    #[error("{status} Unable to load {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Response for {0} has no content-length; cannot bound the record count")]
    MissingContentLength(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stream delivered {received} bytes but announced {expected}")]
    LengthMismatch { expected: usize, received: usize },

    #[error("Failed to parse PLY data: {0}")]
    ParsePly(String),

    #[error("The PLY file contains no vertices.")]
    EmptyPly,

    #[error("Invalid camera presets: {0}")]
    InvalidCameras(String),

    #[error("Invalid view fragment: {0}")]
    InvalidFragment(String),

    #[error("Invalid viewer configuration: {0}")]
    Config(String),

    #[error("Sorter worker is gone")]
    WorkerGone,

    #[error("Viewer has shut down")]
    Closed,

    #[error("An I/O error occurred: {0}")]
    Io(#[from] io::Error),
}
