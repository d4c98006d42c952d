pub mod camera;
pub mod common;
pub mod config;
pub mod controller;
pub mod error;
pub mod input;
pub mod loader;
pub mod matrix;
pub mod ply;
pub mod renderer;
pub mod sorter;
pub mod structures;
pub mod texture;
pub mod viewer;

cfg_if::cfg_if! {
    if #[cfg(feature = "glow")] {
        pub mod gl;
        pub use gl::GlDevice;
    }
}

pub use camera::Camera;
pub use config::ViewerConfig;
pub use controller::CameraController;
pub use error::{Result, ViewerError};
pub use input::{GamepadState, InputEvent, Key};
pub use loader::{load_bytes, load_stream, LoadStatus, LoadSummary, SplatSink};
pub use ply::convert_ply;
pub use renderer::{GpuDevice, Renderer};
pub use sorter::{SorterRequest, SorterResponse, SorterWorker};
pub use structures::{SplatFormat, SplatRecord, RECORD_SIZE};
pub use viewer::{
    FrameClock, IntervalClock, LoadSink, Viewer, ViewerCommand, ViewerHandle, ViewerObserver,
};

#[cfg(feature = "http")]
pub use loader::fetch;
