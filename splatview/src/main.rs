use clap::{ArgGroup, Parser};
use glam::{Mat4, Vec2};
use splatview_lib::renderer::GpuDevice;
use splatview_lib::texture::SplatTexture;
use splatview_lib::{
    convert_ply, load_bytes, IntervalClock, LoadSummary, SplatFormat, Viewer, ViewerCommand,
    ViewerConfig, ViewerObserver, RECORD_SIZE,
};
use std::error::Error;
use std::fs;
use std::process;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "Gaussian Splat Viewer",
    version = "0.1",
    author = "Denis Avvakumov",
    about = "Converts PLY splats and streams splat scenes through a headless viewer"
)]
#[command(group(
    ArgGroup::new("mode").required(true).args(&["convert", "stream"])
))]
struct Cli {
    #[arg(short = 'c', long = "convert", help = "Convert a PLY file into .splat records.")]
    convert: bool,

    #[arg(
        short = 's',
        long = "stream",
        help = "Stream a local file or an http(s) URL through a headless viewer."
    )]
    stream: bool,

    #[arg(
        short = 'i',
        long = "input",
        value_name = "INPUT",
        required = true,
        help = "Path or URL of the input scene."
    )]
    input: String,

    #[arg(
        short = 'o',
        long = "output",
        value_name = "OUTPUT",
        help = "Where to write converted records. Required with --convert."
    )]
    output: Option<String>,

    #[arg(long = "config", value_name = "CONFIG", help = "Viewer settings as JSON.")]
    config: Option<String>,

    #[arg(long = "cameras", value_name = "CAMERAS", help = "Camera presets as JSON.")]
    cameras: Option<String>,

    #[arg(
        long = "view",
        value_name = "FRAGMENT",
        help = "Start from a saved view, e.g. '#[1,0,0,0,...]'."
    )]
    view: Option<String>,

    #[arg(
        long = "fps",
        value_name = "FPS",
        default_value = "60",
        help = "Frame rate of the headless frame loop."
    )]
    fps: u32,

    #[arg(long = "print-config", help = "Print the effective viewer settings and exit.")]
    print_config: bool,

    #[arg(short = 'v', long = "verbose", help = "Log sorter and loader activity.")]
    verbose: bool,
}

/// Accepts every upload and counts frames.
#[derive(Debug, Default)]
struct HeadlessDevice {
    frames: u64,
    instances: u32,
}

impl GpuDevice for HeadlessDevice {
    fn link_program(&mut self, _vertex: &str, _fragment: &str) -> splatview_lib::Result<()> {
        Ok(())
    }

    fn configure_pipeline(&mut self) -> splatview_lib::Result<()> {
        Ok(())
    }

    fn set_viewport(&mut self, _width: u32, _height: u32) {}

    fn set_projection(&mut self, _projection: &Mat4, _focal: Vec2, _viewport: Vec2) {}

    fn set_view(&mut self, _view: &Mat4) {}

    fn upload_texture(&mut self, texture: &SplatTexture) {
        debug!("texture {}x{}", texture.width, texture.height);
    }

    fn upload_indices(&mut self, _indices: &[u32]) {}

    fn clear(&mut self, _color: [f32; 4]) {}

    fn draw_instanced(&mut self, instances: u32) {
        self.frames += 1;
        self.instances = instances;
    }
}

struct Report {
    started: Instant,
    output: Option<String>,
    cancel: Option<CancellationToken>,
    failed: bool,
}

impl Report {
    fn stop(&self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }
}

impl ViewerObserver for Report {
    fn on_progress(&mut self, percent: f32) {
        info!("progress {:.1}%", percent);
        if percent >= 100.0 {
            println!("Loaded in {} ms", self.started.elapsed().as_millis());
            self.stop();
        }
    }

    fn on_loaded(&mut self) {
        println!(
            "First splats after {} ms",
            self.started.elapsed().as_millis()
        );
    }

    fn on_error(&mut self, message: &str) {
        eprintln!("Error: {}", message);
        self.failed = true;
        self.stop();
    }

    fn on_converted(&mut self, buffer: &[u8], record_count: usize) {
        let Some(output) = &self.output else { return };
        match fs::write(output, buffer) {
            Ok(()) => println!("Saved {} records to '{}'.", record_count, output),
            Err(e) => error!("writing '{}' failed: {}", output, e),
        }
    }
}

fn read_config(path: Option<&str>) -> Result<ViewerConfig, Box<dyn Error + Send + Sync>> {
    match path {
        Some(path) => Ok(ViewerConfig::from_json(&fs::read_to_string(path)?)?),
        None => Ok(ViewerConfig::default()),
    }
}

fn run_convert(cli: &Cli) -> Result<(), Box<dyn Error + Send + Sync>> {
    let Some(output) = &cli.output else {
        eprintln!("Error: --output (-o) is required with --convert (-c).");
        process::exit(1);
    };
    let raw_data = fs::read(&cli.input).unwrap_or_else(|e| {
        eprintln!("Error reading input file {}: {}", cli.input, e);
        process::exit(1);
    });

    println!("Mode: Conversion\nInput: {} | Output: {}", cli.input, output);
    let start = Instant::now();
    let records = convert_ply(&raw_data)?;
    println!(
        "Conversion Time: {} ms ({} records)",
        start.elapsed().as_millis(),
        records.len() / RECORD_SIZE
    );

    fs::write(output, &records).unwrap_or_else(|e| {
        eprintln!("Error writing output '{}': {}", output, e);
        process::exit(1);
    });
    println!("Successfully wrote to '{}'.", output);
    Ok(())
}

/// An empty native scene never reports progress, so the loop is stopped from here.
fn loader_done(summary: &LoadSummary, cancel: &CancellationToken) {
    info!("read {} bytes ({:?})", summary.bytes_read, summary.format);
    if summary.format == SplatFormat::Native && summary.record_count == 0 {
        println!("No splats in input.");
        cancel.cancel();
    }
}

async fn run_stream(cli: &Cli, config: ViewerConfig) -> Result<(), Box<dyn Error + Send + Sync>> {
    let report = Report {
        started: Instant::now(),
        output: cli.output.clone(),
        cancel: None,
        failed: false,
    };
    let mut viewer = Viewer::start(config, Some(HeadlessDevice::default()), report)?;
    let cancel = viewer.cancellation_token();
    viewer.observer_mut().cancel = Some(cancel.clone());

    viewer.apply(ViewerCommand::Resize {
        width: 1280.0,
        height: 720.0,
        device_pixel_ratio: 1.0,
    })?;
    if let Some(path) = &cli.cameras {
        viewer.apply(ViewerCommand::LoadCameras(fs::read_to_string(path)?))?;
    }
    if let Some(fragment) = &cli.view {
        viewer.apply(ViewerCommand::RestoreView(fragment.clone()))?;
    }

    println!("Mode: Stream\nInput: {}", cli.input);
    let mut sink = viewer.load_sink();
    let loader = if cli.input.starts_with("http://") || cli.input.starts_with("https://") {
        let url = cli.input.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => info!("fetch cancelled"),
                result = splatview_lib::fetch(&url, &mut sink) => {
                    // Failures already reached the viewer as a load status.
                    if let Ok(summary) = result {
                        loader_done(&summary, &cancel);
                    }
                }
            }
        })
    } else {
        let bytes = fs::read(&cli.input)?;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Ok(summary) = load_bytes(bytes, &mut sink) {
                loader_done(&summary, &cancel);
            }
        })
    };

    let period = Duration::from_secs_f64(1.0 / f64::from(cli.fps.max(1)));
    let mut clock = IntervalClock::new(period);
    let outcome = viewer.run_frame_loop(&mut clock).await;
    cancel.cancel();
    loader.await?;
    outcome?;

    let device = viewer.renderer().device();
    println!(
        "Frames: {} | Splats: {}",
        device.map_or(0, |d| d.frames),
        device.map_or(0, |d| d.instances)
    );
    if viewer.observer().failed {
        process::exit(1);
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = read_config(cli.config.as_deref())?;
    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    if cli.convert {
        return run_convert(&cli);
    }
    debug_assert!(cli.stream);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run_stream(&cli, config))
}
