//! One viewer instance: a renderer, a camera controller and a private sorter worker.
//!
//! The host drives it either frame by frame through [`Viewer::frame`] or with
//! [`Viewer::run_frame_loop`]. While the loop runs, input and resize events reach the viewer
//! through a [`ViewerHandle`]; loaders feed it through a [`LoadSink`].

use std::future::Future;
use std::time::Duration;

use glam::Mat4;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ViewerConfig;
use crate::controller::{CameraController, ControllerEvent};
use crate::error::{Result, ViewerError};
use crate::input::{GamepadState, InputEvent};
use crate::loader::{load_bytes, LoadStatus, SplatSink};
use crate::renderer::{GpuDevice, Renderer};
use crate::sorter::{SorterHandle, SorterRequest, SorterResponse, SorterWorker};
use crate::structures::SplatFormat;

/// Host-side callbacks. Every method has an empty default.
pub trait ViewerObserver {
    /// 0 to 100, non-decreasing within one load.
    fn on_progress(&mut self, _percent: f32) {}

    /// Fired once, the first time sorted splats are available.
    fn on_loaded(&mut self) {}

    fn on_error(&mut self, _message: &str) {}

    fn on_carousel_changed(&mut self, _enabled: bool) {}

    /// A shareable `#[...]` link for the current view.
    fn on_view_saved(&mut self, _fragment: &str) {}

    /// Converted native records for a dropped PLY file, offered for saving.
    fn on_converted(&mut self, _buffer: &[u8], _record_count: usize) {}
}

impl ViewerObserver for () {}

impl<T: ViewerObserver + ?Sized> ViewerObserver for &mut T {
    fn on_progress(&mut self, percent: f32) {
        (**self).on_progress(percent)
    }

    fn on_loaded(&mut self) {
        (**self).on_loaded()
    }

    fn on_error(&mut self, message: &str) {
        (**self).on_error(message)
    }

    fn on_carousel_changed(&mut self, enabled: bool) {
        (**self).on_carousel_changed(enabled)
    }

    fn on_view_saved(&mut self, fragment: &str) {
        (**self).on_view_saved(fragment)
    }

    fn on_converted(&mut self, buffer: &[u8], record_count: usize) {
        (**self).on_converted(buffer, record_count)
    }
}

/// The host's display-refresh primitive.
pub trait FrameClock {
    /// Resolves at the next display tick with a timestamp in milliseconds.
    fn next_frame(&mut self) -> impl Future<Output = f64>;

    fn gamepads(&mut self) -> Vec<GamepadState> {
        Vec::new()
    }
}

/// Fixed-rate clock for headless use.
#[derive(Debug)]
pub struct IntervalClock {
    interval: Interval,
    origin: Instant,
}

impl IntervalClock {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            interval,
            origin: Instant::now(),
        }
    }
}

impl FrameClock for IntervalClock {
    async fn next_frame(&mut self) -> f64 {
        self.interval.tick().await;
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewerCommand {
    Input(InputEvent),
    Resize {
        width: f32,
        height: f32,
        device_pixel_ratio: f32,
    },
    /// A location fragment such as `#[1,0,0,...]`.
    RestoreView(String),
    /// A camera preset JSON document.
    LoadCameras(String),
    SetCarousel(bool),
    /// A file dropped onto the viewer.
    LoadBytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct ViewerHandle {
    commands: UnboundedSender<ViewerCommand>,
}

impl ViewerHandle {
    pub fn send(&self, command: ViewerCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| ViewerError::Closed)
    }

    pub fn input(&self, event: InputEvent) -> Result<()> {
        self.send(ViewerCommand::Input(event))
    }
}

/// Where a loader delivers splat data for one viewer.
#[derive(Debug, Clone)]
pub struct LoadSink {
    sorter: SorterHandle,
    status: UnboundedSender<LoadStatus>,
}

impl SplatSink for LoadSink {
    fn submit(&mut self, request: SorterRequest) -> Result<()> {
        self.sorter.send(request)
    }

    fn report(&mut self, status: LoadStatus) {
        let _ = self.status.send(status);
    }

    fn accepts_records(&self) -> bool {
        self.sorter.accepts_records()
    }
}

pub struct Viewer<D, O> {
    renderer: Renderer<D>,
    controller: CameraController,
    worker: SorterWorker,
    observer: O,
    commands: UnboundedReceiver<ViewerCommand>,
    command_tx: UnboundedSender<ViewerCommand>,
    statuses: UnboundedReceiver<LoadStatus>,
    status_tx: UnboundedSender<LoadStatus>,
    cancel: CancellationToken,
    window: Option<(f32, f32, f32)>,
    load_format: Option<SplatFormat>,
    texture_splats: usize,
    last_view_proj: Option<Mat4>,
    last_progress: Option<f32>,
    loaded: bool,
}

impl<D: GpuDevice, O: ViewerObserver> Viewer<D, O> {
    /// Sets up the GPU pipeline and spawns the sorter. A failure is reported to `observer`
    /// once and returned; no frame will ever run.
    pub fn start(config: ViewerConfig, device: Option<D>, mut observer: O) -> Result<Self> {
        let mut renderer = Renderer::new(config.render.clone());
        let worker = renderer
            .setup(device)
            .and_then(|_| SorterWorker::spawn(config.sorter.clone()));
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                observer.on_error(&e.to_string());
                return Err(e);
            }
        };

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (status_tx, statuses) = mpsc::unbounded_channel();
        info!("viewer started");

        Ok(Self {
            renderer,
            controller: CameraController::new(config.controls),
            worker,
            observer,
            commands,
            command_tx,
            statuses,
            status_tx,
            cancel: CancellationToken::new(),
            window: None,
            load_format: None,
            texture_splats: 0,
            last_view_proj: None,
            last_progress: None,
            loaded: false,
        })
    }

    pub fn handle(&self) -> ViewerHandle {
        ViewerHandle {
            commands: self.command_tx.clone(),
        }
    }

    pub fn load_sink(&self) -> LoadSink {
        LoadSink {
            sorter: self.worker.handle(),
            status: self.status_tx.clone(),
        }
    }

    /// Cancelled when the viewer is torn down. Loaders should stop when it fires.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    pub fn controller(&self) -> &CameraController {
        &self.controller
    }

    pub fn renderer(&self) -> &Renderer<D> {
        &self.renderer
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.renderer.vertex_count()
    }

    pub fn apply(&mut self, command: ViewerCommand) -> Result<()> {
        match command {
            ViewerCommand::Input(event) => self.controller.handle(&event),
            ViewerCommand::Resize {
                width,
                height,
                device_pixel_ratio,
            } => {
                self.window = Some((width, height, device_pixel_ratio));
                self.resize()?;
            }
            ViewerCommand::RestoreView(fragment) => {
                if let Err(e) = self.controller.restore_view(&fragment) {
                    debug!("ignoring fragment {:?}: {}", fragment, e);
                }
            }
            ViewerCommand::LoadCameras(json) => {
                if let Err(e) = self.controller.load_cameras(&json) {
                    warn!("keeping current camera presets: {}", e);
                }
            }
            ViewerCommand::SetCarousel(enabled) => self.controller.set_carousel(enabled),
            ViewerCommand::LoadBytes(bytes) => {
                // Failures come back through the status channel.
                let _ = load_bytes(bytes, &mut self.load_sink());
            }
        }
        self.dispatch_controller_events()
    }

    fn resize(&mut self) -> Result<()> {
        if let Some((width, height, ratio)) = self.window {
            self.renderer
                .resize(self.controller.active_camera(), width, height, ratio)?;
            self.controller.set_viewport(width, height);
        }
        Ok(())
    }

    fn dispatch_controller_events(&mut self) -> Result<()> {
        for event in self.controller.drain_events() {
            match event {
                ControllerEvent::CarouselChanged(enabled) => {
                    self.observer.on_carousel_changed(enabled)
                }
                ControllerEvent::ViewSaved(fragment) => self.observer.on_view_saved(&fragment),
                ControllerEvent::CameraChanged => self.resize()?,
            }
        }
        Ok(())
    }

    fn drain_statuses(&mut self) -> Result<()> {
        while let Ok(status) = self.statuses.try_recv() {
            match status {
                LoadStatus::Started {
                    format,
                    expected_records,
                } => {
                    self.load_format = Some(format);
                    self.last_progress = None;
                    self.renderer.begin_load(expected_records);
                    self.resize()?;
                }
                LoadStatus::Progress { records } => debug!("{} records received", records),
                LoadStatus::Finished { records } => {
                    if self.load_format != Some(SplatFormat::Ply) {
                        self.renderer.finish_load(records);
                        self.resize()?;
                    }
                }
                LoadStatus::Failed(message) => {
                    error!("load failed: {}", message);
                    self.observer.on_error(&message);
                }
            }
        }
        Ok(())
    }

    /// Keeps only the newest texture and the newest order; intermediate results are dropped.
    fn drain_sorter(&mut self) -> Result<()> {
        let mut texture = None;
        let mut order = None;
        while let Some(response) = self.worker.try_recv() {
            match response {
                SorterResponse::Texture(t) => texture = Some(t),
                SorterResponse::DepthIndex {
                    indices,
                    vertex_count,
                } => order = Some((indices, vertex_count)),
                SorterResponse::Converted {
                    buffer,
                    record_count,
                    save,
                } => {
                    info!("converted PLY into {} records", record_count);
                    self.renderer.finish_load(record_count);
                    self.resize()?;
                    if save {
                        self.observer.on_converted(&buffer, record_count);
                    }
                }
                SorterResponse::ConversionFailed(message) => {
                    error!("PLY conversion failed: {}", message);
                    self.observer.on_error(&message);
                }
            }
        }

        if let Some(texture) = texture {
            self.texture_splats = texture.splat_count;
            self.renderer.upload_texture(&texture)?;
            if self.renderer.vertex_count() > self.texture_splats {
                self.renderer.upload_indices(&[], 0)?;
            }
        }
        if let Some((indices, vertex_count)) = order {
            self.renderer
                .upload_indices(&indices, vertex_count.min(self.texture_splats))?;
        }
        Ok(())
    }

    /// One display tick.
    pub fn frame(&mut self, now_ms: f64, gamepads: &[GamepadState]) -> Result<()> {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command)?;
        }
        self.drain_statuses()?;
        self.drain_sorter()?;

        let has_data = self.renderer.vertex_count() > 0;
        let view = self.controller.update(now_ms, has_data, gamepads);
        let view_proj = self.renderer.view_projection(&view);
        if self.last_view_proj != Some(view_proj) {
            self.worker.send(SorterRequest::View { view_proj })?;
            self.last_view_proj = Some(view_proj);
        }

        self.renderer.draw_frame(&view)?;

        if has_data && !self.loaded {
            self.loaded = true;
            info!("first splats on screen");
            self.observer.on_loaded();
        }
        if let Some(progress) = self.renderer.progress() {
            if self.last_progress != Some(progress) {
                self.last_progress = Some(progress);
                self.observer.on_progress(progress);
            }
        }
        self.dispatch_controller_events()
    }

    /// Runs until the viewer's cancellation token fires or a frame fails. A failure is
    /// reported to the observer before it is returned.
    pub async fn run_frame_loop<C: FrameClock>(&mut self, clock: &mut C) -> Result<()> {
        let cancel = self.cancel.clone();
        loop {
            let now = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("frame loop cancelled");
                    return Ok(());
                }
                now = clock.next_frame() => now,
            };
            let gamepads = clock.gamepads();
            if let Err(e) = self.frame(now, &gamepads) {
                error!("frame loop halted: {}", e);
                self.observer.on_error(&e.to_string());
                return Err(e);
            }
        }
    }

    /// Stops the frame loop and any loader watching the token. The worker is joined on drop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl<D, O> Drop for Viewer<D, O> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Key;
    use crate::loader::load_stream;
    use crate::renderer::tests::{Call, MockDevice};
    use crate::structures::{SplatRecord, RECORD_SIZE};
    use zerocopy::IntoBytes;

    #[derive(Debug, Default)]
    struct Recorder {
        progress: Vec<f32>,
        loaded: usize,
        errors: Vec<String>,
        carousel: Vec<bool>,
        saved: Vec<String>,
        converted: Vec<usize>,
    }

    impl ViewerObserver for Recorder {
        fn on_progress(&mut self, percent: f32) {
            self.progress.push(percent);
        }

        fn on_loaded(&mut self) {
            self.loaded += 1;
        }

        fn on_error(&mut self, message: &str) {
            self.errors.push(message.to_string());
        }

        fn on_carousel_changed(&mut self, enabled: bool) {
            self.carousel.push(enabled);
        }

        fn on_view_saved(&mut self, fragment: &str) {
            self.saved.push(fragment.to_string());
        }

        fn on_converted(&mut self, buffer: &[u8], record_count: usize) {
            assert_eq!(buffer.len(), record_count * RECORD_SIZE);
            self.converted.push(record_count);
        }
    }

    type TestViewer = Viewer<MockDevice, Recorder>;

    fn start() -> TestViewer {
        let mut viewer =
            Viewer::start(ViewerConfig::default(), Some(MockDevice::default()), Recorder::default())
                .unwrap();
        viewer
            .apply(ViewerCommand::Resize {
                width: 800.0,
                height: 600.0,
                device_pixel_ratio: 1.0,
            })
            .unwrap();
        viewer
    }

    fn records(n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n * RECORD_SIZE);
        for i in 0..n {
            let f = i as f32;
            let rec = SplatRecord::new(
                [(f * 0.37).sin() * 3.0, (f * 0.11).cos(), (f * 0.05).sin() * 5.0],
                [0.02, 0.03, 0.01],
                [200, 180, 160, 255],
                [1.0, 0.0, 0.0, 0.0],
            );
            out.extend_from_slice(rec.as_bytes());
        }
        out
    }

    async fn pump(viewer: &mut TestViewer, now: &mut f64, done: impl Fn(&TestViewer) -> bool) {
        for _ in 0..5_000 {
            *now += 16.0;
            viewer.frame(*now, &[]).unwrap();
            if done(viewer) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("viewer never reached the expected state");
    }

    #[tokio::test]
    async fn progressive_load_reports_once_and_monotonically() {
        let mut viewer = start();
        let mut now = 0.0;
        viewer.frame(now, &[]).unwrap();

        let data = records(10_000);
        let total = data.len();
        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Vec<u8>>>();
        let mut sink = viewer.load_sink();
        let load = tokio::spawn(async move { load_stream(total, rx, &mut sink).await });

        let mut counts = Vec::new();
        for (i, chunk) in data.chunks(2_000 * RECORD_SIZE).enumerate() {
            tx.unbounded_send(Ok(chunk.to_vec())).unwrap();
            let target = (i + 1) * 2_000;
            pump(&mut viewer, &mut now, |v| v.vertex_count() >= target).await;
            counts.push(viewer.vertex_count());
            assert_eq!(viewer.observer().loaded, 1);
        }
        drop(tx);
        let summary = load.await.unwrap().unwrap();
        assert_eq!(summary.record_count, 10_000);

        pump(&mut viewer, &mut now, |v| {
            v.observer().progress.last() == Some(&100.0)
        })
        .await;

        assert_eq!(counts, vec![2_000, 4_000, 6_000, 8_000, 10_000]);
        let rec = viewer.observer();
        assert_eq!(rec.loaded, 1);
        assert!(rec.errors.is_empty());
        assert!(rec.progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(rec.progress.iter().filter(|p| **p == 100.0).count(), 1);

        let draws = viewer.renderer().device().unwrap().calls.iter().rev().find_map(|c| match c {
            Call::Draw(n) => Some(*n),
            _ => None,
        });
        assert_eq!(draws, Some(10_000));
    }

    #[tokio::test]
    async fn dropped_ply_is_converted_and_offered() {
        let mut viewer = start();
        let mut now = 0.0;
        viewer.frame(now, &[]).unwrap();

        let mut ply = b"ply
format binary_little_endian 1.0
element vertex 2
property float x
property float y
property float z
end_header
"
        .to_vec();
        for f in [0.0f32, 0.0, 1.0, 0.5, 0.5, 2.0] {
            ply.extend_from_slice(&f.to_le_bytes());
        }
        viewer.handle().send(ViewerCommand::LoadBytes(ply)).unwrap();

        pump(&mut viewer, &mut now, |v| v.vertex_count() == 2).await;
        pump(&mut viewer, &mut now, |v| {
            v.observer().progress.last() == Some(&100.0)
        })
        .await;
        assert_eq!(viewer.observer().converted, vec![2]);
        assert!(viewer.observer().errors.is_empty());
    }

    #[tokio::test]
    async fn conversion_failure_reaches_the_host() {
        let mut viewer = start();
        let mut now = 0.0;
        viewer
            .apply(ViewerCommand::LoadBytes(b"ply\ngarbage".to_vec()))
            .unwrap();
        pump(&mut viewer, &mut now, |v| !v.observer().errors.is_empty()).await;
        assert_eq!(viewer.vertex_count(), 0);
        assert_eq!(viewer.observer().loaded, 0);
    }

    #[test]
    fn setup_failure_is_reported_once() {
        let mut recorder = Recorder::default();
        let result: Result<Viewer<MockDevice, &mut Recorder>> =
            Viewer::start(ViewerConfig::default(), None, &mut recorder);
        assert!(result.is_err());
        drop(result);
        assert_eq!(recorder.errors.len(), 1);
        assert!(recorder.errors[0].contains("WebGL2"));
    }

    #[test]
    fn controller_notifications_are_forwarded() {
        let mut viewer = start();
        viewer.apply(ViewerCommand::Input(InputEvent::KeyDown(Key::V))).unwrap();
        viewer.apply(ViewerCommand::Input(InputEvent::KeyDown(Key::P))).unwrap();
        viewer.apply(ViewerCommand::SetCarousel(true)).unwrap();
        let rec = viewer.observer();
        assert_eq!(rec.carousel, vec![false, true]);
        assert_eq!(rec.saved.len(), 1);
        assert!(rec.saved[0].starts_with("#["));
    }

    struct CountingClock {
        frames: u32,
        stop_after: u32,
        cancel: CancellationToken,
    }

    impl FrameClock for CountingClock {
        async fn next_frame(&mut self) -> f64 {
            self.frames += 1;
            if self.frames >= self.stop_after {
                self.cancel.cancel();
            }
            self.frames as f64 * 16.0
        }
    }

    #[tokio::test]
    async fn frame_loop_stops_on_cancel() {
        let mut viewer = start();
        let mut clock = CountingClock {
            frames: 0,
            stop_after: 3,
            cancel: viewer.cancellation_token(),
        };
        viewer.run_frame_loop(&mut clock).await.unwrap();
        assert_eq!(clock.frames, 3);
        assert!(viewer.observer().errors.is_empty());
    }
}
