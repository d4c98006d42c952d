//! GPU side of the viewer.
//!
//! `Renderer` owns a [`GpuDevice`] and walks it through
//! `Uninitialized → ContextAcquired → ProgramLinked → Ready`. A failure on the way halts it
//! for good; there is no fallback path.

use glam::{Mat4, Vec2};
use tracing::{debug, error, info};

use crate::camera::Camera;
use crate::config::RenderConfig;
use crate::error::{Result, ViewerError};
use crate::matrix::{multiply, projection_matrix_with_planes};
use crate::texture::SplatTexture;

pub const VERTEX_SHADER: &str = include_str!("shaders/splat.vert");
pub const FRAGMENT_SHADER: &str = include_str!("shaders/splat.frag");

/// Corners of the instanced quad, drawn as a triangle fan.
pub const QUAD_VERTICES: [f32; 8] = [-2.0, -2.0, 2.0, -2.0, 2.0, 2.0, -2.0, 2.0];

/// What the renderer needs from a host graphics context.
pub trait GpuDevice {
    /// Compiles both stages and links them. Errors carry the info log.
    fn link_program(&mut self, vertex: &str, fragment: &str) -> Result<()>;

    /// Quad buffer, per-instance index attribute, splat texture, premultiplied "over"
    /// blending (`ONE, ONE_MINUS_SRC_ALPHA`) and no depth test.
    fn configure_pipeline(&mut self) -> Result<()>;

    fn set_viewport(&mut self, width: u32, height: u32);

    fn set_projection(&mut self, projection: &Mat4, focal: Vec2, viewport: Vec2);

    fn set_view(&mut self, view: &Mat4);

    fn upload_texture(&mut self, texture: &SplatTexture);

    fn upload_indices(&mut self, indices: &[u32]);

    fn clear(&mut self, color: [f32; 4]);

    fn draw_instanced(&mut self, instances: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    Uninitialized,
    ContextAcquired,
    ProgramLinked,
    Ready,
    Halted,
}

impl RenderState {
    fn name(self) -> &'static str {
        match self {
            RenderState::Uninitialized => "uninitialized",
            RenderState::ContextAcquired => "context-acquired",
            RenderState::ProgramLinked => "program-linked",
            RenderState::Ready => "ready",
            RenderState::Halted => "halted",
        }
    }
}

/// Canvas sizing chosen by the last resize.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub pixel_ratio: f32,
    pub focal: Vec2,
}

#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    total_records: usize,
    vertex_count: usize,
    finished: bool,
    reported: f32,
}

pub struct Renderer<D> {
    config: RenderConfig,
    device: Option<D>,
    state: RenderState,
    projection: Mat4,
    resolution: Option<Resolution>,
    progress: Progress,
}

impl<D: GpuDevice> Renderer<D> {
    pub fn new(config: RenderConfig) -> Self {
        Self {
            config,
            device: None,
            state: RenderState::Uninitialized,
            projection: Mat4::IDENTITY,
            resolution: None,
            progress: Progress::default(),
        }
    }

    #[inline]
    pub fn state(&self) -> RenderState {
        self.state
    }

    pub fn device(&self) -> Option<&D> {
        self.device.as_ref()
    }

    /// Runs the whole setup. `None` means the host could not create a context.
    pub fn setup(&mut self, device: Option<D>) -> Result<()> {
        let result = self.try_setup(device);
        if let Err(e) = &result {
            error!("renderer setup failed: {}", e);
            self.state = RenderState::Halted;
        }
        result
    }

    fn try_setup(&mut self, device: Option<D>) -> Result<()> {
        if self.state != RenderState::Uninitialized {
            return Err(ViewerError::NotReady(self.state.name()));
        }
        let device = device.ok_or_else(|| ViewerError::NoContext("WebGL2 not supported".to_string()))?;
        let device = self.device.insert(device);
        self.state = RenderState::ContextAcquired;

        device.link_program(VERTEX_SHADER, FRAGMENT_SHADER)?;
        self.state = RenderState::ProgramLinked;

        device.configure_pipeline()?;
        self.state = RenderState::Ready;
        info!("renderer ready");
        Ok(())
    }

    fn ready_device(&mut self) -> Result<&mut D> {
        match (self.state, self.device.as_mut()) {
            (RenderState::Ready, Some(device)) => Ok(device),
            (state, _) => Err(ViewerError::NotReady(state.name())),
        }
    }

    /// Rebuilds the projection for a `css_width × css_height` window, keeping the camera's
    /// field of view. Sparse scenes render at CSS resolution, dense ones at the device ratio.
    pub fn resize(
        &mut self,
        camera: &Camera,
        css_width: f32,
        css_height: f32,
        device_pixel_ratio: f32,
    ) -> Result<Resolution> {
        let css_width = css_width.max(1.0);
        let css_height = css_height.max(1.0);
        let scale = (css_width / camera.width as f32).min(css_height / camera.height as f32);
        let focal = Vec2::new(camera.fx * scale, camera.fy * scale);

        let pixel_ratio = if self.progress.total_records < self.config.density_threshold {
            1.0
        } else {
            device_pixel_ratio.max(f32::MIN_POSITIVE)
        };
        let resolution = Resolution {
            canvas_width: (css_width * pixel_ratio).round() as u32,
            canvas_height: (css_height * pixel_ratio).round() as u32,
            pixel_ratio,
            focal,
        };

        self.projection = projection_matrix_with_planes(
            focal.x,
            focal.y,
            css_width,
            css_height,
            self.config.near,
            self.config.far,
        );
        let projection = self.projection;
        let device = self.ready_device()?;
        device.set_viewport(resolution.canvas_width, resolution.canvas_height);
        device.set_projection(&projection, focal, Vec2::new(css_width, css_height));

        debug!(
            "resize {}x{} css, canvas {}x{}, focal {:?}",
            css_width, css_height, resolution.canvas_width, resolution.canvas_height, focal
        );
        self.resolution = Some(resolution);
        Ok(resolution)
    }

    #[inline]
    pub fn projection(&self) -> Mat4 {
        self.projection
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    #[inline]
    pub fn view_projection(&self, view: &Mat4) -> Mat4 {
        multiply(&self.projection, view)
    }

    pub fn upload_texture(&mut self, texture: &SplatTexture) -> Result<()> {
        self.ready_device()?.upload_texture(texture);
        Ok(())
    }

    pub fn upload_indices(&mut self, indices: &[u32], vertex_count: usize) -> Result<()> {
        self.ready_device()?.upload_indices(indices);
        self.progress.vertex_count = vertex_count;
        Ok(())
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.progress.vertex_count
    }

    #[inline]
    pub fn total_records(&self) -> usize {
        self.progress.total_records
    }

    /// Starts progress accounting for a new load.
    pub fn begin_load(&mut self, expected_records: usize) {
        self.progress = Progress {
            total_records: expected_records,
            ..Progress::default()
        };
    }

    pub fn set_total_records(&mut self, total: usize) {
        self.progress.total_records = total;
    }

    pub fn finish_load(&mut self, final_records: usize) {
        self.progress.total_records = final_records;
        self.progress.finished = true;
    }

    /// `100 · sorted / total`, never decreasing within a load. Only a finished load whose full
    /// count has been sorted reports 100. `None` until a total is known.
    pub fn progress(&mut self) -> Option<f32> {
        let p = &mut self.progress;
        if p.total_records == 0 {
            return (p.finished && p.reported > 0.0).then_some(p.reported);
        }
        let value = if p.finished && p.vertex_count >= p.total_records {
            100.0
        } else {
            (100.0 * p.vertex_count as f32 / p.total_records as f32).min(99.9)
        };
        p.reported = p.reported.max(value);
        Some(p.reported)
    }

    /// Draws one frame. Without sorted splats the frame is only cleared.
    pub fn draw_frame(&mut self, view: &Mat4) -> Result<bool> {
        let clear_color = self.config.clear_color;
        let instances = self.progress.vertex_count as u32;
        let device = self.ready_device()?;
        device.clear(clear_color);
        if instances == 0 {
            return Ok(false);
        }
        device.set_view(view);
        device.draw_instanced(instances);
        Ok(true)
    }
}
