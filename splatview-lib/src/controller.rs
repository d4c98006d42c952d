//! Turns input into camera motion.
//!
//! Every edit happens on the inverted view (camera-to-world) matrix and is re-inverted
//! afterwards. A failed inversion leaves the current view untouched for that step.

use glam::Mat4;
use tracing::{debug, warn};

use crate::camera::{default_cameras, default_view_matrix, parse_camera_presets, Camera};
use crate::common::{percent_decode, round_to_hundredths};
use crate::config::ControlConfig;
use crate::error::{Result, ViewerError};
use crate::input::{DragMode, GamepadState, InputEvent, InputState, Key, MouseButton, WheelDeltaMode};
use crate::matrix::{from_flat, invert, rotate, to_flat, translate, view_matrix};

const KEY_MOVE: f32 = 0.03;
const KEY_DOLLY: f32 = 0.1;
const KEY_YAW: f32 = 0.01;
const KEY_PITCH: f32 = 0.005;
const KEY_ORBIT: f32 = 0.05;
const MOUSE_ORBIT: f32 = 5.0;
const MOUSE_PAN: f32 = 10.0;
const TOUCH_ORBIT: f32 = 4.0;
const PINCH_DOLLY: f32 = 3.0;
const WHEEL_DOLLY: f32 = 10.0;

/// Notifications the host should hear about, drained once per frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    CarouselChanged(bool),
    ViewSaved(String),
    /// The active preset changed; focal lengths must be recomputed.
    CameraChanged,
}

#[derive(Debug)]
pub struct CameraController {
    config: ControlConfig,
    cameras: Vec<Camera>,
    preset: usize,
    view: Mat4,
    carousel: bool,
    carousel_origin_ms: f64,
    jump: f32,
    viewport: (f32, f32),
    input: InputState,
    events: Vec<ControllerEvent>,
}

impl CameraController {
    pub fn new(config: ControlConfig) -> Self {
        let cameras = default_cameras();
        let view = cameras.first().map_or(Mat4::IDENTITY, view_matrix);
        Self {
            config,
            cameras,
            preset: 0,
            view,
            carousel: true,
            carousel_origin_ms: 0.0,
            jump: 0.0,
            viewport: (1.0, 1.0),
            input: InputState::new(),
            events: Vec::new(),
        }
    }

    #[inline]
    pub fn view(&self) -> Mat4 {
        self.view
    }

    #[inline]
    pub fn carousel(&self) -> bool {
        self.carousel
    }

    #[inline]
    pub fn jump(&self) -> f32 {
        self.jump
    }

    #[inline]
    pub fn preset_index(&self) -> usize {
        self.preset
    }

    pub fn cameras(&self) -> &[Camera] {
        &self.cameras
    }

    /// The preset whose intrinsics drive the projection.
    pub fn active_camera(&self) -> &Camera {
        &self.cameras[self.preset.min(self.cameras.len() - 1)]
    }

    /// Size of the host window in CSS pixels, used to normalize pointer motion.
    pub fn set_viewport(&mut self, width: f32, height: f32) {
        self.viewport = (width.max(1.0), height.max(1.0));
    }

    pub fn set_carousel(&mut self, enabled: bool) {
        if self.carousel != enabled {
            self.carousel = enabled;
            self.events.push(ControllerEvent::CarouselChanged(enabled));
        }
    }

    pub fn drain_events(&mut self) -> Vec<ControllerEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn select_preset(&mut self, index: usize) -> bool {
        let Some(camera) = self.cameras.get(index) else {
            debug!("no camera preset {}", index);
            return false;
        };
        self.view = view_matrix(camera);
        self.preset = index;
        self.events.push(ControllerEvent::CameraChanged);
        true
    }

    pub fn step_preset(&mut self, forward: bool) {
        let n = self.cameras.len();
        let next = if forward {
            (self.preset + 1) % n
        } else {
            (self.preset + n - 1) % n
        };
        self.select_preset(next);
    }

    /// Replaces the preset list. On error the current list is kept.
    pub fn load_cameras(&mut self, json: &str) -> Result<()> {
        let cameras = parse_camera_presets(json)?;
        self.cameras = cameras;
        self.select_preset(0);
        Ok(())
    }

    /// `#[...]` with the sixteen view entries rounded to two decimals.
    pub fn save_view(&mut self) -> String {
        let rounded: Vec<f64> = to_flat(&self.view)
            .iter()
            .map(|&v| round_to_hundredths(v))
            .collect();
        let fragment = format!(
            "#{}",
            serde_json::to_string(&rounded).unwrap_or_else(|_| "[]".to_string())
        );
        self.events.push(ControllerEvent::ViewSaved(fragment.clone()));
        fragment
    }

    /// Restores a view from a location fragment. Returns `Ok(false)` for an empty fragment.
    pub fn restore_view(&mut self, fragment: &str) -> Result<bool> {
        let raw = fragment.strip_prefix('#').unwrap_or(fragment);
        if raw.is_empty() {
            return Ok(false);
        }
        let view = parse_fragment(raw)?;
        self.view = view;
        self.set_carousel(false);
        Ok(true)
    }

    pub fn handle(&mut self, event: &InputEvent) {
        match *event {
            InputEvent::KeyDown(key) => self.key_down(key),
            InputEvent::KeyUp(key) => self.input.release(key),
            InputEvent::Blur => self.input.release_all(),
            InputEvent::MouseDown { x, y, button, ctrl } => {
                self.set_carousel(false);
                let mode = if button == MouseButton::Right || ctrl {
                    DragMode::Pan
                } else {
                    DragMode::Orbit
                };
                self.input.begin_drag(mode, x, y);
            }
            InputEvent::MouseMove { x, y } => self.mouse_move(x, y),
            InputEvent::MouseUp | InputEvent::TouchEnd => self.input.end_drag(),
            InputEvent::Wheel {
                dx,
                dy,
                mode,
                shift,
                ctrl,
            } => self.wheel(dx, dy, mode, shift, ctrl),
            InputEvent::TouchStart(ref touches) => {
                if self.input.begin_touch(touches) {
                    self.set_carousel(false);
                }
            }
            InputEvent::TouchMove(ref touches) => self.touch_move(touches),
        }
    }

    fn key_down(&mut self, key: Key) {
        self.set_carousel(key == Key::P);
        self.input.press(key);
        match key {
            Key::Digit(d) => {
                self.select_preset(d as usize);
            }
            Key::Minus => self.step_preset(false),
            Key::Plus => self.step_preset(true),
            Key::V => {
                self.save_view();
            }
            _ => {}
        }
    }

    fn edit(&mut self, f: impl FnOnce(Mat4) -> Mat4) {
        if let Some(inv) = invert(&self.view) {
            if let Some(view) = invert(&f(inv)) {
                self.view = view;
            }
        }
    }

    fn mouse_move(&mut self, x: f32, y: f32) {
        let (w, h) = self.viewport;
        let d = self.config.orbit_distance;
        match self.input.drag_to(x, y) {
            Some((DragMode::Orbit, dx, dy)) => self.edit(|inv| {
                orbit(inv, d, MOUSE_ORBIT * dx / w, -MOUSE_ORBIT * dy / h)
            }),
            Some((DragMode::Pan, dx, dy)) => self.edit(|inv| {
                translate(&inv, -MOUSE_PAN * dx / w, 0.0, MOUSE_PAN * dy / h)
            }),
            _ => {}
        }
    }

    fn wheel(&mut self, dx: f32, dy: f32, mode: WheelDeltaMode, shift: bool, ctrl: bool) {
        self.set_carousel(false);
        let (w, h) = self.viewport;
        let scale = match mode {
            WheelDeltaMode::Pixel => 1.0,
            WheelDeltaMode::Line => self.config.wheel_line_height,
            WheelDeltaMode::Page => h,
        };
        let (dx, dy) = (dx * scale, dy * scale);
        let d = self.config.orbit_distance;

        if shift {
            self.edit(|inv| translate(&inv, dx / w, dy / h, 0.0));
        } else if ctrl {
            self.edit(|inv| translate(&inv, 0.0, 0.0, -WHEEL_DOLLY * dy / h));
        } else {
            self.edit(|inv| orbit(inv, d, -dx / w, dy / h));
        }
    }

    fn touch_move(&mut self, touches: &[(f32, f32)]) {
        let (w, h) = self.viewport;
        match touches {
            [only] => {
                let d = self.config.orbit_distance;
                if let Some((_, dx, dy)) = self.input.drag_to(only.0, only.1) {
                    self.edit(|inv| orbit(inv, d, TOUCH_ORBIT * dx / w, -TOUCH_ORBIT * dy / h));
                }
            }
            [first, second] => {
                let p = self.input.pinch_to(*first, *second);
                self.edit(|inv| {
                    let inv = rotate(&inv, p.dtheta, 0.0, 0.0, 1.0);
                    let inv = translate(&inv, -p.dx / w, -p.dy / h, 0.0);
                    translate(&inv, 0.0, 0.0, PINCH_DOLLY * (1.0 - p.dscale))
                });
            }
            _ => {}
        }
    }

    /// Advances one frame and returns the view to render, jump offset included.
    ///
    /// `has_data` is false until the first sorted splats arrive; the carousel clock only
    /// starts `carousel_delay_ms` after that.
    pub fn update(&mut self, now_ms: f64, has_data: bool, gamepads: &[GamepadState]) -> Mat4 {
        if !has_data {
            self.carousel_origin_ms = now_ms + self.config.carousel_delay_ms;
        }

        let mut jumping = self.input.is_held(Key::Space);
        if let Some(mut inv) = invert(&self.view) {
            inv = self.apply_held_keys(inv);
            for (slot, pad) in gamepads.iter().enumerate() {
                inv = self.apply_gamepad(inv, slot, pad, &mut jumping);
            }
            inv = self.apply_orbit_keys(inv);
            if let Some(view) = invert(&inv) {
                self.view = view;
            }
        }

        if self.carousel {
            if let Some(view) = self.carousel_view(now_ms) {
                self.view = view;
            }
        }

        let rate = self.config.jump_rate;
        self.jump = if jumping {
            (self.jump + rate).min(1.0)
        } else {
            (self.jump - rate).max(0.0)
        };

        self.jumped_view().unwrap_or(self.view)
    }

    fn apply_held_keys(&self, mut inv: Mat4) -> Mat4 {
        let input = &self.input;
        let shift = input.is_held(Key::Shift);
        if input.is_held(Key::ArrowUp) {
            inv = if shift {
                translate(&inv, 0.0, -KEY_MOVE, 0.0)
            } else {
                translate(&inv, 0.0, 0.0, KEY_DOLLY)
            };
        }
        if input.is_held(Key::ArrowDown) {
            inv = if shift {
                translate(&inv, 0.0, KEY_MOVE, 0.0)
            } else {
                translate(&inv, 0.0, 0.0, -KEY_DOLLY)
            };
        }
        if input.is_held(Key::ArrowLeft) {
            inv = translate(&inv, -KEY_MOVE, 0.0, 0.0);
        }
        if input.is_held(Key::ArrowRight) {
            inv = translate(&inv, KEY_MOVE, 0.0, 0.0);
        }

        let spins = [
            (Key::A, -KEY_YAW, [0.0, 1.0, 0.0]),
            (Key::D, KEY_YAW, [0.0, 1.0, 0.0]),
            (Key::Q, KEY_YAW, [0.0, 0.0, 1.0]),
            (Key::E, -KEY_YAW, [0.0, 0.0, 1.0]),
            (Key::W, KEY_PITCH, [1.0, 0.0, 0.0]),
            (Key::S, -KEY_PITCH, [1.0, 0.0, 0.0]),
        ];
        for (key, angle, [x, y, z]) in spins {
            if input.is_held(key) {
                inv = rotate(&inv, angle, x, y, z);
            }
        }
        inv
    }

    fn apply_orbit_keys(&self, inv: Mat4) -> Mat4 {
        let input = &self.input;
        if !input.any_held(&[Key::J, Key::K, Key::L, Key::I]) {
            return inv;
        }
        let yaw = if input.is_held(Key::J) {
            -KEY_ORBIT
        } else if input.is_held(Key::L) {
            KEY_ORBIT
        } else {
            0.0
        };
        let pitch = if input.is_held(Key::I) {
            KEY_ORBIT
        } else if input.is_held(Key::K) {
            -KEY_ORBIT
        } else {
            0.0
        };
        orbit(inv, self.config.orbit_distance, yaw, pitch)
    }

    fn apply_gamepad(
        &mut self,
        mut inv: Mat4,
        slot: usize,
        pad: &GamepadState,
        jumping: &mut bool,
    ) -> Mat4 {
        let dead = self.config.gamepad_dead_zone;
        let speed = self.config.gamepad_move_speed;
        let turn = self.config.gamepad_rotate_speed;
        let axis = |i: usize| pad.axes[i];
        let held = |b: usize| if pad.pressed(b) { 1.0 } else { 0.0 };
        let mut moved = false;

        if axis(0).abs() > dead {
            inv = translate(&inv, speed * axis(0), 0.0, 0.0);
            moved = true;
        }
        if axis(1).abs() > dead {
            inv = translate(&inv, 0.0, 0.0, -speed * axis(1));
            moved = true;
        }
        let lift = held(GamepadState::DPAD_UP) - held(GamepadState::DPAD_DOWN);
        if pad.pressed(GamepadState::DPAD_UP) || pad.pressed(GamepadState::DPAD_DOWN) {
            inv = translate(&inv, 0.0, -speed * lift, 0.0);
            moved = true;
        }
        let strafe = held(GamepadState::DPAD_LEFT) - held(GamepadState::DPAD_RIGHT);
        if pad.pressed(GamepadState::DPAD_LEFT) || pad.pressed(GamepadState::DPAD_RIGHT) {
            inv = translate(&inv, -speed * strafe, 0.0, 0.0);
            moved = true;
        }
        if axis(2).abs() > dead {
            inv = rotate(&inv, turn * axis(2), 0.0, 1.0, 0.0);
            moved = true;
        }
        if axis(3).abs() > dead {
            inv = rotate(&inv, -turn * axis(3), 1.0, 0.0, 0.0);
            moved = true;
        }
        let tilt = pad.value(GamepadState::ROLL_LEFT) - pad.value(GamepadState::ROLL_RIGHT);
        if tilt.abs() > dead {
            inv = rotate(&inv, turn * tilt, 0.0, 0.0, 1.0);
            moved = true;
        }

        let (next, prev) = self.input.bumper_edges(slot, pad);
        if next || prev {
            self.step_preset(next);
            match invert(&self.view) {
                Some(preset_inv) => inv = preset_inv,
                None => warn!("camera preset {} is not invertible", self.preset),
            }
            moved = true;
        }
        if pad.pressed(GamepadState::JUMP) {
            *jumping = true;
            moved = true;
        }

        if moved {
            self.set_carousel(false);
        }
        if pad.pressed(GamepadState::RESUME) {
            self.set_carousel(true);
        }
        inv
    }

    fn carousel_view(&self, now_ms: f64) -> Option<Mat4> {
        let elapsed = (now_ms - self.carousel_origin_ms).max(0.0);
        let t = (elapsed / self.config.carousel_period_ms).sin() as f32;
        let inv = invert(&default_view_matrix())?;
        let inv = translate(&inv, 2.5 * t, 0.0, 6.0 * (1.0 - t.cos()));
        let inv = rotate(&inv, -0.6 * t, 0.0, 1.0, 0.0);
        invert(&inv)
    }

    fn jumped_view(&self) -> Option<Mat4> {
        let inv = invert(&self.view)?;
        let inv = translate(&inv, 0.0, -self.jump, 0.0);
        let inv = rotate(&inv, -0.1 * self.jump, 1.0, 0.0, 0.0);
        invert(&inv)
    }
}

/// Rotates about a pivot `distance` units ahead of the camera.
fn orbit(inv: Mat4, distance: f32, yaw: f32, pitch: f32) -> Mat4 {
    let inv = translate(&inv, 0.0, 0.0, distance);
    let inv = rotate(&inv, yaw, 0.0, 1.0, 0.0);
    let inv = rotate(&inv, pitch, 1.0, 0.0, 0.0);
    translate(&inv, 0.0, 0.0, -distance)
}

fn parse_fragment(raw: &str) -> Result<Mat4> {
    let decoded = percent_decode(raw)
        .ok_or_else(|| ViewerError::InvalidFragment("bad percent encoding".to_string()))?;
    let values: Vec<f32> = serde_json::from_str(&decoded)
        .map_err(|e| ViewerError::InvalidFragment(e.to_string()))?;
    let flat: [f32; 16] = values
        .try_into()
        .map_err(|v: Vec<f32>| ViewerError::InvalidFragment(format!("{} entries, expected 16", v.len())))?;
    if !flat.iter().all(|v| v.is_finite()) {
        return Err(ViewerError::InvalidFragment("non-finite entry".to_string()));
    }
    Ok(from_flat(&flat))
}
