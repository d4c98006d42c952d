use serde::{Deserialize, Serialize};

use crate::error::{Result, ViewerError};
use crate::matrix::{DEFAULT_FAR, DEFAULT_NEAR};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterConfig {
    /// Depth quantization buckets for the counting sort.
    pub buckets: usize,
    /// Re-sorting is skipped while `|dot(prev_forward, forward) - 1|` stays below this.
    pub view_change_threshold: f32,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            buckets: 1 << 16,
            view_change_threshold: 0.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub near: f32,
    pub far: f32,
    /// Scenes with fewer records than this render at CSS-pixel resolution.
    pub density_threshold: usize,
    pub clear_color: [f32; 4],
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            near: DEFAULT_NEAR,
            far: DEFAULT_FAR,
            density_threshold: 500_000,
            clear_color: [0.0, 0.0, 0.0, 0.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub orbit_distance: f32,
    pub gamepad_dead_zone: f32,
    pub gamepad_move_speed: f32,
    pub gamepad_rotate_speed: f32,
    pub jump_rate: f32,
    pub carousel_period_ms: f64,
    /// Delay between the first frame with data and the start of the carousel clock.
    pub carousel_delay_ms: f64,
    pub wheel_line_height: f32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            orbit_distance: 4.0,
            gamepad_dead_zone: 0.1,
            gamepad_move_speed: 0.06,
            gamepad_rotate_speed: 0.02,
            jump_rate: 0.05,
            carousel_period_ms: 5000.0,
            carousel_delay_ms: 2000.0,
            wheel_line_height: 10.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub sorter: SorterConfig,
    pub render: RenderConfig,
    pub controls: ControlConfig,
}

impl ViewerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ViewerError::Config(e.to_string()))
    }
}
