use glam::Mat4;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, ViewerError};

/// A named view preset. Presets are swapped wholesale, never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img_name: Option<String>,
    pub position: [f32; 3],
    pub rotation: [[f32; 3]; 3],
    pub fx: f32,
    pub fy: f32,
    pub width: u32,
    pub height: u32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            id: 0,
            img_name: None,
            position: [0.0; 3],
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            fx: 1159.588,
            fy: 1164.660,
            width: 1959,
            height: 1090,
        }
    }
}

impl Camera {
    fn is_usable(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.fx.is_finite()
            && self.fy.is_finite()
            && self.fx > 0.0
            && self.fy > 0.0
            && self.position.iter().all(|v| v.is_finite())
            && self.rotation.iter().flatten().all(|v| v.is_finite())
    }
}

/// Establishing shot used by the idle carousel.
#[rustfmt::skip]
pub const DEFAULT_VIEW: [f32; 16] = [
    0.47, 0.04, 0.88, 0.0,
    -0.11, 0.99, 0.02, 0.0,
    -0.88, -0.11, 0.47, 0.0,
    0.07, 0.03, 6.55, 1.0,
];

#[inline]
pub fn default_view_matrix() -> Mat4 {
    Mat4::from_cols_array(&DEFAULT_VIEW)
}

pub fn default_cameras() -> Vec<Camera> {
    vec![
        Camera {
            id: 0,
            img_name: Some("00001".to_string()),
            position: [-3.008_989_3, -0.110_864_9, -3.752_764],
            rotation: [
                [0.876_134_2, 0.069_259_62, 0.477_066],
                [-0.047_474_22, 0.997_211_1, -0.057_586_74],
                [-0.479_723_94, 0.027_805_377, 0.876_978_8],
            ],
            fx: 1159.588_1,
            fy: 1164.660_2,
            width: 1959,
            height: 1090,
        },
        Camera {
            id: 1,
            img_name: Some("00009".to_string()),
            position: [-2.530_968_2, -0.001_302_1, -3.386_233_6],
            rotation: [
                [0.853_233_4, 0.077_211_12, 0.515_766_6],
                [-0.070_098_6, 0.997_011_5, -0.033_323_84],
                [-0.516_778_6, -0.008_065_168, 0.856_065_1],
            ],
            fx: 1159.588_1,
            fy: 1164.660_2,
            width: 1959,
            height: 1090,
        },
    ]
}

/// Parses a JSON preset array. Entries are taken in order up to the first one that does
/// not describe a usable camera; a document with no usable leading entry is rejected.
pub fn parse_camera_presets(json: &str) -> Result<Vec<Camera>> {
    let values: Vec<serde_json::Value> =
        serde_json::from_str(json).map_err(|e| ViewerError::InvalidCameras(e.to_string()))?;

    let mut cameras = Vec::with_capacity(values.len());
    for (i, value) in values.into_iter().enumerate() {
        match serde_json::from_value::<Camera>(value) {
            Ok(cam) if cam.is_usable() => cameras.push(cam),
            Ok(_) => {
                warn!("camera preset #{} has degenerate intrinsics; ignoring the rest", i);
                break;
            }
            Err(e) => {
                warn!("camera preset #{} is malformed ({}); ignoring the rest", i, e);
                break;
            }
        }
    }

    if cameras.is_empty() {
        return Err(ViewerError::InvalidCameras(
            "no usable camera in preset list".to_string(),
        ));
    }
    Ok(cameras)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE: &str = r#"{"id": 7, "img_name": "a", "position": [1, 2, 3],
        "rotation": [[1,0,0],[0,1,0],[0,0,1]], "fx": 500, "fy": 510, "width": 800, "height": 600}"#;

    #[test]
    fn parses_preset_file() {
        let cams = parse_camera_presets(&format!("[{}, {}]", ONE, ONE)).unwrap();
        assert_eq!(cams.len(), 2);
        assert_eq!(cams[0].id, 7);
        assert_eq!(cams[0].position, [1.0, 2.0, 3.0]);
        assert_eq!(cams[0].width, 800);
    }

    #[test]
    fn malformed_tail_is_truncated() {
        let json = format!(r#"[{}, {{"id": 2, "position": "oops"}}, {}]"#, ONE, ONE);
        let cams = parse_camera_presets(&json).unwrap();
        assert_eq!(cams.len(), 1);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            parse_camera_presets("{not json"),
            Err(ViewerError::InvalidCameras(_))
        ));
        assert!(parse_camera_presets("[]").is_err());
        assert!(parse_camera_presets(r#"[{"id": 1}]"#).is_err());
    }

    #[test]
    fn defaults_are_usable() {
        assert!(default_cameras().iter().all(Camera::is_usable));
    }
}
