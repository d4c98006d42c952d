//! Column-major 4×4 transforms.
//!
//! Every helper composes on the right (`a · op`), so `translate` and `rotate` act in the
//! local frame of whatever `a` already describes. The controller relies on this when it
//! edits the inverted view matrix (camera-to-world) and re-inverts the result.

use glam::{Mat4, Vec3, Vec4};

use crate::camera::Camera;

pub const DEFAULT_NEAR: f32 = 0.2;
pub const DEFAULT_FAR: f32 = 200.0;

const SINGULAR_EPSILON: f32 = 1e-12;

#[inline]
pub fn multiply(a: &Mat4, b: &Mat4) -> Mat4 {
    *a * *b
}

/// Returns `None` for singular or non-finite input; callers keep their previous matrix.
pub fn invert(a: &Mat4) -> Option<Mat4> {
    let det = a.determinant();
    if !det.is_finite() || det.abs() < SINGULAR_EPSILON {
        return None;
    }
    let inv = a.inverse();
    inv.is_finite().then_some(inv)
}

/// Right-multiplies a rotation of `radians` about `(x, y, z)`. The axis need not be unit
/// length; a zero axis leaves `a` unchanged.
pub fn rotate(a: &Mat4, radians: f32, x: f32, y: f32, z: f32) -> Mat4 {
    let axis = Vec3::new(x, y, z);
    let len = axis.length();
    if len == 0.0 || !len.is_finite() {
        return *a;
    }
    *a * Mat4::from_axis_angle(axis / len, radians)
}

#[inline]
pub fn translate(a: &Mat4, dx: f32, dy: f32, dz: f32) -> Mat4 {
    *a * Mat4::from_translation(Vec3::new(dx, dy, dz))
}

/// Perspective projection for pinhole intrinsics with the image-space y-down convention.
pub fn projection_matrix(fx: f32, fy: f32, width: f32, height: f32) -> Mat4 {
    projection_matrix_with_planes(fx, fy, width, height, DEFAULT_NEAR, DEFAULT_FAR)
}

pub fn projection_matrix_with_planes(
    fx: f32,
    fy: f32,
    width: f32,
    height: f32,
    near: f32,
    far: f32,
) -> Mat4 {
    Mat4::from_cols(
        Vec4::new(2.0 * fx / width, 0.0, 0.0, 0.0),
        Vec4::new(0.0, -(2.0 * fy) / height, 0.0, 0.0),
        Vec4::new(0.0, 0.0, far / (far - near), 1.0),
        Vec4::new(0.0, 0.0, -(far * near) / (far - near), 0.0),
    )
}

/// World-to-camera matrix for a preset. The preset's rotation rows become the
/// matrix columns and the translation is `-Rᵀ` applied to the position.
pub fn view_matrix(camera: &Camera) -> Mat4 {
    let r = &camera.rotation;
    let t = camera.position;
    Mat4::from_cols(
        Vec4::new(r[0][0], r[0][1], r[0][2], 0.0),
        Vec4::new(r[1][0], r[1][1], r[1][2], 0.0),
        Vec4::new(r[2][0], r[2][1], r[2][2], 0.0),
        Vec4::new(
            -t[0] * r[0][0] - t[1] * r[1][0] - t[2] * r[2][0],
            -t[0] * r[0][1] - t[1] * r[1][1] - t[2] * r[2][1],
            -t[0] * r[0][2] - t[1] * r[1][2] - t[2] * r[2][2],
            1.0,
        ),
    )
}

/// Depth row of a view-projection matrix: `(m[2], m[6], m[10])` in flat column-major order.
/// Its dot product with a world position orders splats by distance along the view axis.
#[inline]
pub fn forward_axis(view_proj: &Mat4) -> Vec3 {
    view_proj.row(2).truncate()
}

#[inline]
pub fn from_flat(m: &[f32; 16]) -> Mat4 {
    Mat4::from_cols_array(m)
}

#[inline]
pub fn to_flat(m: &Mat4) -> [f32; 16] {
    m.to_cols_array()
}
