//! Rigid-transform algebra and reprojection statistics.
//!
//! Transforms follow the convention `p_B = R · p_A + T`: an [`ExtrinsicTransform`]
//! for the camera pair `(A, B)` takes a point expressed in camera A's frame into
//! camera B's frame.

use crate::camera::CameraIntrinsics;
use nalgebra::{Matrix3, Matrix4, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

const ROTATION_TOLERANCE: f64 = 1e-6;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum GeometryError {
    #[error("rotation is not orthonormal with determinant +1")]
    InvalidRotation,
    #[error("translation must be finite")]
    InvalidTranslation,
    #[error("residual error must be finite and non-negative, got {0}")]
    InvalidResidual(f64),
    #[error("Zero projection points")]
    ZeroProjectionPoints,
}

/// 4×4 homogeneous matrix with `rotation` in the top-left block and `translation` in the last column.
pub fn compose(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix4<f64> {
    let mut transform = Matrix4::identity();
    transform.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
    transform.fixed_view_mut::<3, 1>(0, 3).copy_from(translation);
    transform
}

/// Rigid inverse `(Rᵗ, −Rᵗ·T)`.
pub fn invert(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> (Matrix3<f64>, Vector3<f64>) {
    let rotation_inv = rotation.transpose();
    let translation_inv = -(rotation_inv * translation);
    (rotation_inv, translation_inv)
}

/// Whether `rotation` is orthonormal with determinant +1 within `tolerance`.
pub fn is_rotation(rotation: &Matrix3<f64>, tolerance: f64) -> bool {
    rotation.iter().all(|v| v.is_finite())
        && (rotation.transpose() * rotation - Matrix3::identity()).amax() < tolerance
        && (rotation.determinant() - 1.0).abs() < tolerance
}

/// Solved transform between an ordered camera pair, with the solver's residual.
#[derive(Clone, Copy, PartialEq)]
pub struct ExtrinsicTransform {
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
    residual: f64,
}

impl ExtrinsicTransform {
    pub fn new(
        rotation: Matrix3<f64>,
        translation: Vector3<f64>,
        residual: f64,
    ) -> Result<Self, GeometryError> {
        if !is_rotation(&rotation, ROTATION_TOLERANCE) {
            return Err(GeometryError::InvalidRotation);
        }
        if translation.iter().any(|v| !v.is_finite()) {
            return Err(GeometryError::InvalidTranslation);
        }
        if !residual.is_finite() || residual < 0.0 {
            return Err(GeometryError::InvalidResidual(residual));
        }
        Ok(Self {
            rotation,
            translation,
            residual,
        })
    }

    pub fn rotation(&self) -> &Matrix3<f64> {
        &self.rotation
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    /// Residual reported by the solver (lower is better).
    pub fn residual(&self) -> f64 {
        self.residual
    }

    pub fn to_homogeneous(&self) -> Matrix4<f64> {
        compose(&self.rotation, &self.translation)
    }

    /// Maps a point from camera A's frame into camera B's frame.
    pub fn transform_point(&self, point_a: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point_a + self.translation
    }

    /// Pose of camera B in camera A's frame, A being the world frame.
    pub fn camera_pose(&self) -> CameraPose {
        let (rotation, position) = invert(&self.rotation, &self.translation);
        CameraPose { rotation, position }
    }
}

impl fmt::Debug for ExtrinsicTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ExtrinsicTransform [R: {:?} T: {:?} residual: {}]",
            self.rotation.as_slice(),
            self.translation.as_slice(),
            self.residual
        )
    }
}

/// Camera orientation and position in the world frame (camera → world).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraPose {
    pub rotation: Matrix3<f64>,
    pub position: Vector3<f64>,
}

impl CameraPose {
    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            position: Vector3::zeros(),
        }
    }

    pub fn to_homogeneous(&self) -> Matrix4<f64> {
        compose(&self.rotation, &self.position)
    }

    /// Maps a point from the camera frame to the world frame.
    pub fn camera_to_world(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.position
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

/// Summary statistics of per-point pixel errors.
pub fn projection_statistics(errors: &[f64]) -> Result<ProjectionError, GeometryError> {
    if errors.is_empty() {
        return Err(GeometryError::ZeroProjectionPoints);
    }

    let n = errors.len() as f64;
    let mean = errors.iter().sum::<f64>() / n;
    let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let rmse = (errors.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();
    let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

    let mut sorted = errors.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };

    Ok(ProjectionError {
        rmse,
        min,
        max,
        mean,
        stddev: variance.sqrt(),
        median,
    })
}

/// Pixel errors of projecting camera-frame points through `camera`.
///
/// Points that cannot be projected (behind the camera) are skipped.
pub fn reprojection_errors(
    camera: &CameraIntrinsics,
    points_camera: &[Vector3<f64>],
    observed: &[Vector2<f64>],
) -> Vec<f64> {
    points_camera
        .iter()
        .zip(observed)
        .filter_map(|(p3d, p2d)| camera.project(p3d).ok().map(|proj| (proj - p2d).norm()))
        .collect()
}
