//! Fixed per-camera intrinsics consumed by the calibration solver.
//!
//! A camera is described by its pinhole matrix and the five Brown-Conrady
//! distortion coefficients in OpenCV order `[k1, k2, p1, p2, k3]`. The
//! intrinsics are never re-estimated here; they are only used to project and
//! undistort points while the rig extrinsics are refined.

use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

#[derive(thiserror::Error, Debug)]
pub enum IntrinsicsError {
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Numerical error in computation: {0}")]
    NumericalError(String),
}

/// Pinhole intrinsics plus radial-tangential distortion for one camera.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub intrinsics: Intrinsics,
    /// `[k1, k2, p1, p2, k3]`
    pub distortions: [f64; 5],
}

impl CameraIntrinsics {
    pub fn new(intrinsics: Intrinsics, distortions: [f64; 5]) -> Result<Self, IntrinsicsError> {
        let camera = Self {
            intrinsics,
            distortions,
        };
        camera.validate_params()?;
        Ok(camera)
    }

    /// Builds intrinsics from a 3×3 camera matrix and a distortion slice.
    ///
    /// The matrix must have the pinhole shape `[[fx, 0, cx], [0, fy, cy], [0, 0, 1]]`
    /// (skew is rejected) and exactly five distortion coefficients are required.
    pub fn from_camera_matrix(
        camera_matrix: &Matrix3<f64>,
        distortions: &[f64],
    ) -> Result<Self, IntrinsicsError> {
        if distortions.len() != 5 {
            return Err(IntrinsicsError::InvalidParams(format!(
                "expected 5 distortion coefficients, got {}",
                distortions.len()
            )));
        }
        let bottom = camera_matrix.row(2);
        if bottom[0] != 0.0 || bottom[1] != 0.0 || (bottom[2] - 1.0).abs() > 1e-12 {
            return Err(IntrinsicsError::InvalidParams(
                "camera matrix bottom row must be [0, 0, 1]".to_string(),
            ));
        }
        if camera_matrix[(0, 1)] != 0.0 || camera_matrix[(1, 0)] != 0.0 {
            return Err(IntrinsicsError::InvalidParams(
                "camera matrix with skew is not supported".to_string(),
            ));
        }

        let intrinsics = Intrinsics {
            fx: camera_matrix[(0, 0)],
            fy: camera_matrix[(1, 1)],
            cx: camera_matrix[(0, 2)],
            cy: camera_matrix[(1, 2)],
        };
        let mut coeffs = [0.0; 5];
        coeffs.copy_from_slice(distortions);
        Self::new(intrinsics, coeffs)
    }

    pub fn camera_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.intrinsics.fx,
            0.0,
            self.intrinsics.cx,
            0.0,
            self.intrinsics.fy,
            self.intrinsics.cy,
            0.0,
            0.0,
            1.0,
        )
    }

    pub fn validate_params(&self) -> Result<(), IntrinsicsError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        if self.distortions.iter().any(|d| !d.is_finite()) {
            return Err(IntrinsicsError::InvalidParams(
                "distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Applies radial-tangential distortion to a normalized image point.
    pub fn distort(&self, normalized: &Vector2<f64>) -> Vector2<f64> {
        let [k1, k2, p1, p2, k3] = self.distortions;
        let x = normalized.x;
        let y = normalized.y;

        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;

        Vector2::new(
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    /// Projects a point expressed in this camera's frame to pixel coordinates.
    pub fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, IntrinsicsError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(IntrinsicsError::PointAtCameraCenter);
        }

        let distorted = self.distort(&Vector2::new(
            point_3d.x / point_3d.z,
            point_3d.y / point_3d.z,
        ));

        Ok(Vector2::new(
            self.intrinsics.fx * distorted.x + self.intrinsics.cx,
            self.intrinsics.fy * distorted.y + self.intrinsics.cy,
        ))
    }

    /// Removes lens distortion from a pixel, returning normalized coordinates `(x/z, y/z)`.
    ///
    /// Solved with Newton iterations on the distortion function, starting from
    /// the distorted normalized point.
    pub fn undistort(&self, point_2d: &Vector2<f64>) -> Result<Vector2<f64>, IntrinsicsError> {
        const EPS: f64 = 1e-10;
        const MAX_ITERATIONS: u32 = 100;

        let [k1, k2, p1, p2, k3] = self.distortions;
        let target = Vector2::new(
            (point_2d.x - self.intrinsics.cx) / self.intrinsics.fx,
            (point_2d.y - self.intrinsics.cy) / self.intrinsics.fy,
        );
        let mut point = target;

        for _ in 0..MAX_ITERATIONS {
            let error = self.distort(&point) - target;
            if error.norm() < EPS {
                return Ok(point);
            }

            let x = point.x;
            let y = point.y;
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r4 * r2;
            let d_radial = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;

            let j00 = radial + 2.0 * x * x * d_radial + 2.0 * p1 * y + 6.0 * p2 * x;
            let j01 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let j10 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let j11 = radial + 2.0 * y * y * d_radial + 6.0 * p1 * y + 2.0 * p2 * x;

            let inv_jacobian = Matrix2::new(j00, j01, j10, j11)
                .try_inverse()
                .ok_or_else(|| IntrinsicsError::NumericalError("Jacobian is singular".to_string()))?;
            let delta = inv_jacobian * error;
            point -= delta;
            if delta.norm() < EPS {
                return Ok(point);
            }
        }

        Err(IntrinsicsError::NumericalError(format!(
            "Undistortion did not converge after {MAX_ITERATIONS} iterations."
        )))
    }
}

impl fmt::Debug for CameraIntrinsics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CameraIntrinsics [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), IntrinsicsError> {
        if !(intrinsics.fx > 0.0 && intrinsics.fy > 0.0) {
            return Err(IntrinsicsError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(IntrinsicsError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }
}
