//! The `optimization` module turns an accumulated dataset into an extrinsic transform.
//!
//! The [`CalibrationSolver`] trait is the seam between the pipeline and the
//! numerical backend. A solver receives every accepted correspondence record
//! together with the fixed intrinsics of both cameras and returns the rotation
//! and translation taking camera A's frame into camera B's frame, plus a
//! residual describing fit quality.
//!
//! [`calibrate`] wraps any solver with the acceptance rules shared by all
//! backends: the residual must be a finite non-negative number and the
//! rotation must be a proper rotation. Anything else is reported as
//! [`CalibrationError::CalibrationFailed`].
//!
//! The default backend is [`StereoOptimizationCost`], a Levenberg-Marquardt
//! bundle over board poses and the relative pose built on `tiny_solver`.

pub mod planar;
pub mod stereo;

pub use stereo::StereoOptimizationCost;

use crate::accumulator::MIN_RECORDS;
use crate::camera::CameraIntrinsics;
use crate::error::CalibrationError;
use crate::geometry::ExtrinsicTransform;
use crate::observation::CorrespondenceRecord;

use log::info;
use nalgebra::{Matrix3, Vector3};

/// Everything a solver needs: the accepted records and both cameras' intrinsics.
#[derive(Debug, Clone)]
pub struct CalibrationDataset {
    records: Vec<CorrespondenceRecord>,
    intrinsics_a: CameraIntrinsics,
    intrinsics_b: CameraIntrinsics,
}

impl CalibrationDataset {
    pub fn new(
        records: Vec<CorrespondenceRecord>,
        intrinsics_a: CameraIntrinsics,
        intrinsics_b: CameraIntrinsics,
    ) -> Result<Self, CalibrationError> {
        if records.len() < MIN_RECORDS {
            return Err(CalibrationError::InsufficientData {
                found: records.len(),
                required: MIN_RECORDS,
            });
        }
        Ok(Self {
            records,
            intrinsics_a,
            intrinsics_b,
        })
    }

    pub fn records(&self) -> &[CorrespondenceRecord] {
        &self.records
    }

    pub fn intrinsics_a(&self) -> &CameraIntrinsics {
        &self.intrinsics_a
    }

    pub fn intrinsics_b(&self) -> &CameraIntrinsics {
        &self.intrinsics_b
    }

    /// Total number of matched corners across all records.
    pub fn num_points(&self) -> usize {
        self.records.iter().map(|r| r.len()).sum()
    }
}

/// Raw solver result before the acceptance checks of [`calibrate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverOutput {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    /// Reprojection residual in pixels. A negative value signals failure.
    pub residual: f64,
}

/// A numerical backend estimating the rigid transform between two cameras.
///
/// Intrinsics are treated as known and must not be refined by the solver.
pub trait CalibrationSolver {
    /// Solves for the transform taking camera A's frame into camera B's frame.
    ///
    /// # Arguments
    ///
    /// * `dataset` - At least five correspondence records and both cameras' intrinsics.
    ///
    /// # Returns
    ///
    /// * `Ok(SolverOutput)` - The estimated rotation, translation and residual.
    /// * `Err(CalibrationError)` - If the backend could not produce an estimate.
    fn solve(&self, dataset: &CalibrationDataset) -> Result<SolverOutput, CalibrationError>;
}

/// Runs `solver` and applies the acceptance rules shared by every backend.
pub fn calibrate<S: CalibrationSolver + ?Sized>(
    solver: &S,
    dataset: &CalibrationDataset,
) -> Result<ExtrinsicTransform, CalibrationError> {
    info!(
        "Calibrating from {} image pairs ({} corner matches)",
        dataset.records().len(),
        dataset.num_points()
    );
    let output = solver.solve(dataset)?;

    if !output.residual.is_finite() || output.residual < 0.0 {
        return Err(CalibrationError::CalibrationFailed(format!(
            "solver reported residual {}",
            output.residual
        )));
    }

    let transform = ExtrinsicTransform::new(output.rotation, output.translation, output.residual)
        .map_err(|err| CalibrationError::CalibrationFailed(err.to_string()))?;
    info!("Stereo calibration error: {}", transform.residual());
    Ok(transform)
}
