//! Levenberg-Marquardt stereo extrinsic refinement built on `tiny_solver`.
//!
//! The problem has one SE3 variable per correspondence record (board pose in
//! camera A) and a single SE3 variable for the relative pose taking camera A's
//! frame into camera B's frame. Every record contributes one residual block per
//! camera; intrinsics and distortion stay fixed.
//!
//! SE3 parameters use the layout `[qx, qy, qz, qw, tx, ty, tz]`.

use crate::camera::CameraIntrinsics;
use crate::error::CalibrationError;
use crate::geometry::{projection_statistics, reprojection_errors};
use crate::optimization::planar::{average_isometries, estimate_board_pose};
use crate::optimization::{CalibrationDataset, CalibrationSolver, SolverOutput};

use log::{info, warn};
use nalgebra::{
    DVector, Isometry3, Quaternion, RealField, Translation3, UnitQuaternion, Vector2, Vector3,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tiny_solver::factors::Factor;
use tiny_solver::manifold::se3::SE3Manifold;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer, OptimizerOptions};

const REL_KEY: &str = "rel";

/// Default solver: linear seeding followed by a joint Levenberg-Marquardt refinement.
#[derive(Clone)]
pub struct StereoOptimizationCost {
    max_iterations: usize,
    verbose: bool,
}

/// Reprojection residual of one record in one camera.
///
/// With a single parameter block the board pose maps straight into the
/// observing camera. With two, the second block (the relative pose) is
/// applied after the board pose.
#[derive(Debug, Clone)]
struct BoardReprojectionCost {
    camera: CameraIntrinsics,
    object_points: Vec<Vector3<f64>>,
    pixels: Vec<Vector2<f64>>,
}

fn se3_transform<T: RealField>(pose: &DVector<T>, point: &Vector3<T>) -> Vector3<T> {
    let rotation = UnitQuaternion::from_quaternion(Quaternion::new(
        pose[3].clone(),
        pose[0].clone(),
        pose[1].clone(),
        pose[2].clone(),
    ));
    let translation = Vector3::new(pose[4].clone(), pose[5].clone(), pose[6].clone());
    rotation * point + translation
}

impl BoardReprojectionCost {
    fn new(camera: CameraIntrinsics, object_points: &[Vector3<f64>], pixels: &[Vector2<f64>]) -> Self {
        Self {
            camera,
            object_points: object_points.to_vec(),
            pixels: pixels.to_vec(),
        }
    }

    /// Brown-Conrady projection with the camera's fixed coefficients.
    fn project<T: RealField>(&self, p: &Vector3<T>) -> Vector2<T> {
        let c = |v: f64| -> T { nalgebra::convert(v) };
        let k = &self.camera.intrinsics;
        let [k1, k2, p1, p2, k3] = self.camera.distortions;

        let min_z = c(1e-12);
        let z = if p.z.clone() < min_z.clone() {
            min_z
        } else {
            p.z.clone()
        };
        let x = p.x.clone() / z.clone();
        let y = p.y.clone() / z;

        let r2 = x.clone() * x.clone() + y.clone() * y.clone();
        let radial = c(1.0)
            + c(k1) * r2.clone()
            + c(k2) * r2.clone() * r2.clone()
            + c(k3) * r2.clone() * r2.clone() * r2.clone();
        let xy = x.clone() * y.clone();
        let xd = x.clone() * radial.clone()
            + c(2.0 * p1) * xy.clone()
            + c(p2) * (r2.clone() + c(2.0) * x.clone() * x);
        let yd = y.clone() * radial + c(p1) * (r2 + c(2.0) * y.clone() * y) + c(2.0 * p2) * xy;

        Vector2::new(c(k.fx) * xd + c(k.cx), c(k.fy) * yd + c(k.cy))
    }
}

impl<T: RealField> Factor<T> for BoardReprojectionCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let board_pose = &params[0];
        let relative = params.get(1);

        let mut residuals = DVector::zeros(self.pixels.len() * 2);
        for (i, (p3d, p2d)) in self.object_points.iter().zip(&self.pixels).enumerate() {
            let board_point = Vector3::new(
                nalgebra::convert::<f64, T>(p3d.x),
                nalgebra::convert::<f64, T>(p3d.y),
                nalgebra::convert::<f64, T>(p3d.z),
            );
            let mut p_cam = se3_transform(board_pose, &board_point);
            if let Some(rel) = relative {
                p_cam = se3_transform(rel, &p_cam);
            }
            let proj = self.project(&p_cam);
            residuals[i * 2] = proj.x.clone() - nalgebra::convert::<f64, T>(p2d.x);
            residuals[i * 2 + 1] = proj.y.clone() - nalgebra::convert::<f64, T>(p2d.y);
        }
        residuals
    }
}

fn isometry_to_se3(pose: &Isometry3<f64>) -> DVector<f64> {
    let q = pose.rotation.coords;
    let t = pose.translation.vector;
    DVector::from_vec(vec![q[0], q[1], q[2], q[3], t.x, t.y, t.z])
}

fn se3_to_isometry(v: &DVector<f64>) -> Result<Isometry3<f64>, CalibrationError> {
    if v.len() != 7 {
        return Err(CalibrationError::CalibrationFailed(format!(
            "expected se3 vector of length 7, got {}",
            v.len()
        )));
    }
    let rotation = UnitQuaternion::from_quaternion(Quaternion::new(v[3], v[0], v[1], v[2]));
    Ok(Isometry3::from_parts(
        Translation3::new(v[4], v[5], v[6]),
        rotation,
    ))
}

fn view_key(index: usize) -> String {
    format!("view/{}", index)
}

/// Linear starting point for the bundle.
#[derive(Debug, Clone)]
pub struct InitialGuess {
    /// Records that could be seeded, as indices into the dataset.
    pub views: Vec<usize>,
    /// Board pose in camera A for each seeded record.
    pub board_poses: Vec<Isometry3<f64>>,
    /// Camera A to camera B.
    pub relative: Isometry3<f64>,
}

impl StereoOptimizationCost {
    pub fn new() -> Self {
        Self {
            max_iterations: 100,
            verbose: false,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Seeds board poses per record by homography decomposition and averages
    /// the per-record relative poses.
    pub fn initial_guess(
        &self,
        dataset: &CalibrationDataset,
    ) -> Result<InitialGuess, CalibrationError> {
        let mut views = Vec::new();
        let mut board_poses = Vec::new();
        let mut relatives = Vec::new();

        for (i, record) in dataset.records().iter().enumerate() {
            let pose_a =
                estimate_board_pose(dataset.intrinsics_a(), record.object_points(), record.points_a());
            let pose_b =
                estimate_board_pose(dataset.intrinsics_b(), record.object_points(), record.points_b());
            match (pose_a, pose_b) {
                (Ok(pose_a), Ok(pose_b)) => {
                    relatives.push(pose_b * pose_a.inverse());
                    board_poses.push(pose_a);
                    views.push(i);
                }
                (Err(err), _) | (_, Err(err)) => {
                    warn!("record {}: board pose could not be initialised: {}", i, err);
                }
            }
        }

        let relative = average_isometries(&relatives).map_err(|err| {
            CalibrationError::CalibrationFailed(format!("no record could be initialised: {}", err))
        })?;

        Ok(InitialGuess {
            views,
            board_poses,
            relative,
        })
    }

    /// RMS pixel error over both cameras for the given poses.
    fn rms_error(
        dataset: &CalibrationDataset,
        guess: &InitialGuess,
    ) -> Result<f64, CalibrationError> {
        let mut errors = Vec::new();
        for (&idx, pose_a) in guess.views.iter().zip(&guess.board_poses) {
            let record = &dataset.records()[idx];
            let pose_b = guess.relative * pose_a;
            let in_a: Vec<Vector3<f64>> = record
                .object_points()
                .iter()
                .map(|p| pose_a.transform_point(&(*p).into()).coords)
                .collect();
            let in_b: Vec<Vector3<f64>> = record
                .object_points()
                .iter()
                .map(|p| pose_b.transform_point(&(*p).into()).coords)
                .collect();
            errors.extend(reprojection_errors(dataset.intrinsics_a(), &in_a, record.points_a()));
            errors.extend(reprojection_errors(dataset.intrinsics_b(), &in_b, record.points_b()));
        }
        let stats = projection_statistics(&errors)
            .map_err(|err| CalibrationError::CalibrationFailed(err.to_string()))?;
        info!("{:?}", stats);
        Ok(stats.rmse)
    }
}

impl Default for StereoOptimizationCost {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StereoOptimizationCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StereoOptimizationCost [max_iterations: {}, verbose: {}]",
            self.max_iterations, self.verbose
        )
    }
}

impl CalibrationSolver for StereoOptimizationCost {
    fn solve(&self, dataset: &CalibrationDataset) -> Result<SolverOutput, CalibrationError> {
        let mut guess = self.initial_guess(dataset)?;

        if self.verbose {
            info!("Starting stereo extrinsic optimization...");
            info!(
                "{} of {} records initialised",
                guess.views.len(),
                dataset.records().len()
            );
            info!("Initial relative pose: {}", guess.relative);
        }

        let mut problem = tiny_solver::Problem::new();
        let mut initial_values = HashMap::new();

        problem.set_variable_manifold(REL_KEY, Arc::new(SE3Manifold));
        initial_values.insert(REL_KEY.to_string(), isometry_to_se3(&guess.relative));

        for (&idx, pose_a) in guess.views.iter().zip(&guess.board_poses) {
            let record = &dataset.records()[idx];
            let key = view_key(idx);
            problem.set_variable_manifold(&key, Arc::new(SE3Manifold));
            initial_values.insert(key.clone(), isometry_to_se3(pose_a));

            let num_residuals = record.len() * 2;
            let cost_a = BoardReprojectionCost::new(
                *dataset.intrinsics_a(),
                record.object_points(),
                record.points_a(),
            );
            problem.add_residual_block(num_residuals, &[key.as_str()], Box::new(cost_a), None);

            let cost_b = BoardReprojectionCost::new(
                *dataset.intrinsics_b(),
                record.object_points(),
                record.points_b(),
            );
            problem.add_residual_block(
                num_residuals,
                &[key.as_str(), REL_KEY],
                Box::new(cost_b),
                None,
            );
        }

        let options = OptimizerOptions {
            max_iteration: self.max_iterations,
            verbosity_level: 0,
            ..Default::default()
        };
        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(&problem, &initial_values, Some(options))
            .ok_or_else(|| CalibrationError::CalibrationFailed("Optimization failed".to_string()))?;

        if self.verbose {
            info!("Stereo optimization finished");
        }

        let rel = result
            .get(REL_KEY)
            .ok_or_else(|| CalibrationError::CalibrationFailed("missing relative pose".to_string()))?;
        guess.relative = se3_to_isometry(rel)?;
        for (pose, &idx) in guess.board_poses.iter_mut().zip(&guess.views) {
            let value = result.get(&view_key(idx)).ok_or_else(|| {
                CalibrationError::CalibrationFailed(format!("missing board pose {}", idx))
            })?;
            *pose = se3_to_isometry(value)?;
        }

        let residual = Self::rms_error(dataset, &guess)?;
        if self.verbose {
            info!("Optimized relative pose: {}", guess.relative);
        }

        Ok(SolverOutput {
            rotation: guess.relative.rotation.to_rotation_matrix().into_inner(),
            translation: guess.relative.translation.vector,
            residual,
        })
    }
}
