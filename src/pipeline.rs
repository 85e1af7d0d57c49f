//! End-to-end calibration of one camera pair and assembly of rig poses.

use crate::accumulator::{AccumulatorStats, CalibrationAccumulator, CornerDetector};
use crate::board::BoardModel;
use crate::camera::CameraIntrinsics;
use crate::error::CalibrationError;
use crate::geometry::{CameraPose, ExtrinsicTransform};
use crate::io;
use crate::optimization::{calibrate, CalibrationDataset, CalibrationSolver};

use log::{info, warn};
use nalgebra::{Matrix3, Matrix4};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Paths of one pair calibration under a task directory.
///
/// Layout: `<task>/cali_T_{base}_{sub}/{cam{base}, cam{sub}, intrinsics.yaml, extrinsics.yaml}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairTask {
    pub base_id: u32,
    pub sub_id: u32,
    pub dir: PathBuf,
}

impl PairTask {
    pub fn new(task_path: &Path, base_id: u32, sub_id: u32) -> Self {
        Self {
            base_id,
            sub_id,
            dir: task_path.join(format!("cali_T_{}_{}", base_id, sub_id)),
        }
    }

    pub fn base_dir(&self) -> PathBuf {
        self.dir.join(format!("cam{}", self.base_id))
    }

    pub fn sub_dir(&self) -> PathBuf {
        self.dir.join(format!("cam{}", self.sub_id))
    }

    pub fn intrinsics_file(&self) -> PathBuf {
        self.dir.join("intrinsics.yaml")
    }

    pub fn extrinsics_file(&self) -> PathBuf {
        self.dir.join("extrinsics.yaml")
    }

    pub fn correspondences_file(&self) -> PathBuf {
        self.dir.join("correspondences.csv")
    }
}

/// Outcome of a successful pair calibration.
#[derive(Debug, Clone)]
pub struct PairCalibration {
    pub transform: ExtrinsicTransform,
    pub stats: AccumulatorStats,
    pub dataset: CalibrationDataset,
}

/// Detects, matches and accumulates every pair, then solves.
///
/// Nothing is returned unless the dataset holds at least five records and the
/// solver's residual passes the acceptance check.
pub fn run_pair_calibration<'p, D, S, I>(
    board: &BoardModel,
    detector: &D,
    pairs: I,
    intrinsics_a: CameraIntrinsics,
    intrinsics_b: CameraIntrinsics,
    solver: &S,
) -> Result<PairCalibration, CalibrationError>
where
    D: CornerDetector,
    D::Image: 'p,
    S: CalibrationSolver + ?Sized,
    I: IntoIterator<Item = (&'p D::Image, &'p D::Image)>,
{
    let mut accumulator = CalibrationAccumulator::new(board);
    accumulator.extend_pairs(detector, pairs)?;
    let stats = accumulator.stats();
    let records = accumulator.finish()?;

    let dataset = CalibrationDataset::new(records, intrinsics_a, intrinsics_b)?;
    let transform = calibrate(solver, &dataset)?;
    info!("Stereo calibration successful.");
    info!("Rotation matrix: {}", transform.rotation());
    info!("Translation vector: {}", transform.translation());

    Ok(PairCalibration {
        transform,
        stats,
        dataset,
    })
}

/// Runs a pair calibration over the task directory and writes its results.
///
/// `extrinsics.yaml` and `correspondences.csv` are only left on disk when
/// calibration and both writes have succeeded.
pub fn calibrate_task<S: CalibrationSolver + ?Sized>(
    task: &PairTask,
    board: &BoardModel,
    solver: &S,
    extension: &str,
) -> Result<PairCalibration, CalibrationError> {
    let intrinsics_file = task.intrinsics_file();
    let intrinsics_a = io::load_intrinsics(&intrinsics_file, task.base_id)?;
    let intrinsics_b = io::load_intrinsics(&intrinsics_file, task.sub_id)?;
    info!("Camera intrinsics loaded successfully.");

    let pairs = io::list_pairs(&task.base_dir(), &task.sub_dir(), extension)?;
    let detector = io::DetectionFileReader;
    let result = run_pair_calibration(
        board,
        &detector,
        pairs.iter().map(|(a, b)| (a, b)),
        intrinsics_a,
        intrinsics_b,
        solver,
    )?;

    let correspondences_file = task.correspondences_file();
    io::export_correspondences_csv(&correspondences_file, result.dataset.records())?;
    if let Err(err) = io::save_extrinsics(
        &task.extrinsics_file(),
        task.base_id,
        task.sub_id,
        &result.transform,
    ) {
        if let Err(remove_err) = fs::remove_file(&correspondences_file) {
            warn!(
                "Could not remove {}: {}",
                correspondences_file.display(),
                remove_err
            );
        }
        return Err(err);
    }
    Ok(result)
}

/// Poses of the rig cameras in the base camera's frame.
#[derive(Debug, Clone, Default)]
pub struct RigPoses {
    /// Sub camera id → pose in the base (world) frame.
    pub poses: BTreeMap<u32, CameraPose>,
    /// Sub camera id → homogeneous `T_{base}_{sub}`.
    pub transforms: BTreeMap<u32, Matrix4<f64>>,
    /// Camera id → camera matrix, for every camera whose intrinsics were found.
    pub intrinsics: BTreeMap<u32, Matrix3<f64>>,
}

impl RigPoses {
    /// Homogeneous camera-to-world matrix of `cam_id`; the base camera is the identity.
    pub fn world_pose(&self, base_id: u32, cam_id: u32) -> Option<Matrix4<f64>> {
        if cam_id == base_id {
            return Some(Matrix4::identity());
        }
        self.poses.get(&cam_id).map(CameraPose::to_homogeneous)
    }
}

/// Loads every `T_{base}_{sub}` under the task directory and inverts it into a pose.
///
/// Sub cameras whose calibration directory or extrinsics are missing are skipped.
pub fn rig_poses(
    task_path: &Path,
    base_id: u32,
    sub_ids: &[u32],
) -> Result<RigPoses, CalibrationError> {
    if !task_path.is_dir() {
        return Err(CalibrationError::MissingResource(format!(
            "Task path does not exist: {}",
            task_path.display()
        )));
    }

    let mut rig = RigPoses::default();
    for &sub_id in sub_ids {
        let task = PairTask::new(task_path, base_id, sub_id);
        if !task.dir.is_dir() {
            warn!("Calibration directory not found: {}", task.dir.display());
            continue;
        }

        let transform = match io::load_extrinsics(&task.extrinsics_file(), base_id, sub_id) {
            Ok(transform) => transform,
            Err(err) => {
                warn!("Skipping camera {} due to missing extrinsics: {}", sub_id, err);
                continue;
            }
        };
        rig.poses.insert(sub_id, transform.camera_pose());
        rig.transforms.insert(sub_id, transform.to_homogeneous());
        info!("Added camera {} to the rig.", sub_id);

        let intrinsics_file = task.intrinsics_file();
        for cam_id in [base_id, sub_id] {
            match io::load_intrinsics(&intrinsics_file, cam_id) {
                Ok(camera) => {
                    rig.intrinsics.insert(cam_id, camera.camera_matrix());
                }
                Err(err) => warn!("No intrinsics for camera {}: {}", cam_id, err),
            }
        }
    }
    Ok(rig)
}

/// Collects the rig and writes `summary.txt` into the task directory.
pub fn export_rig_summary(
    task_path: &Path,
    base_id: u32,
    sub_ids: &[u32],
) -> Result<RigPoses, CalibrationError> {
    let rig = rig_poses(task_path, base_id, sub_ids)?;
    io::export_summary(
        &task_path.join("summary.txt"),
        base_id,
        sub_ids,
        &rig.intrinsics,
        &rig.transforms,
    )?;
    Ok(rig)
}
