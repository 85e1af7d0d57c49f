use approx::assert_relative_eq;
use nalgebra::{Isometry3, Matrix3, Matrix4, Translation3, UnitQuaternion, Vector3, Vector4};
use rig_extrinsics::io::{self, save_detections};
use rig_extrinsics::optimization::{CalibrationDataset, CalibrationSolver, SolverOutput};
use rig_extrinsics::pipeline::{
    calibrate_task, export_rig_summary, rig_poses, run_pair_calibration, PairTask,
};
use rig_extrinsics::{
    ArucoDictionary, BoardModel, CalibrationError, CameraIntrinsics, CornerDetector,
    CornerObservation, ExtrinsicTransform, Intrinsics, StereoOptimizationCost,
};
use std::cell::Cell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

struct FakeSolver {
    residual: f64,
}

impl CalibrationSolver for FakeSolver {
    fn solve(&self, _dataset: &CalibrationDataset) -> Result<SolverOutput, CalibrationError> {
        Ok(SolverOutput {
            rotation: Matrix3::identity(),
            translation: Vector3::new(-0.1, 0.0, 0.0),
            residual: self.residual,
        })
    }
}

fn board() -> BoardModel {
    BoardModel::new(5, 7, 0.03, 0.024, ArucoDictionary::Dict4x4_50).unwrap()
}

fn camera(fx: f64, k1: f64) -> CameraIntrinsics {
    CameraIntrinsics::new(
        Intrinsics {
            fx,
            fy: fx,
            cx: 320.0,
            cy: 240.0,
        },
        [k1, 0.01, 0.0, 0.0, 0.0],
    )
    .unwrap()
}

fn intrinsics_yaml(cams: &[(u32, CameraIntrinsics)]) -> String {
    let mut out = String::new();
    for (id, cam) in cams {
        let k = &cam.intrinsics;
        let d = cam.distortions;
        out.push_str(&format!(
            "cam{}:\n  camera_matrix: [[{:?}, 0.0, {:?}], [0.0, {:?}, {:?}], [0.0, 0.0, 1.0]]\n  dist_coefficients: [{:?}, {:?}, {:?}, {:?}, {:?}]\n",
            id, k.fx, k.cx, k.fy, k.cy, d[0], d[1], d[2], d[3], d[4]
        ));
    }
    out
}

/// Board poses in the base camera that keep the whole board in view.
fn board_poses(n: usize) -> Vec<Isometry3<f64>> {
    (0..n)
        .map(|v| {
            let s = v as f64;
            Isometry3::from_parts(
                Translation3::new(-0.05 + 0.01 * s, -0.08 + 0.005 * s, 0.6 + 0.04 * s),
                UnitQuaternion::from_euler_angles(0.15 - 0.05 * s, -0.2 + 0.07 * s, 0.03 * s),
            )
        })
        .collect()
}

fn observe(
    board: &BoardModel,
    camera: &CameraIntrinsics,
    pose: &Isometry3<f64>,
    ids: impl Iterator<Item = u32>,
) -> CornerObservation {
    CornerObservation::new(ids.map(|id| {
        let p = board.object_point(id).unwrap();
        let pc = pose.transform_point(&(*p).into()).coords;
        (id, camera.project(&pc).unwrap())
    }))
    .unwrap()
}

/// Writes a task directory with `good` fully visible pairs plus `bad` pairs
/// where the sub camera sees only three corners.
fn write_task(
    task_path: &Path,
    base_id: u32,
    sub_id: u32,
    relative: &Isometry3<f64>,
    good: usize,
    bad: usize,
) -> PairTask {
    let board = board();
    let cam_a = camera(500.0, -0.05);
    let cam_b = camera(520.0, 0.02);
    let task = PairTask::new(task_path, base_id, sub_id);
    fs::create_dir_all(task.base_dir()).unwrap();
    fs::create_dir_all(task.sub_dir()).unwrap();
    fs::write(
        task.intrinsics_file(),
        intrinsics_yaml(&[(base_id, cam_a), (sub_id, cam_b)]),
    )
    .unwrap();

    for (i, pose_a) in board_poses(good + bad).iter().enumerate() {
        let pose_b = relative * pose_a;
        let name = format!("{:03}.yaml", i);
        let obs_a = observe(&board, &cam_a, pose_a, board.ids());
        let obs_b = if i < good {
            observe(&board, &cam_b, &pose_b, board.ids())
        } else {
            observe(&board, &cam_b, &pose_b, 0..3)
        };
        save_detections(&task.base_dir().join(&name), &obs_a).unwrap();
        save_detections(&task.sub_dir().join(&name), &obs_b).unwrap();
    }
    task
}

fn relative_truth() -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::new(-0.12, 0.005, 0.01),
        UnitQuaternion::from_euler_angles(0.01, 0.08, -0.02),
    )
}

#[test]
fn test_negative_residual_fails_without_writing_extrinsics() {
    let dir = tempdir().unwrap();
    let task = write_task(dir.path(), 0, 1, &relative_truth(), 8, 0);

    let err = calibrate_task(&task, &board(), &FakeSolver { residual: -1.0 }, "yaml").unwrap_err();
    assert!(matches!(err, CalibrationError::CalibrationFailed(_)));
    assert!(!task.extrinsics_file().exists());
}

/// In-memory detector: image name to a pre-baked observation.
struct MemoryDetector(HashMap<String, CornerObservation>);

impl CornerDetector for MemoryDetector {
    type Image = String;

    fn detect(&self, image: &String) -> Result<Option<CornerObservation>, CalibrationError> {
        Ok(self.0.get(image).filter(|obs| obs.is_valid()).cloned())
    }
}

/// Records the dataset size it was called with and reports failure.
struct RejectingSolver {
    records_seen: Cell<usize>,
}

impl CalibrationSolver for RejectingSolver {
    fn solve(&self, dataset: &CalibrationDataset) -> Result<SolverOutput, CalibrationError> {
        self.records_seen.set(dataset.records().len());
        Ok(SolverOutput {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
            residual: -1.0,
        })
    }
}

#[test]
fn test_overlap_skip_then_solver_failure() {
    let board = board();
    let cam = camera(500.0, 0.0);
    let poses = board_poses(6);
    let mut observations = HashMap::new();
    let mut pairs = Vec::new();
    for (i, pose) in poses.iter().enumerate() {
        let (ids_a, ids_b): (Vec<u32>, Vec<u32>) = if i == 2 {
            (vec![0, 1, 2, 3, 4], vec![2, 3, 4, 5, 6])
        } else {
            (board.ids().collect(), board.ids().collect())
        };
        let a = format!("a{}", i);
        let b = format!("b{}", i);
        observations.insert(a.clone(), observe(&board, &cam, pose, ids_a.into_iter()));
        observations.insert(b.clone(), observe(&board, &cam, pose, ids_b.into_iter()));
        pairs.push((a, b));
    }

    let solver = RejectingSolver {
        records_seen: Cell::new(0),
    };
    let result = run_pair_calibration(
        &board,
        &MemoryDetector(observations),
        pairs.iter().map(|(a, b)| (a, b)),
        cam,
        cam,
        &solver,
    );
    assert!(matches!(result, Err(CalibrationError::CalibrationFailed(_))));
    assert_eq!(solver.records_seen.get(), 5);
}

#[test]
fn test_too_few_pairs_is_insufficient_data() {
    let dir = tempdir().unwrap();
    let task = write_task(dir.path(), 0, 1, &relative_truth(), 4, 3);

    match calibrate_task(&task, &board(), &FakeSolver { residual: 0.1 }, "yaml") {
        Err(CalibrationError::InsufficientData { found, required }) => {
            assert_eq!(found, 4);
            assert_eq!(required, 5);
        }
        other => panic!("expected InsufficientData, got {:?}", other.map(|r| r.transform)),
    }
    assert!(!task.extrinsics_file().exists());
}

#[test]
fn test_fake_solver_result_is_written() {
    let dir = tempdir().unwrap();
    let task = write_task(dir.path(), 2, 1, &relative_truth(), 5, 2);

    let result = calibrate_task(&task, &board(), &FakeSolver { residual: 0.25 }, "yaml").unwrap();
    assert_eq!(result.stats.processed, 7);
    assert_eq!(result.stats.accepted, 5);
    assert_eq!(result.stats.skipped_detection, 2);
    assert_eq!(result.dataset.records().len(), 5);

    let saved = io::load_extrinsics(&task.extrinsics_file(), 2, 1).unwrap();
    assert_eq!(saved.translation(), &Vector3::new(-0.1, 0.0, 0.0));
    assert_relative_eq!(saved.residual(), 0.25);

    let csv = fs::read_to_string(task.correspondences_file()).unwrap();
    assert_eq!(csv.lines().count(), 1 + 5 * 24);
}

#[test]
fn test_failed_csv_write_leaves_no_extrinsics() {
    let dir = tempdir().unwrap();
    let task = write_task(dir.path(), 2, 1, &relative_truth(), 5, 0);
    fs::create_dir_all(task.correspondences_file()).unwrap();

    assert!(matches!(
        calibrate_task(&task, &board(), &FakeSolver { residual: 0.25 }, "yaml"),
        Err(CalibrationError::Io(_))
    ));
    assert!(!task.extrinsics_file().exists());
}

#[test]
fn test_failed_extrinsics_write_removes_csv() {
    let dir = tempdir().unwrap();
    let task = write_task(dir.path(), 2, 1, &relative_truth(), 5, 0);
    fs::create_dir_all(task.extrinsics_file()).unwrap();

    assert!(calibrate_task(&task, &board(), &FakeSolver { residual: 0.25 }, "yaml").is_err());
    assert!(!task.correspondences_file().exists());
}

#[test]
fn test_mismatched_directories_are_rejected() {
    let dir = tempdir().unwrap();
    let task = write_task(dir.path(), 0, 1, &relative_truth(), 6, 0);
    fs::remove_file(task.sub_dir().join("005.yaml")).unwrap();

    assert!(matches!(
        calibrate_task(&task, &board(), &FakeSolver { residual: 0.1 }, "yaml"),
        Err(CalibrationError::InputMismatch { left: 6, right: 5 })
    ));
}

#[test]
fn test_synthetic_rig_is_recovered() {
    let dir = tempdir().unwrap();
    let truth = relative_truth();
    let task = write_task(dir.path(), 0, 1, &truth, 7, 1);

    let solver = StereoOptimizationCost::new().with_verbose(true);
    let result = calibrate_task(&task, &board(), &solver, "yaml").unwrap();

    assert_relative_eq!(
        *result.transform.rotation(),
        truth.rotation.to_rotation_matrix().into_inner(),
        epsilon = 1e-5
    );
    assert_relative_eq!(
        *result.transform.translation(),
        truth.translation.vector,
        epsilon = 1e-5
    );
    assert!(result.transform.residual() < 1e-3);

    let rig = rig_poses(dir.path(), 0, &[1]).unwrap();
    let pose = rig.poses[&1];
    let expected = truth.inverse();
    assert_relative_eq!(pose.position, expected.translation.vector, epsilon = 1e-5);
    assert_relative_eq!(
        pose.rotation,
        expected.rotation.to_rotation_matrix().into_inner(),
        epsilon = 1e-5
    );
}

#[test]
fn test_rig_summary_skips_missing_pairs() {
    let dir = tempdir().unwrap();
    let task = PairTask::new(dir.path(), 0, 1);
    fs::create_dir_all(&task.dir).unwrap();
    fs::write(
        task.intrinsics_file(),
        intrinsics_yaml(&[(0, camera(500.0, 0.0)), (1, camera(520.0, 0.0))]),
    )
    .unwrap();
    let transform =
        ExtrinsicTransform::new(Matrix3::identity(), Vector3::new(0.0, 0.0, 1.0), 0.2).unwrap();
    io::save_extrinsics(&task.extrinsics_file(), 0, 1, &transform).unwrap();

    let rig = export_rig_summary(dir.path(), 0, &[1, 3]).unwrap();
    assert_eq!(rig.poses.len(), 1);
    assert_relative_eq!(rig.poses[&1].position, Vector3::new(0.0, 0.0, -1.0));

    // The sub camera's own origin maps to the base camera's origin.
    let world = rig.world_pose(0, 1).unwrap() * Vector4::new(0.0, 0.0, 1.0, 1.0);
    assert_relative_eq!(world, Vector4::new(0.0, 0.0, 0.0, 1.0), epsilon = 1e-12);
    assert_eq!(rig.world_pose(0, 0), Some(Matrix4::identity()));
    assert_eq!(rig.intrinsics.len(), 2);

    let summary = fs::read_to_string(dir.path().join("summary.txt")).unwrap();
    assert!(summary.starts_with("cam0\n    intrinsic\n"));
    assert!(summary.contains("    T_0_1: \n"));
    assert!(summary.contains("[0.0, 0.0, 1.0, 1.0],"));
    assert!(summary.contains("cam3\n    intrinsic\n        []\n"));
}

#[test]
fn test_missing_task_path_is_reported() {
    let dir = tempdir().unwrap();
    assert!(matches!(
        rig_poses(&dir.path().join("nope"), 0, &[1]),
        Err(CalibrationError::MissingResource(_))
    ));
}

#[test]
fn test_observation_of_whole_board() {
    let board = board();
    let obs = observe(&board, &camera(500.0, 0.0), &board_poses(1)[0], board.ids());
    assert_eq!(obs.len(), board.len());
    assert!(obs.iter().all(|(_, p)| p.x > 0.0 && p.x < 640.0 && p.y > 0.0 && p.y < 480.0));
}
