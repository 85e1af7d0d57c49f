//! Rig Extrinsics Library
//!
//! Extrinsic calibration of multi-camera rigs from ChArUco board detections.
//! For a pair of cameras with known intrinsics the library:
//! - models the ChArUco board and its corner ids
//! - matches the corners both cameras saw at the same instant
//! - accumulates matched pairs into a calibration dataset
//! - solves for the rigid transform between the cameras
//! - composes and inverts transforms into rig poses
//!
//! The default solver refines board poses and the relative pose with the
//! tiny-solver Levenberg-Marquardt optimizer while keeping intrinsics fixed.

pub mod accumulator;
pub mod board;
pub mod camera;
pub mod error;
pub mod geometry;
pub mod io;
pub mod matcher;
pub mod observation;
pub mod optimization;
pub mod pipeline;

// Re-export commonly used types
pub use accumulator::{AccumulatorStats, CalibrationAccumulator, CornerDetector, PairOutcome};
pub use board::{ArucoDictionary, BoardConfig, BoardModel};
pub use camera::{CameraIntrinsics, Intrinsics};
pub use error::CalibrationError;
pub use geometry::{compose, invert, CameraPose, ExtrinsicTransform};
pub use matcher::match_observations;
pub use observation::{CornerObservation, CorrespondenceRecord};
pub use optimization::{
    calibrate, CalibrationDataset, CalibrationSolver, SolverOutput, StereoOptimizationCost,
};
pub use pipeline::{rig_poses, run_pair_calibration, PairTask};
