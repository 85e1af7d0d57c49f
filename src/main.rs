//! Command line front end for pair calibration and rig summaries.
//!
//! Usage:
//! ```bash
//! rig-extrinsics calibrate --basecam-id 2 --subcam-id 1 \
//!   --task-path data/task --board board.yaml
//! rig-extrinsics summary --basecam-id 2 --subcam-id 1 3 4 --task-path data/task
//! ```

use clap::{Parser, Subcommand};
use log::{error, info};
use rig_extrinsics::io::{self, DEFAULT_DETECTION_EXTENSION};
use rig_extrinsics::pipeline::{calibrate_task, export_rig_summary, PairTask};
use rig_extrinsics::StereoOptimizationCost;
use std::path::PathBuf;
use std::process::ExitCode;

/// Extrinsic calibration of camera rigs from ChArUco detections
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calibrate the transform between a base camera and one sub camera
    Calibrate {
        /// Base camera ID
        #[arg(long)]
        basecam_id: u32,

        /// Sub camera ID
        #[arg(long)]
        subcam_id: u32,

        /// Path to calibration task directory
        #[arg(long)]
        task_path: PathBuf,

        /// Path to the board YAML configuration file
        #[arg(long)]
        board: PathBuf,

        /// Extension of the detection files in each camera directory
        #[arg(long, default_value = DEFAULT_DETECTION_EXTENSION)]
        extension: String,

        /// Maximum number of Levenberg-Marquardt iterations
        #[arg(long, default_value = "100")]
        max_iterations: usize,

        /// Log solver progress
        #[arg(short, long)]
        verbose: bool,
    },
    /// Collect calibrated pairs into rig poses and export summary.txt
    Summary {
        /// Base camera ID
        #[arg(long)]
        basecam_id: u32,

        /// Sub camera IDs
        #[arg(long, num_args = 1.., required = true)]
        subcam_id: Vec<u32>,

        /// Path to calibration task directory
        #[arg(long)]
        task_path: PathBuf,
    },
}

fn run(cli: Cli) -> Result<(), rig_extrinsics::CalibrationError> {
    match cli.command {
        Command::Calibrate {
            basecam_id,
            subcam_id,
            task_path,
            board,
            extension,
            max_iterations,
            verbose,
        } => {
            let board = io::load_board(&board)?;
            let task = PairTask::new(&task_path, basecam_id, subcam_id);
            let solver = StereoOptimizationCost::new()
                .with_max_iterations(max_iterations)
                .with_verbose(verbose);
            let result = calibrate_task(&task, &board, &solver, &extension)?;
            info!(
                "T_{}_{} calibrated from {} of {} pairs, error {:.4}",
                basecam_id,
                subcam_id,
                result.stats.accepted,
                result.stats.processed,
                result.transform.residual()
            );
        }
        Command::Summary {
            basecam_id,
            subcam_id,
            task_path,
        } => {
            let rig = export_rig_summary(&task_path, basecam_id, &subcam_id)?;
            for (cam_id, pose) in &rig.poses {
                info!("cam{} position in cam{}: {}", cam_id, basecam_id, pose.position);
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}
