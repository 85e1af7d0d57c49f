//! File formats of a calibration task.
//!
//! Board, intrinsics and extrinsics files are YAML. Detection files hold the
//! corners found by the external detector, one file per captured image, in
//! YAML or JSON.

use crate::accumulator::CornerDetector;
use crate::board::{BoardConfig, BoardModel};
use crate::camera::CameraIntrinsics;
use crate::error::CalibrationError;
use crate::geometry::ExtrinsicTransform;
use crate::observation::{CornerObservation, CorrespondenceRecord};

use log::{debug, info, warn};
use nalgebra::{Matrix3, Matrix4, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use yaml_rust::{Yaml, YamlLoader};

/// Extension of detection files produced by the corner extractor.
pub const DEFAULT_DETECTION_EXTENSION: &str = "yaml";

fn read_to_string(path: &Path) -> Result<String, CalibrationError> {
    fs::read_to_string(path).map_err(|e| {
        CalibrationError::MissingResource(format!("{}: {}", path.display(), e))
    })
}

fn load_yaml_doc(path: &Path) -> Result<Yaml, CalibrationError> {
    let contents = read_to_string(path)?;
    let mut docs = YamlLoader::load_from_str(&contents)?;
    if docs.is_empty() {
        return Err(CalibrationError::Yaml(format!(
            "Empty YAML document: {}",
            path.display()
        )));
    }
    Ok(docs.swap_remove(0))
}

/// Numeric value of a YAML scalar; integers are accepted.
fn yaml_f64(node: &Yaml) -> Option<f64> {
    match node {
        Yaml::Real(_) => node.as_f64(),
        Yaml::Integer(v) => Some(*v as f64),
        _ => None,
    }
}

fn yaml_matrix3(node: &Yaml, what: &str) -> Result<Matrix3<f64>, CalibrationError> {
    let rows = node
        .as_vec()
        .filter(|rows| rows.len() == 3)
        .ok_or_else(|| CalibrationError::Configuration(format!("{} must be a 3x3 matrix", what)))?;
    let mut m = Matrix3::zeros();
    for (r, row) in rows.iter().enumerate() {
        let cols = row.as_vec().filter(|cols| cols.len() == 3).ok_or_else(|| {
            CalibrationError::Configuration(format!("{} row {} must have 3 values", what, r))
        })?;
        for (c, value) in cols.iter().enumerate() {
            m[(r, c)] = yaml_f64(value).ok_or_else(|| {
                CalibrationError::Configuration(format!("{}[{}][{}] is not a number", what, r, c))
            })?;
        }
    }
    Ok(m)
}

/// Accepts both a column `[[x], [y], [z]]` and a flat `[x, y, z]`.
fn yaml_vector3(node: &Yaml, what: &str) -> Result<Vector3<f64>, CalibrationError> {
    let values: Vec<f64> = node
        .as_vec()
        .ok_or_else(|| CalibrationError::Configuration(format!("{} must be a sequence", what)))?
        .iter()
        .map(|item| match item {
            Yaml::Array(inner) if inner.len() == 1 => yaml_f64(&inner[0]),
            other => yaml_f64(other),
        })
        .collect::<Option<_>>()
        .ok_or_else(|| CalibrationError::Configuration(format!("{} is not numeric", what)))?;
    if values.len() != 3 {
        return Err(CalibrationError::Configuration(format!(
            "{} must have 3 values, found {}",
            what,
            values.len()
        )));
    }
    Ok(Vector3::new(values[0], values[1], values[2]))
}

/// Reads a board description. An empty file yields the default board.
pub fn load_board_config(path: &Path) -> Result<BoardConfig, CalibrationError> {
    let contents = read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(BoardConfig::default());
    }
    let config: BoardConfig = serde_yaml::from_str(&contents)
        .map_err(|e| CalibrationError::Configuration(format!("{}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn load_board(path: &Path) -> Result<BoardModel, CalibrationError> {
    let config = load_board_config(path)?;
    let board = BoardModel::from_config(&config)?;
    info!(
        "ChArUco board loaded: {}x{} squares, {} corners, {}",
        board.squares_x(),
        board.squares_y(),
        board.len(),
        board.dictionary()
    );
    Ok(board)
}

/// Loads `cam{cam_id}` from an intrinsics file.
pub fn load_intrinsics(path: &Path, cam_id: u32) -> Result<CameraIntrinsics, CalibrationError> {
    let doc = load_yaml_doc(path)?;
    let key = format!("cam{}", cam_id);
    let node = &doc[key.as_str()];
    if node.is_badvalue() {
        return Err(CalibrationError::MissingResource(format!(
            "{} not found in {}",
            key,
            path.display()
        )));
    }

    let camera_matrix = yaml_matrix3(&node["camera_matrix"], "camera_matrix")?;
    let distortions = node["dist_coefficients"]
        .as_vec()
        .ok_or_else(|| {
            CalibrationError::Configuration(format!("{}: missing dist_coefficients", key))
        })?
        .iter()
        .map(|value| match value {
            // OpenCV sometimes writes the coefficients as a 1×5 matrix.
            Yaml::Array(inner) => inner.iter().map(yaml_f64).collect::<Option<Vec<_>>>(),
            other => yaml_f64(other).map(|v| vec![v]),
        })
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| {
            CalibrationError::Configuration(format!("{}: dist_coefficients must be numeric", key))
        })?
        .concat();

    let camera = CameraIntrinsics::from_camera_matrix(&camera_matrix, &distortions)?;
    debug!("{} intrinsics: {:?}", key, camera);
    Ok(camera)
}

fn matrix_rows(m: &Matrix3<f64>) -> Vec<Vec<f64>> {
    (0..3).map(|r| (0..3).map(|c| m[(r, c)]).collect()).collect()
}

/// Writes `T_{a}_{b}` with `R`, `T` (as a 3×1 column) and `stereo_calib_error`.
pub fn save_extrinsics(
    path: &Path,
    base_id: u32,
    sub_id: u32,
    transform: &ExtrinsicTransform,
) -> Result<(), CalibrationError> {
    let t = transform.translation();
    let entry = serde_yaml::Mapping::from_iter([
        (
            serde_yaml::Value::String("R".to_string()),
            serde_yaml::to_value(matrix_rows(transform.rotation()))?,
        ),
        (
            serde_yaml::Value::String("T".to_string()),
            serde_yaml::to_value(vec![vec![t.x], vec![t.y], vec![t.z]])?,
        ),
        (
            serde_yaml::Value::String("stereo_calib_error".to_string()),
            serde_yaml::to_value(transform.residual())?,
        ),
    ]);
    let yaml = serde_yaml::Mapping::from_iter([(
        serde_yaml::Value::String(format!("T_{}_{}", base_id, sub_id)),
        serde_yaml::Value::Mapping(entry),
    )]);

    let yaml_string = serde_yaml::to_string(&yaml)?;
    fs::write(path, yaml_string)?;
    info!("Extrinsic parameters saved to {}", path.display());
    Ok(())
}

pub fn load_extrinsics(
    path: &Path,
    base_id: u32,
    sub_id: u32,
) -> Result<ExtrinsicTransform, CalibrationError> {
    let doc = load_yaml_doc(path)?;
    let key = format!("T_{}_{}", base_id, sub_id);
    let node = &doc[key.as_str()];
    if node.is_badvalue() {
        return Err(CalibrationError::MissingResource(format!(
            "Extrinsics key '{}' not found in {}",
            key,
            path.display()
        )));
    }

    let rotation = yaml_matrix3(&node["R"], "R")?;
    let translation = yaml_vector3(&node["T"], "T")?;
    let residual = yaml_f64(&node["stereo_calib_error"]).ok_or_else(|| {
        CalibrationError::Configuration(format!(
            "{}: 'stereo_calib_error' missing or not a number in {}",
            key,
            path.display()
        ))
    })?;
    ExtrinsicTransform::new(rotation, translation, residual)
        .map_err(|e| CalibrationError::Configuration(format!("{}: {}", key, e)))
}

fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, CalibrationError> {
    if !dir.is_dir() {
        return Err(CalibrationError::MissingResource(format!(
            "directory not found: {}",
            dir.display()
        )));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
        if path.is_file() && matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Sorted files of both camera directories, paired by position.
pub fn list_pairs(
    dir_a: &Path,
    dir_b: &Path,
    extension: &str,
) -> Result<Vec<(PathBuf, PathBuf)>, CalibrationError> {
    let files_a = list_files(dir_a, extension)?;
    let files_b = list_files(dir_b, extension)?;
    if files_a.len() != files_b.len() {
        return Err(CalibrationError::InputMismatch {
            left: files_a.len(),
            right: files_b.len(),
        });
    }
    info!("Found {} image pairs.", files_a.len());
    Ok(files_a.into_iter().zip(files_b).collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DetectedCorner {
    id: u32,
    x: f64,
    y: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DetectionFile {
    #[serde(default)]
    corners: Vec<DetectedCorner>,
}

/// Corner detector backed by detection files written by the external extractor.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectionFileReader;

impl DetectionFileReader {
    fn parse(path: &Path, contents: &str) -> Result<DetectionFile, CalibrationError> {
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(contents)?)
        } else if contents.trim().is_empty() {
            Ok(DetectionFile::default())
        } else {
            Ok(serde_yaml::from_str(contents)?)
        }
    }
}

impl CornerDetector for DetectionFileReader {
    type Image = PathBuf;

    fn detect(&self, image: &PathBuf) -> Result<Option<CornerObservation>, CalibrationError> {
        let contents = read_to_string(image)?;
        let file = Self::parse(image, &contents)?;

        let observation = match CornerObservation::new(
            file.corners
                .iter()
                .map(|c| (c.id, nalgebra::Vector2::new(c.x, c.y))),
        ) {
            Ok(observation) => observation,
            Err(err) => {
                warn!("{}: {}", image.display(), err);
                return Ok(None);
            }
        };

        if !observation.is_valid() {
            debug!(
                "{}: only {} corners detected",
                image.display(),
                observation.len()
            );
            return Ok(None);
        }
        Ok(Some(observation))
    }
}

/// Writes one observation in the detection-file format.
pub fn save_detections(path: &Path, observation: &CornerObservation) -> Result<(), CalibrationError> {
    let file = DetectionFile {
        corners: observation
            .iter()
            .map(|(&id, p)| DetectedCorner { id, x: p.x, y: p.y })
            .collect(),
    };
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let contents = if is_json {
        serde_json::to_string_pretty(&file)?
    } else {
        serde_yaml::to_string(&file)?
    };
    fs::write(path, contents)?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct CorrespondenceRow {
    record: usize,
    id: u32,
    x: f64,
    y: f64,
    z: f64,
    u_a: f64,
    v_a: f64,
    u_b: f64,
    v_b: f64,
}

/// Dumps every matched corner of the dataset, one CSV row per corner.
pub fn export_correspondences_csv(
    path: &Path,
    records: &[CorrespondenceRecord],
) -> Result<(), CalibrationError> {
    let mut writer = csv::Writer::from_path(path)?;
    for (index, record) in records.iter().enumerate() {
        for i in 0..record.len() {
            let object = &record.object_points()[i];
            let a = &record.points_a()[i];
            let b = &record.points_b()[i];
            writer.serialize(CorrespondenceRow {
                record: index,
                id: record.ids()[i],
                x: object.x,
                y: object.y,
                z: object.z,
                u_a: a.x,
                v_a: a.y,
                u_b: b.x,
                v_b: b.y,
            })?;
        }
    }
    writer.flush()?;
    debug!("correspondences written to {}", path.display());
    Ok(())
}

/// Renders the rig summary: per camera (ascending id) its intrinsic matrix and,
/// for every camera but the base, the homogeneous `T_{base}_{cam}`.
pub fn format_summary(
    base_id: u32,
    sub_ids: &[u32],
    intrinsics: &BTreeMap<u32, Matrix3<f64>>,
    extrinsics: &BTreeMap<u32, Matrix4<f64>>,
) -> String {
    let mut cam_ids: Vec<u32> = std::iter::once(base_id).chain(sub_ids.iter().copied()).collect();
    cam_ids.sort_unstable();
    cam_ids.dedup();

    let mut out = String::new();
    for cam_id in cam_ids {
        out.push_str(&format!("cam{}\n    intrinsic\n", cam_id));
        match intrinsics.get(&cam_id) {
            Some(k) => {
                let rows: Vec<String> = (0..3)
                    .map(|r| format!("{:?}", [k[(r, 0)], k[(r, 1)], k[(r, 2)]]))
                    .collect();
                out.push_str(&format!("        [{}]\n", rows.join(",\n        ")));
            }
            None => out.push_str("        []\n"),
        }

        if cam_id != base_id {
            let key = format!("T_{}_{}", base_id, cam_id);
            match extrinsics.get(&cam_id) {
                Some(t) => {
                    out.push_str(&format!("    {}: \n", key));
                    for r in 0..4 {
                        out.push_str(&format!(
                            "            {:?},\n",
                            [t[(r, 0)], t[(r, 1)], t[(r, 2)], t[(r, 3)]]
                        ));
                    }
                }
                None => out.push_str(&format!("    \"{}\": \n            []\n", key)),
            }
        }
        out.push('\n');
    }
    out
}

pub fn export_summary(
    path: &Path,
    base_id: u32,
    sub_ids: &[u32],
    intrinsics: &BTreeMap<u32, Matrix3<f64>>,
    extrinsics: &BTreeMap<u32, Matrix4<f64>>,
) -> Result<(), CalibrationError> {
    fs::write(path, format_summary(base_id, sub_ids, intrinsics, extrinsics))?;
    info!("Summary exported to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Rotation3, Vector2};
    use tempfile::tempdir;

    const INTRINSICS: &str = "\
cam0:
  camera_matrix:
    - [600.0, 0, 320.5]
    - [0, 610.0, 240.5]
    - [0, 0, 1]
  dist_coefficients: [-0.1, 0.01, 0.0, 0.0, 0.001]
cam2:
  camera_matrix: [[500, 0, 300], [0, 500, 200], [0, 0, 1]]
  dist_coefficients: [[0.0, 0.0, 0.0, 0.0, 0.0]]
";

    #[test]
    fn test_load_board_config_defaults_and_overrides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("board.yaml");

        fs::write(&path, "").unwrap();
        assert_eq!(load_board_config(&path).unwrap(), BoardConfig::default());

        fs::write(&path, "squares_x: 8\naruco_dict: DICT_5X5_100\n").unwrap();
        let config = load_board_config(&path).unwrap();
        assert_eq!(config.squares_x, 8);
        assert_eq!(config.squares_y, 7);
        assert_eq!(config.aruco_dict, "DICT_5X5_100");

        let board = load_board(&path).unwrap();
        assert_eq!(board.len(), 7 * 6);
    }

    #[test]
    fn test_unknown_dictionary_is_configuration_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("board.yaml");
        fs::write(&path, "aruco_dict: DICT_9X9_1\n").unwrap();
        assert!(matches!(
            load_board(&path),
            Err(CalibrationError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_intrinsics() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("intrinsics.yaml");
        fs::write(&path, INTRINSICS).unwrap();

        let cam0 = load_intrinsics(&path, 0).unwrap();
        assert_relative_eq!(cam0.intrinsics.fx, 600.0);
        assert_relative_eq!(cam0.intrinsics.cy, 240.5);
        assert_eq!(cam0.distortions, [-0.1, 0.01, 0.0, 0.0, 0.001]);

        let cam2 = load_intrinsics(&path, 2).unwrap();
        assert_relative_eq!(cam2.intrinsics.cx, 300.0);
        assert_eq!(cam2.distortions, [0.0; 5]);

        assert!(matches!(
            load_intrinsics(&path, 1),
            Err(CalibrationError::MissingResource(_))
        ));
        assert!(matches!(
            load_intrinsics(&dir.path().join("missing.yaml"), 0),
            Err(CalibrationError::MissingResource(_))
        ));
    }

    #[test]
    fn test_extrinsics_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("extrinsics.yaml");
        let rotation = Rotation3::from_euler_angles(0.01, -0.3, 0.02).into_inner();
        let transform =
            ExtrinsicTransform::new(rotation, Vector3::new(-0.12, 0.003, 0.01), 0.42).unwrap();

        save_extrinsics(&path, 2, 1, &transform).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("T_2_1"));
        assert!(contents.contains("stereo_calib_error"));

        let loaded = load_extrinsics(&path, 2, 1).unwrap();
        assert_relative_eq!(loaded.rotation(), transform.rotation(), epsilon = 1e-12);
        assert_relative_eq!(loaded.translation(), transform.translation(), epsilon = 1e-12);
        assert_relative_eq!(loaded.residual(), 0.42);

        assert!(matches!(
            load_extrinsics(&path, 2, 3),
            Err(CalibrationError::MissingResource(_))
        ));
    }

    #[test]
    fn test_load_extrinsics_accepts_flat_translation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("extrinsics.yaml");
        fs::write(
            &path,
            "T_0_1:\n  R: [[1, 0, 0], [0, 1, 0], [0, 0, 1]]\n  T: [0.5, 0, 1]\n  stereo_calib_error: 0.3\n",
        )
        .unwrap();
        let loaded = load_extrinsics(&path, 0, 1).unwrap();
        assert_eq!(loaded.translation(), &Vector3::new(0.5, 0.0, 1.0));
    }

    #[test]
    fn test_load_extrinsics_requires_residual() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("extrinsics.yaml");
        fs::write(
            &path,
            "T_0_1:\n  R: [[1, 0, 0], [0, 1, 0], [0, 0, 1]]\n  T: [[0.5], [0], [1]]\n\
             T_0_2:\n  R: [[1, 0, 0], [0, 1, 0], [0, 0, 1]]\n  T: [[0.5], [0], [1]]\n  stereo_calib_error: low\n",
        )
        .unwrap();

        assert!(matches!(
            load_extrinsics(&path, 0, 1),
            Err(CalibrationError::Configuration(_))
        ));
        assert!(matches!(
            load_extrinsics(&path, 0, 2),
            Err(CalibrationError::Configuration(_))
        ));
    }

    #[test]
    fn test_list_pairs_sorted_and_checked() {
        let dir = tempdir().unwrap();
        let cam_a = dir.path().join("cam0");
        let cam_b = dir.path().join("cam1");
        fs::create_dir_all(&cam_a).unwrap();
        fs::create_dir_all(&cam_b).unwrap();
        for name in ["002.yaml", "000.yaml", "001.yaml", "notes.txt"] {
            fs::write(cam_a.join(name), "").unwrap();
            fs::write(cam_b.join(name), "").unwrap();
        }

        let pairs = list_pairs(&cam_a, &cam_b, "yaml").unwrap();
        let names: Vec<_> = pairs
            .iter()
            .map(|(a, _)| a.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["000.yaml", "001.yaml", "002.yaml"]);

        fs::write(cam_b.join("003.yaml"), "").unwrap();
        assert!(matches!(
            list_pairs(&cam_a, &cam_b, "yaml"),
            Err(CalibrationError::InputMismatch { left: 3, right: 4 })
        ));
        assert!(matches!(
            list_pairs(&cam_a, &dir.path().join("cam9"), "yaml"),
            Err(CalibrationError::MissingResource(_))
        ));
    }

    #[test]
    fn test_detection_files() {
        let dir = tempdir().unwrap();
        let reader = DetectionFileReader;
        let obs = CornerObservation::new((0..6).map(|id| (id, Vector2::new(id as f64, 2.0)))).unwrap();

        let yaml_path = dir.path().join("000.yaml");
        save_detections(&yaml_path, &obs).unwrap();
        assert_eq!(reader.detect(&yaml_path).unwrap(), Some(obs.clone()));

        let json_path = dir.path().join("000.json");
        save_detections(&json_path, &obs).unwrap();
        assert_eq!(reader.detect(&json_path).unwrap(), Some(obs));

        let few = dir.path().join("001.yaml");
        fs::write(&few, "corners:\n  - {id: 1, x: 1.0, y: 2.0}\n").unwrap();
        assert_eq!(reader.detect(&few).unwrap(), None);

        let empty = dir.path().join("002.yaml");
        fs::write(&empty, "").unwrap();
        assert_eq!(reader.detect(&empty).unwrap(), None);

        let duplicated = dir.path().join("003.yaml");
        fs::write(
            &duplicated,
            "corners:\n  - {id: 1, x: 1.0, y: 2.0}\n  - {id: 1, x: 1.0, y: 2.0}\n  - {id: 2, x: 1.0, y: 2.0}\n  - {id: 3, x: 1.0, y: 2.0}\n  - {id: 4, x: 1.0, y: 2.0}\n",
        )
        .unwrap();
        assert_eq!(reader.detect(&duplicated).unwrap(), None);

        assert!(matches!(
            reader.detect(&dir.path().join("missing.yaml")),
            Err(CalibrationError::MissingResource(_))
        ));
    }

    #[test]
    fn test_export_correspondences_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("correspondences.csv");
        let record = CorrespondenceRecord::new(
            vec![0, 1, 2, 3],
            vec![Vector3::new(0.03, 0.03, 0.0); 4],
            vec![Vector2::new(10.0, 20.0); 4],
            vec![Vector2::new(11.0, 21.0); 4],
        )
        .unwrap();
        export_correspondences_csv(&path, &[record.clone(), record]).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "record,id,x,y,z,u_a,v_a,u_b,v_b");
        assert_eq!(lines.len(), 9);
        assert_eq!(lines[5], "1,0,0.03,0.03,0.0,10.0,20.0,11.0,21.0");
    }

    #[test]
    fn test_format_summary() {
        let k = Matrix3::new(600.0, 0.0, 320.0, 0.0, 600.0, 240.0, 0.0, 0.0, 1.0);
        let intrinsics = BTreeMap::from([(2, k), (1, k)]);
        let extrinsics = BTreeMap::from([(1, Matrix4::identity())]);

        let summary = format_summary(2, &[3, 1], &intrinsics, &extrinsics);
        let cam1 = summary.find("cam1\n").unwrap();
        let cam2 = summary.find("cam2\n").unwrap();
        let cam3 = summary.find("cam3\n").unwrap();
        assert!(cam1 < cam2 && cam2 < cam3);
        assert!(summary.contains("    T_2_1: \n            [1.0, 0.0, 0.0, 0.0],\n"));
        assert!(summary.contains("        [[600.0, 0.0, 320.0],\n        [0.0, 600.0, 240.0],"));
        assert!(summary.contains("    \"T_2_3\": \n            []\n"));
        assert!(!summary.contains("T_2_2"));
    }
}
