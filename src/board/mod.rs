//! ChArUco target description.
//!
//! The board is a `squares_x × squares_y` chessboard with ArUco markers in the
//! white squares. Calibration points are the inner chessboard corners, numbered
//! row-major starting at the top-left inner corner; their 3D coordinates lie on
//! the board plane `Z = 0` with the origin at the top-left board corner.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Predefined marker dictionaries a board can be printed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArucoDictionary {
    Dict4x4_50,
    Dict4x4_100,
    Dict4x4_250,
    Dict4x4_1000,
    Dict5x5_50,
    Dict5x5_100,
    Dict5x5_250,
    Dict5x5_1000,
    Dict6x6_50,
    Dict6x6_100,
    Dict6x6_250,
    Dict6x6_1000,
    Dict7x7_50,
    Dict7x7_100,
    Dict7x7_250,
    Dict7x7_1000,
    ArucoOriginal,
    AprilTag16h5,
    AprilTag25h9,
    AprilTag36h10,
    AprilTag36h11,
    ArucoMip36h12,
}

impl ArucoDictionary {
    pub const ALL: [ArucoDictionary; 22] = [
        Self::Dict4x4_50,
        Self::Dict4x4_100,
        Self::Dict4x4_250,
        Self::Dict4x4_1000,
        Self::Dict5x5_50,
        Self::Dict5x5_100,
        Self::Dict5x5_250,
        Self::Dict5x5_1000,
        Self::Dict6x6_50,
        Self::Dict6x6_100,
        Self::Dict6x6_250,
        Self::Dict6x6_1000,
        Self::Dict7x7_50,
        Self::Dict7x7_100,
        Self::Dict7x7_250,
        Self::Dict7x7_1000,
        Self::ArucoOriginal,
        Self::AprilTag16h5,
        Self::AprilTag25h9,
        Self::AprilTag36h10,
        Self::AprilTag36h11,
        Self::ArucoMip36h12,
    ];

    /// Name as written in board configuration files.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dict4x4_50 => "DICT_4X4_50",
            Self::Dict4x4_100 => "DICT_4X4_100",
            Self::Dict4x4_250 => "DICT_4X4_250",
            Self::Dict4x4_1000 => "DICT_4X4_1000",
            Self::Dict5x5_50 => "DICT_5X5_50",
            Self::Dict5x5_100 => "DICT_5X5_100",
            Self::Dict5x5_250 => "DICT_5X5_250",
            Self::Dict5x5_1000 => "DICT_5X5_1000",
            Self::Dict6x6_50 => "DICT_6X6_50",
            Self::Dict6x6_100 => "DICT_6X6_100",
            Self::Dict6x6_250 => "DICT_6X6_250",
            Self::Dict6x6_1000 => "DICT_6X6_1000",
            Self::Dict7x7_50 => "DICT_7X7_50",
            Self::Dict7x7_100 => "DICT_7X7_100",
            Self::Dict7x7_250 => "DICT_7X7_250",
            Self::Dict7x7_1000 => "DICT_7X7_1000",
            Self::ArucoOriginal => "DICT_ARUCO_ORIGINAL",
            Self::AprilTag16h5 => "DICT_APRILTAG_16h5",
            Self::AprilTag25h9 => "DICT_APRILTAG_25h9",
            Self::AprilTag36h10 => "DICT_APRILTAG_36h10",
            Self::AprilTag36h11 => "DICT_APRILTAG_36h11",
            Self::ArucoMip36h12 => "DICT_ARUCO_MIP_36h12",
        }
    }

    /// Number of distinct markers in the dictionary.
    pub fn marker_count(&self) -> usize {
        match self {
            Self::Dict4x4_50 | Self::Dict5x5_50 | Self::Dict6x6_50 | Self::Dict7x7_50 => 50,
            Self::Dict4x4_100 | Self::Dict5x5_100 | Self::Dict6x6_100 | Self::Dict7x7_100 => 100,
            Self::Dict4x4_250 | Self::Dict5x5_250 | Self::Dict6x6_250 | Self::Dict7x7_250 => 250,
            Self::Dict4x4_1000 | Self::Dict5x5_1000 | Self::Dict6x6_1000 | Self::Dict7x7_1000 => {
                1000
            }
            Self::ArucoOriginal => 1024,
            Self::AprilTag16h5 => 30,
            Self::AprilTag25h9 => 35,
            Self::AprilTag36h10 => 2320,
            Self::AprilTag36h11 => 587,
            Self::ArucoMip36h12 => 250,
        }
    }
}

impl FromStr for ArucoDictionary {
    type Err = BoardError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|dict| dict.name() == name)
            .ok_or_else(|| BoardError::UnknownDictionary(name.to_string()))
    }
}

impl fmt::Display for ArucoDictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BoardError {
    #[error("Invalid ArUco dictionary: {0}")]
    UnknownDictionary(String),
    #[error("squares_x and squares_y must be >= 2, got {0}x{1}")]
    InvalidSize(u32, u32),
    #[error("square length must be positive and finite")]
    InvalidSquareLength,
    #[error("marker length must be positive and smaller than the square length")]
    InvalidMarkerLength,
    #[error("board needs {needed} markers, dictionary {dictionary} has {available}")]
    NotEnoughDictionaryCodes {
        dictionary: ArucoDictionary,
        needed: usize,
        available: usize,
    },
}

fn default_squares_x() -> u32 {
    5
}

fn default_squares_y() -> u32 {
    7
}

fn default_square_length_mm() -> f64 {
    30.0
}

fn default_marker_length_mm() -> f64 {
    24.0
}

fn default_aruco_dict() -> String {
    ArucoDictionary::Dict4x4_50.name().to_string()
}

/// Board description as stored in the board YAML file. Lengths are in millimetres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardConfig {
    #[serde(default = "default_squares_x")]
    pub squares_x: u32,
    #[serde(default = "default_squares_y")]
    pub squares_y: u32,
    #[serde(default = "default_square_length_mm")]
    pub square_length_mm: f64,
    #[serde(default = "default_marker_length_mm")]
    pub marker_length_mm: f64,
    #[serde(default = "default_aruco_dict")]
    pub aruco_dict: String,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            squares_x: default_squares_x(),
            squares_y: default_squares_y(),
            square_length_mm: default_square_length_mm(),
            marker_length_mm: default_marker_length_mm(),
            aruco_dict: default_aruco_dict(),
        }
    }
}

/// Validated board geometry with the canonical 3D position of every corner id.
#[derive(Debug, Clone)]
pub struct BoardModel {
    squares_x: u32,
    squares_y: u32,
    square_length: f64,
    marker_length: f64,
    dictionary: ArucoDictionary,
    object_points: Vec<Vector3<f64>>,
}

impl BoardModel {
    /// Lengths are in metres.
    pub fn new(
        squares_x: u32,
        squares_y: u32,
        square_length: f64,
        marker_length: f64,
        dictionary: ArucoDictionary,
    ) -> Result<Self, BoardError> {
        if squares_x < 2 || squares_y < 2 {
            return Err(BoardError::InvalidSize(squares_x, squares_y));
        }
        if !square_length.is_finite() || square_length <= 0.0 {
            return Err(BoardError::InvalidSquareLength);
        }
        if !marker_length.is_finite() || marker_length <= 0.0 || marker_length >= square_length {
            return Err(BoardError::InvalidMarkerLength);
        }

        let needed = (squares_x as usize * squares_y as usize) / 2;
        let available = dictionary.marker_count();
        if available < needed {
            return Err(BoardError::NotEnoughDictionaryCodes {
                dictionary,
                needed,
                available,
            });
        }

        let inner_cols = squares_x - 1;
        let inner_rows = squares_y - 1;
        let object_points = (0..inner_rows)
            .flat_map(|row| {
                (0..inner_cols).map(move |col| {
                    Vector3::new(
                        (col + 1) as f64 * square_length,
                        (row + 1) as f64 * square_length,
                        0.0,
                    )
                })
            })
            .collect();

        Ok(Self {
            squares_x,
            squares_y,
            square_length,
            marker_length,
            dictionary,
            object_points,
        })
    }

    pub fn from_config(config: &BoardConfig) -> Result<Self, BoardError> {
        let dictionary: ArucoDictionary = config.aruco_dict.parse()?;
        Self::new(
            config.squares_x,
            config.squares_y,
            config.square_length_mm / 1000.0,
            config.marker_length_mm / 1000.0,
            dictionary,
        )
    }

    pub fn squares_x(&self) -> u32 {
        self.squares_x
    }

    pub fn squares_y(&self) -> u32 {
        self.squares_y
    }

    pub fn square_length(&self) -> f64 {
        self.square_length
    }

    pub fn marker_length(&self) -> f64 {
        self.marker_length
    }

    pub fn dictionary(&self) -> ArucoDictionary {
        self.dictionary
    }

    /// Number of corner ids on the board.
    pub fn len(&self) -> usize {
        self.object_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_points.is_empty()
    }

    /// All corner ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.object_points.len()).map(|id| id as u32)
    }

    /// Board-frame coordinate of a corner id, `None` for ids outside the board.
    pub fn object_point(&self, id: u32) -> Option<&Vector3<f64>> {
        self.object_points.get(id as usize)
    }
}
