//! Observation types shared by the matcher, the accumulator and the solvers.

use nalgebra::{Vector2, Vector3};
use std::collections::btree_map::{self, BTreeMap};

/// Minimum number of corners for a detection or a matched pair to be usable.
pub const MIN_CORNERS: usize = 4;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ObservationError {
    #[error("corner id {0} appears more than once in one observation")]
    DuplicateId(u32),
    #[error("correspondence sequences differ in length: {ids} ids, {object} object points, {a} / {b} image points")]
    LengthMismatch {
        ids: usize,
        object: usize,
        a: usize,
        b: usize,
    },
    #[error("correspondence needs at least 4 points, got {0}")]
    TooFewPoints(usize),
}

/// Corner detections for one image, keyed by board corner id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CornerObservation {
    corners: BTreeMap<u32, Vector2<f64>>,
}

impl CornerObservation {
    /// Builds an observation, rejecting duplicate ids.
    pub fn new<I>(corners: I) -> Result<Self, ObservationError>
    where
        I: IntoIterator<Item = (u32, Vector2<f64>)>,
    {
        let mut map = BTreeMap::new();
        for (id, point) in corners {
            if map.insert(id, point).is_some() {
                return Err(ObservationError::DuplicateId(id));
            }
        }
        Ok(Self { corners: map })
    }

    pub fn len(&self) -> usize {
        self.corners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.corners.is_empty()
    }

    /// Whether enough corners were detected for the image to take part in matching.
    pub fn is_valid(&self) -> bool {
        self.corners.len() >= MIN_CORNERS
    }

    pub fn get(&self, id: u32) -> Option<&Vector2<f64>> {
        self.corners.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.corners.contains_key(&id)
    }

    /// Ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.corners.keys().copied()
    }

    /// `(id, point)` pairs in ascending id order.
    pub fn iter(&self) -> btree_map::Iter<'_, u32, Vector2<f64>> {
        self.corners.iter()
    }
}

/// Board points seen by both cameras at one capture instant.
///
/// The four sequences are index-aligned and sorted by ascending corner id.
/// Records are immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrespondenceRecord {
    ids: Vec<u32>,
    object_points: Vec<Vector3<f64>>,
    points_a: Vec<Vector2<f64>>,
    points_b: Vec<Vector2<f64>>,
}

impl CorrespondenceRecord {
    pub fn new(
        ids: Vec<u32>,
        object_points: Vec<Vector3<f64>>,
        points_a: Vec<Vector2<f64>>,
        points_b: Vec<Vector2<f64>>,
    ) -> Result<Self, ObservationError> {
        let n = ids.len();
        if object_points.len() != n || points_a.len() != n || points_b.len() != n {
            return Err(ObservationError::LengthMismatch {
                ids: n,
                object: object_points.len(),
                a: points_a.len(),
                b: points_b.len(),
            });
        }
        if n < MIN_CORNERS {
            return Err(ObservationError::TooFewPoints(n));
        }
        Ok(Self {
            ids,
            object_points,
            points_a,
            points_b,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn object_points(&self) -> &[Vector3<f64>] {
        &self.object_points
    }

    /// Image points in the first camera.
    pub fn points_a(&self) -> &[Vector2<f64>] {
        &self.points_a
    }

    /// Image points in the second camera.
    pub fn points_b(&self) -> &[Vector2<f64>] {
        &self.points_b
    }
}
