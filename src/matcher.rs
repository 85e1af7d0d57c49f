//! Matches the corner detections of two cameras taken at the same instant.

use crate::board::BoardModel;
use crate::observation::{CornerObservation, CorrespondenceRecord, MIN_CORNERS};
use log::{debug, warn};

/// Builds the correspondence record for one capture instant.
///
/// Only ids detected by both cameras are kept, in ascending id order. Returns
/// `None` when fewer than four shared ids remain, either because the views
/// overlap too little or because some shared ids are not on the board.
pub fn match_observations(
    board: &BoardModel,
    obs_a: &CornerObservation,
    obs_b: &CornerObservation,
) -> Option<CorrespondenceRecord> {
    let common: Vec<u32> = obs_a.ids().filter(|id| obs_b.contains(*id)).collect();
    if common.len() < MIN_CORNERS {
        debug!(
            "only {} common corners between views, {} required",
            common.len(),
            MIN_CORNERS
        );
        return None;
    }

    let mut ids = Vec::with_capacity(common.len());
    let mut object_points = Vec::with_capacity(common.len());
    let mut points_a = Vec::with_capacity(common.len());
    let mut points_b = Vec::with_capacity(common.len());

    for id in common {
        let Some(object_point) = board.object_point(id) else {
            warn!(
                "corner id {} is outside the board ({} ids), dropping it",
                id,
                board.len()
            );
            continue;
        };
        let (Some(point_a), Some(point_b)) = (obs_a.get(id), obs_b.get(id)) else {
            continue;
        };
        ids.push(id);
        object_points.push(*object_point);
        points_a.push(*point_a);
        points_b.push(*point_b);
    }

    match CorrespondenceRecord::new(ids, object_points, points_a, points_b) {
        Ok(record) => Some(record),
        Err(err) => {
            debug!("no usable correspondence after dropping unknown ids: {}", err);
            None
        }
    }
}
