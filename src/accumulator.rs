//! Collects matched correspondences across a sequence of capture instants.

use crate::board::BoardModel;
use crate::error::CalibrationError;
use crate::matcher::match_observations;
use crate::observation::{CornerObservation, CorrespondenceRecord};
use log::{debug, info, warn};

/// Minimum number of accepted image pairs before a solve is attempted.
pub const MIN_RECORDS: usize = 5;

/// Black-box corner detector: one image in, its corner observation out.
///
/// Returning `Ok(None)` means nothing usable was detected. Errors are reserved
/// for problems that must stop the run, such as an unreadable input.
pub trait CornerDetector {
    type Image;

    fn detect(&self, image: &Self::Image) -> Result<Option<CornerObservation>, CalibrationError>;
}

/// What happened to one capture instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairOutcome {
    Accepted,
    /// At least one image had fewer than four detected corners.
    DetectionSkip,
    /// Both images were valid but shared fewer than four board corners.
    OverlapSkip,
}

/// Advisory counts gathered while accumulating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccumulatorStats {
    pub processed: usize,
    pub accepted: usize,
    pub skipped_detection: usize,
    pub skipped_overlap: usize,
}

/// Ordered collection of accepted records. Records are only ever appended.
#[derive(Debug, Clone)]
pub struct CalibrationAccumulator<'a> {
    board: &'a BoardModel,
    records: Vec<CorrespondenceRecord>,
    stats: AccumulatorStats,
}

impl<'a> CalibrationAccumulator<'a> {
    pub fn new(board: &'a BoardModel) -> Self {
        Self {
            board,
            records: Vec::new(),
            stats: AccumulatorStats::default(),
        }
    }

    /// Matches one pair of observations and appends the record if it is usable.
    pub fn push_observations(
        &mut self,
        obs_a: Option<&CornerObservation>,
        obs_b: Option<&CornerObservation>,
    ) -> PairOutcome {
        self.stats.processed += 1;
        let index = self.stats.processed;

        let (Some(obs_a), Some(obs_b)) = (
            obs_a.filter(|obs| obs.is_valid()),
            obs_b.filter(|obs| obs.is_valid()),
        ) else {
            warn!("Board corners not detected in pair {}. Skipping.", index);
            self.stats.skipped_detection += 1;
            return PairOutcome::DetectionSkip;
        };

        match match_observations(self.board, obs_a, obs_b) {
            Some(record) => {
                debug!("pair {}: {} common corners", index, record.len());
                self.records.push(record);
                self.stats.accepted += 1;
                PairOutcome::Accepted
            }
            None => {
                warn!("Not enough common corners in pair {}. Skipping.", index);
                self.stats.skipped_overlap += 1;
                PairOutcome::OverlapSkip
            }
        }
    }

    /// Runs the detector on both images of one capture instant and accumulates the result.
    pub fn push_pair<D: CornerDetector>(
        &mut self,
        detector: &D,
        image_a: &D::Image,
        image_b: &D::Image,
    ) -> Result<PairOutcome, CalibrationError> {
        let obs_a = detector.detect(image_a)?;
        let obs_b = detector.detect(image_b)?;
        Ok(self.push_observations(obs_a.as_ref(), obs_b.as_ref()))
    }

    /// Processes every pair in input order.
    pub fn extend_pairs<'p, D, I>(&mut self, detector: &D, pairs: I) -> Result<(), CalibrationError>
    where
        D: CornerDetector,
        D::Image: 'p,
        I: IntoIterator<Item = (&'p D::Image, &'p D::Image)>,
    {
        for (image_a, image_b) in pairs {
            self.push_pair(detector, image_a, image_b)?;
        }
        Ok(())
    }

    pub fn records(&self) -> &[CorrespondenceRecord] {
        &self.records
    }

    pub fn stats(&self) -> AccumulatorStats {
        self.stats
    }

    /// Applies the dataset-size gate and hands over the accepted records.
    pub fn finish(self) -> Result<Vec<CorrespondenceRecord>, CalibrationError> {
        info!(
            "processed {} pairs: {} accepted, {} without detection, {} with too little overlap",
            self.stats.processed,
            self.stats.accepted,
            self.stats.skipped_detection,
            self.stats.skipped_overlap
        );
        if self.records.len() < MIN_RECORDS {
            return Err(CalibrationError::InsufficientData {
                found: self.records.len(),
                required: MIN_RECORDS,
            });
        }
        Ok(self.records)
    }
}
