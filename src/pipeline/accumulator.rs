use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::offload::{DrainedResults, PlateResult};
use crate::speed::SpeedEstimate;

use super::context::{PipelineContext, SavedViolation, Violation};

/// State carried across frames for the lifetime of one run.
///
/// Lists only grow. `saved_plates` is the dedup set consulted by the save
/// stage; a plate enters it when its pair is selected, whether or not the sink
/// accepts the record.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AccumulatedState {
    /// Latest estimate per track, overwritten frame by frame.
    pub speed_values: BTreeMap<u64, SpeedEstimate>,
    pub violations: Vec<Violation>,
    pub violation_plates: Vec<PlateResult>,
    pub saved: Vec<SavedViolation>,
    pub reports: Vec<String>,
    #[serde(skip)]
    saved_plates: HashSet<String>,
}

impl AccumulatedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one run's outputs into the accumulated lists.
    pub fn merge(&mut self, ctx: &PipelineContext) {
        for (track_id, estimate) in &ctx.speed_values {
            self.speed_values.insert(*track_id, *estimate);
        }
        self.violations.extend(ctx.violations.iter().cloned());
        self.violation_plates.extend(ctx.violation_plates.iter().cloned());
        self.saved.extend(ctx.saved.iter().cloned());
        self.reports.extend(ctx.reports.iter().cloned());
    }

    /// Append offload results handed over by the drain barrier.
    pub fn absorb(&mut self, drained: DrainedResults) {
        self.violation_plates.extend(drained.into_results());
    }

    pub fn is_saved(&self, plate: &str) -> bool {
        self.saved_plates.contains(plate.trim())
    }

    /// Pair violations with resolved plates by `(frame_id, tracker_id)` and keep
    /// the first violation per plate not already saved. Violations without a
    /// resolved plate are skipped.
    pub fn select_unsaved(
        &mut self,
        violations: &[Violation],
        plates: &[PlateResult],
    ) -> Vec<(Violation, String)> {
        let mut by_key: HashMap<(u64, u64), &PlateResult> = HashMap::new();
        for plate in plates.iter().filter(|p| p.is_resolved()) {
            by_key.entry((plate.frame_id, plate.tracker_id)).or_insert(plate);
        }

        let mut selected = Vec::new();
        for violation in violations {
            let Some(plate) = by_key.get(&(violation.frame_id, violation.tracker_id)) else {
                log::debug!(
                    "no plate for track {} in frame {}; not saved",
                    violation.tracker_id,
                    violation.frame_id
                );
                continue;
            };
            let text = plate.license_plate.trim().to_string();
            if self.saved_plates.insert(text.clone()) {
                selected.push((violation.clone(), text));
            }
        }
        selected
    }
}
