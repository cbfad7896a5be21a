use std::collections::BTreeMap;
use std::path::PathBuf;

use rtp_activity::ActivityRecorder;
use rtp_core::{StageError, TimePoint, TrackingWindow};

use crate::config::TrackingConfig;
use crate::stages;

/// Track `untracked` maps batch by batch on top of `seed` maps.
///
/// Sequential: each batch sees the maps tracked by the previous one. The first
/// failure ends tracking and is returned.
pub fn run_tracking(
    cfg: &TrackingConfig,
    recorder: &ActivityRecorder,
    seed: BTreeMap<TimePoint, PathBuf>,
    untracked: BTreeMap<TimePoint, PathBuf>,
) -> Result<BTreeMap<TimePoint, PathBuf>, StageError> {
    let mut window = TrackingWindow::new(cfg.overlap_count, cfg.group_count, seed, untracked)?;
    tracing::info!(
        seed = window.tracked().len(),
        untracked = window.remaining(),
        overlap = cfg.overlap_count,
        group = cfg.group_count,
        "starting tracking"
    );

    while let Some(batch) = window.next_batch()? {
        if let Err(e) = stages::track_batch(cfg, recorder, &batch) {
            tracing::error!(batch = batch.index, error = %e, "tracking failed");
            return Err(e);
        }
        window.commit()?;
    }
    Ok(window.into_tracked())
}
