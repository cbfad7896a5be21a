use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rtp_core::{DropReason, DroppedTimePoint, RunId, Stage, TimePoint};
use serde::Serialize;

/// Outcome of one pipeline run.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub start: TimePoint,
    pub end: TimePoint,
    pub interval_seconds: i64,
    /// Time points surviving each stage, in pipeline order.
    pub survivors: Vec<(Stage, usize)>,
    pub dropped: Vec<DroppedTimePoint>,
    pub tracked: BTreeMap<TimePoint, PathBuf>,
    pub deferred: BTreeMap<TimePoint, PathBuf>,
    pub colors_file: Option<PathBuf>,
    pub longlived_colors: usize,
    pub cleaned: BTreeMap<TimePoint, PathBuf>,
    pub overlays: BTreeMap<TimePoint, PathBuf>,
    pub extraction_outputs: BTreeMap<String, BTreeMap<TimePoint, PathBuf>>,
}

impl RunReport {
    pub fn new(start: TimePoint, end: TimePoint, interval_seconds: i64) -> Self {
        Self {
            run_id: RunId::new(),
            start,
            end,
            interval_seconds,
            survivors: Vec::new(),
            dropped: Vec::new(),
            tracked: BTreeMap::new(),
            deferred: BTreeMap::new(),
            colors_file: None,
            longlived_colors: 0,
            cleaned: BTreeMap::new(),
            overlays: BTreeMap::new(),
            extraction_outputs: BTreeMap::new(),
        }
    }

    pub fn drop_point(&mut self, time: TimePoint, stage: Stage, reason: DropReason) {
        self.dropped.push(DroppedTimePoint { time, stage, reason });
    }

    pub fn survived(&mut self, stage: Stage, count: usize) {
        self.survivors.push((stage, count));
    }

    pub fn drops_at(&self, stage: &Stage) -> Vec<&DroppedTimePoint> {
        self.dropped.iter().filter(|d| &d.stage == stage).collect()
    }

    /// Arguments that feed the deferred maps into the next incremental run.
    pub fn next_run_args(&self) -> Vec<String> {
        self.deferred
            .values()
            .flat_map(|p| ["--tracked-map".to_string(), p.display().to_string()])
            .collect()
    }

    pub fn summary(&self) -> String {
        let mut out = format!("run {} from {} to {}\n", self.run_id, self.start, self.end);
        for (stage, count) in &self.survivors {
            out.push_str(&format!("  {:<24} {count}\n", stage.to_string()));
        }
        if !self.dropped.is_empty() {
            out.push_str(&format!("dropped {} time point(s):\n", self.dropped.len()));
            for d in &self.dropped {
                out.push_str(&format!("  {} at {}: {}\n", d.time, d.stage, d.reason));
            }
        }
        if let Some(colors) = &self.colors_file {
            out.push_str(&format!("{} longlived region colors in {}\n", self.longlived_colors, colors.display()));
        }
        if !self.deferred.is_empty() {
            out.push_str(&format!("next run: {}\n", self.next_run_args().join(" ")));
        }
        out
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, bytes).with_context(|| format!("write report {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_run_hint_and_json() {
        let t0 = TimePoint::parse_iso("2020-01-01").unwrap();
        let t1 = TimePoint::parse_iso("2020-01-01T06:00").unwrap();
        let mut r = RunReport::new(t0, t1, 6 * 3600);
        r.deferred.insert(t1, PathBuf::from("/maps/ch_map.20200101_060000.fits"));
        r.drop_point(t0, Stage::Overlay, DropReason::SelectionMiss("aia{wavelength=193}".into()));
        r.survived(Stage::Locate, 2);

        assert_eq!(r.next_run_args(), vec!["--tracked-map", "/maps/ch_map.20200101_060000.fits"]);
        assert_eq!(r.drops_at(&Stage::Overlay).len(), 1);
        assert!(r.summary().contains("next run: --tracked-map /maps/ch_map.20200101_060000.fits"));

        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("reports/run.json");
        r.write_to(&p).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&std::fs::read(&p).unwrap()).unwrap();
        assert_eq!(v["deferred"]["2020-01-01T06:00:00"], "/maps/ch_map.20200101_060000.fits");
        assert_eq!(v["dropped"][0]["reason"]["kind"], "selection_miss");
    }
}
