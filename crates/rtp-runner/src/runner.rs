use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use rtp_activity::ActivityRecorder;
use rtp_core::{partition_by_lifespan, time_range, DropReason, DroppedTimePoint, Stage, StageError, TimePoint};
use rtp_locator::{LocateError, QualityFileLocator};
use rtp_pool::{BoundedParallelMap, ItemFailure, ParallelOutcome};

use crate::config::{expand_path, Config, ExtractionConfig, Selection};
use crate::stages::{self, ExtractionInputs};
use crate::tracking::run_tracking;
use crate::RunReport;

#[derive(Clone, Debug)]
pub struct RunRequest {
    pub start: TimePoint,
    pub end: TimePoint,
    pub interval: Duration,
    /// Maps tracked by a previous run; their time is read from the file name.
    pub seed_tracked: Vec<PathBuf>,
    /// Overrides `lifespan.colors_file`.
    pub colors_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct ClassCentersOutcome {
    pub centers: BTreeMap<TimePoint, PathBuf>,
    pub dropped: Vec<DroppedTimePoint>,
}

pub struct Pipeline {
    pub cfg: Config,
    pub recorder: ActivityRecorder,
    pub locators: BTreeMap<String, QualityFileLocator>,
    pub pool: BoundedParallelMap,
}

fn locate_error(e: LocateError) -> StageError {
    match e {
        LocateError::Template(t) => StageError::Template(t),
        other => StageError::Configuration(other.to_string()),
    }
}

fn item_reason(failure: &ItemFailure<StageError>) -> DropReason {
    match failure {
        ItemFailure::Failed(e) => e.drop_reason(),
        ItemFailure::Panicked(msg) => DropReason::JobFailed(format!("worker panicked: {msg}")),
    }
}

impl Pipeline {
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate()?;
        let mut locators = BTreeMap::new();
        for (name, source) in &cfg.sources {
            let locator = QualityFileLocator::from_config(name.clone(), source).with_context(|| format!("sources.{name}"))?;
            locators.insert(name.clone(), locator);
        }
        let recorder = ActivityRecorder::in_directory(cfg.activity_dir());
        let pool = match cfg.pool.workers {
            Some(n) => BoundedParallelMap::new(n),
            None => BoundedParallelMap::from_available_parallelism(),
        };
        Ok(Self { cfg, recorder, locators, pool })
    }

    pub fn open(config_path: &Path) -> Result<Self> {
        Self::new(Config::load_from(config_path)?)
    }

    /// Write an example `rtp.toml` under `root` unless one exists. Returns its path.
    pub fn init(root: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
        let cfg_path = Config::config_path(root);
        if cfg_path.exists() {
            tracing::info!(path = %cfg_path.display(), "config already present, left untouched");
        } else {
            Config::example().save_to(&cfg_path)?;
        }
        Ok(cfg_path)
    }

    pub fn doctor(&self) -> Result<()> {
        crate::doctor(&self.cfg)
    }

    pub fn locate(&self, selection: &Selection, time: TimePoint) -> Result<Option<PathBuf>, StageError> {
        let locator = self
            .locators
            .get(&selection.source)
            .ok_or_else(|| StageError::Configuration(format!("unknown source {:?}", selection.source)))?;
        locator.locate(time, &selection.params).map_err(locate_error)
    }

    /// Every selection for `time`, or the reason the time point cannot proceed.
    fn locate_all(&self, selections: &[Selection], time: TimePoint) -> Result<Vec<PathBuf>, DropReason> {
        let mut files = Vec::with_capacity(selections.len());
        for sel in selections {
            match self.locate(sel, time) {
                Ok(Some(p)) => files.push(p),
                Ok(None) => {
                    tracing::info!(date = %time, selection = %sel, "no good quality file");
                    return Err(DropReason::SelectionMiss(sel.to_string()));
                }
                Err(e) => {
                    tracing::error!(date = %time, selection = %sel, error = %e, "could not locate");
                    return Err(e.drop_reason());
                }
            }
        }
        Ok(files)
    }

    /// Everything `extractor` needs at `time`, joined from earlier stages and earlier extractors.
    fn extraction_inputs(
        &self,
        extractor: &ExtractionConfig,
        report: &RunReport,
        time: TimePoint,
        cleaned: &Path,
        tracked: &BTreeMap<TimePoint, PathBuf>,
        overlays: &BTreeMap<TimePoint, PathBuf>,
    ) -> Result<ExtractionInputs, DropReason> {
        let missing = |what: String| DropReason::MissingDependency(what);
        let tracked = tracked.get(&time).ok_or_else(|| missing("tracked map".to_string()))?;
        let overlay = overlays.get(&time).ok_or_else(|| missing("overlay image".to_string()))?;
        let mut tables = Vec::with_capacity(extractor.depends_on.len());
        for dep in &extractor.depends_on {
            let table = report
                .extraction_outputs
                .get(dep)
                .and_then(|outputs| outputs.get(&time))
                .ok_or_else(|| missing(format!("{dep} table")))?;
            tables.push((dep.clone(), table.clone()));
        }
        let stat_images = self.locate_all(&extractor.stat_images, time).map_err(|reason| match reason {
            DropReason::SelectionMiss(sel) => missing(format!("stat image {sel}")),
            other => other,
        })?;
        Ok(ExtractionInputs {
            tracked: tracked.clone(),
            cleaned: cleaned.to_path_buf(),
            overlay: overlay.clone(),
            tables,
            stat_images,
        })
    }

    fn collect<O>(report: &mut RunReport, stage: Stage, outcome: ParallelOutcome<TimePoint, O, StageError>) -> BTreeMap<TimePoint, O> {
        for (t, failure) in &outcome.failures {
            report.drop_point(*t, stage.clone(), item_reason(failure));
        }
        report.survived(stage, outcome.results.len());
        outcome.results
    }

    pub fn run(&self, req: RunRequest) -> Result<RunReport> {
        if req.end <= req.start {
            return Err(anyhow!("end {} must be after start {}", req.end, req.start));
        }
        if req.interval <= Duration::zero() {
            return Err(anyhow!("interval must be positive"));
        }
        let min_lifespan = self.cfg.min_lifespan()?;
        let mut report = RunReport::new(req.start, req.end, req.interval.num_seconds());
        let times = time_range(req.start, req.end, req.interval);
        tracing::info!(run_id = %report.run_id, start = %req.start, end = %req.end, steps = times.len(), "starting run");

        // locate inputs on the driver thread; the caches are only touched here
        let mut located = BTreeMap::new();
        for t in times {
            match self.locate_all(&self.cfg.segmentation.selections, t) {
                Ok(files) => {
                    located.insert(t, files);
                }
                Err(reason) => report.drop_point(t, Stage::Locate, reason),
            }
        }
        report.survived(Stage::Locate, located.len());

        let seg_cfg = &self.cfg.segmentation;
        let segmented = self.pool.run("segmentation", located, |t, images| {
            stages::segmentation(seg_cfg, &self.recorder, *t, &images)
        });
        let segmented = Self::collect(&mut report, Stage::Segmentation, segmented);

        let mut region_inputs = BTreeMap::new();
        for (t, seg_map) in segmented {
            let mut stats = Vec::new();
            for sel in &self.cfg.region_map.stat_images {
                match self.locate(sel, t) {
                    Ok(Some(p)) => stats.push(p),
                    Ok(None) => tracing::info!(date = %t, selection = %sel, "stat image missing, omitted"),
                    Err(e) => tracing::warn!(date = %t, selection = %sel, error = %e, "stat image not located, omitted"),
                }
            }
            region_inputs.insert(t, (seg_map, stats));
        }
        let rm_cfg = &self.cfg.region_map;
        let region_maps = self.pool.run("region_map", region_inputs, |t, (seg_map, stats)| {
            stages::region_map(rm_cfg, &self.recorder, *t, &seg_map, &stats)
        });
        let region_maps = Self::collect(&mut report, Stage::RegionMap, region_maps);

        let mut seed = BTreeMap::new();
        for p in &req.seed_tracked {
            let t = TimePoint::from_filename(p).with_context(|| format!("tracked map {}", p.display()))?;
            seed.insert(t, p.clone());
        }
        let tracked = run_tracking(&self.cfg.tracking, &self.recorder, seed, region_maps).context("tracking failed")?;
        report.survived(Stage::Tracking, tracked.len());

        let colors_file = req
            .colors_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(expand_path(&self.cfg.lifespan.colors_file)));
        let colors: BTreeSet<i64> = if tracked.is_empty() {
            tracing::warn!("nothing tracked, skipping longlived region reduction");
            BTreeSet::new()
        } else {
            let colors = stages::longlived_colors(&self.cfg.lifespan, &self.recorder, &tracked, &colors_file)
                .context("longlived region reduction failed")?;
            tracing::info!(colors = colors.len(), file = %colors_file.display(), "wrote longlived region colors");
            report.colors_file = Some(colors_file.clone());
            colors
        };
        report.longlived_colors = colors.len();
        report.tracked = tracked.clone();

        let retention = partition_by_lifespan(tracked.clone(), req.end, min_lifespan);
        for (t, map) in &retention.deferred {
            tracing::warn!(date = %t, map = %map.display(), end = %req.end, "too close to the end to know the definitive lifespan, deferring");
            report.drop_point(*t, Stage::Lifespan, DropReason::Deferred);
        }
        report.survived(Stage::Lifespan, retention.finalizable.len());
        report.deferred = retention.deferred;

        let clean_cfg = &self.cfg.cleaning;
        let cleaned = self.pool.run("cleaning", retention.finalizable, |t, map| {
            stages::cleaning(clean_cfg, &self.recorder, *t, &map, &colors_file)
        });
        let cleaned = Self::collect(&mut report, Stage::Cleaning, cleaned);

        let mut overlay_inputs = BTreeMap::new();
        for (t, map) in &cleaned {
            match self.locate_all(std::slice::from_ref(&self.cfg.overlay.background), *t) {
                Ok(mut bg) => {
                    overlay_inputs.insert(*t, (map.clone(), bg.remove(0)));
                }
                Err(reason) => report.drop_point(*t, Stage::Overlay, reason),
            }
        }
        let ov_cfg = &self.cfg.overlay;
        let overlays = self.pool.run("overlay", overlay_inputs, |t, (map, background)| {
            stages::overlay(ov_cfg, &self.recorder, *t, &map, &background)
        });
        let overlays = Self::collect(&mut report, Stage::Overlay, overlays);

        for extractor in self.cfg.extraction_order()? {
            let stage = Stage::Extraction(extractor.name.clone());
            let mut inputs = BTreeMap::new();
            for (t, cleaned_map) in &cleaned {
                match self.extraction_inputs(extractor, &report, *t, cleaned_map, &tracked, &overlays) {
                    Ok(joined) => {
                        inputs.insert(*t, joined);
                    }
                    Err(reason) => {
                        tracing::info!(date = %t, extractor = %extractor.name, %reason, "skipping extraction");
                        report.drop_point(*t, stage.clone(), reason);
                    }
                }
            }
            let outputs = self.pool.run(&stage.to_string(), inputs, |t, inputs| {
                stages::extraction(extractor, &self.recorder, *t, &inputs, &colors_file)
            });
            let outputs = Self::collect(&mut report, stage, outputs);
            report.extraction_outputs.insert(extractor.name.clone(), outputs);
        }

        report.cleaned = cleaned;
        report.overlays = overlays;
        if !report.deferred.is_empty() {
            tracing::info!(args = %report.next_run_args().join(" "), "pass these at the next run");
        }
        Ok(report)
    }

    /// Compute class-centre files for every time step.
    pub fn class_centers(&self, start: TimePoint, end: TimePoint, interval: Duration) -> Result<ClassCentersOutcome> {
        let cc_cfg = self.cfg.class_centers.as_ref().ok_or_else(|| anyhow!("no [class_centers] section in config"))?;
        let mut outcome = ClassCentersOutcome::default();
        let mut located = BTreeMap::new();
        for t in time_range(start, end, interval) {
            match self.locate_all(&cc_cfg.selections, t) {
                Ok(files) => {
                    located.insert(t, files);
                }
                Err(reason) => outcome.dropped.push(DroppedTimePoint { time: t, stage: Stage::Locate, reason }),
            }
        }

        let centers = self.pool.run("class_centers", located, |t, images| {
            stages::class_centers(cc_cfg, &self.recorder, *t, &images)
        });
        for (t, failure) in &centers.failures {
            outcome.dropped.push(DroppedTimePoint { time: *t, stage: Stage::ClassCenters, reason: item_reason(failure) });
        }
        outcome.centers = centers.results;
        Ok(outcome)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("sources", &self.locators.keys().collect::<Vec<_>>())
            .field("workers", &self.pool.workers())
            .finish_non_exhaustive()
    }
}
