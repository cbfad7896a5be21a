//! One function per external stage. Each renders its output path, runs the job, checks the
//! declared artifact and records the activity.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use rtp_activity::{ActivityArgs, ActivityRecorder, OperationDescriptor};
use rtp_core::{render_template, StageError, TimePoint, TrackingBatch};
use rtp_job::JobSpec;

use crate::config::{
    expand_path, ClassCentersConfig, CleaningConfig, ExtractionConfig, LifespanConfig, OverlayConfig, RegionMapConfig,
    SegmentationConfig, TrackingConfig,
};

const CLASS_CENTERS_DOC: &str = "Run the classification program on images to compute the class centers";
const SEGMENTATION_DOC: &str = "Run the attribution program on images to create a segmentation map";
const REGION_MAP_DOC: &str = "Run the region extraction program on a segmentation map to create a region map";
const TRACKING_DOC: &str = "Run the tracking program on region maps, continuing identities from previously tracked maps";
const LIFESPAN_DOC: &str = "Compute region lifespans on tracked maps and list the colors of longlived regions";
const CLEANING_DOC: &str = "Clean a tracked region map to keep only the longlived regions";
const OVERLAY_DOC: &str = "Draw the contours of the regions of a map on top of a background image";
const EXTRACTION_DOC: &str =
    "Extract tabular parameters from the tracked, cleaned and overlay products of one time point, plus any earlier tables and stat images";

fn path_str(p: &Path) -> String {
    p.display().to_string()
}

fn joined(ps: &[PathBuf]) -> String {
    ps.iter().map(|p| path_str(p)).collect::<Vec<_>>().join(" ")
}

/// Render a `{date}` template and make sure its directory exists.
pub fn output_path(template: &str, time: TimePoint) -> Result<PathBuf, StageError> {
    let rendered = render_template(template, Some(time), &BTreeMap::new())?;
    let path = PathBuf::from(expand_path(&rendered));
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| StageError::io(parent, e))?;
    }
    Ok(path)
}

fn base_job(executable: &str, config_file: Option<&str>) -> JobSpec {
    JobSpec::new(expand_path(executable)).opt_if("config", config_file.map(expand_path))
}

fn descriptor(name: &str, doc: &str, job: &JobSpec) -> OperationDescriptor {
    OperationDescriptor::new(name, doc).with_executable(job.executable.clone())
}

pub fn class_centers(
    cfg: &ClassCentersConfig,
    recorder: &ActivityRecorder,
    time: TimePoint,
    images: &[PathBuf],
) -> Result<PathBuf, StageError> {
    let centers = output_path(&cfg.output_file, time)?;
    let job = base_job(&cfg.executable, cfg.config_file.as_deref())
        .opt("centersFile", path_str(&centers))
        .args(images.iter().map(|p| path_str(p)));
    let op = descriptor("get_class_centers", CLASS_CENTERS_DOC, &job);
    let args = ActivityArgs::new()
        .time("date", time)
        .paths("images", images.iter().map(PathBuf::as_path))
        .path("class_centers_file", &centers);
    let context = vec![("images".to_string(), joined(images)), ("class_centers_file".to_string(), path_str(&centers))];

    recorder.record(&op, op.key_at(time), args, || {
        tracing::info!(date = %time, "computing class centers");
        job.run_for_artifact(&centers, context)?;
        Ok(centers.clone())
    })
}

pub fn segmentation(
    cfg: &SegmentationConfig,
    recorder: &ActivityRecorder,
    time: TimePoint,
    images: &[PathBuf],
) -> Result<PathBuf, StageError> {
    let centers = PathBuf::from(expand_path(&render_template(&cfg.centers_file, Some(time), &BTreeMap::new())?));
    if !centers.is_file() {
        return Err(StageError::Configuration(format!("centers file {} not found", centers.display())));
    }
    let map = output_path(&cfg.output_file, time)?;
    let job = base_job(&cfg.executable, cfg.config_file.as_deref())
        .opt("centersFile", path_str(&centers))
        .opt("output", path_str(&map))
        .args(images.iter().map(|p| path_str(p)));
    let op = descriptor("get_segmentation_map", SEGMENTATION_DOC, &job);
    let args = ActivityArgs::new()
        .time("date", time)
        .paths("images", images.iter().map(PathBuf::as_path))
        .path("centers_file", &centers);
    let context = vec![("images".to_string(), joined(images)), ("centers_file".to_string(), path_str(&centers))];

    recorder.record(&op, op.key_at(time), args, || {
        tracing::info!(date = %time, "creating segmentation map");
        job.run_for_artifact(&map, context)?;
        Ok(map.clone())
    })
}

pub fn region_map(
    cfg: &RegionMapConfig,
    recorder: &ActivityRecorder,
    time: TimePoint,
    segmentation_map: &Path,
    stat_images: &[PathBuf],
) -> Result<PathBuf, StageError> {
    let map = output_path(&cfg.output_file, time)?;
    let job = base_job(&cfg.executable, cfg.config_file.as_deref())
        .opt("output", path_str(&map))
        .arg(path_str(segmentation_map))
        .args(stat_images.iter().map(|p| path_str(p)));
    let op = descriptor("get_region_map", REGION_MAP_DOC, &job);
    let args = ActivityArgs::new()
        .time("date", time)
        .path("segmentation_map", segmentation_map)
        .paths("stat_images", stat_images.iter().map(PathBuf::as_path));
    let context = vec![
        ("segmentation_map".to_string(), path_str(segmentation_map)),
        ("stat_images".to_string(), joined(stat_images)),
    ];

    recorder.record(&op, op.key_at(time), args, || {
        tracing::info!(date = %time, segmentation_map = %segmentation_map.display(), "creating region map");
        job.run_for_artifact(&map, context)?;
        Ok(map.clone())
    })
}

/// Track one batch in place: context maps first, then the group.
pub fn track_batch(
    cfg: &TrackingConfig,
    recorder: &ActivityRecorder,
    batch: &TrackingBatch<PathBuf>,
) -> Result<Vec<PathBuf>, StageError> {
    let Some((first, last)) = batch.span() else {
        return Ok(Vec::new());
    };
    let context: Vec<PathBuf> = batch.context.iter().map(|(_, p)| p.clone()).collect();
    let group: Vec<PathBuf> = batch.group.iter().map(|(_, p)| p.clone()).collect();
    let job = base_job(&cfg.executable, cfg.config_file.as_deref()).args(batch.inputs().iter().map(|p| path_str(p)));
    let op = descriptor("get_tracked_map", TRACKING_DOC, &job);
    let args = ActivityArgs::new()
        .paths("tracked_maps", context.iter().map(PathBuf::as_path))
        .paths("untracked_maps", group.iter().map(PathBuf::as_path));
    let failure_context = vec![("untracked_maps".to_string(), joined(&group))];

    recorder.record(&op, op.key_between(first, last), args, || {
        tracing::info!(batch = batch.index, context = context.len(), group = group.len(), from = %first, to = %last, "running tracking");
        job.execute(&[], &[])
            .map_err(|f| f.with_context(failure_context.clone()))?
            .into_success(failure_context)?;
        Ok(group.clone())
    })
}

/// Reduce every tracked map to the set of longlived region colors, written to `colors_file`.
pub fn longlived_colors(
    cfg: &LifespanConfig,
    recorder: &ActivityRecorder,
    tracked: &BTreeMap<TimePoint, PathBuf>,
    colors_file: &Path,
) -> Result<BTreeSet<i64>, StageError> {
    let (Some(first), Some(last)) = (tracked.keys().next().copied(), tracked.keys().next_back().copied()) else {
        return Ok(BTreeSet::new());
    };
    if let Some(parent) = colors_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| StageError::io(parent, e))?;
    }
    let maps: Vec<PathBuf> = tracked.values().cloned().collect();
    let job = base_job(&cfg.executable, cfg.config_file.as_deref())
        .opt("minLifespan", cfg.min_lifespan.clone())
        .opt("output", path_str(colors_file))
        .args(maps.iter().map(|p| path_str(p)));
    let op = descriptor("get_longlived_regions_colors", LIFESPAN_DOC, &job);
    let args = ActivityArgs::new()
        .paths("region_maps", maps.iter().map(PathBuf::as_path))
        .text("min_lifespan", cfg.min_lifespan.clone());
    let context = vec![("region_maps".to_string(), format!("{} maps from {first} to {last}", maps.len()))];

    recorder.record(&op, op.key_between(first, last), args, || {
        tracing::info!(maps = maps.len(), min_lifespan = %cfg.min_lifespan, "computing longlived region colors");
        job.run_for_artifact(colors_file, context)?;
        read_region_colors(colors_file)
    })
}

/// Whitespace-separated integers.
pub fn read_region_colors(path: &Path) -> Result<BTreeSet<i64>, StageError> {
    let text = std::fs::read_to_string(path).map_err(|e| StageError::io(path, e))?;
    text.split_whitespace()
        .map(|tok| {
            tok.parse::<i64>().map_err(|_| {
                StageError::io(
                    path,
                    std::io::Error::new(std::io::ErrorKind::InvalidData, format!("invalid region color {tok:?}")),
                )
            })
        })
        .collect()
}

pub fn cleaning(
    cfg: &CleaningConfig,
    recorder: &ActivityRecorder,
    time: TimePoint,
    tracked_map: &Path,
    colors_file: &Path,
) -> Result<PathBuf, StageError> {
    let cleaned = output_path(&cfg.output_file, time)?;
    let job = base_job(&cfg.executable, cfg.config_file.as_deref())
        .opt("colorsFile", path_str(colors_file))
        .opt("output", path_str(&cleaned))
        .arg(path_str(tracked_map));
    let op = descriptor("get_cleaned_map", CLEANING_DOC, &job);
    let args = ActivityArgs::new()
        .time("date", time)
        .path("region_map", tracked_map)
        .path("longlived_regions_colors", colors_file);
    let context = vec![("region_map".to_string(), path_str(tracked_map))];

    recorder.record(&op, op.key_at(time), args, || {
        tracing::info!(date = %time, map = %tracked_map.display(), "cleaning map");
        job.run_for_artifact(&cleaned, context)?;
        Ok(cleaned.clone())
    })
}

pub fn overlay(
    cfg: &OverlayConfig,
    recorder: &ActivityRecorder,
    time: TimePoint,
    map: &Path,
    background: &Path,
) -> Result<PathBuf, StageError> {
    let image = output_path(&cfg.output_file, time)?;
    let job = base_job(&cfg.executable, cfg.config_file.as_deref())
        .opt("output", path_str(&image))
        .arg(path_str(map))
        .arg(path_str(background));
    let op = descriptor("get_overlay_image", OVERLAY_DOC, &job);
    let args = ActivityArgs::new().time("date", time).path("map", map).path("background_image", background);
    let context = vec![("map".to_string(), path_str(map)), ("background_image".to_string(), path_str(background))];

    recorder.record(&op, op.key_at(time), args, || {
        tracing::info!(date = %time, map = %map.display(), "creating overlay image");
        job.run_for_artifact(&image, context)?;
        Ok(image.clone())
    })
}

/// Inputs of one extraction, joined by time point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractionInputs {
    pub tracked: PathBuf,
    pub cleaned: PathBuf,
    pub overlay: PathBuf,
    /// Tables of the extractors named in `depends_on`, by extractor name.
    pub tables: Vec<(String, PathBuf)>,
    pub stat_images: Vec<PathBuf>,
}

pub fn extraction(
    cfg: &ExtractionConfig,
    recorder: &ActivityRecorder,
    time: TimePoint,
    inputs: &ExtractionInputs,
    colors_file: &Path,
) -> Result<PathBuf, StageError> {
    let table = output_path(&cfg.output_file, time)?;
    let mut job = base_job(&cfg.executable, cfg.config_file.as_deref())
        .opt("colorsFile", path_str(colors_file))
        .opt("output", path_str(&table));
    for (name, dep) in &inputs.tables {
        job = job.opt(name.clone(), path_str(dep));
    }
    let job = job
        .args([path_str(&inputs.tracked), path_str(&inputs.cleaned), path_str(&inputs.overlay)])
        .args(inputs.stat_images.iter().map(|p| path_str(p)));
    let op = descriptor("extract_table", EXTRACTION_DOC, &job);
    let mut args = ActivityArgs::new()
        .time("date", time)
        .text("extractor", cfg.name.clone())
        .path("tracked_map", &inputs.tracked)
        .path("cleaned_map", &inputs.cleaned)
        .path("overlay_image", &inputs.overlay)
        .path("longlived_regions_colors", colors_file);
    for (name, dep) in &inputs.tables {
        args = args.path(&format!("{name}_table"), dep);
    }
    if !inputs.stat_images.is_empty() {
        args = args.paths("stat_images", inputs.stat_images.iter().map(PathBuf::as_path));
    }
    let context = vec![("extractor".to_string(), cfg.name.clone()), ("tracked_map".to_string(), path_str(&inputs.tracked))];

    recorder.record(&op, op.key_at(time).with_qualifier(cfg.name.clone()), args, || {
        tracing::info!(date = %time, extractor = %cfg.name, "extracting table");
        job.run_for_artifact(&table, context)?;
        Ok(table.clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_colors_as_a_set() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("colors.txt");
        std::fs::write(&p, "12\n7 12\n\n3").unwrap();
        assert_eq!(read_region_colors(&p).unwrap(), BTreeSet::from([3, 7, 12]));

        std::fs::write(&p, "12 x").unwrap();
        assert!(matches!(read_region_colors(&p), Err(StageError::Io { .. })));
    }

    #[test]
    fn segmentation_requires_centers_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SegmentationConfig {
            executable: "true".into(),
            config_file: None,
            output_file: format!("{}/seg/{{date}}.fits", dir.path().display()),
            centers_file: format!("{}/centers.{{date}}.txt", dir.path().display()),
            selections: vec![],
        };
        let rec = ActivityRecorder::in_directory(dir.path().join("log"));
        let t = TimePoint::parse_iso("2020-01-01").unwrap();
        let err = segmentation(&cfg, &rec, t, &[]).unwrap_err();
        assert!(matches!(err, StageError::Configuration(ref m) if m.contains("centers.20200101_000000.txt")));
        assert!(!dir.path().join("log").exists());
    }

    #[test]
    fn output_path_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let t = TimePoint::parse_iso("2020-01-01T06:00").unwrap();
        let p = output_path(&format!("{}/a/b/map.{{date}}.fits", dir.path().display()), t).unwrap();
        assert_eq!(p, dir.path().join("a/b/map.20200101_060000.fits"));
        assert!(dir.path().join("a/b").is_dir());
    }
}
