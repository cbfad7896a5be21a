#![cfg(unix)]

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::Duration;
use rtp_core::{DropReason, Stage, TimePoint};
use rtp_locator::fixtures::write_fits_with_quality;
use rtp_locator::SourceConfig;
use rtp_runner::{Config, ExtractionConfig, Pipeline, RunRequest, Selection};

fn tp(s: &str) -> TimePoint {
    TimePoint::parse_iso(s).unwrap()
}

/// A fake program that logs its argv and writes the file named by `out_opt`.
fn program(dir: &Path, name: &str, out_opt: Option<&str>, fail_on: Option<&str>, content: &str) -> String {
    let path = dir.join("bin").join(name);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut body = format!("#!/bin/sh\necho \"{name} $*\" >> '{}'\n", dir.join("calls.log").display());
    if let Some(pattern) = fail_on {
        body.push_str(&format!("case \"$*\" in *{pattern}*) echo 'cannot process' >&2; exit 2;; esac\n"));
    }
    if let Some(opt) = out_opt {
        body.push_str(&format!(
            "out=\"\"\nprev=\"\"\nfor a in \"$@\"; do\n  if [ \"$prev\" = \"--{opt}\" ]; then out=\"$a\"; fi\n  prev=\"$a\"\ndone\necho '{content}' > \"$out\"\n"
        ));
    }
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

fn calls(dir: &Path, name: &str) -> Vec<Vec<String>> {
    fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .filter_map(|l| {
            let mut words = l.split_whitespace();
            (words.next() == Some(name)).then(|| words.map(str::to_string).collect())
        })
        .collect()
}

fn aia_file(dir: &Path, wavelength: &str, t: TimePoint, suffix: &str, quality: i64) {
    let path = dir
        .join("archive")
        .join(wavelength)
        .join(format!("aia.{wavelength}.{}_{suffix}.fits", t.to_filename_stamp()));
    write_fits_with_quality(&path, 1, "QUALITY", quality).unwrap();
}

fn out(dir: &Path, rel: &str) -> String {
    dir.join(rel).display().to_string()
}

struct Fixture {
    dir: tempfile::TempDir,
    cfg: Config,
}

/// Archive and programs for four 6-hourly time points on 2020-01-01.
///
/// 06:00 only has a file with bit 31 set; segmentation fails on 12:00.
fn fixture(tracking_fails: bool) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    for t in ["2020-01-01T00:00", "2020-01-01T12:00", "2020-01-01T18:00"] {
        aia_file(dir, "193", tp(t), "lev2", 0);
    }
    aia_file(dir, "193", tp("2020-01-01T06:00"), "lev2", 1 << 31);
    for t in ["2019-12-31T18:00", "2020-01-01T00:00", "2020-01-01T06:00", "2020-01-01T12:00", "2020-01-01T18:00"] {
        aia_file(dir, "171", tp(t), "lev2", 1 << 8);
    }
    fs::write(dir.join("centers.txt"), "1 2 3\n").unwrap();

    let mut cfg = Config::example();
    cfg.activity.output_directory = out(dir, "activity");
    cfg.pool.workers = Some(2);
    cfg.sources = BTreeMap::from([(
        "aia".to_string(),
        SourceConfig::new(out(dir, "archive/{wavelength}/aia.{wavelength}.{date}*.fits")),
    )]);
    let aia = |w: &str| Selection::new("aia", &[("wavelength", w)]);

    let cc = cfg.class_centers.as_mut().unwrap();
    cc.executable = program(dir, "classification", Some("centersFile"), None, "1 2 3");
    cc.config_file = None;
    cc.output_file = out(dir, "centers/centers.{date}.txt");
    cc.selections = vec![aia("193")];

    cfg.segmentation.executable = program(dir, "attribution", Some("output"), Some("20200101_120000"), "seg");
    cfg.segmentation.config_file = None;
    cfg.segmentation.output_file = out(dir, "seg/seg.{date}.fits");
    cfg.segmentation.centers_file = out(dir, "centers.txt");
    cfg.segmentation.selections = vec![aia("193")];

    cfg.region_map.executable = program(dir, "get_ch_map", Some("output"), None, "map");
    cfg.region_map.config_file = None;
    cfg.region_map.output_file = out(dir, "maps/ch_map.{date}.fits");
    cfg.region_map.stat_images = vec![aia("171")];

    cfg.tracking.executable = program(dir, "tracking", None, tracking_fails.then_some("ch_map"), "");
    cfg.tracking.config_file = None;
    cfg.tracking.group_count = 1;

    cfg.lifespan.executable = program(dir, "longlived", Some("output"), None, "3 5 8");
    cfg.lifespan.min_lifespan = "12h".to_string();
    cfg.lifespan.colors_file = out(dir, "colors.txt");

    cfg.cleaning.executable = program(dir, "clean_map", Some("output"), None, "clean");
    cfg.cleaning.output_file = out(dir, "clean/cleaned.{date}.fits");

    cfg.overlay.executable = program(dir, "overlay", Some("output"), None, "png");
    cfg.overlay.config_file = None;
    cfg.overlay.output_file = out(dir, "overlays/overlay.{date}.png");
    cfg.overlay.background = aia("171");

    cfg.extraction = vec![extractor(dir, "epn_core", None)];

    Fixture { dir: tmp, cfg }
}

fn extractor(dir: &Path, name: &str, fail_on: Option<&str>) -> ExtractionConfig {
    ExtractionConfig {
        name: name.to_string(),
        executable: program(dir, name, Some("output"), fail_on, "csv"),
        config_file: None,
        output_file: out(dir, &format!("tables/{name}.{{date}}.csv")),
        depends_on: vec![],
        stat_images: vec![],
    }
}

/// A tracked map from a previous run, old enough to be finalized in this one.
fn seed_map(dir: &Path) -> PathBuf {
    let seed = dir.join("previous/ch_map.20191231_180000.fits");
    fs::create_dir_all(seed.parent().unwrap()).unwrap();
    fs::write(&seed, "tracked").unwrap();
    seed
}

fn request(seed: Vec<PathBuf>) -> RunRequest {
    RunRequest {
        start: tp("2020-01-01T00:00"),
        end: tp("2020-01-02T00:00"),
        interval: Duration::hours(6),
        seed_tracked: seed,
        colors_file: None,
    }
}

#[test]
fn full_run_drops_per_stage_and_defers_the_tail() {
    let f = fixture(false);
    let dir = f.dir.path();
    let pipeline = Pipeline::new(f.cfg.clone()).unwrap();
    let report = pipeline.run(request(vec![])).unwrap();

    let locate = report.drops_at(&Stage::Locate);
    assert_eq!(locate.len(), 1);
    assert_eq!(locate[0].time, tp("2020-01-01T06:00"));
    assert!(matches!(&locate[0].reason, DropReason::SelectionMiss(s) if s.contains("193")));

    let seg = report.drops_at(&Stage::Segmentation);
    assert_eq!(seg.len(), 1);
    assert_eq!(seg[0].time, tp("2020-01-01T12:00"));
    assert!(matches!(&seg[0].reason, DropReason::JobFailed(msg) if msg.contains("exited with status 2")));

    let tracked: Vec<_> = report.tracked.keys().copied().collect();
    assert_eq!(tracked, vec![tp("2020-01-01T00:00"), tp("2020-01-01T18:00")]);
    assert_eq!(report.longlived_colors, 3);

    // 18:00 + 12h is past the end
    assert_eq!(report.deferred.keys().copied().collect::<Vec<_>>(), vec![tp("2020-01-01T18:00")]);
    assert_eq!(report.drops_at(&Stage::Lifespan)[0].reason, DropReason::Deferred);
    assert_eq!(
        report.next_run_args(),
        vec!["--tracked-map".to_string(), out(dir, "maps/ch_map.20200101_180000.fits")]
    );

    assert_eq!(report.cleaned.keys().copied().collect::<Vec<_>>(), vec![tp("2020-01-01T00:00")]);
    assert_eq!(report.overlays.len(), 1);
    let tables = &report.extraction_outputs["epn_core"];
    assert_eq!(tables[&tp("2020-01-01T00:00")], PathBuf::from(out(dir, "tables/epn_core.20200101_000000.csv")));
    assert!(tables[&tp("2020-01-01T00:00")].is_file());

    // the stat image rides along as a positional after the segmentation map
    let region_calls = calls(dir, "get_ch_map");
    assert_eq!(region_calls.len(), 2);
    assert!(region_calls.iter().all(|c| c.last().unwrap().contains("archive/171/")));

    let activity: Vec<String> = fs::read_dir(dir.join("activity"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(activity.iter().any(|n| n.starts_with("get_tracked_map.")));
    assert!(activity.iter().any(|n| n.starts_with("extract_table.") && n.contains("epn_core")));
    assert!(!activity.iter().any(|n| n.starts_with("get_segmentation_map.20200101_120000")));
}

#[test]
fn tracking_continues_from_seed_maps_batch_by_batch() {
    let f = fixture(false);
    let dir = f.dir.path();
    let seed = seed_map(dir);

    let report = Pipeline::new(f.cfg.clone()).unwrap().run(request(vec![seed.clone()])).unwrap();

    let m0 = out(dir, "maps/ch_map.20200101_000000.fits");
    let m18 = out(dir, "maps/ch_map.20200101_180000.fits");
    let seed = seed.display().to_string();
    assert_eq!(calls(dir, "tracking"), vec![vec![seed.clone(), m0.clone()], vec![seed.clone(), m0, m18]]);

    // the seed is now old enough to finalize
    assert!(report.cleaned.contains_key(&tp("2019-12-31T18:00")));
    assert_eq!(report.extraction_outputs["epn_core"].len(), 2);
}

#[test]
fn failed_overlay_skips_extraction_for_that_time_point() {
    let mut f = fixture(false);
    let dir = f.dir.path().to_path_buf();
    f.cfg.overlay.executable = program(&dir, "overlay", Some("output"), Some("20191231_180000"), "png");
    let report = Pipeline::new(f.cfg.clone()).unwrap().run(request(vec![seed_map(&dir)])).unwrap();

    let t = tp("2019-12-31T18:00");
    assert!(report.cleaned.contains_key(&t));
    assert_eq!(report.drops_at(&Stage::Overlay)[0].time, t);

    let skipped = report.drops_at(&Stage::Extraction("epn_core".to_string()));
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].time, t);
    assert_eq!(skipped[0].reason, DropReason::MissingDependency("overlay image".to_string()));
    assert!(!report.extraction_outputs["epn_core"].contains_key(&t));
    assert!(!dir.join("tables/epn_core.20191231_180000.csv").exists());
    assert!(dir.join("tables/epn_core.20200101_000000.csv").is_file());
}

#[test]
fn missing_background_drops_the_overlay() {
    let f = fixture(false);
    let dir = f.dir.path();
    fs::remove_file(dir.join("archive/171/aia.171.20191231_180000_lev2.fits")).unwrap();
    let report = Pipeline::new(f.cfg.clone()).unwrap().run(request(vec![seed_map(dir)])).unwrap();

    let t = tp("2019-12-31T18:00");
    let overlay = report.drops_at(&Stage::Overlay);
    assert_eq!(overlay.len(), 1);
    assert_eq!(overlay[0].time, t);
    assert!(matches!(&overlay[0].reason, DropReason::SelectionMiss(s) if s.contains("171")));
    assert!(!report.overlays.contains_key(&t));
    assert!(calls(dir, "overlay").iter().all(|c| !c.iter().any(|a| a.contains("20191231_180000"))));
}

#[test]
fn chained_extraction_joins_earlier_tables_and_stat_images() {
    let mut f = fixture(false);
    let dir = f.dir.path().to_path_buf();
    let mut datalink = extractor(&dir, "datalink", None);
    datalink.depends_on = vec!["epn_core".to_string()];
    datalink.stat_images = vec![Selection::new("aia", &[("wavelength", "171")])];
    // listed first, still runs once epn_core is done
    f.cfg.extraction = vec![datalink, extractor(&dir, "epn_core", Some("20191231_180000"))];

    let report = Pipeline::new(f.cfg.clone()).unwrap().run(request(vec![seed_map(&dir)])).unwrap();

    let t = tp("2019-12-31T18:00");
    assert!(matches!(&report.drops_at(&Stage::Extraction("epn_core".to_string()))[0].reason, DropReason::JobFailed(_)));
    let skipped = report.drops_at(&Stage::Extraction("datalink".to_string()));
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].time, t);
    assert_eq!(skipped[0].reason, DropReason::MissingDependency("epn_core table".to_string()));

    let epn_core = out(&dir, "tables/epn_core.20200101_000000.csv");
    let datalink_calls = calls(&dir, "datalink");
    assert_eq!(datalink_calls.len(), 1);
    let call = &datalink_calls[0];
    let at = call.iter().position(|a| a == "--epn_core").unwrap();
    assert_eq!(call[at + 1], epn_core);
    assert!(call.last().unwrap().contains("archive/171/aia.171.20200101_000000"));
    assert!(report.extraction_outputs["datalink"][&tp("2020-01-01T00:00")].is_file());
}

#[test]
fn tracking_failure_aborts_the_run() {
    let f = fixture(true);
    let err = Pipeline::new(f.cfg.clone()).unwrap().run(request(vec![])).unwrap_err();
    assert!(format!("{err:#}").contains("tracking failed"), "{err:#}");
    assert!(calls(f.dir.path(), "clean_map").is_empty());
}

#[test]
fn class_centers_per_time_point() {
    let f = fixture(false);
    let dir = f.dir.path();
    let outcome = Pipeline::new(f.cfg.clone())
        .unwrap()
        .class_centers(tp("2020-01-01T00:00"), tp("2020-01-01T12:00"), Duration::hours(6))
        .unwrap();

    assert_eq!(outcome.centers.len(), 1);
    assert_eq!(outcome.centers[&tp("2020-01-01T00:00")], PathBuf::from(out(dir, "centers/centers.20200101_000000.txt")));
    assert_eq!(outcome.dropped.len(), 1);
    assert_eq!(outcome.dropped[0].stage, Stage::Locate);
}

#[test]
fn init_writes_a_loadable_config_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = Pipeline::init(dir.path()).unwrap();
    let cfg = Config::load_from(&path).unwrap();
    assert_eq!(cfg.tracking.group_count, 40);

    fs::write(&path, "# edited\n").unwrap();
    Pipeline::init(dir.path()).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "# edited\n");
}
