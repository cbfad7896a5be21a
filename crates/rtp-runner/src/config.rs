use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use rtp_core::{parse_duration, render_template, TimePoint};
use rtp_locator::{IgnorableBits, SourceConfig};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub activity: ActivityConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    pub sources: BTreeMap<String, SourceConfig>,
    #[serde(default)]
    pub class_centers: Option<ClassCentersConfig>,
    pub segmentation: SegmentationConfig,
    pub region_map: RegionMapConfig,
    pub tracking: TrackingConfig,
    pub lifespan: LifespanConfig,
    pub cleaning: CleaningConfig,
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub extraction: Vec<ExtractionConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityConfig {
    pub output_directory: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Defaults to the number of CPUs.
    #[serde(default)]
    pub workers: Option<usize>,
}

/// One located input: a source plus the parameters rendered into its file pattern.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Selection {
    pub source: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl Selection {
    pub fn new(source: &str, params: &[(&str, &str)]) -> Self {
        Self {
            source: source.to_string(),
            params: params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)?;
        if !self.params.is_empty() {
            let ps: Vec<String> = self.params.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, "{{{}}}", ps.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassCentersConfig {
    pub executable: String,
    #[serde(default)]
    pub config_file: Option<String>,
    pub output_file: String,
    pub selections: Vec<Selection>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SegmentationConfig {
    pub executable: String,
    #[serde(default)]
    pub config_file: Option<String>,
    pub output_file: String,
    pub centers_file: String,
    pub selections: Vec<Selection>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionMapConfig {
    pub executable: String,
    #[serde(default)]
    pub config_file: Option<String>,
    pub output_file: String,
    #[serde(default)]
    pub stat_images: Vec<Selection>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub executable: String,
    #[serde(default)]
    pub config_file: Option<String>,
    #[serde(default = "default_overlap_count")]
    pub overlap_count: usize,
    #[serde(default = "default_group_count")]
    pub group_count: usize,
}

fn default_overlap_count() -> usize {
    6
}

fn default_group_count() -> usize {
    40
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LifespanConfig {
    pub executable: String,
    #[serde(default)]
    pub config_file: Option<String>,
    /// e.g. `"3d"`, `"72h"`.
    pub min_lifespan: String,
    pub colors_file: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleaningConfig {
    pub executable: String,
    #[serde(default)]
    pub config_file: Option<String>,
    pub output_file: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OverlayConfig {
    pub executable: String,
    #[serde(default)]
    pub config_file: Option<String>,
    pub output_file: String,
    pub background: Selection,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub name: String,
    pub executable: String,
    #[serde(default)]
    pub config_file: Option<String>,
    pub output_file: String,
    /// Extractors whose table for the same time point is passed as `--<name> <table>`.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Images located at the time point and appended as positionals; all are required.
    #[serde(default)]
    pub stat_images: Vec<Selection>,
}

/// `~` expansion for every configured path.
pub fn expand_path(s: &str) -> String {
    shellexpand::tilde(s).to_string()
}

impl Config {
    pub fn example() -> Self {
        let aia = |w: &str| Selection::new("aia", &[("wavelength", w)]);
        Self {
            activity: ActivityConfig { output_directory: "~/rtp/activity_log".to_string() },
            pool: PoolConfig::default(),
            sources: BTreeMap::from([
                (
                    "aia".to_string(),
                    SourceConfig::new(
                        "/data/sdo/aia_science_level2/{wavelength:04}/{date:%Y/%m/%d}/aia_science_level2.{wavelength:04}.{date:%Y%m%d_%H}*.fits",
                    ),
                ),
                (
                    "hmi".to_string(),
                    SourceConfig::new("/data/sdo/hmi_science_level2/{date:%Y/%m/%d}/hmi_science_level2.{date:%Y%m%d_%H}*.fits"),
                ),
            ]),
            class_centers: Some(ClassCentersConfig {
                executable: "/opt/spoca/bin/classification.x".to_string(),
                config_file: Some("/opt/spoca/config/classification.config".to_string()),
                output_file: "~/rtp/centers/centers.{date}.txt".to_string(),
                selections: vec![aia("193")],
            }),
            segmentation: SegmentationConfig {
                executable: "/opt/spoca/bin/attribution.x".to_string(),
                config_file: Some("/opt/spoca/config/attribution.config".to_string()),
                output_file: "~/rtp/segmentation_maps/segmentation_map.{date}.fits".to_string(),
                centers_file: "~/rtp/centers/centers.{date}.txt".to_string(),
                selections: vec![aia("193")],
            },
            region_map: RegionMapConfig {
                executable: "/opt/spoca/bin/get_ch_map.x".to_string(),
                config_file: Some("/opt/spoca/config/get_ch_map.config".to_string()),
                output_file: "~/rtp/ch_maps/ch_map.{date}.fits".to_string(),
                stat_images: vec![aia("193"), Selection::new("hmi", &[])],
            },
            tracking: TrackingConfig {
                executable: "/opt/spoca/bin/tracking.x".to_string(),
                config_file: Some("/opt/spoca/config/tracking.config".to_string()),
                overlap_count: default_overlap_count(),
                group_count: default_group_count(),
            },
            lifespan: LifespanConfig {
                executable: "/opt/spoca/bin/longlived_regions.x".to_string(),
                config_file: None,
                min_lifespan: "3d".to_string(),
                colors_file: "~/rtp/longlived_regions_colors.txt".to_string(),
            },
            cleaning: CleaningConfig {
                executable: "/opt/spoca/bin/clean_map.x".to_string(),
                config_file: None,
                output_file: "~/rtp/cleaned_ch_maps/cleaned_ch_map.{date}.fits".to_string(),
            },
            overlay: OverlayConfig {
                executable: "/opt/spoca/bin/overlay.x".to_string(),
                config_file: Some("/opt/spoca/config/overlay.config".to_string()),
                output_file: "~/rtp/overlays/overlay.{date}.png".to_string(),
                background: aia("193"),
            },
            extraction: vec![
                ExtractionConfig {
                    name: "epn_core".to_string(),
                    executable: "/opt/rtp/bin/epn_core_parameters".to_string(),
                    config_file: None,
                    output_file: "~/rtp/tap/epn_core.{date}.csv".to_string(),
                    depends_on: vec![],
                    stat_images: vec![],
                },
                ExtractionConfig {
                    name: "tracking".to_string(),
                    executable: "/opt/rtp/bin/tracking_parameters".to_string(),
                    config_file: None,
                    output_file: "~/rtp/tap/tracking.{date}.csv".to_string(),
                    depends_on: vec![],
                    stat_images: vec![],
                },
                ExtractionConfig {
                    name: "datalink".to_string(),
                    executable: "/opt/rtp/bin/datalink_parameters".to_string(),
                    config_file: None,
                    output_file: "~/rtp/tap/datalink.{date}.csv".to_string(),
                    depends_on: vec!["epn_core".to_string()],
                    stat_images: vec![aia("193"), Selection::new("hmi", &[])],
                },
            ],
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        cfg.validate().with_context(|| format!("invalid config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn config_path(root: &Path) -> PathBuf {
        root.join("rtp.toml")
    }

    pub fn activity_dir(&self) -> PathBuf {
        PathBuf::from(expand_path(&self.activity.output_directory))
    }

    pub fn min_lifespan(&self) -> Result<Duration> {
        parse_duration(&self.lifespan.min_lifespan).with_context(|| "lifespan.min_lifespan")
    }

    /// Reject what would otherwise only fail halfway through a run.
    pub fn validate(&self) -> Result<()> {
        if self.tracking.group_count == 0 {
            return Err(anyhow!("tracking.group_count must be at least 1"));
        }
        if self.pool.workers == Some(0) {
            return Err(anyhow!("pool.workers must be at least 1"));
        }
        self.min_lifespan()?;

        for (name, source) in &self.sources {
            IgnorableBits::new(&source.ignore_quality_bits).with_context(|| format!("sources.{name}.ignore_quality_bits"))?;
        }

        let mut selections: Vec<(&str, &Selection)> = Vec::new();
        selections.extend(self.segmentation.selections.iter().map(|s| ("segmentation.selections", s)));
        selections.extend(self.region_map.stat_images.iter().map(|s| ("region_map.stat_images", s)));
        selections.push(("overlay.background", &self.overlay.background));
        if let Some(cc) = &self.class_centers {
            selections.extend(cc.selections.iter().map(|s| ("class_centers.selections", s)));
        }
        for e in &self.extraction {
            selections.extend(e.stat_images.iter().map(|s| ("extraction.stat_images", s)));
        }
        if self.segmentation.selections.is_empty() {
            return Err(anyhow!("segmentation.selections must not be empty"));
        }

        // any valid time point exercises the date placeholders
        let sample = TimePoint::parse_iso("2000-01-01")?;
        for (at, sel) in selections {
            let source = self
                .sources
                .get(&sel.source)
                .ok_or_else(|| anyhow!("{at}: unknown source {:?}", sel.source))?;
            render_template(&source.file_pattern, Some(sample), &sel.params).with_context(|| format!("{at}: {sel}"))?;
        }

        let mut templates = vec![
            ("segmentation.output_file", &self.segmentation.output_file),
            ("segmentation.centers_file", &self.segmentation.centers_file),
            ("region_map.output_file", &self.region_map.output_file),
            ("cleaning.output_file", &self.cleaning.output_file),
            ("overlay.output_file", &self.overlay.output_file),
        ];
        if let Some(cc) = &self.class_centers {
            templates.push(("class_centers.output_file", &cc.output_file));
        }
        templates.extend(self.extraction.iter().map(|e| ("extraction.output_file", &e.output_file)));
        for (at, template) in templates {
            render_template(template, Some(sample), &BTreeMap::new()).with_context(|| at.to_string())?;
        }

        let mut names = BTreeSet::new();
        for e in &self.extraction {
            if e.name.is_empty() || !names.insert(e.name.as_str()) {
                return Err(anyhow!("extraction names must be unique and non-empty (got {:?})", e.name));
            }
        }
        self.extraction_order()?;
        Ok(())
    }

    /// Extractors in config order, except that each one comes after everything it depends on.
    pub fn extraction_order(&self) -> Result<Vec<&ExtractionConfig>> {
        let names: BTreeSet<&str> = self.extraction.iter().map(|e| e.name.as_str()).collect();
        for e in &self.extraction {
            if let Some(dep) = e.depends_on.iter().find(|d| !names.contains(d.as_str())) {
                return Err(anyhow!("extraction {:?} depends on unknown extraction {dep:?}", e.name));
            }
        }

        let mut done: BTreeSet<&str> = BTreeSet::new();
        let mut order = Vec::with_capacity(self.extraction.len());
        while order.len() < self.extraction.len() {
            let ready = self
                .extraction
                .iter()
                .find(|e| !done.contains(e.name.as_str()) && e.depends_on.iter().all(|d| done.contains(d.as_str())));
            let Some(next) = ready else {
                let stuck: Vec<&str> =
                    self.extraction.iter().map(|e| e.name.as_str()).filter(|n| !done.contains(n)).collect();
                return Err(anyhow!("extraction dependencies form a cycle among {stuck:?}"));
            };
            done.insert(next.name.as_str());
            order.push(next);
        }
        Ok(order)
    }
}
