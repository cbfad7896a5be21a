use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

use crate::config::expand_path;
use crate::Config;

/// Resolve `program` the way a spawn would: paths as given, bare names on PATH.
pub fn find_executable(program: &str) -> Option<PathBuf> {
    let program = expand_path(program);
    if program.contains('/') {
        let p = PathBuf::from(program);
        return p.is_file().then_some(p);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).map(|dir| dir.join(&program)).find(|p| p.is_file())
}

fn stage_programs(cfg: &Config) -> Vec<(String, &str, Option<&str>)> {
    let mut out = Vec::new();
    if let Some(cc) = &cfg.class_centers {
        out.push(("class_centers".to_string(), cc.executable.as_str(), cc.config_file.as_deref()));
    }
    out.push(("segmentation".to_string(), cfg.segmentation.executable.as_str(), cfg.segmentation.config_file.as_deref()));
    out.push(("region_map".to_string(), cfg.region_map.executable.as_str(), cfg.region_map.config_file.as_deref()));
    out.push(("tracking".to_string(), cfg.tracking.executable.as_str(), cfg.tracking.config_file.as_deref()));
    out.push(("lifespan".to_string(), cfg.lifespan.executable.as_str(), cfg.lifespan.config_file.as_deref()));
    out.push(("cleaning".to_string(), cfg.cleaning.executable.as_str(), cfg.cleaning.config_file.as_deref()));
    out.push(("overlay".to_string(), cfg.overlay.executable.as_str(), cfg.overlay.config_file.as_deref()));
    for e in &cfg.extraction {
        out.push((format!("extraction[{}]", e.name), e.executable.as_str(), e.config_file.as_deref()));
    }
    out
}

/// Check that a run can start: config valid, programs and their config files present,
/// activity directory writable. Every problem is reported, not just the first.
pub fn doctor(cfg: &Config) -> Result<()> {
    let mut problems = Vec::new();

    if let Err(e) = cfg.validate() {
        problems.push(format!("invalid config: {e:#}"));
    }

    for (stage, exe, config_file) in stage_programs(cfg) {
        if find_executable(exe).is_none() {
            problems.push(format!("{stage}: executable {exe:?} not found"));
        }
        if let Some(c) = config_file {
            let c = expand_path(c);
            if !Path::new(&c).is_file() {
                problems.push(format!("{stage}: config file {c} not found"));
            }
        }
    }

    let activity = cfg.activity_dir();
    if let Err(e) = std::fs::create_dir_all(&activity) {
        problems.push(format!("activity directory {} not creatable: {e}", activity.display()));
    }

    if problems.is_empty() {
        tracing::info!("doctor: ok");
        Ok(())
    } else {
        Err(anyhow!("doctor found {} problem(s):\n  {}", problems.len(), problems.join("\n  ")))
    }
}
