use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rtp_core::{render_template, TemplateError, TimePoint};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{expand_glob, FitsHeaderReader, IgnorableBits, InvalidBit, QualityReader, SelectionCache, DEFAULT_IGNORABLE_BITS};

#[derive(Debug, Error)]
pub enum LocateError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    InvalidBit(#[from] InvalidBit),
}

/// One archive of quality-flagged files, as configured under `[sources.<name>]`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    /// Path template rendered into a glob, e.g. `/data/{wavelength:04}/{date:%Y/%m/%d}/*.fits`.
    pub file_pattern: String,
    #[serde(default = "default_hdu_index")]
    pub hdu_index: usize,
    #[serde(default = "default_quality_keyword")]
    pub quality_keyword: String,
    #[serde(default = "default_ignore_quality_bits")]
    pub ignore_quality_bits: Vec<u32>,
    #[serde(default)]
    pub cache_capacity: Option<usize>,
}

fn default_hdu_index() -> usize {
    1
}

fn default_quality_keyword() -> String {
    "QUALITY".to_string()
}

fn default_ignore_quality_bits() -> Vec<u32> {
    DEFAULT_IGNORABLE_BITS.to_vec()
}

impl SourceConfig {
    pub fn new(file_pattern: impl Into<String>) -> Self {
        Self {
            file_pattern: file_pattern.into(),
            hdu_index: default_hdu_index(),
            quality_keyword: default_quality_keyword(),
            ignore_quality_bits: default_ignore_quality_bits(),
            cache_capacity: None,
        }
    }
}

/// Picks the first lexicographic candidate whose quality word is clean.
pub struct QualityFileLocator {
    name: String,
    file_pattern: String,
    ignorable: IgnorableBits,
    reader: Box<dyn QualityReader>,
    cache: Mutex<SelectionCache>,
    scans: AtomicUsize,
}

impl QualityFileLocator {
    pub fn new(
        name: impl Into<String>,
        file_pattern: impl Into<String>,
        ignorable: IgnorableBits,
        reader: Box<dyn QualityReader>,
        cache_capacity: Option<usize>,
    ) -> Self {
        Self {
            name: name.into(),
            file_pattern: file_pattern.into(),
            ignorable,
            reader,
            cache: Mutex::new(SelectionCache::new(cache_capacity)),
            scans: AtomicUsize::new(0),
        }
    }

    pub fn from_config(name: impl Into<String>, cfg: &SourceConfig) -> Result<Self, LocateError> {
        let ignorable = IgnorableBits::new(&cfg.ignore_quality_bits)?;
        let reader = FitsHeaderReader::new(cfg.hdu_index, cfg.quality_keyword.clone());
        Ok(Self::new(name, cfg.file_pattern.clone(), ignorable, Box::new(reader), cfg.cache_capacity))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of filesystem scans performed; cache hits do not count.
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::Relaxed)
    }

    /// All files matching the rendered pattern, in lexicographic order.
    pub fn candidates(&self, time: TimePoint, params: &BTreeMap<String, String>) -> Result<Vec<PathBuf>, LocateError> {
        let pattern = render_template(&self.file_pattern, Some(time), params)?;
        tracing::debug!(source = %self.name, %pattern, "expanding file pattern");
        self.scans.fetch_add(1, Ordering::Relaxed);
        Ok(expand_glob(&pattern))
    }

    pub fn locate(&self, time: TimePoint, params: &BTreeMap<String, String>) -> Result<Option<PathBuf>, LocateError> {
        let key = (time, params.clone());
        if let Some(hit) = self.lock_cache().get(&key) {
            return Ok(hit.clone());
        }

        let selected = self
            .candidates(time, params)?
            .into_iter()
            .find(|path| self.accepts(path));
        if selected.is_none() {
            tracing::debug!(source = %self.name, time = %time, ?params, "no good quality file");
        }
        self.lock_cache().insert(key, selected.clone());
        Ok(selected)
    }

    fn accepts(&self, path: &Path) -> bool {
        match self.reader.quality(path) {
            Ok(q) if q.is_clean(self.ignorable) => true,
            Ok(q) => {
                tracing::debug!(file = %path.display(), defects = ?q.residual(self.ignorable).defects(), "skipping file with bad quality");
                false
            }
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "could not read quality");
                false
            }
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, SelectionCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for QualityFileLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityFileLocator")
            .field("name", &self.name)
            .field("file_pattern", &self.file_pattern)
            .field("ignorable", &self.ignorable)
            .finish_non_exhaustive()
    }
}
