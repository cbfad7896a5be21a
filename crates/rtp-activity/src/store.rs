use std::path::PathBuf;

use anyhow::{Context, Result};
use rtp_core::ActivityId;
use uuid::Uuid;

use crate::ActivityRecord;

pub trait ActivityStore: Send + Sync {
    fn record_path(&self, id: &ActivityId) -> PathBuf;
    /// Write or replace the record for `record.activity_id`.
    fn write_record(&self, record: &ActivityRecord) -> Result<PathBuf>;
}

/// One pretty-printed `<activity_id>.json` per record under `root`.
#[derive(Clone, Debug)]
pub struct FsActivityStore {
    pub root: PathBuf,
}

impl FsActivityStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl ActivityStore for FsActivityStore {
    fn record_path(&self, id: &ActivityId) -> PathBuf {
        self.root.join(format!("{}.json", id.as_str()))
    }

    fn write_record(&self, record: &ActivityRecord) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("create activity dir {}", self.root.display()))?;
        let path = self.record_path(&record.activity_id);
        let bytes = serde_json::to_vec_pretty(record)?;

        // readers only ever see a complete record
        let tmp = self.root.join(format!(".{}.json.tmp.{}", record.activity_id.as_str(), Uuid::new_v4()));
        std::fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("replace activity record {}", path.display()))?;
        Ok(path)
    }
}
