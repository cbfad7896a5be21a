use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::{ActivityArgs, ActivityKey, ActivityRecord, ActivityStore, CodeVersions, FsActivityStore, OperationDescriptor};

/// Writes one activity record per successful operation.
#[derive(Clone)]
pub struct ActivityRecorder {
    store: Arc<dyn ActivityStore>,
    versions: Arc<CodeVersions>,
}

impl ActivityRecorder {
    pub fn new(store: Arc<dyn ActivityStore>) -> Self {
        Self { store, versions: Arc::new(CodeVersions::new()) }
    }

    pub fn in_directory(root: PathBuf) -> Self {
        Self::new(Arc::new(FsActivityStore::new(root)))
    }

    /// Run `op`; on success persist a record keyed by `key` and return the output.
    ///
    /// Errors from `op` pass through untouched and leave no record. A record that
    /// cannot be persisted is logged and does not fail the operation.
    pub fn record<T, E>(
        &self,
        descriptor: &OperationDescriptor,
        key: ActivityKey,
        arguments: ActivityArgs,
        op: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E>
    where
        T: Serialize,
    {
        let output = op()?;

        let output_value = serde_json::to_value(&output).unwrap_or_else(|e| {
            tracing::warn!(operation = %descriptor.name, error = %e, "activity output not serializable");
            Value::Null
        });
        let record = ActivityRecord {
            activity_id: key.id(),
            operation: descriptor.name.clone(),
            code_version: self.versions.version_of(descriptor.executable.as_deref()),
            arguments,
            output: output_value,
            documentation: descriptor.doc.clone(),
        };
        match self.store.write_record(&record) {
            Ok(path) => tracing::debug!(activity_id = %record.activity_id, path = %path.display(), "recorded activity"),
            Err(e) => tracing::error!(activity_id = %record.activity_id, error = %format!("{e:#}"), "could not persist activity record"),
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp_core::TimePoint;
    use std::path::Path;

    fn op() -> OperationDescriptor {
        OperationDescriptor::new("get_segmentation_map", "Run attribution on images to create a segmentation map")
    }

    #[test]
    fn unrelated_arguments_do_not_change_identity() {
        let dir = tempfile::tempdir().unwrap();
        let rec = ActivityRecorder::in_directory(dir.path().to_path_buf());
        let t = TimePoint::parse_iso("2020-01-01T06:00").unwrap();

        let a = ActivityArgs::new().time("date", t).text("config_file", "a.cfg");
        let b = ActivityArgs::new().time("date", t).text("config_file", "b.cfg").text("note", "retry");
        rec.record(&op(), op().key_at(t), a, || Ok::<_, ()>("seg_a.fits")).unwrap();
        rec.record(&op(), op().key_at(t), b, || Ok::<_, ()>("seg_b.fits")).unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(files, vec![dir.path().join("get_segmentation_map.20200101_060000.json")]);
        let back: ActivityRecord = serde_json::from_slice(&std::fs::read(&files[0]).unwrap()).unwrap();
        assert_eq!(back.output, serde_json::json!("seg_b.fits"));
        assert_eq!(back.documentation, op().doc);
        assert_eq!(back.arguments.get("note"), Some(&serde_json::json!("retry")));
    }

    #[test]
    fn failure_writes_nothing_and_passes_error_through() {
        let dir = tempfile::tempdir().unwrap();
        let rec = ActivityRecorder::in_directory(dir.path().join("log"));
        let t = TimePoint::parse_iso("2020-01-01").unwrap();
        let err = rec.record(&op(), op().key_at(t), ActivityArgs::new(), || Err::<(), _>("boom")).unwrap_err();
        assert_eq!(err, "boom");
        assert!(!dir.path().join("log").exists());
    }

    #[test]
    fn persist_failure_does_not_fail_the_operation() {
        let dir = tempfile::tempdir().unwrap();
        // a file where the directory should be
        let blocker = dir.path().join("log");
        std::fs::write(&blocker, b"").unwrap();
        let rec = ActivityRecorder::in_directory(blocker);
        let t = TimePoint::parse_iso("2020-01-01").unwrap();
        let out = rec.record(&op(), op().key_at(t), ActivityArgs::new(), || Ok::<_, ()>(Path::new("x").to_path_buf()));
        assert_eq!(out, Ok(PathBuf::from("x")));
    }
}
