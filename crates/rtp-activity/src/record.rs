use std::collections::BTreeMap;
use std::path::Path;

use rtp_core::{ActivityId, TimePoint};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Static description of a recorded operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub name: String,
    pub doc: String,
    /// Executable whose digest goes into the code version, when the work runs out of process.
    pub executable: Option<String>,
}

impl OperationDescriptor {
    pub fn new(name: impl Into<String>, doc: impl Into<String>) -> Self {
        Self { name: name.into(), doc: doc.into(), executable: None }
    }

    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    pub fn key_at(&self, time: TimePoint) -> ActivityKey {
        ActivityKey { operation: self.name.clone(), span: ActivitySpan::At(time), qualifier: None }
    }

    pub fn key_between(&self, start: TimePoint, end: TimePoint) -> ActivityKey {
        ActivityKey { operation: self.name.clone(), span: ActivitySpan::Between(start, end), qualifier: None }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivitySpan {
    At(TimePoint),
    Between(TimePoint, TimePoint),
}

/// The inputs that identify a logical operation. Nothing else reaches the id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivityKey {
    pub operation: String,
    pub span: ActivitySpan,
    pub qualifier: Option<String>,
}

impl ActivityKey {
    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    pub fn id(&self) -> ActivityId {
        let mut id = match self.span {
            ActivitySpan::At(t) => format!("{}.{}", self.operation, t.to_filename_stamp()),
            ActivitySpan::Between(a, b) => {
                format!("{}.{}-{}", self.operation, a.to_filename_stamp(), b.to_filename_stamp())
            }
        };
        if let Some(q) = &self.qualifier {
            id.push('.');
            id.push_str(q);
        }
        ActivityId::from_str(id)
    }
}

/// Typed call arguments, serialized with times as ISO-8601, paths as strings and sets as sorted lists.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityArgs(BTreeMap<String, Value>);

impl ActivityArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn time(mut self, name: &str, t: TimePoint) -> Self {
        self.0.insert(name.to_string(), Value::String(t.to_iso()));
        self
    }

    pub fn path(mut self, name: &str, p: &Path) -> Self {
        self.0.insert(name.to_string(), Value::String(p.display().to_string()));
        self
    }

    pub fn paths<'a>(mut self, name: &str, ps: impl IntoIterator<Item = &'a Path>) -> Self {
        let list = ps.into_iter().map(|p| Value::String(p.display().to_string())).collect();
        self.0.insert(name.to_string(), Value::Array(list));
        self
    }

    pub fn set(mut self, name: &str, values: impl IntoIterator<Item = i64>) -> Self {
        let mut sorted: Vec<i64> = values.into_iter().collect();
        sorted.sort_unstable();
        sorted.dedup();
        self.0.insert(name.to_string(), Value::Array(sorted.into_iter().map(Value::from).collect()));
        self
    }

    pub fn text(mut self, name: &str, s: impl Into<String>) -> Self {
        self.0.insert(name.to_string(), Value::String(s.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub activity_id: ActivityId,
    pub operation: String,
    pub code_version: String,
    pub arguments: ActivityArgs,
    pub output: Value,
    pub documentation: String,
}
