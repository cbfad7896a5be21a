use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::{DropReason, TemplateError, WindowError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureCause {
    NonZeroExit,
    /// Exit status was 0 but the declared output does not exist.
    MissingOutput(PathBuf),
    Spawn(String),
}

/// Fixed diagnostic carried by every external job failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Error)]
#[error("{}", self.describe())]
pub struct JobFailure {
    pub executable: String,
    pub command: Vec<String>,
    pub exit_status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub cause: FailureCause,
    /// Named inputs that let an operator replay the single failed item.
    pub context: Vec<(String, String)>,
}

impl JobFailure {
    pub fn with_context(mut self, context: Vec<(String, String)>) -> Self {
        self.context.extend(context);
        self
    }

    pub fn summary(&self) -> String {
        match &self.cause {
            FailureCause::NonZeroExit => match self.exit_status {
                Some(code) => format!("{} exited with status {}", self.executable, code),
                None => format!("{} terminated by signal", self.executable),
            },
            FailureCause::MissingOutput(p) => {
                format!("{} succeeded but output {} is missing", self.executable, p.display())
            }
            FailureCause::Spawn(e) => format!("could not start {}: {}", self.executable, e),
        }
    }

    /// Summary plus replay context and captured output.
    fn describe(&self) -> String {
        let mut out = self.summary();
        if !self.context.is_empty() {
            let ctx: Vec<String> = self.context.iter().map(|(k, v)| format!("{k}={v}")).collect();
            out.push_str(&format!(" [{}]", ctx.join(", ")));
        }
        for (label, text) in [("stderr", self.stderr.trim()), ("stdout", self.stdout.trim())] {
            if !text.is_empty() {
                out.push_str(&format!("\n{label}: {text}"));
            }
        }
        out
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Job(#[from] JobFailure),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Window(#[from] WindowError),
}

impl StageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StageError::Io { path: path.into(), source }
    }

    /// How a per-key failure shows up in the run report.
    pub fn drop_reason(&self) -> DropReason {
        match self {
            StageError::Job(j) => DropReason::JobFailed(j.summary()),
            StageError::Configuration(m) => DropReason::Configuration(m.clone()),
            StageError::Template(t) => DropReason::Configuration(t.to_string()),
            other => DropReason::JobFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(cause: FailureCause) -> JobFailure {
        JobFailure {
            executable: "attribution".into(),
            command: vec!["attribution".into(), "a.fits".into()],
            exit_status: Some(2),
            stdout: "".into(),
            stderr: "bad header\n".into(),
            cause,
            context: vec![],
        }
    }

    #[test]
    fn display_carries_causal_context() {
        let f = failure(FailureCause::NonZeroExit).with_context(vec![("images".into(), "a.fits".into())]);
        let s = f.to_string();
        assert!(s.starts_with("attribution exited with status 2 [images=a.fits]"));
        assert!(s.contains("stderr: bad header"));
        assert!(!s.contains("stdout:"));

        let err = StageError::from(f);
        assert_eq!(err.to_string(), s);
        let source: &dyn std::error::Error = &err;
        assert!(source.source().is_none());
    }

    #[test]
    fn drop_reason_classification() {
        let missing = StageError::from(failure(FailureCause::MissingOutput(PathBuf::from("/o/x.fits"))));
        assert_eq!(
            missing.drop_reason(),
            DropReason::JobFailed("attribution succeeded but output /o/x.fits is missing".into())
        );
        let cfg = StageError::Configuration("centers file /c.txt not found".into());
        assert!(matches!(cfg.drop_reason(), DropReason::Configuration(_)));
    }
}
