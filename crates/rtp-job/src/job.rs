use std::path::Path;
use std::process::Command;

use rtp_core::{FailureCause, JobFailure};

/// `--key value`, or just `--key` when the value is `None`.
pub type NamedArg = (String, Option<String>);

/// An external executable with its fixed arguments.
///
/// Rendered as `executable (--key [value])* positional*`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobSpec {
    pub executable: String,
    pub positional: Vec<String>,
    pub named: Vec<NamedArg>,
}

impl JobSpec {
    pub fn new(executable: impl Into<String>) -> Self {
        Self { executable: executable.into(), ..Self::default() }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.positional.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn opt(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        set_named(&mut self.named, key.into(), Some(value.into()));
        self
    }

    /// Set `key` only when a value is present.
    pub fn opt_if(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.opt(key, v),
            None => self,
        }
    }

    pub fn flag(mut self, key: impl Into<String>) -> Self {
        set_named(&mut self.named, key.into(), None);
        self
    }

    /// Override wins on shared keys but keeps the base position; positionals are base then override.
    pub fn merge(&self, other: &JobSpec) -> JobSpec {
        let mut named = self.named.clone();
        for (k, v) in &other.named {
            set_named(&mut named, k.clone(), v.clone());
        }
        let mut positional = self.positional.clone();
        positional.extend(other.positional.iter().cloned());
        JobSpec { executable: self.executable.clone(), positional, named }
    }

    pub fn render(&self) -> Vec<String> {
        let mut command = Vec::with_capacity(1 + self.named.len() * 2 + self.positional.len());
        command.push(self.executable.clone());
        for (k, v) in &self.named {
            command.push(format!("--{k}"));
            if let Some(v) = v {
                command.push(v.clone());
            }
        }
        command.extend(self.positional.iter().cloned());
        command
    }

    pub fn render_with(&self, extra_positional: &[String], extra_named: &[NamedArg]) -> Vec<String> {
        let extra = JobSpec {
            executable: String::new(),
            positional: extra_positional.to_vec(),
            named: extra_named.to_vec(),
        };
        self.merge(&extra).render()
    }

    /// Run synchronously and capture output. Only a spawn failure is an error here;
    /// classify the exit status with [`JobOutput::into_success`].
    pub fn execute(&self, extra_positional: &[String], extra_named: &[NamedArg]) -> Result<JobOutput, JobFailure> {
        let command = self.render_with(extra_positional, extra_named);
        tracing::debug!(command = %command.join(" "), "executing job");

        let out = Command::new(&command[0]).args(&command[1..]).output();
        match out {
            Ok(out) => Ok(JobOutput {
                executable: self.executable.clone(),
                command,
                status: out.status.code(),
                stdout: String::from_utf8_lossy(&out.stdout).to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            }),
            Err(e) => Err(JobFailure {
                executable: self.executable.clone(),
                command,
                exit_status: None,
                stdout: String::new(),
                stderr: String::new(),
                cause: FailureCause::Spawn(e.to_string()),
                context: Vec::new(),
            }),
        }
    }

    /// Execute, require exit status 0, then require `artifact` to exist.
    pub fn run_for_artifact(&self, artifact: &Path, context: Vec<(String, String)>) -> Result<JobOutput, JobFailure> {
        self.execute(&[], &[])
            .map_err(|f| f.with_context(context.clone()))?
            .into_success(context.clone())?
            .require_artifact(artifact, context)
    }
}

fn set_named(named: &mut Vec<NamedArg>, key: String, value: Option<String>) {
    match named.iter_mut().find(|(k, _)| *k == key) {
        Some(slot) => slot.1 = value,
        None => named.push((key, value)),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobOutput {
    pub executable: String,
    pub command: Vec<String>,
    /// `None` when terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl JobOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn failure(self, cause: FailureCause, context: Vec<(String, String)>) -> JobFailure {
        JobFailure {
            executable: self.executable,
            command: self.command,
            exit_status: self.status,
            stdout: self.stdout,
            stderr: self.stderr,
            cause,
            context,
        }
    }

    pub fn into_success(self, context: Vec<(String, String)>) -> Result<JobOutput, JobFailure> {
        if self.success() {
            Ok(self)
        } else {
            Err(self.failure(FailureCause::NonZeroExit, context))
        }
    }

    pub fn require_artifact(self, path: &Path, context: Vec<(String, String)>) -> Result<JobOutput, JobFailure> {
        if path.exists() {
            tracing::info!(artifact = %path.display(), executable = %self.executable, "wrote artifact");
            Ok(self)
        } else {
            Err(self.failure(FailureCause::MissingOutput(path.to_path_buf()), context))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_named_before_positional() {
        let spec = JobSpec::new("prog").opt("config", "c.cfg").opt("output", "a.fits").arg("b.fits");
        assert_eq!(spec.render(), vec!["prog", "--config", "c.cfg", "--output", "a.fits", "b.fits"]);
    }

    #[test]
    fn valueless_named_renders_bare_flag() {
        let spec = JobSpec::new("prog").flag("verbose").arg("x");
        assert_eq!(spec.render(), vec!["prog", "--verbose", "x"]);
    }

    #[test]
    fn merge_overrides_in_place_and_appends() {
        let base = JobSpec::new("prog").opt("config", "base.cfg").opt("output", "o.fits").arg("a");
        let over = JobSpec::new("ignored").opt("config", "over.cfg").opt("extra", "1").arg("b");
        let merged = base.merge(&over);
        assert_eq!(
            merged.render(),
            vec!["prog", "--config", "over.cfg", "--output", "o.fits", "--extra", "1", "a", "b"]
        );
        // base untouched
        assert_eq!(base.render()[2], "base.cfg");
    }

    #[test]
    fn render_with_extras() {
        let spec = JobSpec::new("prog").opt("config", "c.cfg");
        let cmd = spec.render_with(&["b.fits".into()], &[("output".into(), Some("a.fits".into()))]);
        assert_eq!(cmd, vec!["prog", "--config", "c.cfg", "--output", "a.fits", "b.fits"]);
    }

    #[test]
    fn spawn_failure_is_a_job_failure() {
        let err = JobSpec::new("/nonexistent/definitely-not-here").execute(&[], &[]).unwrap_err();
        assert!(matches!(err.cause, FailureCause::Spawn(_)));
        assert_eq!(err.exit_status, None);
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_classified() {
        let out = JobSpec::new("sh").args(["-c", "echo oops >&2; exit 3"]).execute(&[], &[]).unwrap();
        assert_eq!(out.status, Some(3));
        let err = out.into_success(vec![("images".into(), "a.fits".into())]).unwrap_err();
        assert_eq!(err.cause, FailureCause::NonZeroExit);
        assert_eq!(err.stderr.trim(), "oops");
        assert_eq!(err.context, vec![("images".to_string(), "a.fits".to_string())]);
    }

    #[cfg(unix)]
    #[test]
    fn missing_artifact_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("never.fits");
        let err = JobSpec::new("true").run_for_artifact(&artifact, vec![]).unwrap_err();
        assert_eq!(err.cause, FailureCause::MissingOutput(artifact.clone()));
        assert_eq!(err.exit_status, Some(0));

        std::fs::write(&artifact, b"x").unwrap();
        assert!(JobSpec::new("true").run_for_artifact(&artifact, vec![]).is_ok());
    }
}
