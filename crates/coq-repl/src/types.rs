use std::path::PathBuf;
use std::time::Duration;

use encoding_rs::Encoding;

use crate::project;

/// Flags every backend is started with: quiet, protocol on stdio, and
/// asynchronous proof checking.
pub const BASE_FLAGS: [&str; 5] = ["-quiet", "-main-channel", "stdfds", "-async-proofs", "on"];

/// Errors that can occur while driving a backend.
///
/// A failure reported by the backend itself is not an error here; it comes
/// back as [`crate::Response::Err`].
#[derive(Debug, thiserror::Error)]
pub enum CoqError {
    /// The backend could not be started or refused the initial handshake.
    #[error("couldn't launch coqtop: {0}")]
    Launch(String),

    /// The backend sent something that is not a valid protocol reply.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The backend stopped producing output and was killed.
    #[error(
        "Coq has died! Timeout: {timeout_secs} seconds. \
         Change the timeout with `timeout_secs` in the config or --timeout"
    )]
    BackendDied { timeout_secs: f64 },

    /// No reply within the call's deadline. The backend is still running.
    #[error(
        "Timeout: {timeout_secs} seconds. Coq is still up and running! \
         Change the timeout with `timeout_secs` in the config or --timeout"
    )]
    Timeout { timeout_secs: f64 },

    /// `rewind` asked to undo more steps than have been recorded.
    #[error("cannot rewind {requested} step(s): only {available} recorded")]
    RewindTooFar { requested: usize, available: usize },

    /// `resume` was called with no timed-out call outstanding.
    #[error("no timed-out call to resume")]
    NothingPending,

    #[error("unknown text encoding {0:?}")]
    UnknownEncoding(String),

    /// I/O failure on the backend's pipes.
    #[error(transparent)]
    Transport(#[from] std::io::Error),
}

/// Configuration for launching and talking to a backend.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CoqConfig {
    /// Backend executable, looked up in `PATH` if relative.
    #[serde(default = "default_executable")]
    pub executable: PathBuf,

    /// Extra arguments appended after [`BASE_FLAGS`].
    #[serde(default)]
    pub args: Vec<String>,

    /// Default timeout in seconds for a single call.
    #[serde(default = "default_timeout")]
    pub timeout_secs: f64,

    /// Label of the text encoding used for outgoing strings (e.g. `"utf-8"`).
    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// Whether to append flags from the nearest `_CoqProject`.
    #[serde(default = "default_project_flags")]
    pub project_flags: bool,

    /// Directory the backend runs in and `_CoqProject` is searched from.
    /// Defaults to the current directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl Default for CoqConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            args: Vec::new(),
            timeout_secs: default_timeout(),
            encoding: default_encoding(),
            project_flags: default_project_flags(),
            working_dir: None,
        }
    }
}

impl CoqConfig {
    /// Config for `executable` with every other field at its default.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        // Infinite means no limit; negative and NaN mean zero.
        Duration::try_from_secs_f64(self.timeout_secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Resolve [`CoqConfig::encoding`] to an encoding.
    pub fn text_encoding(&self) -> Result<&'static Encoding, CoqError> {
        Encoding::for_label(self.encoding.as_bytes())
            .ok_or_else(|| CoqError::UnknownEncoding(self.encoding.clone()))
    }

    /// Full argument list: base flags, configured extras, then project flags.
    pub fn backend_args(&self) -> Vec<String> {
        let mut args: Vec<String> = BASE_FLAGS.iter().map(|s| s.to_string()).collect();
        args.extend(self.args.iter().cloned());

        if self.project_flags {
            let start = match &self.working_dir {
                Some(dir) => Some(dir.clone()),
                None => std::env::current_dir().ok(),
            };
            if let Some(flags) = start.as_deref().and_then(project::read_project_flags) {
                tracing::debug!(count = flags.len(), "Using _CoqProject flags");
                args.extend(flags);
            }
        }
        args
    }
}

fn default_executable() -> PathBuf {
    PathBuf::from("coqidetop")
}
fn default_timeout() -> f64 {
    10.0
}
fn default_encoding() -> String {
    "utf-8".to_string()
}
fn default_project_flags() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CoqConfig::default();
        assert_eq!(config.executable, PathBuf::from("coqidetop"));
        assert!(config.args.is_empty());
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.text_encoding().unwrap(), encoding_rs::UTF_8);
        assert!(config.project_flags);
    }

    #[test]
    fn odd_timeouts_do_not_panic() {
        let mut config = CoqConfig::default();
        config.timeout_secs = f64::INFINITY;
        assert_eq!(config.timeout(), Duration::MAX);
        config.timeout_secs = -1.0;
        assert_eq!(config.timeout(), Duration::ZERO);
        config.timeout_secs = 0.25;
        assert_eq!(config.timeout(), Duration::from_millis(250));
    }

    #[test]
    fn unknown_encoding_is_reported() {
        let config = CoqConfig {
            encoding: "klingon-8".into(),
            ..CoqConfig::default()
        };
        assert!(matches!(
            config.text_encoding(),
            Err(CoqError::UnknownEncoding(label)) if label == "klingon-8"
        ));
    }

    #[test]
    fn latin1_label_resolves() {
        let config = CoqConfig {
            encoding: "latin1".into(),
            ..CoqConfig::default()
        };
        assert_eq!(config.text_encoding().unwrap(), encoding_rs::WINDOWS_1252);
    }

    #[test]
    fn backend_args_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("_CoqProject"), "-R theories Foo\n").unwrap();

        let config = CoqConfig {
            args: vec!["-noinit".into()],
            working_dir: Some(dir.path().to_path_buf()),
            ..CoqConfig::default()
        };
        assert_eq!(
            config.backend_args(),
            vec![
                "-quiet", "-main-channel", "stdfds", "-async-proofs", "on", "-noinit", "-R",
                "theories", "Foo"
            ]
        );

        let without_project = CoqConfig {
            project_flags: false,
            ..config
        };
        assert_eq!(without_project.backend_args().len(), 6);
    }

    #[test]
    fn error_messages_mention_timeout() {
        let died = CoqError::BackendDied { timeout_secs: 1.5 }.to_string();
        assert!(died.contains("1.5"));
        assert!(died.contains("timeout_secs"));

        let timeout = CoqError::Timeout { timeout_secs: 3.0 }.to_string();
        assert!(timeout.contains("still up and running"));
    }
}
