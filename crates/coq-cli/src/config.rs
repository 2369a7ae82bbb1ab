//! TOML config loading for the CLI.
//!
//! Reads an optional file with a `[backend]` section, then merges CLI flags
//! on top.

use std::path::{Path, PathBuf};

use coq_repl::CoqConfig;
use serde::Deserialize;

/// Top-level structure of `configs/coq.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct CliToml {
    #[serde(default)]
    pub backend: BackendOverrides,
}

/// Optional overrides for `CoqConfig` fields.
#[derive(Debug, Default, Deserialize)]
pub struct BackendOverrides {
    pub executable: Option<PathBuf>,
    /// Extra backend arguments.
    pub args: Option<Vec<String>>,
    /// Seconds to wait for the backend before giving up on it.
    pub timeout_secs: Option<f64>,
    /// Label of the encoding used for sentences and queries.
    pub encoding: Option<String>,
    /// Whether to pick up flags from the nearest `_CoqProject`.
    pub project_flags: Option<bool>,
    pub working_dir: Option<PathBuf>,
}

/// Backend settings given on the command line.
#[derive(Debug, Default, Clone)]
pub struct BackendFlags {
    pub executable: Option<PathBuf>,
    pub args: Vec<String>,
    pub timeout_secs: Option<f64>,
}

/// Load and deserialize a `CliToml` from a TOML file.
pub fn load_cli_toml(path: &Path) -> anyhow::Result<CliToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let config: CliToml = toml::from_str(&contents)?;
    tracing::info!(path = %path.display(), "Loaded config");
    Ok(config)
}

/// Build a `CoqConfig` from defaults, TOML overrides and CLI flags.
///
/// Priority chain: `CoqConfig::default()` < TOML values < CLI flags. CLI
/// `--arg`s are appended after the TOML ones.
pub fn build_coq_config(
    overrides: &BackendOverrides,
    flags: &BackendFlags,
) -> anyhow::Result<CoqConfig> {
    let mut config = CoqConfig::default();

    // Apply TOML overrides
    if let Some(exe) = &overrides.executable {
        config.executable = exe.clone();
    }
    if let Some(args) = &overrides.args {
        config.args = args.clone();
    }
    if let Some(secs) = overrides.timeout_secs {
        config.timeout_secs = secs;
    }
    if let Some(label) = &overrides.encoding {
        config.encoding = label.clone();
    }
    if let Some(enabled) = overrides.project_flags {
        config.project_flags = enabled;
    }
    if let Some(dir) = &overrides.working_dir {
        config.working_dir = Some(dir.clone());
    }

    // CLI flags take highest priority
    if let Some(exe) = &flags.executable {
        config.executable = exe.clone();
    }
    config.args.extend(flags.args.iter().cloned());
    if let Some(secs) = flags.timeout_secs {
        config.timeout_secs = secs;
    }

    if !(config.timeout_secs.is_finite() && config.timeout_secs > 0.0) {
        anyhow::bail!(
            "timeout must be a positive number of seconds, got {}",
            config.timeout_secs
        );
    }
    // Fail early on a bad label rather than at the first sentence.
    config.text_encoding()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_full_toml() {
        let toml_str = r#"
[backend]
executable = "/opt/coq/bin/coqidetop"
args = ["-noinit", "-R", "theories", "Lib"]
timeout_secs = 2.5
encoding = "latin1"
project_flags = false
working_dir = "/tmp/proj"
"#;
        let config: CliToml = toml::from_str(toml_str).unwrap();
        let b = &config.backend;
        assert_eq!(b.executable, Some(PathBuf::from("/opt/coq/bin/coqidetop")));
        assert_eq!(b.args.as_ref().unwrap().len(), 4);
        assert_eq!(b.timeout_secs, Some(2.5));
        assert_eq!(b.encoding.as_deref(), Some("latin1"));
        assert_eq!(b.project_flags, Some(false));
        assert_eq!(b.working_dir, Some(PathBuf::from("/tmp/proj")));
    }

    #[test]
    fn test_missing_backend_section() {
        let config: CliToml = toml::from_str("").unwrap();
        assert!(config.backend.executable.is_none());
        assert!(config.backend.timeout_secs.is_none());
    }

    #[test]
    fn test_defaults_without_overrides() {
        let config = build_coq_config(&BackendOverrides::default(), &BackendFlags::default()).unwrap();
        assert_eq!(config.executable, PathBuf::from("coqidetop"));
        assert!(config.args.is_empty());
        assert_eq!(config.timeout_secs, 10.0);
        assert!(config.project_flags);
    }

    #[test]
    fn test_cli_override_priority() {
        let overrides = BackendOverrides {
            executable: Some("toml-coqidetop".into()),
            args: Some(vec!["-noinit".into()]),
            timeout_secs: Some(5.0),
            ..Default::default()
        };
        let flags = BackendFlags {
            executable: Some("cli-coqidetop".into()),
            args: vec!["-w".into(), "-all".into()],
            timeout_secs: Some(1.5),
        };
        let config = build_coq_config(&overrides, &flags).unwrap();
        assert_eq!(config.executable, PathBuf::from("cli-coqidetop"));
        assert_eq!(config.args, vec!["-noinit", "-w", "-all"]);
        assert_eq!(config.timeout_secs, 1.5);
    }

    #[test]
    fn test_rejects_bad_timeout_and_encoding() {
        let flags = BackendFlags {
            timeout_secs: Some(0.0),
            ..Default::default()
        };
        assert!(build_coq_config(&BackendOverrides::default(), &flags).is_err());

        let overrides = BackendOverrides {
            encoding: Some("klingon".into()),
            ..Default::default()
        };
        assert!(build_coq_config(&overrides, &BackendFlags::default()).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coq.toml");
        std::fs::write(&path, "[backend]\ntimeout_secs = 3.0\n").unwrap();
        let config = load_cli_toml(&path).unwrap();
        assert_eq!(config.backend.timeout_secs, Some(3.0));

        std::fs::write(&path, "[backend]\ntimeout_secs = \"soon\"\n").unwrap();
        assert!(load_cli_toml(&path).is_err());

        assert!(load_cli_toml(&dir.path().join("missing.toml")).is_err());
    }
}
