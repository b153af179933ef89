//! CLI argument definitions and backend target resolution.
//!
//! The backend is located in priority order: `--embedded` hosts one
//! in-process, `--port` names an already-running listener, and failing
//! both the working directory is probed for a `.nrepl-port` file left
//! behind by the backend at startup.

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use tracing::debug;

const TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::config");

/// File conventionally holding the backend's listen port.
pub const PORT_FILE: &str = ".nrepl-port";

/// Log rendering selection for diagnostics on stderr.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
    /// Single-line human-readable events.
    #[default]
    Compact,
    /// Structured JSON events.
    Json,
}

/// Command-line interface for the bridge.
#[derive(Parser, Debug)]
#[command(name = "banter-mcp", version, about = "Tool-calling bridge for a live evaluation backend")]
pub struct Cli {
    /// Port of an already-running backend.
    #[arg(long, conflicts_with = "embedded")]
    pub port: Option<u16>,
    /// Host an embedded backend inside this process.
    #[arg(long)]
    pub embedded: bool,
    /// Tracing filter directives (overrides RUST_LOG).
    #[arg(long)]
    pub log_filter: Option<String>,
    /// How diagnostics are rendered on stderr.
    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

/// Where the bridge should find its backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendTarget {
    /// Host a backend in-process.
    Embedded,
    /// Connect to a listener on this port.
    External(u16),
}

/// Backend resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No port was given and no port file was found.
    #[error(
        "no backend configured: pass --port, --embedded, or start the backend \
         in a directory containing {PORT_FILE}"
    )]
    NoBackend,
    /// A port file existed but did not hold a port number.
    #[error("malformed port file {path}: {reason}")]
    MalformedPortFile { path: PathBuf, reason: String },
}

impl Cli {
    /// Resolves the backend target, probing `directory` for a port file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when no target can be determined or the
    /// port file cannot be parsed.
    pub fn resolve_backend(&self, directory: &Path) -> Result<BackendTarget, ConfigError> {
        if self.embedded {
            return Ok(BackendTarget::Embedded);
        }
        if let Some(port) = self.port {
            return Ok(BackendTarget::External(port));
        }
        let candidate = directory.join(PORT_FILE);
        match fs::read_to_string(&candidate) {
            Ok(contents) => {
                let port = contents.trim().parse::<u16>().map_err(|error| {
                    ConfigError::MalformedPortFile {
                        path: candidate.clone(),
                        reason: error.to_string(),
                    }
                })?;
                debug!(target: TARGET, port, path = %candidate.display(), "discovered port file");
                Ok(BackendTarget::External(port))
            }
            Err(_) => Err(ConfigError::NoBackend),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    fn parse(arguments: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("banter-mcp").chain(arguments.iter().copied()))
            .expect("arguments parse")
    }

    #[rstest]
    fn explicit_port_wins_without_touching_the_filesystem() {
        let cli = parse(&["--port", "7888"]);
        let target = cli
            .resolve_backend(Path::new("/nonexistent"))
            .expect("resolves");
        assert_eq!(target, BackendTarget::External(7888));
    }

    #[rstest]
    fn embedded_flag_selects_the_in_process_backend() {
        let cli = parse(&["--embedded"]);
        let target = cli
            .resolve_backend(Path::new("/nonexistent"))
            .expect("resolves");
        assert_eq!(target, BackendTarget::Embedded);
    }

    #[rstest]
    fn port_and_embedded_conflict() {
        let result =
            Cli::try_parse_from(["banter-mcp", "--port", "7888", "--embedded"]);
        assert!(result.is_err());
    }

    #[rstest]
    fn port_file_is_discovered() {
        let directory = TempDir::new().expect("tempdir");
        fs::write(directory.path().join(PORT_FILE), "61234\n").expect("write port file");
        let cli = parse(&[]);
        let target = cli.resolve_backend(directory.path()).expect("resolves");
        assert_eq!(target, BackendTarget::External(61234));
    }

    #[rstest]
    fn malformed_port_file_is_reported_with_its_path() {
        let directory = TempDir::new().expect("tempdir");
        fs::write(directory.path().join(PORT_FILE), "not-a-port").expect("write port file");
        let cli = parse(&[]);
        let error = cli
            .resolve_backend(directory.path())
            .expect_err("file is malformed");
        assert!(matches!(error, ConfigError::MalformedPortFile { .. }));
        assert!(error.to_string().contains(PORT_FILE));
    }

    #[rstest]
    fn missing_everything_is_a_clear_error() {
        let directory = TempDir::new().expect("tempdir");
        let cli = parse(&[]);
        let error = cli
            .resolve_backend(directory.path())
            .expect_err("nothing configured");
        assert!(matches!(error, ConfigError::NoBackend));
        assert!(error.to_string().contains("--embedded"));
    }
}
