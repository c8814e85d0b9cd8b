//! External tool validation

use std::process::Command;
use which::which;

/// Checker for the encoder, prober, and tagger binaries
pub struct DependencyChecker;

#[derive(Debug, Clone)]
pub struct DependencyStatus {
    pub name: String,
    pub found: bool,
    pub version: Option<String>,
    pub path: Option<String>,
}

impl DependencyChecker {
    /// Check the encoder (ffmpeg)
    pub fn check_encoder() -> DependencyStatus {
        Self::check_tool("ffmpeg", &["-version"], |stdout| {
            stdout
                .lines()
                .next()
                .and_then(|line| line.split_whitespace().nth(2))
                .map(|s| s.to_string())
        })
    }

    /// Check the prober (ffprobe)
    pub fn check_prober() -> DependencyStatus {
        Self::check_tool("ffprobe", &["-version"], |stdout| {
            stdout
                .lines()
                .next()
                .and_then(|line| line.split_whitespace().nth(2))
                .map(|s| s.to_string())
        })
    }

    /// Check the tagger (AtomicParsley)
    pub fn check_tagger() -> DependencyStatus {
        Self::check_tool("AtomicParsley", &["--version"], |stdout| {
            stdout
                .lines()
                .find(|line| line.contains("version"))
                .and_then(|line| line.split_whitespace().last())
                .map(|s| s.to_string())
        })
    }

    /// Check every tool the pipeline shells out to
    pub fn check_all() -> Vec<DependencyStatus> {
        vec![
            Self::check_encoder(),
            Self::check_prober(),
            Self::check_tagger(),
        ]
    }

    fn check_tool(
        name: &str,
        version_args: &[&str],
        parse: fn(&str) -> Option<String>,
    ) -> DependencyStatus {
        match which(name) {
            Ok(path) => {
                let version = Command::new(name)
                    .args(version_args)
                    .output()
                    .ok()
                    .and_then(|out| parse(&String::from_utf8_lossy(&out.stdout)));
                DependencyStatus {
                    name: name.to_string(),
                    found: true,
                    version,
                    path: Some(path.display().to_string()),
                }
            }
            Err(_) => DependencyStatus {
                name: name.to_string(),
                found: false,
                version: None,
                path: None,
            },
        }
    }
}

impl std::fmt::Display for DependencyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.found {
            write!(f, "✓ {}", self.name)?;
            if let Some(ref version) = self.version {
                write!(f, " ({})", version)?;
            }
            if let Some(ref path) = self.path {
                write!(f, "\n  Path: {}", path)?;
            }
            Ok(())
        } else {
            write!(f, "✗ {} - NOT FOUND", self.name)
        }
    }
}
