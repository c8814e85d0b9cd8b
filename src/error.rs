//! Classified pipeline errors
//!
//! Every failure in the pipeline is one of four kinds. The kind decides
//! whether a retry is worthwhile and which exit code the process reports.

use std::process::ExitStatus;
use thiserror::Error;

/// Pipeline error taxonomy
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing required tool or malformed configuration (permanent)
    #[error("configuration error: {0}")]
    Config(String),

    /// Corrupt audio, unreadable source, identity cannot be computed (permanent)
    #[error("input error: {0}")]
    Input(String),

    /// Encoder/tagger/prober non-zero exit, HTTP 5xx, subprocess timeout
    #[error("{tool} failed: {message}")]
    ExternalTool { tool: String, message: String },

    /// Network timeout, 429, lock contention on a shared resource
    #[error("transient error: {0}")]
    Transient(String),
}

/// Retry categorization of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorCategory {
    Success,
    Transient,
    Permanent,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Success => "success",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
        }
    }
}

impl PipelineError {
    /// Kind name recorded in the manifest `last_error.category`
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "config",
            PipelineError::Input(_) => "input",
            PipelineError::ExternalTool { .. } => "external_tool",
            PipelineError::Transient(_) => "transient",
        }
    }

    /// Whether a retry could succeed
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::Config(_) | PipelineError::Input(_) => ErrorCategory::Permanent,
            PipelineError::ExternalTool { .. } | PipelineError::Transient(_) => {
                ErrorCategory::Transient
            }
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.category() == ErrorCategory::Permanent
    }

    /// Process exit code for this error when it is the worst one observed
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => 2,
            PipelineError::Input(_) => 3,
            PipelineError::ExternalTool { .. } | PipelineError::Transient(_) => 1,
        }
    }

    /// Build an external-tool error from a subprocess exit
    pub fn from_tool_exit(tool: &str, status: ExitStatus, stderr: &str) -> Self {
        let message = if stderr.trim().is_empty() {
            format!("exited with {}", status)
        } else {
            format!("exited with {}: {}", status, stderr.trim())
        };
        // Tools in this pipeline reserve 2 and 3 for unrecoverable input or
        // configuration problems; anything else is worth a retry.
        match status.code() {
            Some(2) => PipelineError::Config(format!("{}: {}", tool, message)),
            Some(3) => PipelineError::Input(format!("{}: {}", tool, message)),
            _ => PipelineError::ExternalTool {
                tool: tool.to_string(),
                message,
            },
        }
    }
}

/// Classify any error chain, recovering the typed kind when present
pub fn classify(error: &anyhow::Error) -> ErrorCategory {
    if let Some(pe) = error.downcast_ref::<PipelineError>() {
        return pe.category();
    }

    // Untyped errors: sniff the message, defaulting to transient so callers
    // err on the side of retrying.
    let msg = error.to_string().to_lowercase();
    if msg.contains("not found")
        || msg.contains("permission denied")
        || msg.contains("invalid")
        || msg.contains("unsupported")
        || msg.contains("corrupt")
    {
        ErrorCategory::Permanent
    } else {
        ErrorCategory::Transient
    }
}

/// Kind name for the manifest, falling back to a generic label
pub fn kind_of(error: &anyhow::Error) -> &'static str {
    match error.downcast_ref::<PipelineError>() {
        Some(pe) => pe.kind(),
        None => match classify(error) {
            ErrorCategory::Permanent => "input",
            _ => "transient",
        },
    }
}

/// Exit code for an error chain
pub fn exit_code_of(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<PipelineError>() {
        Some(pe) => pe.exit_code(),
        None => 1,
    }
}
