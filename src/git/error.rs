use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::clients::process::ProcessOutput;

static MERGE_CONFLICT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^CONFLICT \(|Automatic merge failed|could not apply [0-9a-f]+").unwrap()
});

static NON_FAST_FORWARD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[rejected\].*\((non-fast-forward|fetch first)\)|Updates were rejected because")
        .unwrap()
});

/// Failures of git invocations.
///
/// Always carried inside an [`anyhow::Error`]; use `downcast_ref` to branch on
/// the kind.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("error executing `{command}` ({}): {output}", describe_code(.code))]
    Command {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("merge conflict executing `{command}`: {output}")]
    MergeConflict { command: String, output: String },

    #[error("push rejected (non-fast-forward) executing `{command}`: {output}")]
    NonFastForward { command: String, output: String },

    #[error("unable to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },
}

impl GitError {
    /// Build the error for a failed invocation, recognising conflicts and
    /// rejected pushes from the output text.
    pub fn from_output(command: String, output: &ProcessOutput) -> Self {
        let text = output.combined();
        if MERGE_CONFLICT_RE.is_match(&text) {
            GitError::MergeConflict {
                command,
                output: text,
            }
        } else if NON_FAST_FORWARD_RE.is_match(&text) {
            GitError::NonFastForward {
                command,
                output: text,
            }
        } else {
            GitError::Command {
                command,
                code: output.code,
                output: text,
            }
        }
    }

    pub(crate) fn parse(what: &'static str, detail: impl Into<String>) -> Self {
        GitError::Parse {
            what,
            detail: detail.into(),
        }
    }

    /// Whether the failure can be resolved by refetching and trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GitError::MergeConflict { .. } | GitError::NonFastForward { .. }
        )
    }
}

/// Whether an `anyhow` error wraps a retryable [`GitError`].
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<GitError>()
        .is_some_and(GitError::is_retryable)
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "killed by signal".to_string(),
    }
}
