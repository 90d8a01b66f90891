//! Git invocations whose nonzero exit codes are answers, not failures.
//!
//! Each probe has a small table of exit codes with a boolean meaning.  Any code
//! outside the table is a real failure and becomes a [`GitError`].

use crate::clients::process::ProcessOutput;
use crate::git::error::GitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// `git ls-remote --heads --exit-code origin <branch>`
    RemoteBranchExists,
    /// `git show-ref --verify --quiet refs/heads/<branch>`
    LocalBranchExists,
    /// `git merge-base --is-ancestor <parent> <child>`
    IsAncestor,
    /// `git diff --quiet <a> <b>`
    RefsHaveDiffs,
    /// `git rev-parse --verify --quiet <rev>^{commit}`
    CommitExists,
}

const EXIT_CODES: &[(Probe, i32, bool)] = &[
    (Probe::RemoteBranchExists, 0, true),
    (Probe::RemoteBranchExists, 2, false),
    (Probe::LocalBranchExists, 0, true),
    (Probe::LocalBranchExists, 1, false),
    (Probe::IsAncestor, 0, true),
    (Probe::IsAncestor, 1, false),
    (Probe::RefsHaveDiffs, 0, false),
    (Probe::RefsHaveDiffs, 1, true),
    (Probe::CommitExists, 0, true),
    (Probe::CommitExists, 1, false),
];

/// Translate the outcome of a probe into its boolean answer.
pub fn interpret(probe: Probe, command: String, output: &ProcessOutput) -> Result<bool, GitError> {
    let answer = output.code.and_then(|code| {
        EXIT_CODES
            .iter()
            .find(|(p, c, _)| *p == probe && *c == code)
            .map(|(_, _, answer)| *answer)
    });
    match answer {
        Some(answer) => Ok(answer),
        None => Err(GitError::from_output(command, output)),
    }
}
