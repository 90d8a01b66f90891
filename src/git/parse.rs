//! Parsers for git plumbing output.
//!
//! Every listing is line oriented with tab separated fields.  A line with the
//! wrong number of fields means the installed git disagrees with the format we
//! asked for, so it is a hard error rather than something to skip.

use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;

use crate::git::error::GitError;

/// `git log` format producing [`CommitMetadata`] lines.
pub const COMMIT_FORMAT: &str = "%H%x09%cI%x09%an <%ae>%x09%cn <%ce>%x09%s";

/// `git for-each-ref` format producing [`TagMetadata`] lines.
///
/// Annotated tags report the tag object's own date, tagger and subject, and
/// the commit they peel to.  Lightweight tags fall back to the commit.
pub const TAG_FORMAT: &str = concat!(
    "%(refname:short)%09",
    "%(if)%(*objectname)%(then)%(*objectname)%(else)%(objectname)%(end)%09",
    "%(creatordate:iso-strict)%09",
    "%(if)%(taggername)%(then)%(taggername) %(taggeremail)%(else)%(authorname) %(authoremail)%(end)%09",
    "%(if)%(*objectname)%(then)%(*committername) %(*committeremail)%(else)%(committername) %(committeremail)%(end)%09",
    "%(subject)",
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitMetadata {
    pub id: String,
    pub commit_date: DateTime<Utc>,
    pub author: String,
    pub committer: String,
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagMetadata {
    pub tag: String,
    pub commit_id: String,
    pub creator_date: DateTime<Utc>,
    pub author: String,
    pub committer: String,
    pub subject: String,
}

/// One non-bare entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    pub branch: Option<String>,
}

/// One line of `git status -s`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// The two-letter `XY` code, e.g. `" M"` or `"??"`.
    pub code: String,
    pub path: String,
}

pub fn parse_commits(output: &str) -> Result<Vec<CommitMetadata>, GitError> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let fields = split_fields::<5>("commit", line)?;
            Ok(CommitMetadata {
                id: fields[0].to_string(),
                commit_date: parse_date("commit date", fields[1])?,
                author: fields[2].to_string(),
                committer: fields[3].to_string(),
                subject: fields[4].to_string(),
            })
        })
        .collect()
}

pub fn parse_tags(output: &str) -> Result<Vec<TagMetadata>, GitError> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let fields = split_fields::<6>("tag", line)?;
            Ok(TagMetadata {
                tag: fields[0].to_string(),
                commit_id: fields[1].to_string(),
                creator_date: parse_date("tag creator date", fields[2])?,
                author: fields[3].to_string(),
                committer: fields[4].to_string(),
                subject: fields[5].to_string(),
            })
        })
        .collect()
}

pub fn parse_worktrees(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    for block in output.split("\n\n") {
        let mut path = None;
        let mut head = None;
        let mut branch = None;
        let mut bare = false;
        for line in block.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                path = Some(PathBuf::from(p));
            } else if let Some(h) = line.strip_prefix("HEAD ") {
                head = Some(h.to_string());
            } else if let Some(b) = line.strip_prefix("branch ") {
                branch = Some(b.strip_prefix("refs/heads/").unwrap_or(b).to_string());
            } else if line == "bare" {
                bare = true;
            }
        }
        if let Some(path) = path
            && !bare
        {
            entries.push(WorktreeEntry { path, head, branch });
        }
    }
    entries
}

pub fn parse_status(output: &str) -> Result<Vec<StatusEntry>, GitError> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            if line.len() < 4 || !line.is_char_boundary(2) || &line[2..3] != " " {
                return Err(GitError::parse("status line", line));
            }
            Ok(StatusEntry {
                code: line[..2].to_string(),
                path: line[3..].to_string(),
            })
        })
        .collect()
}

fn split_fields<'a, const N: usize>(
    what: &'static str,
    line: &'a str,
) -> Result<[&'a str; N], GitError> {
    let fields: Vec<&str> = line.splitn(N, '\t').collect();
    fields.try_into().map_err(|fields: Vec<&str>| {
        GitError::parse(
            what,
            format!("expected {} fields, found {}: {:?}", N, fields.len(), line),
        )
    })
}

fn parse_date(what: &'static str, value: &str) -> Result<DateTime<Utc>, GitError> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| GitError::parse(what, format!("{:?}: {}", value, e)))
}
