use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use colored::ColoredString;
use colored::Colorize;

use crate::App;
use crate::clients::github::GitProvider;
use crate::git::repo::CloneOptions;
use crate::pr;
use crate::pr::PrOutcome;
use crate::pr::PromotionStatus;
use crate::pr::PullRequestPromotion;
use crate::promotion;
use crate::promotion::CommitChangesOptions;
use crate::promotion::FileUpdate;
use crate::promotion::SetFiles;

/// Runs of the commit algorithm before a rejected push is reported.
const PUSH_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromoteArgs {
    pub write_branch: String,
    pub read_ref: Option<String>,
    pub files: Vec<FileUpdate>,
}

impl App {
    /// Write `args.files` to `args.write_branch` and push.
    ///
    /// Returns the branch's latest commit ID.
    pub async fn cmd_promote(
        &self,
        url: &str,
        args: &PromoteArgs,
        stdout: &mut impl std::io::Write,
    ) -> Result<String> {
        let repo = self.clone_repo(url, &CloneOptions::default()).await?;
        let result = async {
            let _guard = self.locks.lock(repo.url(), &args.write_branch).await;
            promotion::commit_changes_with_retry(
                &*repo,
                &CommitChangesOptions {
                    read_ref: args.read_ref.clone(),
                    write_branch: args.write_branch.clone(),
                    author: None,
                },
                &SetFiles {
                    files: args.files.clone(),
                },
                PUSH_ATTEMPTS,
            )
            .await
        }
        .await;
        self.discard_repo(repo).await;

        let commit_id = result?;
        writeln!(
            stdout,
            "{} {} at {}",
            "Promoted".green(),
            args.write_branch,
            commit_id
        )?;
        Ok(commit_id)
    }

    /// Run one pass of a review-gated promotion of `args.files` into
    /// `args.write_branch`.
    ///
    /// Progress is kept in the JSON file at `state_path`, so running the same
    /// command again continues where the last run stopped.
    pub async fn cmd_promote_pull_request<P: GitProvider>(
        &self,
        provider: &P,
        url: &str,
        args: &PromoteArgs,
        stage: &str,
        state_path: &Path,
        stdout: &mut impl std::io::Write,
    ) -> Result<PrOutcome> {
        let mut status = load_status(state_path).await?;
        let opts = PullRequestPromotion {
            stage: stage.to_string(),
            base: args.write_branch.clone(),
            branch_prefix: self.config.pr_branch_prefix.clone(),
            read_ref: args.read_ref.clone(),
            author: None,
        };
        let mutation = SetFiles {
            files: args.files.clone(),
        };

        let repo = self.clone_repo(url, &CloneOptions::default()).await?;
        let result = async {
            let pr_branch = pr::pr_branch_name(&opts.branch_prefix, &opts.stage, &opts.base);
            let _guard = self.locks.lock(repo.url(), &pr_branch).await;
            pr::promote_via_pull_request(provider, &*repo, &mut status, &opts, &mutation).await
        }
        .await;
        self.discard_repo(repo).await;

        save_status(state_path, &status).await?;
        let outcome = result?;
        writeln!(stdout, "{}", describe(&outcome))?;
        Ok(outcome)
    }
}

fn describe(outcome: &PrOutcome) -> ColoredString {
    match outcome {
        PrOutcome::NoChanges => "No changes to promote".yellow(),
        PrOutcome::Opened { number, url } => {
            format!("Opened pull request #{}: {}", number, url).green()
        }
        PrOutcome::Pending { number } => {
            format!("Waiting for pull request #{} to be merged", number).yellow()
        }
        PrOutcome::Merged {
            number,
            merge_commit,
        } => format!("Pull request #{} merged as {}", number, merge_commit).green(),
        PrOutcome::Closed { number } => {
            format!("Pull request #{} was closed without merging", number).red()
        }
        PrOutcome::Finished { phase } => format!("Promotion already {}", phase).dimmed(),
    }
}

async fn load_status(path: &Path) -> Result<PromotionStatus> {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse promotion state {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PromotionStatus::default()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

async fn save_status(path: &Path, status: &PromotionStatus) -> Result<()> {
    let json = serde_json::to_string_pretty(status)?;
    tokio::fs::write(path, json + "\n")
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pr::PromotionPhase;

    #[tokio::test]
    async fn test_missing_state_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let status = load_status(&dir.path().join("state.json")).await.unwrap();
        assert_eq!(status, PromotionStatus::default());
    }

    #[tokio::test]
    async fn test_state_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let status = PromotionStatus {
            phase: PromotionPhase::Failed,
            message: "closed".to_string(),
            ..Default::default()
        };

        save_status(&path, &status).await.unwrap();
        assert_eq!(load_status(&path).await.unwrap(), status);
    }

    #[tokio::test]
    async fn test_corrupt_state_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_status(&path).await.is_err());
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            describe(&PrOutcome::Pending { number: 4 }).to_string(),
            "Waiting for pull request #4 to be merged"
        );
        assert_eq!(
            describe(&PrOutcome::Finished {
                phase: PromotionPhase::Succeeded
            })
            .to_string(),
            "Promotion already Succeeded"
        );
    }
}
