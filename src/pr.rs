//! Review-gated promotions.
//!
//! Instead of pushing straight to the target branch, the promotion commit
//! lands on a dedicated branch and a pull request is opened against the
//! target.  The promotion then completes only once the pull request is
//! merged.  All state that has to survive between attempts lives in the
//! caller's [`PromotionStatus`], so each call picks up where the last one
//! stopped.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::clients::github::CreatePullRequestOptions;
use crate::clients::github::GitProvider;
use crate::clients::github::ListPullRequestOptions;
use crate::clients::process::ProcessRunner;
use crate::git::worktree::CommitOptions;
use crate::git::worktree::PushOptions;
use crate::git::worktree::WorkingTree;
use crate::promotion;
use crate::promotion::CommitChangesOptions;
use crate::promotion::TreeMutation;

const PR_NUMBER_KEY: &str = "pr";
const PR_URL_KEY: &str = "pr-url";
const INITIAL_COMMIT_MESSAGE: &str = "Initial commit";

// -----------------------------------------------------------------------------
// Types

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromotionPhase {
    #[default]
    Running,
    Succeeded,
    Failed,
}

/// Caller-owned progress of one promotion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionStatus {
    pub phase: PromotionPhase,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// What the status records about the pull request for one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrTracking {
    None,
    Created { number: u64, url: String },
    Terminal { phase: PromotionPhase },
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrOutcome {
    /// The PR branch matches the base; nothing to review.
    NoChanges,
    Opened { number: u64, url: String },
    Pending { number: u64 },
    Merged { number: u64, merge_commit: String },
    Closed { number: u64 },
    /// An earlier pass already finished the promotion.
    Finished { phase: PromotionPhase },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestPromotion {
    /// Stage being promoted into; part of the PR branch name.
    pub stage: String,
    /// Branch the pull request targets.
    pub base: String,
    /// Prefix for PR branch names, e.g. `promotion/`.
    pub branch_prefix: String,
    /// Ref the mutation reads from.  The PR branch itself when unset.
    pub read_ref: Option<String>,
    pub author: Option<String>,
}

// -----------------------------------------------------------------------------
// PromotionPhase / PrTracking impl

impl fmt::Display for PromotionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PromotionPhase::Running => "Running",
            PromotionPhase::Succeeded => "Succeeded",
            PromotionPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

impl PromotionPhase {
    pub fn is_terminal(self) -> bool {
        self != PromotionPhase::Running
    }
}

fn number_key(repo_url: &str) -> String {
    format!("{}:{}", PR_NUMBER_KEY, repo_url)
}

fn url_key(repo_url: &str) -> String {
    format!("{}:{}", PR_URL_KEY, repo_url)
}

impl PrTracking {
    /// Read the tracking state for `repo_url`.  A recorded number that does
    /// not parse is an error, not a missing PR.
    pub fn from_status(status: &PromotionStatus, repo_url: &str) -> Result<Self> {
        if status.phase.is_terminal() {
            return Ok(PrTracking::Terminal {
                phase: status.phase,
            });
        }
        let Some(number) = status.metadata.get(&number_key(repo_url)) else {
            return Ok(PrTracking::None);
        };
        let number = number
            .parse::<u64>()
            .with_context(|| format!("Invalid pull request number {:?}", number))?;
        let url = status
            .metadata
            .get(&url_key(repo_url))
            .cloned()
            .unwrap_or_default();
        Ok(PrTracking::Created { number, url })
    }

    pub fn record(&self, status: &mut PromotionStatus, repo_url: &str) {
        match self {
            PrTracking::None => {
                status.metadata.remove(&number_key(repo_url));
                status.metadata.remove(&url_key(repo_url));
            }
            PrTracking::Created { number, url } => {
                status
                    .metadata
                    .insert(number_key(repo_url), number.to_string());
                status.metadata.insert(url_key(repo_url), url.clone());
                status.phase = PromotionPhase::Running;
            }
            PrTracking::Terminal { phase } => status.phase = *phase,
        }
    }
}

/// Deterministic PR branch for promoting `stage` into `base`.
pub fn pr_branch_name(prefix: &str, stage: &str, base: &str) -> String {
    format!("{}{}/{}", prefix, stage, base.replace('/', "-"))
}

// -----------------------------------------------------------------------------
// Branch preparation

/// Make sure `base` exists remotely and `pr_branch` descends from it, then
/// check out `pr_branch`.  Safe to repeat.
#[instrument(skip(tree))]
pub async fn prepare_branches<R: ProcessRunner>(
    tree: &WorkingTree<R>,
    base: &str,
    pr_branch: &str,
) -> Result<()> {
    if !tree.remote_branch_exists(base).await? {
        info!("creating base branch");
        if tree.local_branch_exists(base).await? && tree.current_branch().await? != base {
            tree.delete_branch(base, true).await?;
        }
        tree.create_orphaned_branch(base).await?;
        tree.commit(
            INITIAL_COMMIT_MESSAGE,
            &CommitOptions {
                allow_empty: true,
                ..Default::default()
            },
        )
        .await?;
        push_to(tree, base, false).await?;
    }

    if !tree.remote_branch_exists(pr_branch).await? {
        info!("creating PR branch");
        recreate_from_base(tree, base, pr_branch).await?;
        push_to(tree, pr_branch, false).await?;
    } else {
        tree.fetch_branch(base).await?;
        tree.fetch_branch(pr_branch).await?;
        let diverged = !tree
            .is_ancestor(&remote_ref(base), &remote_ref(pr_branch))
            .await?;
        if diverged {
            info!("PR branch diverged from base, recreating");
            recreate_from_base(tree, base, pr_branch).await?;
            push_to(tree, pr_branch, true).await?;
        }
    }

    tree.checkout_remote_branch(pr_branch).await
}

async fn recreate_from_base<R: ProcessRunner>(
    tree: &WorkingTree<R>,
    base: &str,
    pr_branch: &str,
) -> Result<()> {
    tree.checkout_remote_branch(base).await?;
    if tree.local_branch_exists(pr_branch).await? {
        tree.delete_branch(pr_branch, true).await?;
    }
    tree.create_child_branch(pr_branch).await
}

async fn push_to<R: ProcessRunner>(tree: &WorkingTree<R>, branch: &str, force: bool) -> Result<()> {
    tree.push(&PushOptions {
        force,
        target_branch: Some(branch.to_string()),
        ..Default::default()
    })
    .await
}

fn remote_ref(branch: &str) -> String {
    format!("refs/remotes/origin/{}", branch)
}

// -----------------------------------------------------------------------------
// Reconciliation

/// Advance the pull request for `pr_branch` by one step and record the
/// result in `status`.
#[instrument(skip(provider, tree, status))]
pub async fn reconcile<P, R>(
    provider: &P,
    tree: &WorkingTree<R>,
    status: &mut PromotionStatus,
    base: &str,
    pr_branch: &str,
) -> Result<PrOutcome>
where
    P: GitProvider,
    R: ProcessRunner,
{
    let repo_url = tree.url().to_string();
    match PrTracking::from_status(status, &repo_url)? {
        PrTracking::Terminal { phase } => Ok(PrOutcome::Finished { phase }),
        PrTracking::None => open_pull_request(provider, tree, status, base, pr_branch).await,
        PrTracking::Created { number, .. } => {
            let pr = provider.get_pull_request(&repo_url, number).await?;
            if pr.is_open {
                debug!(number, "pull request still open");
                return Ok(PrOutcome::Pending { number });
            }
            if provider.is_pull_request_merged(&repo_url, number).await? {
                let merge_commit = pr
                    .merge_commit_sha
                    .filter(|sha| !sha.is_empty())
                    .with_context(|| {
                        format!(
                            "Pull request #{} is merged but reports no merge commit",
                            number
                        )
                    })?;
                PrTracking::Terminal {
                    phase: PromotionPhase::Succeeded,
                }
                .record(status, &repo_url);
                status.message = format!("Pull request #{} merged as {}", number, merge_commit);
                info!(number, %merge_commit, "pull request merged");
                Ok(PrOutcome::Merged {
                    number,
                    merge_commit,
                })
            } else {
                PrTracking::Terminal {
                    phase: PromotionPhase::Failed,
                }
                .record(status, &repo_url);
                status.message = format!("Pull request #{} was closed without merging", number);
                info!(number, "pull request closed without merging");
                Ok(PrOutcome::Closed { number })
            }
        }
    }
}

async fn open_pull_request<P, R>(
    provider: &P,
    tree: &WorkingTree<R>,
    status: &mut PromotionStatus,
    base: &str,
    pr_branch: &str,
) -> Result<PrOutcome>
where
    P: GitProvider,
    R: ProcessRunner,
{
    let repo_url = tree.url().to_string();

    // Compare what the remote has now, not what this tree last saw.
    tree.fetch_branch(base).await?;
    tree.fetch_branch(pr_branch).await?;
    let (base_ref, pr_ref) = (remote_ref(base), remote_ref(pr_branch));
    if !tree.refs_have_diffs(&base_ref, &pr_ref).await? {
        PrTracking::Terminal {
            phase: PromotionPhase::Succeeded,
        }
        .record(status, &repo_url);
        status.message = "No changes to promote".to_string();
        info!("PR branch matches base, nothing to review");
        return Ok(PrOutcome::NoChanges);
    }

    let message = tree.commit_message(&pr_ref).await?;
    let title = message.lines().next().unwrap_or_default().to_string();
    let create = CreatePullRequestOptions {
        head: pr_branch.to_string(),
        base: base.to_string(),
        title,
    };
    let pr = match provider.create_pull_request(&repo_url, &create).await {
        Ok(pr) => pr,
        Err(create_err) => {
            warn!("Creating pull request failed, looking for an existing one: {:#}", create_err);
            let existing = provider
                .list_pull_requests(
                    &repo_url,
                    &ListPullRequestOptions {
                        head: pr_branch.to_string(),
                        base: base.to_string(),
                    },
                )
                .await?;
            match <[_; 1]>::try_from(existing) {
                Ok([pr]) => pr,
                Err(existing) => {
                    return Err(create_err.context(format!(
                        "Failed to create pull request ({} existing matches)",
                        existing.len()
                    )));
                }
            }
        }
    };

    PrTracking::Created {
        number: pr.number,
        url: pr.url.clone(),
    }
    .record(status, &repo_url);
    status.message = format!("Waiting for pull request #{} to be merged", pr.number);
    info!(number = pr.number, url = %pr.url, "opened pull request");
    Ok(PrOutcome::Opened {
        number: pr.number,
        url: pr.url,
    })
}

// -----------------------------------------------------------------------------
// Composition

/// Run one pass of a review-gated promotion.
///
/// Until a pull request is recorded this prepares the branches and commits
/// the mutation to the PR branch first.  Afterwards it only checks on the
/// pull request.
#[instrument(skip_all, fields(stage = %opts.stage, base = %opts.base))]
pub async fn promote_via_pull_request<P, R, M>(
    provider: &P,
    tree: &WorkingTree<R>,
    status: &mut PromotionStatus,
    opts: &PullRequestPromotion,
    mutation: &M,
) -> Result<PrOutcome>
where
    P: GitProvider,
    R: ProcessRunner,
    M: TreeMutation,
{
    let pr_branch = pr_branch_name(&opts.branch_prefix, &opts.stage, &opts.base);
    if PrTracking::from_status(status, tree.url())? == PrTracking::None {
        prepare_branches(tree, &opts.base, &pr_branch).await?;
        promotion::commit_changes(
            tree,
            &CommitChangesOptions {
                read_ref: opts.read_ref.clone(),
                write_branch: pr_branch.clone(),
                author: opts.author.clone(),
            },
            mutation,
        )
        .await?;
    }
    reconcile(provider, tree, status, &opts.base, &pr_branch).await
}
