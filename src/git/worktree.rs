use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;
use tracing::instrument;

use crate::clients::process::ProcessRunner;
use crate::clients::process::SystemRunner;
use crate::git::auth::GitEnv;
use crate::git::cmd;
use crate::git::exit::Probe;
use crate::git::home::HomeDir;
use crate::git::parse;
use crate::git::parse::CommitMetadata;
use crate::git::parse::StatusEntry;
use crate::git::parse::TagMetadata;

const REMOTE: &str = "origin";

// -----------------------------------------------------------------------------
// Types

/// One checked-out working copy.
///
/// Either standalone (its own `.git` directory) or linked to a
/// [`BareRepository`](crate::git::bare::BareRepository).  Branch and HEAD are
/// always read from disk, never remembered.
///
/// A handle is not safe for concurrent use: every operation mutates the same
/// directory.
#[derive(Debug)]
pub struct WorkingTree<R = SystemRunner> {
    dir: PathBuf,
    home: HomeDir,
    remote_url: String,
    env: GitEnv,
    bare_dir: Option<PathBuf>,
    runner: Arc<R>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOptions {
    pub allow_empty: bool,
    /// `Name <email>`, overriding the configured identity for this commit.
    pub author: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOptions {
    pub force: bool,
    /// Remote branch to push to; the current branch when unset.
    pub target_branch: Option<String>,
    /// Rebase onto the remote branch before pushing.
    pub pull_rebase: bool,
}

// -----------------------------------------------------------------------------
// WorkingTree impl

impl<R: ProcessRunner> WorkingTree<R> {
    pub(crate) fn new(
        dir: PathBuf,
        home: HomeDir,
        remote_url: String,
        env: GitEnv,
        bare_dir: Option<PathBuf>,
        runner: Arc<R>,
    ) -> Self {
        Self {
            dir,
            home,
            remote_url,
            env,
            bare_dir,
            runner,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn home_dir(&self) -> &Path {
        self.home.path()
    }

    pub(crate) fn home(&self) -> &HomeDir {
        &self.home
    }

    /// The remote URL, without any embedded credentials.
    pub fn url(&self) -> &str {
        &self.remote_url
    }

    /// The bare repository this tree is linked to, if any.
    pub fn bare_dir(&self) -> Option<&Path> {
        self.bare_dir.as_deref()
    }

    // -------------------------------------------------------------------------
    // Branches

    #[instrument(skip(self))]
    pub async fn checkout(&self, branch: &str) -> Result<()> {
        self.git(["checkout", branch, "--"]).await?;
        Ok(())
    }

    /// Create `branch` from the current HEAD and switch to it.
    #[instrument(skip(self))]
    pub async fn create_child_branch(&self, branch: &str) -> Result<()> {
        self.git(["checkout", "-b", branch]).await?;
        Ok(())
    }

    /// Switch to a new branch with no history and an empty index.
    #[instrument(skip(self))]
    pub async fn create_orphaned_branch(&self, branch: &str) -> Result<()> {
        self.git(["switch", "--discard-changes", "--orphan", branch])
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_branch(&self, branch: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.git(["branch", flag, branch]).await?;
        Ok(())
    }

    /// Fetch `branch` and check it out at exactly the remote's tip.
    #[instrument(skip(self))]
    pub async fn checkout_remote_branch(&self, branch: &str) -> Result<()> {
        self.fetch_branch(branch).await?;
        let remote_ref = format!("refs/remotes/{}/{}", REMOTE, branch);
        self.git(["checkout", "-B", branch, &remote_ref, "--"]).await?;
        Ok(())
    }

    /// The checked-out branch, or an empty string when HEAD is detached.
    pub async fn current_branch(&self) -> Result<String> {
        Ok(self.git(["branch", "--show-current"]).await?.trim().to_string())
    }

    pub async fn remote_branch_exists(&self, branch: &str) -> Result<bool> {
        let head_ref = format!("refs/heads/{}", branch);
        self.probe(
            Probe::RemoteBranchExists,
            ["ls-remote", "--heads", "--exit-code", REMOTE, &head_ref],
        )
        .await
    }

    pub async fn local_branch_exists(&self, branch: &str) -> Result<bool> {
        let head_ref = format!("refs/heads/{}", branch);
        self.probe(
            Probe::LocalBranchExists,
            ["show-ref", "--verify", "--quiet", &head_ref],
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Content

    pub async fn add_all(&self) -> Result<()> {
        self.git(["add", "--all", "."]).await?;
        Ok(())
    }

    #[instrument(skip(self, message, opts))]
    pub async fn commit(&self, message: &str, opts: &CommitOptions) -> Result<()> {
        let author = opts.author.as_ref().map(|a| format!("--author={}", a));
        let mut args = vec!["commit", "-m", message];
        if opts.allow_empty {
            args.push("--allow-empty");
        }
        if let Some(author) = &author {
            args.push(author);
        }
        self.git(args).await?;
        debug!("committed");
        Ok(())
    }

    pub async fn add_all_and_commit(&self, message: &str) -> Result<()> {
        self.add_all().await?;
        self.commit(message, &CommitOptions::default()).await
    }

    #[instrument(skip(self))]
    pub async fn push(&self, opts: &PushOptions) -> Result<()> {
        let target = match &opts.target_branch {
            Some(branch) => branch.clone(),
            None => self.current_branch().await?,
        };
        if opts.pull_rebase && self.remote_branch_exists(&target).await? {
            self.git(["pull", "--rebase", REMOTE, &target]).await?;
        }
        let refspec = format!("HEAD:refs/heads/{}", target);
        let mut args = vec!["push", REMOTE, refspec.as_str()];
        if opts.force {
            args.push("--force");
        }
        self.git(args).await?;
        debug!(branch = %target, "pushed");
        Ok(())
    }

    pub async fn reset_hard(&self) -> Result<()> {
        self.git(["reset", "--hard"]).await?;
        Ok(())
    }

    /// Remove untracked and ignored files.
    pub async fn clean(&self) -> Result<()> {
        self.git(["clean", "-ffdx"]).await?;
        Ok(())
    }

    pub async fn fetch(&self) -> Result<()> {
        self.git(["fetch", REMOTE]).await?;
        Ok(())
    }

    pub async fn fetch_branch(&self, branch: &str) -> Result<()> {
        let refspec = format!("+refs/heads/{}:refs/remotes/{}/{}", branch, REMOTE, branch);
        self.git(["fetch", REMOTE, &refspec]).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Inspection

    /// Whether the tree has uncommitted changes, untracked files included.
    pub async fn has_diffs(&self) -> Result<bool> {
        Ok(!self.status().await?.is_empty())
    }

    pub async fn status(&self) -> Result<Vec<StatusEntry>> {
        let output = self.git(["status", "-s"]).await?;
        Ok(parse::parse_status(&output)?)
    }

    pub async fn get_diff_paths_for_commit_id(&self, commit_id: &str) -> Result<Vec<String>> {
        let output = self
            .git(["show", "--pretty=format:", "--name-only", commit_id])
            .await?;
        Ok(output
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn refs_have_diffs(&self, a: &str, b: &str) -> Result<bool> {
        self.probe(Probe::RefsHaveDiffs, ["diff", "--quiet", a, b, "--"])
            .await
    }

    /// Whether `parent` is reachable from `child`.
    pub async fn is_ancestor(&self, parent: &str, child: &str) -> Result<bool> {
        self.probe(Probe::IsAncestor, ["merge-base", "--is-ancestor", parent, child])
            .await
    }

    pub async fn last_commit_id(&self) -> Result<String> {
        Ok(self.git(["rev-parse", "HEAD"]).await?.trim().to_string())
    }

    /// Full message of a commit, trailing whitespace removed.
    pub async fn commit_message(&self, id: &str) -> Result<String> {
        Ok(self
            .git(["log", "-1", "--format=%B", id])
            .await?
            .trim_end()
            .to_string())
    }

    /// Commits reachable from HEAD, newest first.  A `limit` of zero means
    /// no limit.
    pub async fn list_commits(&self, limit: usize, skip: usize) -> Result<Vec<CommitMetadata>> {
        let format = format!("--format={}", parse::COMMIT_FORMAT);
        let skip = format!("--skip={}", skip);
        let mut args = vec!["log".to_string(), format, skip];
        if limit > 0 {
            args.push(format!("--max-count={}", limit));
        }
        let output = self.git(args).await?;
        Ok(parse::parse_commits(&output)?)
    }

    /// All tags, newest first by creation date.
    pub async fn list_tags(&self) -> Result<Vec<TagMetadata>> {
        self.git(["fetch", REMOTE, "--tags", "--force"]).await?;
        let format = format!("--format={}", parse::TAG_FORMAT);
        let output = self
            .git([
                "for-each-ref",
                "--sort=-creatordate",
                format.as_str(),
                "refs/tags",
            ])
            .await?;
        Ok(parse::parse_tags(&output)?)
    }

    // -------------------------------------------------------------------------
    // Plumbing

    pub(crate) async fn git<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        cmd::git(&*self.runner, &self.dir, &self.env, args).await
    }

    async fn probe<I, S>(&self, probe: Probe, args: I) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        cmd::probe(&*self.runner, &self.dir, &self.env, probe, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::process::MockProcessRunner;
    use crate::clients::process::ProcessOutput;
    use crate::git::error::GitError;

    fn exited(code: i32, stdout: &str, stderr: &str) -> ProcessOutput {
        ProcessOutput {
            code: Some(code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    fn tree(runner: MockProcessRunner) -> WorkingTree<MockProcessRunner> {
        let home = HomeDir::adopt(Path::new("/tmp/home"));
        let env = GitEnv::base(home.path(), false);
        WorkingTree::new(
            PathBuf::from("/tmp/home/repo"),
            home,
            "https://example.com/r.git".to_string(),
            env,
            None,
            Arc::new(runner),
        )
    }

    fn runner_for(expected_args: &'static [&'static str], output: ProcessOutput) -> MockProcessRunner {
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(move |inv| inv.program == "git" && inv.args == expected_args)
            .times(1)
            .returning(move |_| Ok(output.clone()));
        runner
    }

    #[tokio::test]
    async fn test_remote_branch_exists_exit_codes() {
        let args: &[&str] = &["ls-remote", "--heads", "--exit-code", "origin", "refs/heads/stage"];
        for (code, expected) in [(0, true), (2, false)] {
            let t = tree(runner_for(args, exited(code, "", "")));
            assert_eq!(t.remote_branch_exists("stage").await.unwrap(), expected);
        }
        let t = tree(runner_for(args, exited(128, "", "fatal: could not read from remote")));
        let err = t.remote_branch_exists("stage").await.unwrap_err();
        assert!(err.downcast_ref::<GitError>().is_some());
        assert!(err.to_string().contains("git ls-remote"));
    }

    #[tokio::test]
    async fn test_local_branch_exists_exit_codes() {
        let args: &[&str] = &["show-ref", "--verify", "--quiet", "refs/heads/stage"];
        for (code, expected) in [(0, true), (1, false)] {
            let t = tree(runner_for(args, exited(code, "", "")));
            assert_eq!(t.local_branch_exists("stage").await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_is_ancestor_exit_codes() {
        let args: &[&str] = &["merge-base", "--is-ancestor", "a", "b"];
        for (code, expected) in [(0, true), (1, false)] {
            let t = tree(runner_for(args, exited(code, "", "")));
            assert_eq!(t.is_ancestor("a", "b").await.unwrap(), expected);
        }
        let t = tree(runner_for(args, exited(128, "", "fatal: Not a valid commit name a")));
        assert!(t.is_ancestor("a", "b").await.is_err());
    }

    #[tokio::test]
    async fn test_refs_have_diffs_exit_codes() {
        let args: &[&str] = &["diff", "--quiet", "a", "b", "--"];
        for (code, expected) in [(0, false), (1, true)] {
            let t = tree(runner_for(args, exited(code, "", "")));
            assert_eq!(t.refs_have_diffs("a", "b").await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_has_diffs_reads_short_status() {
        let t = tree(runner_for(&["status", "-s"], exited(0, " M values.yaml\n", "")));
        assert!(t.has_diffs().await.unwrap());

        let t = tree(runner_for(&["status", "-s"], exited(0, "", "")));
        assert!(!t.has_diffs().await.unwrap());
    }

    #[tokio::test]
    async fn test_push_rejection_is_classified() {
        let t = tree(runner_for(
            &["push", "origin", "HEAD:refs/heads/main"],
            exited(
                1,
                "",
                " ! [rejected]        HEAD -> main (non-fast-forward)\nerror: failed to push some refs\n",
            ),
        ));
        let err = t
            .push(&PushOptions {
                target_branch: Some("main".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(crate::git::error::is_retryable(&err));
    }

    #[tokio::test]
    async fn test_push_defaults_to_current_branch() {
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|inv| inv.args == ["branch", "--show-current"])
            .times(1)
            .returning(|_| Ok(exited(0, "env/prod\n", "")));
        runner
            .expect_run()
            .withf(|inv| inv.args == ["push", "origin", "HEAD:refs/heads/env/prod", "--force"])
            .times(1)
            .returning(|_| Ok(exited(0, "", "")));

        tree(runner)
            .push(&PushOptions {
                force: true,
                ..Default::default()
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_commit_passes_options() {
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|inv| {
                inv.args
                    == [
                        "commit",
                        "-m",
                        "bump",
                        "--allow-empty",
                        "--author=Bot <bot@example.com>",
                    ]
            })
            .times(1)
            .returning(|_| Ok(exited(0, "", "")));

        tree(runner)
            .commit(
                "bump",
                &CommitOptions {
                    allow_empty: true,
                    author: Some("Bot <bot@example.com>".to_string()),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invocations_use_tree_dir_and_env() {
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|inv| {
                inv.dir == Path::new("/tmp/home/repo")
                    && inv.env.contains(&("HOME".to_string(), "/tmp/home".to_string()))
            })
            .times(1)
            .returning(|_| Ok(exited(0, "abc\n", "")));

        assert_eq!(tree(runner).last_commit_id().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_clean_removes_untracked_and_ignored() {
        let t = tree(runner_for(&["clean", "-ffdx"], exited(0, "Removing stray.txt\n", "")));
        t.clean().await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_updates_all_remote_branches() {
        let t = tree(runner_for(&["fetch", "origin"], exited(0, "", "")));
        t.fetch().await.unwrap();

        let t = tree(runner_for(
            &["fetch", "origin"],
            exited(128, "", "fatal: unable to access remote\n"),
        ));
        let err = t.fetch().await.unwrap_err();
        assert!(err.to_string().contains("git fetch origin"));
    }

    #[tokio::test]
    async fn test_list_commits_surfaces_parse_errors() {
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(exited(0, "abc\tnot-enough-fields\n", "")));

        let err = tree(runner).list_commits(10, 0).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GitError>(),
            Some(GitError::Parse { .. })
        ));
    }
}
