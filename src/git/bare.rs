use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use log::warn;
use tracing::info;
use tracing::instrument;

use crate::clients::process::ProcessRunner;
use crate::clients::process::SystemRunner;
use crate::git::auth;
use crate::git::auth::AuthOptions;
use crate::git::auth::GitEnv;
use crate::git::cmd;
use crate::git::exit::Probe;
use crate::git::home::HomeDir;
use crate::git::parse;
use crate::git::repo::CloneOptions;
use crate::git::worktree::WorkingTree;

/// Directory name of the bare clone inside its home directory.
pub const BARE_DIR_NAME: &str = "repo.git";

// -----------------------------------------------------------------------------
// Types

/// A bare clone of a remote, with any number of linked working trees.
///
/// Sibling trees share the object store.  Remove every tree before closing
/// the repository.
#[derive(Debug)]
pub struct BareRepository<R = SystemRunner> {
    remote_url: String,
    home: HomeDir,
    bare_dir: PathBuf,
    env: GitEnv,
    runner: Arc<R>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkTreeOptions {
    /// Create the tree on a new branch with no history, named by the ref.
    pub orphan: bool,
}

// -----------------------------------------------------------------------------
// BareRepository impl

impl BareRepository<SystemRunner> {
    pub async fn clone_bare(url: &str, auth: &AuthOptions, opts: &CloneOptions) -> Result<Self> {
        Self::clone_bare_with(Arc::new(SystemRunner), url, auth, opts).await
    }

    pub async fn load(path: &Path, auth: &AuthOptions) -> Result<Self> {
        Self::load_with(Arc::new(SystemRunner), path, auth).await
    }
}

impl<R: ProcessRunner> BareRepository<R> {
    /// Clone `url` into a new home directory.
    ///
    /// On failure nothing is left behind.
    #[instrument(skip(runner, auth, opts))]
    pub async fn clone_bare_with(
        runner: Arc<R>,
        url: &str,
        auth: &AuthOptions,
        opts: &CloneOptions,
    ) -> Result<Self> {
        let home = HomeDir::create()?;
        match Self::clone_into(runner, home.clone(), url, auth, opts).await {
            Ok(repo) => {
                info!(dir = %repo.bare_dir.display(), "cloned bare repository");
                Ok(repo)
            }
            Err(e) => {
                if let Err(cleanup) = home.remove().await {
                    warn!("Failed to clean up after failed clone: {:#}", cleanup);
                }
                Err(e)
            }
        }
    }

    async fn clone_into(
        runner: Arc<R>,
        home: HomeDir,
        url: &str,
        auth: &AuthOptions,
        opts: &CloneOptions,
    ) -> Result<Self> {
        let env = auth::configure(&*runner, home.path(), url, auth).await?;
        let bare_dir = home.path().join(BARE_DIR_NAME);
        let mut args = vec!["clone".to_string(), "--bare".to_string()];
        args.extend(opts.args());
        args.push(env.access_url.clone());
        args.push(bare_dir.display().to_string());
        cmd::git(&*runner, home.path(), &env, args).await?;
        cmd::git(
            &*runner,
            &bare_dir,
            &env,
            [
                "config",
                "remote.origin.fetch",
                "+refs/heads/*:refs/remotes/origin/*",
            ],
        )
        .await?;
        Ok(Self {
            remote_url: url.to_string(),
            home,
            bare_dir,
            env,
            runner,
        })
    }

    /// Adopt a bare clone previously created by [`clone_bare`](Self::clone_bare).
    ///
    /// The home directory is the clone's parent, and the URL is read back from
    /// the clone's configuration.
    #[instrument(skip(runner, auth), fields(path = %path.display()))]
    pub async fn load_with(runner: Arc<R>, path: &Path, auth: &AuthOptions) -> Result<Self> {
        let bare_dir = path
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", path.display()))?;
        let home_path = bare_dir
            .parent()
            .with_context(|| format!("{} has no parent directory", bare_dir.display()))?;
        let home = HomeDir::adopt(home_path);

        let base = GitEnv::base(home.path(), auth.insecure_skip_tls_verify);
        let url = cmd::git(
            &*runner,
            &bare_dir,
            &base,
            ["config", "--get", "remote.origin.url"],
        )
        .await?;
        let url = auth::strip_userinfo(url.trim());

        let env = auth::configure(&*runner, home.path(), &url, auth).await?;
        cmd::git(
            &*runner,
            &bare_dir,
            &env,
            ["config", "remote.origin.url", env.access_url.as_str()],
        )
        .await?;

        Ok(Self {
            remote_url: url,
            home,
            bare_dir,
            env,
            runner,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.bare_dir
    }

    pub fn home_dir(&self) -> &Path {
        self.home.path()
    }

    pub fn url(&self) -> &str {
        &self.remote_url
    }

    /// Create a working tree at `path`, checked out at `git_ref`.
    ///
    /// With `orphan`, `git_ref` names a new branch with no history instead.
    /// Fails if a tree is already registered at the same resolved path.
    #[instrument(skip(self, opts), fields(path = %path.display()))]
    pub async fn add_work_tree(
        &self,
        path: &Path,
        git_ref: &str,
        opts: &WorkTreeOptions,
    ) -> Result<WorkingTree<R>> {
        let path = normalize_path(path)?;
        if self.work_trees().await?.iter().any(|t| t.dir() == path) {
            bail!("Working tree already exists at {}", path.display());
        }
        let target = path.display().to_string();

        if !opts.orphan {
            self.git(["worktree", "add", target.as_str(), git_ref]).await?;
        } else if self.has_commits().await? {
            self.git(["worktree", "add", "--detach", "--no-checkout", target.as_str()])
                .await?;
        } else {
            self.git(["worktree", "add", "--orphan", "-b", git_ref, target.as_str()])
                .await?;
        }

        let tree = self.tree_at(path);
        if opts.orphan && tree.current_branch().await? != git_ref {
            tree.create_orphaned_branch(git_ref).await?;
        }
        info!(git_ref, "added working tree");
        Ok(tree)
    }

    /// Detach the tree at `path` and delete its directory.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn remove_work_tree(&self, path: &Path) -> Result<()> {
        let path = normalize_path(path)?;
        if !self.work_trees().await?.iter().any(|t| t.dir() == path) {
            bail!("No working tree registered at {}", path.display());
        }
        let target = path.display().to_string();
        self.git(["worktree", "remove", "--force", target.as_str()])
            .await?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
            }
        }
        info!("removed working tree");
        Ok(())
    }

    /// Trees currently registered with git, excluding the bare repository
    /// itself.
    pub async fn work_trees(&self) -> Result<Vec<WorkingTree<R>>> {
        let output = self.git(["worktree", "list", "--porcelain"]).await?;
        Ok(parse::parse_worktrees(&output)
            .into_iter()
            .map(|entry| {
                let dir = normalize_path(&entry.path).unwrap_or(entry.path);
                self.tree_at(dir)
            })
            .collect())
    }

    /// Delete the home directory.  Fails while any tree is still registered.
    #[instrument(skip(self), fields(home = %self.home.path().display()))]
    pub async fn close(&self) -> Result<()> {
        let trees = self.work_trees().await?;
        if !trees.is_empty() {
            bail!(
                "Cannot close repository with {} working tree(s) still registered",
                trees.len()
            );
        }
        self.home.remove().await
    }

    fn tree_at(&self, dir: PathBuf) -> WorkingTree<R> {
        WorkingTree::new(
            dir,
            self.home.clone(),
            self.remote_url.clone(),
            self.env.clone(),
            Some(self.bare_dir.clone()),
            self.runner.clone(),
        )
    }

    async fn has_commits(&self) -> Result<bool> {
        cmd::probe(
            &*self.runner,
            &self.bare_dir,
            &self.env,
            Probe::CommitExists,
            ["rev-parse", "--verify", "--quiet", "HEAD^{commit}"],
        )
        .await
    }

    async fn git<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        cmd::git(&*self.runner, &self.bare_dir, &self.env, args).await
    }
}

/// Absolute, symlink-resolved form of `path`.  The final component need not
/// exist yet.
pub(crate) fn normalize_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("Failed to read current directory")?
            .join(path)
    };
    if let Ok(resolved) = absolute.canonicalize() {
        return Ok(resolved);
    }
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(parent) => Ok(parent.join(name)),
            Err(_) => Ok(absolute),
        },
        _ => Ok(absolute),
    }
}
