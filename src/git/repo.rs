use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use log::warn;
use tracing::info;
use tracing::instrument;

use crate::clients::process::ProcessRunner;
use crate::clients::process::SystemRunner;
use crate::git::auth;
use crate::git::auth::AuthOptions;
use crate::git::auth::GitEnv;
use crate::git::cmd;
use crate::git::home::HomeDir;
use crate::git::worktree::WorkingTree;

/// Directory name of the checkout inside its home directory.
pub const REPO_DIR_NAME: &str = "repo";

/// A standalone (non-bare) clone with exactly one working tree.
#[derive(Debug)]
pub struct Repo<R = SystemRunner> {
    tree: WorkingTree<R>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneOptions {
    /// Branch to check out instead of the remote's default.
    pub branch: Option<String>,
    pub single_branch: bool,
    /// Shallow clone depth.
    pub depth: Option<u32>,
    /// Partial clone filter, e.g. `blob:none`.
    pub filter: Option<String>,
}

impl CloneOptions {
    pub(crate) fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(branch) = &self.branch {
            args.push("--branch".to_string());
            args.push(branch.clone());
        }
        if self.single_branch {
            args.push("--single-branch".to_string());
        } else if self.depth.is_some() {
            // --depth implies --single-branch unless told otherwise.
            args.push("--no-single-branch".to_string());
        }
        if let Some(depth) = self.depth {
            args.push(format!("--depth={}", depth));
        }
        if let Some(filter) = &self.filter {
            args.push(format!("--filter={}", filter));
        }
        args
    }
}

impl Repo<SystemRunner> {
    pub async fn clone(url: &str, auth: &AuthOptions, opts: &CloneOptions) -> Result<Self> {
        Self::clone_with(Arc::new(SystemRunner), url, auth, opts).await
    }

    pub async fn load(path: &Path, auth: &AuthOptions) -> Result<Self> {
        Self::load_with(Arc::new(SystemRunner), path, auth).await
    }
}

impl<R: ProcessRunner> Repo<R> {
    #[instrument(skip(runner, auth, opts))]
    pub async fn clone_with(
        runner: Arc<R>,
        url: &str,
        auth: &AuthOptions,
        opts: &CloneOptions,
    ) -> Result<Self> {
        let home = HomeDir::create()?;
        match Self::clone_into(runner, home.clone(), url, auth, opts).await {
            Ok(repo) => {
                info!(dir = %repo.tree.dir().display(), "cloned repository");
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
        let dir = home.path().join(REPO_DIR_NAME);
        let mut args = vec!["clone".to_string()];
        args.extend(opts.args());
        args.push(env.access_url.clone());
        args.push(dir.display().to_string());
        cmd::git(&*runner, home.path(), &env, args).await?;
        Ok(Self {
            tree: WorkingTree::new(dir, home, url.to_string(), env, None, runner),
        })
    }

    /// Adopt a checkout previously created by [`clone`](Self::clone).
    #[instrument(skip(runner, auth), fields(path = %path.display()))]
    pub async fn load_with(runner: Arc<R>, path: &Path, auth: &AuthOptions) -> Result<Self> {
        let dir = path
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", path.display()))?;
        let home_path = dir
            .parent()
            .with_context(|| format!("{} has no parent directory", dir.display()))?;
        let home = HomeDir::adopt(home_path);

        let base = GitEnv::base(home.path(), auth.insecure_skip_tls_verify);
        let url = cmd::git(&*runner, &dir, &base, ["config", "--get", "remote.origin.url"]).await?;
        let url = auth::strip_userinfo(url.trim());

        let env = auth::configure(&*runner, home.path(), &url, auth).await?;
        cmd::git(
            &*runner,
            &dir,
            &env,
            ["config", "remote.origin.url", env.access_url.as_str()],
        )
        .await?;

        Ok(Self {
            tree: WorkingTree::new(dir, home, url, env, None, runner),
        })
    }

    /// Delete the home directory, checkout included.
    pub async fn close(self) -> Result<()> {
        self.tree.home().remove().await
    }
}

impl<R> Deref for Repo<R> {
    type Target = WorkingTree<R>;

    fn deref(&self) -> &Self::Target {
        &self.tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_args() {
        assert!(CloneOptions::default().args().is_empty());

        let opts = CloneOptions {
            branch: Some("env/prod".to_string()),
            single_branch: true,
            depth: Some(1),
            filter: Some("blob:none".to_string()),
        };
        assert_eq!(
            opts.args(),
            [
                "--branch",
                "env/prod",
                "--single-branch",
                "--depth=1",
                "--filter=blob:none"
            ]
        );
    }

    #[test]
    fn test_shallow_clone_keeps_all_branches_unless_asked() {
        let opts = CloneOptions {
            depth: Some(5),
            ..Default::default()
        };
        assert_eq!(opts.args(), ["--no-single-branch", "--depth=5"]);
    }
}
