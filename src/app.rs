use anyhow::Result;
use log::warn;

use crate::config::Config;
use crate::git::auth::AuthOptions;
use crate::git::auth::RepoCredentials;
use crate::git::repo::CloneOptions;
use crate::git::repo::Repo;
use crate::promotion::BranchLocks;

pub struct App {
    pub config: Config,
    pub credentials: Option<RepoCredentials>,
    pub locks: BranchLocks,
}

impl App {
    pub fn new(config: Config, credentials: Option<RepoCredentials>) -> Self {
        Self {
            config,
            credentials,
            locks: BranchLocks::new(),
        }
    }

    pub(crate) fn auth_options(&self) -> AuthOptions {
        self.config.auth_options(self.credentials.clone())
    }

    pub(crate) async fn clone_repo(&self, url: &str, opts: &CloneOptions) -> Result<Repo> {
        Repo::clone(url, &self.auth_options(), opts).await
    }

    /// Delete a clone made by [`clone_repo`](Self::clone_repo).  Failure
    /// only leaks a temp directory, so it is logged rather than returned.
    pub(crate) async fn discard_repo(&self, repo: Repo) {
        if let Err(e) = repo.close().await {
            warn!("Failed to remove clone: {:#}", e);
        }
    }
}
