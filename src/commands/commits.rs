use anyhow::Result;
use colored::Colorize;

use crate::App;
use crate::git::repo::CloneOptions;

impl App {
    /// Print the commit log of `branch` (the remote's default branch when
    /// unset), newest first.
    pub async fn cmd_commits(
        &self,
        url: &str,
        branch: Option<&str>,
        limit: usize,
        skip: usize,
        stdout: &mut impl std::io::Write,
    ) -> Result<()> {
        let opts = CloneOptions {
            branch: branch.map(str::to_string),
            single_branch: branch.is_some(),
            ..Default::default()
        };
        let repo = self.clone_repo(url, &opts).await?;
        let commits = repo.list_commits(limit, skip).await;
        self.discard_repo(repo).await;

        for commit in commits? {
            writeln!(
                stdout,
                "{} {} {} {}",
                commit.id.yellow(),
                commit.commit_date.format("%Y-%m-%dT%H:%M:%SZ"),
                commit.author.dimmed(),
                commit.subject
            )?;
        }
        Ok(())
    }
}
