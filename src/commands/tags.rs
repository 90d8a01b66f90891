use anyhow::Result;
use colored::Colorize;

use crate::App;
use crate::git::repo::CloneOptions;

impl App {
    /// Print the remote's tags, newest first.
    ///
    /// Only history is needed, so the clone is shallow and skips file
    /// contents.
    pub async fn cmd_tags(&self, url: &str, stdout: &mut impl std::io::Write) -> Result<()> {
        let opts = CloneOptions {
            depth: Some(1),
            filter: Some("blob:none".to_string()),
            ..Default::default()
        };
        let repo = self.clone_repo(url, &opts).await?;
        let tags = repo.list_tags().await;
        self.discard_repo(repo).await;

        for tag in tags? {
            writeln!(
                stdout,
                "{} {} {} {}",
                tag.tag.cyan(),
                tag.commit_id.yellow(),
                tag.creator_date.format("%Y-%m-%dT%H:%M:%SZ"),
                tag.subject
            )?;
        }
        Ok(())
    }
}
