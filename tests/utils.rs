#![allow(dead_code)]

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer as _;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

pub const AUTHOR_NAME: &str = "Test User";
pub const AUTHOR_EMAIL: &str = "test@example.com";
pub const INITIAL_DATE: &str = "2024-01-01T00:00:00Z";

/// Runs git in `dir` with a fixed identity and no host configuration, and
/// returns trimmed stdout.
pub async fn git(dir: &Path, args: &[&str]) -> anyhow::Result<String> {
    git_at(dir, args, INITIAL_DATE).await
}

/// Like [`git`], with author, committer and tagger dates set to `date`.
pub async fn git_at(dir: &Path, args: &[&str], date: &str) -> anyhow::Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_AUTHOR_NAME", AUTHOR_NAME)
        .env("GIT_AUTHOR_EMAIL", AUTHOR_EMAIL)
        .env("GIT_COMMITTER_NAME", AUTHOR_NAME)
        .env("GIT_COMMITTER_EMAIL", AUTHOR_EMAIL)
        .env("GIT_AUTHOR_DATE", date)
        .env("GIT_COMMITTER_DATE", date)
        .stdin(Stdio::null())
        .output()
        .await?;
    anyhow::ensure!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(String::from_utf8(output.stdout)?.trim().to_string())
}

/// A bare "remote" repository plus a seed checkout used to push to it.
pub struct Remote {
    pub bare: PathBuf,
    pub seed: PathBuf,
}

impl Remote {
    /// Creates `<dir>/remote.git` with a `master` branch holding one commit
    /// that adds `README.md`.
    pub async fn create(dir: &Path) -> anyhow::Result<Self> {
        let bare = dir.join("remote.git");
        let seed = dir.join("seed");
        tokio::fs::create_dir_all(&bare).await?;
        tokio::fs::create_dir_all(&seed).await?;

        git(&bare, &["init", "--bare", "--initial-branch=master"]).await?;
        git(&seed, &["init", "--initial-branch=master"]).await?;
        git(&seed, &["remote", "add", "origin", &bare.display().to_string()]).await?;
        tokio::fs::write(seed.join("README.md"), "hello\n").await?;
        git(&seed, &["add", "README.md"]).await?;
        git(&seed, &["commit", "-m", "Initial commit"]).await?;
        git(&seed, &["push", "origin", "master"]).await?;

        Ok(Self { bare, seed })
    }

    pub fn url(&self) -> String {
        self.bare.display().to_string()
    }

    /// Commit ID of `branch` in the remote.
    pub async fn rev_parse(&self, branch: &str) -> anyhow::Result<String> {
        git(&self.bare, &["rev-parse", &format!("refs/heads/{}", branch)]).await
    }

    /// Number of commits reachable from `branch` in the remote.
    pub async fn commit_count(&self, branch: &str) -> anyhow::Result<usize> {
        let count = git(
            &self.bare,
            &["rev-list", "--count", &format!("refs/heads/{}", branch)],
        )
        .await?;
        Ok(count.parse()?)
    }

    /// Contents of `path` on `branch` in the remote.
    pub async fn show(&self, branch: &str, path: &str) -> anyhow::Result<String> {
        git(&self.bare, &["show", &format!("refs/heads/{}:{}", branch, path)]).await
    }

    /// Sorted file list of `branch` in the remote.
    pub async fn ls_tree(&self, branch: &str) -> anyhow::Result<Vec<String>> {
        let listing = git(
            &self.bare,
            &["ls-tree", "-r", "--name-only", &format!("refs/heads/{}", branch)],
        )
        .await?;
        let mut files: Vec<String> = listing.lines().map(str::to_string).collect();
        files.sort();
        Ok(files)
    }

    /// Pushes an orphan `branch` holding a single file from the seed checkout.
    pub async fn push_orphan_branch(
        &self,
        branch: &str,
        file: &str,
        contents: &str,
    ) -> anyhow::Result<()> {
        git(&self.seed, &["switch", "--orphan", branch]).await?;
        tokio::fs::write(self.seed.join(file), contents).await?;
        git(&self.seed, &["add", file]).await?;
        git(&self.seed, &["commit", "-m", &format!("Seed {}", branch)]).await?;
        git(&self.seed, &["push", "origin", branch]).await?;
        git(&self.seed, &["switch", "--discard-changes", "master"]).await?;
        Ok(())
    }
}

pub fn setup_logging() -> anyhow::Result<()> {
    let timer = tracing_subscriber::fmt::time::ChronoLocal::new("%H:%M:%S%.3f".into());
    let format = tracing_subscriber::fmt::format().with_timer(timer);
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;
    let subscriber = tracing_subscriber::fmt::layer()
        .event_format(format)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_test_writer()
        .with_filter(filter);
    tracing_subscriber::registry().with(subscriber).init();
    Ok(())
}

pub enum TestDir {
    Temp(tempfile::TempDir),
    Kept(std::path::PathBuf),
}

impl TestDir {
    pub fn new() -> std::io::Result<Self> {
        let temp_dir = tempfile::tempdir()?;

        if std::env::var("DEBUG_TESTS").is_ok() {
            let path = temp_dir.keep();
            eprintln!("Test directory kept at: {}", path.display());
            Ok(TestDir::Kept(path))
        } else {
            Ok(TestDir::Temp(temp_dir))
        }
    }

    pub fn path(&self) -> &std::path::Path {
        match self {
            TestDir::Temp(t) => t.path(),
            TestDir::Kept(p) => p.as_path(),
        }
    }
}
