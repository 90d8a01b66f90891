use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use clap::Subcommand;
use gitpromote::App;
use gitpromote::Config;
use gitpromote::clients::github::GithubClient;
use gitpromote::commands::promote::PromoteArgs;
use gitpromote::config;
use gitpromote::promotion::FileUpdate;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Parser)]
#[command(name = "gitpromote")]
#[command(about = "Promote changes into GitOps repositories, directly or through pull requests", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the repository's tags, newest first
    Tags {
        /// Repository URL
        url: String,
    },
    /// List commits, newest first
    Commits {
        /// Repository URL
        url: String,
        /// Branch to list (defaults to the remote's default branch)
        #[arg(short, long)]
        branch: Option<String>,
        /// Maximum number of commits to show (0 for all)
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// Number of commits to skip
        #[arg(short, long, default_value_t = 0)]
        skip: usize,
    },
    /// Write files to a branch and push
    Promote {
        /// Repository URL
        url: String,
        /// Branch receiving the commit
        #[arg(short, long)]
        write_branch: String,
        /// Ref to read from (defaults to the remote's default branch)
        #[arg(short, long)]
        read_ref: Option<String>,
        /// PATH=FILE: write the contents of local FILE to PATH in the repository
        #[arg(long = "set", value_name = "PATH=FILE", required = true)]
        set: Vec<String>,
        /// Open a pull request against the write branch instead of pushing to it
        #[arg(long, requires = "state")]
        pull_request: bool,
        /// JSON file holding pull request progress between runs
        #[arg(long, requires = "pull_request")]
        state: Option<PathBuf>,
        /// Stage name used in the pull request branch
        #[arg(long, default_value = "default")]
        stage: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging()?;

    let cli = Cli::parse();
    let app = App::new(Config::from_env()?, config::credentials_from_env()?);
    let stdout = &mut std::io::stdout();

    match cli.command {
        Commands::Tags { url } => app.cmd_tags(&url, stdout).await?,
        Commands::Commits {
            url,
            branch,
            limit,
            skip,
        } => {
            app.cmd_commits(&url, branch.as_deref(), limit, skip, stdout)
                .await?
        }
        Commands::Promote {
            url,
            write_branch,
            read_ref,
            set,
            pull_request,
            state,
            stage,
        } => {
            let args = PromoteArgs {
                write_branch,
                read_ref,
                files: read_file_updates(&set)?,
            };
            match (pull_request, state) {
                (true, Some(state)) => {
                    let provider = GithubClient::new(config::github_token_from_env()?);
                    app.cmd_promote_pull_request(&provider, &url, &args, &stage, &state, stdout)
                        .await?;
                }
                (false, None) => {
                    app.cmd_promote(&url, &args, stdout).await?;
                }
                _ => bail!("--pull-request and --state must be given together"),
            }
        }
    }

    Ok(())
}

/// Parse `PATH=FILE` pairs and read each FILE.
fn read_file_updates(pairs: &[String]) -> Result<Vec<FileUpdate>> {
    pairs
        .iter()
        .map(|pair| {
            let (path, file) = pair
                .split_once('=')
                .with_context(|| format!("Expected PATH=FILE, got {:?}", pair))?;
            let contents =
                std::fs::read(file).with_context(|| format!("Failed to read {}", file))?;
            Ok(FileUpdate {
                path: path.to_string(),
                contents,
            })
        })
        .collect()
}

fn setup_logging() -> Result<()> {
    let timer = tracing_subscriber::fmt::time::ChronoLocal::new("%H:%M:%S%.3f".into());
    let format = tracing_subscriber::fmt::format().with_timer(timer);
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;
    let subscriber = tracing_subscriber::fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr)
        .with_filter(filter);
    tracing_subscriber::registry().with(subscriber).init();
    Ok(())
}
