use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pr_reviewer::config::Config;
use pr_reviewer::state::LintError;

#[derive(Parser)]
#[command(name = "pr-ai-backend", about = "LLM-assisted pull request review")]
struct Cli {
    /// Path to a JSON config file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Review one PR in a local repository and print the report.
    Review {
        /// Repository checkout to review.
        #[arg(long)]
        repo: PathBuf,
        /// Base ref (e.g. main).
        #[arg(long)]
        base: String,
        /// Head ref to check out and review.
        #[arg(long, default_value = "HEAD")]
        head: String,
        /// Optional JSON file with linter findings.
        #[arg(long)]
        lint: Option<PathBuf>,
        /// Build the repo-map asset before reviewing.
        #[arg(long)]
        build_repo_map: bool,
    },
    /// Serve the PR webhook.
    Serve,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Load environment variables from .env file, if present.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Review {
            repo,
            base,
            head,
            lint,
            build_repo_map,
        } => {
            let lint_errors: Vec<LintError> = match lint {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => Vec::new(),
            };

            if build_repo_map {
                let map = pr_reviewer::assets::build_repo_map(&repo);
                let store = pr_reviewer::assets::AssetStore::new(&config.system.assets_dir);
                let key = config.system.asset_key.as_deref().unwrap_or("repo_map");
                store.save("assets", key, &serde_json::to_value(&map)?)?;
                info!(files = map.file_count, "repo map asset built");
            }

            let state = pr_reviewer::run_review(&repo, &base, &head, config, lint_errors).await?;
            info!(
                confirmed = state.confirmed_issues.len(),
                "review finished"
            );
            println!("{}", state.final_report);
        }
        Command::Serve => {
            let settings = api::ApiSettings::from_env().map_err(std::io::Error::other)?;
            api::start(settings, config).await?;
        }
    }

    Ok(())
}
