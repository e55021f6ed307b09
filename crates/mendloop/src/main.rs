//! mendloop CLI
//!
//! ```bash
//! # Repair a Maven project in place, committing every accepted iteration
//! mendloop run --repo ./project --config mendloop.toml
//!
//! # Measure the baseline only: build once and print the diagnostics
//! mendloop run --repo ./project --dry-run
//!
//! # Run the extractor over a saved build log
//! mendloop extract --tool maven --log build.log --exit-code 1
//! ```

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use coordination::{BuildRunner, BuildToolRegistry, ChangePolicy, CommandRunner, ProcessOutput};
use mendloop::{Collaborators, MendConfig, RepairSession};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a repair session against a working copy
    Run {
        /// Git working copy of the project to repair
        #[arg(long)]
        repo: PathBuf,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Iteration budget (overrides MENDLOOP_MAX_ITERATIONS)
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Change policy: no-material-change, non-increasing or decreasing
        #[arg(long)]
        policy: Option<ChangePolicy>,

        /// Build tool name (overrides MENDLOOP_BUILD_TOOL)
        #[arg(long)]
        build_tool: Option<String>,

        /// Build once and print the baseline diagnostics without changing anything
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Extract diagnostics from a saved build log
    Extract {
        #[arg(long, default_value = "maven")]
        tool: String,

        /// Captured stdout of the build
        #[arg(long)]
        log: PathBuf,

        /// Captured stderr of the build
        #[arg(long)]
        stderr: Option<PathBuf>,

        #[arg(long, default_value_t = 1)]
        exit_code: i32,

        /// Project root used to resolve descriptors and snippets
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Run {
            repo,
            config,
            max_iterations,
            policy,
            build_tool,
            dry_run,
        } => {
            let mut config = MendConfig::load(config.as_deref())?;
            if let Some(max_iterations) = max_iterations {
                config.session.max_iterations = max_iterations;
            }
            if let Some(policy) = policy {
                config.build.policy = policy;
            }
            if let Some(tool) = build_tool {
                config.build.tool = tool;
            }
            config.validate()?;

            let repo = repo
                .canonicalize()
                .with_context(|| format!("Working copy not found: {}", repo.display()))?;
            if dry_run {
                return measure_baseline(&repo, &config).await;
            }

            info!(
                repo = %repo.display(),
                tool = %config.build.tool,
                policy = %config.build.policy,
                model = %config.model.model,
                "Starting repair session"
            );
            let collaborators = Collaborators::production(&repo, &config)?;
            let report = RepairSession::new(&repo, config, collaborators)?.run().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Extract {
            tool,
            log,
            stderr,
            exit_code,
            root,
        } => {
            let stdout = std::fs::read_to_string(&log)
                .with_context(|| format!("Failed to read {}", log.display()))?;
            let stderr = match stderr {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => String::new(),
            };
            let tool = BuildToolRegistry::new().create(&tool, &root)?;
            let observations = tool.extract(&ProcessOutput::new(stdout, stderr, Some(exit_code)))?;
            println!("{}", serde_json::to_string_pretty(&observations)?);
            Ok(())
        }
    }
}

async fn measure_baseline(repo: &std::path::Path, config: &MendConfig) -> Result<()> {
    let tool = BuildToolRegistry::new().create(&config.build.tool, repo)?;
    let command = config
        .build
        .command
        .clone()
        .unwrap_or_else(|| tool.default_build_command().to_string());
    let runner = CommandRunner::new(command, repo, config.build.runner.clone());
    info!(command = runner.command(), "Measuring baseline");

    let output = runner.run().await?;
    let diagnostics = tool.extract(&output)?;
    let summary = serde_json::json!({
        "tool": tool.name(),
        "command": runner.command(),
        "exit_code": output.exit_code,
        "errors": diagnostics.len(),
        "diagnostics": diagnostics,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
