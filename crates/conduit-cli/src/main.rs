use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use conduit_client::ProviderDefinition;
use conduit_core::{
    CallOptions, DiscoveryMode, ErrorSummary, ManagerConfig, ProviderId, Request, Resolved,
    SourceManager,
};

#[derive(Parser)]
#[command(name = "conduit", version, about = "Resilient multi-provider lookups")]
struct Cli {
    /// JSON file listing provider definitions
    #[arg(long, global = true, env = "CONDUIT_PROVIDERS", default_value = "providers.json")]
    providers: PathBuf,

    /// Overall deadline for one command, in seconds
    #[arg(long, global = true, env = "CONDUIT_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search across providers
    Search {
        query: String,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[command(flatten)]
        target: Target,
    },

    /// List the items under a parent id
    Items {
        parent_id: String,

        #[command(flatten)]
        target: Target,
    },

    /// List the sub-items of an entry
    SubItems {
        entry_id: String,

        #[command(flatten)]
        target: Target,
    },

    /// Probe every provider, then print the health snapshot
    Health,

    /// Print the priority order and reliability ranks.
    ///
    /// The graph lives in memory, so a fresh process reports uniform ranks.
    Ranks,
}

#[derive(clap::Args)]
struct Target {
    /// Query every capable provider and merge the answers
    #[arg(long, conflicts_with = "provider")]
    broad: bool,

    /// Ask this provider only, without fallback
    #[arg(short, long)]
    provider: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("conduit=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let manager = build_manager(&cli.providers, cli.timeout_secs)?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    let options = CallOptions::with_timeout(Duration::from_secs(cli.timeout_secs))
        .with_cancel(cancel);

    match cli.command {
        Commands::Search {
            query,
            page,
            target,
        } => cmd_lookup(&manager, Request::search(query, page), &target, &options).await,
        Commands::Items { parent_id, target } => {
            cmd_lookup(&manager, Request::list_items(parent_id), &target, &options).await
        }
        Commands::SubItems { entry_id, target } => {
            cmd_lookup(&manager, Request::list_sub_items(entry_id), &target, &options).await
        }
        Commands::Health => cmd_health(&manager, &options).await,
        Commands::Ranks => cmd_ranks(&manager),
    }
}

fn build_manager(path: &Path, timeout_secs: u64) -> Result<SourceManager> {
    let definitions = ProviderDefinition::load(path)
        .with_context(|| format!("Failed to load provider definitions: {}", path.display()))?;
    let config = ManagerConfig::from_env().context("Invalid CONDUIT_* configuration")?;

    let mut builder = SourceManager::builder().with_config(config);
    for definition in definitions {
        let id = definition.id().to_string();
        let connector = definition
            .into_connector(Duration::from_secs(timeout_secs))
            .with_context(|| format!("Invalid provider definition '{id}'"))?;
        builder = builder.register_arc(connector);
    }
    builder.build().context("Failed to register providers")
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Interrupted, cancelling outstanding calls");
        cancel.cancel();
    }
}

async fn cmd_lookup(
    manager: &SourceManager,
    request: Request,
    target: &Target,
    options: &CallOptions,
) -> Result<()> {
    let result = match &target.provider {
        Some(id) => manager.resolve(&ProviderId::new(id), &request, options).await,
        None => {
            let mode = if target.broad {
                DiscoveryMode::Broad
            } else {
                DiscoveryMode::FirstSuccess
            };
            manager.discover(&request, options, mode).await
        }
    };

    let resolved = result.map_err(report_exhausted)?;
    log_fallbacks(&resolved);
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(())
}

/// Details stay in the logs; the user only learns nothing could be served.
fn report_exhausted(summary: ErrorSummary) -> anyhow::Error {
    for attempt in &summary.attempts {
        tracing::warn!(
            provider = %attempt.provider_id,
            kind = attempt.error.label(),
            error = %attempt.error,
            "Candidate failed"
        );
    }
    if summary.was_cancelled() {
        anyhow::anyhow!("Cancelled")
    } else {
        tracing::warn!(%summary, "Lookup exhausted");
        anyhow::anyhow!("No results available right now")
    }
}

fn log_fallbacks(resolved: &Resolved) {
    for failure in &resolved.failures {
        tracing::info!(
            provider = %failure.provider_id,
            error = %failure.error,
            "Fell back past provider"
        );
    }
    tracing::info!(
        served_by = ?resolved.served_by.iter().map(ProviderId::as_str).collect::<Vec<_>>(),
        items = resolved.payload.len(),
        elapsed_ms = elapsed_ms(resolved.elapsed),
        "Lookup complete"
    );
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

async fn cmd_health(manager: &SourceManager, options: &CallOptions) -> Result<()> {
    for (provider, result) in manager.probe_all(options).await {
        match result {
            Ok(()) => tracing::info!(%provider, "Healthy"),
            Err(e) => tracing::warn!(%provider, error = %e, "Probe failed"),
        }
    }
    println!("{}", serde_json::to_string_pretty(&manager.health_snapshot())?);
    Ok(())
}

fn cmd_ranks(manager: &SourceManager) -> Result<()> {
    let report = serde_json::json!({
        "order": manager.priority_order(),
        "ranks": manager.reliability_ranks(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
