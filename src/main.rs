//! tutord entry point: HTTP daemon plus an offline rollout subcommand.

use tutord::agent::TutorAgent;
use tutord::api::{ApiState, router};
use tutord::capability::CapabilityClient;
use tutord::config::TutorConfig;
use tutord::dataset::DatasetEmitter;
use tutord::rollout::{RolloutConfig, RolloutEntry, run_rollout};
use tutord::store::TutorStore;

use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tutord=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("rollout") => rollout_cli(&args[2..]).await,
        Some("serve") => serve(args.get(2).map(String::as_str)).await,
        Some(other) if other.ends_with(".toml") => serve(Some(other)).await,
        None => serve(None).await,
        Some(other) => {
            eprintln!("unknown command: {other}");
            eprintln!("usage: tutord [serve [config.toml]] | rollout <observations> <out-dir> [candidates] [seed]");
            std::process::exit(2);
        }
    }
}

async fn serve(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = TutorConfig::load(Path::new(config_path.unwrap_or("config.toml")))
        .context("failed to load configuration")?;
    let store = TutorStore::connect(Path::new(&config.server.db_path))
        .await
        .context("failed to open database")?;
    let capability = Arc::new(CapabilityClient::from_config(&config.capability)?);
    let emitter = DatasetEmitter::new(&config.dataset);
    let bind_addr = config.server.bind_addr.clone();
    let agent = Arc::new(TutorAgent::new(store, capability, config));
    let state = Arc::new(ApiState { agent, emitter });

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(%bind_addr, "tutord listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Offline dataset generation: read observations, run a mock rollout, write
/// one batch.
async fn rollout_cli(args: &[String]) -> anyhow::Result<()> {
    let [observations_path, out_dir, rest @ ..] = args else {
        anyhow::bail!("usage: tutord rollout <observations> <out-dir> [candidates] [seed]");
    };
    let candidates: usize = rest
        .first()
        .map(|raw| raw.parse())
        .transpose()
        .context("candidates must be an integer")?
        .unwrap_or(3);
    let seed: Option<u64> = rest
        .get(1)
        .map(|raw| raw.parse())
        .transpose()
        .context("seed must be an integer")?;

    let entries = read_entries(Path::new(observations_path))?;
    if entries.is_empty() {
        tracing::warn!(path = %observations_path, "no observations found");
        return Ok(());
    }

    let config = TutorConfig::load(Path::new("config.toml"))?;
    let store = TutorStore::connect_in_memory().await?;
    let agent = Arc::new(TutorAgent::new(
        store,
        Arc::new(CapabilityClient::Mock),
        config,
    ));

    let rollout_config = RolloutConfig {
        candidates: candidates.max(1),
        mock: true,
        seed,
        ..Default::default()
    };
    let output = run_rollout(&agent, &entries, &rollout_config).await?;

    let emitter = DatasetEmitter::with_out_dir(Path::new(out_dir), false);
    let manifest = emitter.emit_batch(&output)?;
    tracing::info!(
        batch_id = %manifest.batch_id,
        sft = manifest.sft_count,
        prefs = manifest.prefs_count,
        dir = %manifest.dir.display(),
        "rollout batch written"
    );
    Ok(())
}

/// Observations file: a JSON array or one JSON object per line.
fn read_entries(path: &Path) -> anyhow::Result<Vec<RolloutEntry>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("observations array is malformed");
    }
    let mut entries = Vec::new();
    for (index, line) in trimmed.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: RolloutEntry = serde_json::from_str(line)
            .with_context(|| format!("failed to parse JSON on line {}", index + 1))?;
        entries.push(entry);
    }
    Ok(entries)
}
