use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};

use rostercache::cache::{parse_id, IdRule};
use rostercache::changeset::{read_entries, ChangeSetReconciler, JsonChangeLog};
use rostercache::config::Config;

#[derive(Parser, Debug)]
#[command(name = "rostercache")]
#[command(about = "Entity cache and change-set reconciliation for a school-records store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rostercache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Reconcile a change log against local changes and print what other processes changed
  Replay {
    /// JSON array of change entries as reported by the remote store
    #[arg(short, long)]
    log: PathBuf,

    /// JSON array of change entries this process made
    #[arg(long)]
    local: Option<PathBuf>,

    /// Starting watermark (default: nothing accounted for yet)
    #[arg(short, long, default_value_t = 0)]
    baseline: i64,
  },

  /// Print the canonical ID of a serialized record
  ParseId {
    /// File holding the record content
    file: PathBuf,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = rostercache::logging::init(&config.logging)?;

  match args.command {
    Command::Replay {
      log,
      local,
      baseline,
    } => replay(&log, local.as_deref(), baseline).await,
    Command::ParseId { file } => {
      let content = std::fs::read_to_string(&file)
        .map_err(|e| eyre!("Failed to read record {}: {}", file.display(), e))?;
      let id = parse_id(&content, IdRule::default())
        .map_err(|e| eyre!("Failed to parse record {}: {}", file.display(), e))?;
      println!("{id}");
      Ok(())
    }
  }
}

async fn replay(log: &Path, local: Option<&Path>, baseline: i64) -> Result<()> {
  let reconciler = ChangeSetReconciler::new(JsonChangeLog::load(log)?);
  reconciler.set_baseline_to(baseline);

  if let Some(local) = local {
    reconciler.register_local_change(read_entries(local)?);
  }

  let external = reconciler.reconcile().await?;
  tracing::info!(
    external = external.len(),
    sequence = reconciler.current_sequence(),
    unmatched_local = reconciler.pending_len(),
    "replay finished"
  );

  println!("{}", serde_json::to_string_pretty(&external)?);
  Ok(())
}
