use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use rentsync::config::Config;
use rentsync::event::drain_notifications;
use rentsync::queue::PendingMutation;
use rentsync::SyncEngine;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "rentsync")]
#[command(about = "Offline cache and write queue for the rental marketplace client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rentsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Directory for log files (default: $XDG_DATA_HOME/rentsync/logs)
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List queued and failed mutations
  Pending,
  /// Drop a queued or failed mutation
  Discard { id: Uuid },
  /// Move a failed mutation back into the queue
  Retry { id: Uuid },
  /// Cached GET of a backend path, printed as JSON
  Fetch {
    path: String,
    /// Query parameter as key=value; repeatable
    #[arg(short, long = "query", value_parser = parse_pair)]
    query: Vec<(String, String)>,
  },
  /// Show the cart kept for the signed-out user
  Cart,
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
  raw
    .split_once('=')
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .ok_or_else(|| format!("expected key=value, got {:?}", raw))
}

fn print_mutation(m: &PendingMutation) {
  println!(
    "{}  {:<12} {:<10} attempts={} created={}",
    m.id,
    m.kind.label(),
    format!("{:?}", m.status),
    m.attempts,
    m.created_at.format("%Y-%m-%d %H:%M:%S")
  );
  if let Some(err) = &m.last_error {
    println!("    last error: {}", err);
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _log_guard = rentsync::logging::init(args.log_dir.as_deref())?;

  let engine = SyncEngine::new(&config)?;
  let mut notifications = engine.notifications();

  match args.command {
    Command::Pending => {
      let pending = engine.queue().peek_pending();
      let failed = engine.queue().failed();
      if pending.is_empty() && failed.is_empty() {
        println!("Queue is empty");
      }
      for m in pending.iter().chain(failed.iter()) {
        print_mutation(m);
      }
    }
    Command::Discard { id } => {
      if !engine.queue().discard(id)? {
        return Err(eyre!("No discardable mutation with id {}", id));
      }
      println!("Discarded {}", id);
    }
    Command::Retry { id } => {
      if !engine.queue().retry(id)? {
        return Err(eyre!("No failed mutation with id {}", id));
      }
      println!("{} will be retried on the next sync", id);
    }
    Command::Fetch { path, query } => {
      let value = engine.catalog().fetch(&path, &query).await?;
      println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Command::Cart => {
      let cart = engine.cart().anonymous();
      for line in cart.lines() {
        println!(
          "{:<8} {:<24} x{:<4} {:>10}",
          line.item_id,
          line.name.as_deref().unwrap_or("-"),
          line.quantity,
          line.total.to_string()
        );
      }
      println!("{} item(s), total {}", cart.total_items(), cart.total_price());
    }
  }

  for n in drain_notifications(&mut notifications) {
    eprintln!("[{:?}] {}: {}", n.severity, n.title, n.message);
  }

  Ok(())
}
