use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use offcache::config::Config;
use offcache::engine::Engine;
use offcache::event::{Event, EventHandler};
use offcache::message::ControlMessage;
use offcache::net::{HttpFetcher, Request};
use offcache::logging;

#[derive(Parser, Debug)]
#[command(name = "offcache")]
#[command(about = "An offline-first request cache and background-sync engine")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Resolve one request through the cache
  Fetch {
    /// Absolute URL or path relative to the configured origin
    url: String,

    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Send a JSON control message, e.g. '{"type":"GET_VERSION"}'
  Message { json: String },
  /// Inspect or replay the sync queues
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Inspect the cache partitions
  #[command(subcommand)]
  Cache(CacheCommand),
  /// Run the engine: probe connectivity, refresh periodically and accept
  /// control messages on stdin, one JSON object per line
  Run,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// List pending items
  List,
  /// Replay every queue now
  Replay,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// List partitions and their entry counts
  List,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _guard = logging::init(&config.data_dir()?.join("logs"), args.verbose)?;

  let engine = Engine::start(config.clone()).await?;

  match args.command {
    Command::Fetch {
      url,
      method,
      navigate,
      data,
    } => {
      let url = config.resolve(&url)?;
      let mut request = if navigate {
        Request::navigate(url)
      } else {
        Request::new(&method, url)
      };
      if let Some(data) = data {
        request = request.with_body(data);
      }

      let resolved = engine
        .handle_fetch(request)
        .await
        .map_err(|e| eyre!("Fetch failed: {}", e))?;
      eprintln!("{} ({:?})", resolved.response.status, resolved.source);
      println!("{}", resolved.response.text());
    }
    Command::Message { json } => {
      let reply = engine.handle_message(ControlMessage::from_json(&json)?).await?;
      print_json(&reply)?;
    }
    Command::Queue(QueueCommand::List) => {
      for name in engine.queue().queue_names()? {
        for item in engine.queue().items(&name)? {
          println!(
            "{}\t{}\t{} {}\t{}",
            name,
            item.id,
            item.method,
            item.url,
            item.enqueued_at.to_rfc3339()
          );
        }
      }
    }
    Command::Queue(QueueCommand::Replay) => {
      let summaries = engine.replay_all().await?;
      print_json(&summaries)?;
    }
    Command::Cache(CacheCommand::List) => {
      for name in engine.store().partitions()? {
        println!("{}\t{}", name, engine.store().len(&name)?);
      }
    }
    Command::Run => run(engine, &config).await?,
  }

  Ok(())
}

async fn run(engine: Engine, config: &Config) -> Result<()> {
  let probe = std::sync::Arc::new(HttpFetcher::new(config.request_timeout())?);
  let mut events = EventHandler::new(
    probe,
    config.probe_url()?,
    config.probe_interval(),
    config.refresh_interval(),
  );

  // Control messages on stdin
  let tx = events.sender();
  tokio::spawn(async move {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
      if line.trim().is_empty() {
        continue;
      }
      match ControlMessage::from_json(&line) {
        Ok(message) => {
          if tx.send(Event::Message(message)).is_err() {
            break;
          }
        }
        Err(e) => warn!(error = %e, "ignoring stdin line"),
      }
    }
  });

  let mut notifications = engine.subscribe();
  tokio::spawn(async move {
    while let Ok(event) = notifications.recv().await {
      if let Ok(line) = serde_json::to_string(&event) {
        println!("{}", line);
      }
    }
  });

  info!("running; ctrl-c to stop");
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        info!("shutting down");
        break;
      }
      event = events.next() => {
        let Some(event) = event else { break };
        if let Err(e) = engine.dispatch(event).await {
          warn!(error = %e, "event handling failed");
        }
      }
    }
  }

  Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  let json =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode reply: {}", e))?;
  println!("{}", json);
  Ok(())
}
