//! story-sync: follow a story project from the command line.
//!
//! Connects to the push channel, keeps the lock table and repository cache
//! current, and logs every event the session surfaces.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use story_core::{Actor, NotificationLevel, SyncEvent};
use story_sync::{HttpBackend, ProjectSession, SessionConfig, SyncConfig};

#[derive(Parser, Debug)]
#[command(name = "story-sync")]
#[command(about = "Realtime sync client for story projects")]
struct Args {
    /// Base URL of the backend REST API
    #[arg(long, env = "STORY_SYNC_API_URL")]
    api_url: String,

    /// Push channel URL (derived from the API URL when omitted)
    #[arg(long, env = "STORY_SYNC_WS_URL")]
    ws_url: Option<String>,

    /// Bearer token for the REST API and the push channel
    #[arg(long, env = "STORY_SYNC_TOKEN", hide_env_values = true)]
    token: String,

    /// Project to follow
    #[arg(short, long)]
    project: String,

    /// Actor id used for lock operations
    #[arg(long, default_value = "story-sync")]
    actor: String,

    /// Act with override rights
    #[arg(long)]
    editor: bool,

    /// Files to open and keep current
    #[arg(long = "open")]
    open: Vec<String>,

    /// Print events as JSON lines on stdout
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::Notification(notification) => match notification.level {
            NotificationLevel::Info => info!("{}", notification.message),
            NotificationLevel::Warning => warn!("{}", notification.message),
            NotificationLevel::Error => error!("{}", notification.message),
        },
        SyncEvent::LockChanged {
            component_id,
            lock: Some(lock),
        } => info!("{} is now {} locked by {}", component_id, lock.level, lock.locked_by),
        SyncEvent::LockChanged {
            component_id,
            lock: None,
        } => info!("{} unlocked", component_id),
        SyncEvent::LockConflict { conflict } => warn!(
            "Lock conflict {} on {}: {}",
            conflict.id, conflict.component_id, conflict.description
        ),
        SyncEvent::ConflictResolved { conflict_id } => info!("Conflict {} resolved", conflict_id),
        SyncEvent::Reconciliation(notice) => warn!(
            "{} changed remotely while it has unsaved edits (seen {} times)",
            notice.path, notice.occurrences
        ),
        SyncEvent::RefetchFailed { path, error, .. } => {
            warn!("Could not refresh {}: {}", path, error)
        }
        SyncEvent::ConnectionLost { attempts } => {
            error!("Connection lost after {} reconnect attempts", attempts)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,story_sync=debug,story_core=debug"
    } else {
        "info,story_sync=info,story_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = SyncConfig::from_parts(&args.api_url, args.ws_url.as_deref(), &args.token)
        .context("invalid configuration")?;
    info!("Starting story-sync");
    info!("API: {}", config.api_url);
    info!("Push channel: {}", config.ws_url);

    let actor = if args.editor {
        Actor::editor(&args.actor)
    } else {
        Actor::member(&args.actor)
    };
    let backend = Arc::new(HttpBackend::from_config(&config)?);
    let (mut session, mut events) =
        ProjectSession::start(SessionConfig::from(&config), backend, &args.project, actor)?;

    for path in &args.open {
        match session.open_file(path).await {
            Ok(overlay) => info!(
                "Opened {} ({} bytes at {})",
                path,
                overlay.effective_content().len(),
                overlay.remote_version().unwrap_or("unknown version")
            ),
            Err(e) => warn!("Could not open {}: {}", path, e),
        }
    }

    let json = args.json;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => error!("Failed to encode event: {}", e),
                }
            } else {
                log_event(&event);
            }
        }
        debug!("Event stream closed");
    });

    info!("Following {}. Press Ctrl+C to stop.", args.project);

    loop {
        tokio::select! {
            running = session.step() => {
                if !running {
                    warn!("Push channel closed; stopping");
                    break;
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    session.shutdown().await;
    let _ = printer.await;
    Ok(())
}
