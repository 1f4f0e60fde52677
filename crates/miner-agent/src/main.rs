//! # miner-agent
//!
//! Points miner binary: loads settings, subscribes the user and channel
//! topics on the event bus, and logs what happens until Ctrl-C.

#![deny(unsafe_code)]

mod events;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use miner_pubsub::{ClientConfig, PubSubPool, Topic, TopicName};
use miner_settings::MinerSettings;

use crate::events::LoggingListener;

/// Watch a streaming platform's event bus for loyalty-point events.
#[derive(Parser, Debug)]
#[command(name = "miner-agent", about = "Points miner event-bus watcher")]
struct Cli {
    /// Settings file (defaults to `~/.points-miner/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// OAuth token sent with LISTEN commands.
    #[arg(long, env = "MINER_AUTH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Numeric id of the logged-in user (overrides settings).
    #[arg(long)]
    user_id: Option<String>,

    /// Channel id to watch; repeat for several (replaces settings).
    #[arg(long = "channel")]
    channels: Vec<String>,

    /// Log level when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// CLI flags win over file and environment.
    fn apply(&self, settings: &mut MinerSettings) {
        if let Some(user_id) = &self.user_id {
            settings.account.user_id = Some(user_id.clone());
        }
        if !self.channels.is_empty() {
            settings.account.channels.clone_from(&self.channels);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

/// Topics for one user and their followed channels.
fn watch_topics(user_id: &str, channels: &[String]) -> Vec<Topic> {
    let mut topics = vec![
        Topic::new(TopicName::CommunityPointsUser, user_id),
        Topic::new(TopicName::PredictionsUser, user_id),
    ];
    for channel in channels {
        topics.push(Topic::new(TopicName::VideoPlaybackById, channel));
        topics.push(Topic::new(TopicName::Raid, channel));
        topics.push(Topic::new(TopicName::PredictionsChannel, channel));
    }
    topics
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(miner_settings::settings_path);
    let mut settings = miner_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    if settings.logging.json {
        miner_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        miner_core::logging::init_subscriber(&settings.logging.level);
    }
    // wss:// needs a process-wide crypto provider; an existing one is fine
    let _ = rustls::crypto::ring::default_provider().install_default();

    let user_id = settings
        .account
        .user_id
        .clone()
        .context("No user id: pass --user-id or set account.userId")?;
    let token = args
        .token
        .clone()
        .context("No auth token: pass --token or set MINER_AUTH_TOKEN")?;

    let pool = PubSubPool::new(ClientConfig::from_settings(&settings.pubsub));
    pool.set_auth_token(token).await;
    pool.add_listener(Arc::new(LoggingListener)).await;

    for topic in watch_topics(&user_id, &settings.account.channels) {
        pool.listen(topic.clone())
            .await
            .with_context(|| format!("Failed to listen to {topic}"))?;
    }
    tracing::info!(
        user_id = %user_id,
        channels = settings.account.channels.len(),
        topics = pool.topic_count().await,
        connections = pool.client_count().await,
        "watching event bus"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    pool.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
