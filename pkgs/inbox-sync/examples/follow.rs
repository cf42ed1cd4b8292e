use std::path::PathBuf;

use clap::Parser;
use inbox_sync::{HttpInboxApi, StoreUpdate, SyncConfig, SyncEngine, WsTransport};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Follow the admin inbox from a terminal
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the REST base URL
    #[arg(long)]
    api: Option<String>,

    /// Override the push channel URL
    #[arg(long)]
    events: Option<String>,
}

fn print_conversations<A: inbox_sync::InboxApi>(engine: &SyncEngine<A>) {
    println!("\n📥 Inbox");
    for conversation in engine.conversation_list() {
        let marker = if conversation.unread_count > 0 { "●" } else { " " };
        let title = if conversation.title.is_empty() {
            conversation.id.as_str()
        } else {
            conversation.title.as_str()
        };
        println!(
            "  {} {} ({} unread, {} messages)",
            marker,
            title,
            conversation.unread_count,
            conversation.messages.len()
        );
    }
}

fn print_threads<A: inbox_sync::InboxApi>(engine: &SyncEngine<A>, conversation_id: &str) {
    for thread in engine.threads(conversation_id) {
        println!(
            "    🧵 [{}] {} ({} messages, {} unread)",
            thread.category,
            thread.title,
            thread.messages.len(),
            thread.unread_count
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    if let Some(api) = args.api {
        config.api_base_url = api;
    }
    if let Some(events) = args.events {
        config.events_url = events;
    }
    config.validate()?;

    let engine = SyncEngine::new(HttpInboxApi::new(&config)?, config.clone());
    let mut updates = engine.subscribe();

    match engine.cold_start().await {
        Ok(count) => info!("Loaded {} messages", count),
        Err(e) => warn!("Cold start failed, continuing with live events only: {}", e),
    }
    print_conversations(&engine);

    let (transport, events) = WsTransport::spawn(&config)?;
    let runner = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(events).await }
    });

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(StoreUpdate::Conversation { conversation_id }) => {
                    debug!("Conversation {} changed", conversation_id);
                    print_conversations(&engine);
                    print_threads(&engine, &conversation_id);
                }
                Ok(StoreUpdate::Conversations) => print_conversations(&engine),
                Ok(StoreUpdate::Connectivity { status }) => println!("🔌 {:?}", status),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Skipped {} updates", skipped);
                    print_conversations(&engine);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\n👋 Bye");
                break;
            }
        }
    }

    transport.shutdown();
    runner.abort();
    info!("Follow example completed");
    Ok(())
}
