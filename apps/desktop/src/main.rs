use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use clap::Parser;
use client_core::{
    InboundPolicy, OfflineTransport, SendOutcome, SkipReason, StoreChange, SyncCore,
    SyncSettings, TransportChannel, WebSocketTransport,
};
use shared::domain::{ConversationGroup, ConversationId, Message, MessageKind};
use storage::{LocalStoreAdapter, SqliteKeyValueStore};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{parse_command, Command, ConversationRef, HELP};
use config::{load_settings, normalize_database_url, relay_url_or_offline};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "concord.toml")]
    config: String,
    #[arg(long)]
    relay_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    inbound_policy: Option<InboundPolicy>,
    /// Never connect to the relay.
    #[arg(long)]
    offline: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = load_settings(&args.config)?;
    if let Some(v) = args.relay_url {
        settings.relay_url = relay_url_or_offline(v);
    }
    if let Some(v) = args.database_url {
        settings.database_url = v;
    }
    if let Some(v) = args.inbound_policy {
        settings.inbound_policy = v;
    }
    if args.offline {
        settings.relay_url = None;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&settings.log_filter))
        .with_writer(std::io::stderr)
        .init();

    let database_url = normalize_database_url(&settings.database_url);
    let kv = SqliteKeyValueStore::new(&database_url).await?;
    let persistence = LocalStoreAdapter::new(Arc::new(kv));

    let websocket = settings
        .relay_url
        .as_ref()
        .map(|_| Arc::new(WebSocketTransport::new(settings.reconnect.clone())));
    let transport: Arc<dyn TransportChannel> = match &websocket {
        Some(websocket) => websocket.clone(),
        None => Arc::new(OfflineTransport),
    };
    let core = Arc::new(
        SyncCore::load(
            transport,
            persistence,
            SyncSettings {
                inbound_policy: settings.inbound_policy,
            },
        )
        .await,
    );

    if let (Some(websocket), Some(url)) = (&websocket, &settings.relay_url) {
        let registration = serde_json::to_value(core.registration())?;
        match websocket.connect(url, Some(registration)).await {
            Ok(inbound) => {
                let core = Arc::clone(&core);
                tokio::spawn(async move { core.run(inbound).await });
            }
            Err(error) => warn!(%error, "relay unavailable; running offline"),
        }
    } else {
        info!("no relay configured; running offline");
    }

    spawn_unread_notifier(Arc::clone(&core));

    let user = core.user().await;
    println!("Signed in as {} (ID: #{})", user.display_name(), user.id);
    println!("Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => {
                if let Err(error) = execute(&core, command).await {
                    println!("error: {error}");
                }
            }
            Err(usage) => println!("{usage}"),
        }
    }

    if let Some(websocket) = websocket {
        websocket.close().await;
    }
    Ok(())
}

/// Stand-in for the unread badge of a graphical list.
fn spawn_unread_notifier(core: Arc<SyncCore>) {
    let mut changes = core.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(StoreChange::Upserted(id)) => {
                    if let Some(group) = core.get(&id).await {
                        if group.unread {
                            println!("* new messages in {}", group.name);
                        }
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "unread notifier fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn resolve(core: &SyncCore, conversation: &ConversationRef) -> Result<ConversationId> {
    match conversation {
        ConversationRef::Index(index) => core
            .groups()
            .await
            .get(index - 1)
            .map(|group| group.id.clone())
            .ok_or_else(|| anyhow!("no conversation at position {index}")),
        ConversationRef::Id(id) => Ok(ConversationId::from(id.as_str())),
    }
}

async fn execute(core: &SyncCore, command: Command) -> Result<()> {
    match command {
        Command::Profile { name, avatar } => {
            let user = core.save_profile(&name, avatar).await?;
            println!("profile saved: {}", user.display_name());
        }
        Command::Create { member_ids, name } => {
            let id = core.create_group(&name, member_ids).await?;
            if let Some(group) = core.get(&id).await {
                println!("created {} [{}]", group.name, group.id);
            }
        }
        Command::Edit {
            conversation,
            member_ids,
            name,
        } => {
            let id = resolve(core, &conversation).await?;
            core.edit_group(&id, &name, member_ids).await?;
            println!("updated {id}");
        }
        Command::Delete(conversation) => {
            let id = resolve(core, &conversation).await?;
            core.delete_group(&id).await;
            println!("deleted {id}");
        }
        Command::Open(conversation) => {
            let id = resolve(core, &conversation).await?;
            core.set_active(Some(id)).await?;
            if let Some(group) = core.active().await {
                print_group(&group);
            }
        }
        Command::Close => core.set_active(None).await?,
        Command::List => {
            let groups = core.groups().await;
            if groups.is_empty() {
                println!("no conversations; /create one");
            }
            let active = core.active().await.map(|group| group.id.clone());
            for (index, group) in groups.iter().enumerate() {
                let marker = if active.as_ref() == Some(&group.id) { ">" } else { " " };
                let badge = if group.unread { " *" } else { "" };
                let preview = group
                    .last_message()
                    .map(|message| format!("{}: {}", message.sender_name, message.text))
                    .unwrap_or_else(|| "No messages yet".to_string());
                println!("{marker}{:>3}. {}{badge}  {preview}", index + 1, group.name);
            }
        }
        Command::Show => match core.active().await {
            Some(group) => print_group(&group),
            None => println!("No Conversation Selected"),
        },
        Command::Whoami => {
            let user = core.user().await;
            println!("{} (ID: #{})", user.display_name(), user.id);
        }
        Command::Say(text) => send(core, &text, MessageKind::User).await,
        Command::System(text) => send(core, &text, MessageKind::System).await,
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

async fn send(core: &SyncCore, text: &str, kind: MessageKind) {
    let Some(group) = core.active().await else {
        println!("no conversation open; /open one first");
        return;
    };
    match core.send_message(&group.id, text, kind).await {
        SendOutcome::Sent(_) | SendOutcome::Skipped(SkipReason::BlankText) => {}
        SendOutcome::LocalOnly(_) => println!("(offline: message kept locally only)"),
        SendOutcome::Skipped(SkipReason::UnknownConversation) => {
            println!("conversation no longer exists")
        }
    }
}

fn print_group(group: &ConversationGroup) {
    let members = group
        .member_ids
        .iter()
        .map(|id| format!("#{id}"))
        .collect::<Vec<_>>()
        .join(", ");
    println!("== {} ({members})", group.name);
    for message in &group.messages {
        println!("{}", format_message(message));
    }
}

fn format_message(message: &Message) -> String {
    let time = DateTime::from_timestamp_millis(message.timestamp)
        .map(|at| at.with_timezone(&Local).format("%H:%M").to_string())
        .unwrap_or_default();
    match message.kind {
        MessageKind::User => format!("[{time}] {}: {}", message.sender_name, message.text),
        MessageKind::System => format!("[{time}] -- {}", message.text),
    }
}
