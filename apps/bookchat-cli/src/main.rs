use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use bookchat_sync::{
    ChatSnapshot, DirectoryStatus, HttpChatApi, Identity, NewConversation, Role, SyncConfig,
    SyncEngine, SyncHandle,
};
use bookchat_transport::{MessageBody, TransportChannel, WsDialer};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, instrument, warn};
use tracing_subscriber::EnvFilter;

/// Bookchat - conversations about your bookings, in the terminal
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Participant id of the signed-in user
    #[arg(short, long)]
    participant: String,

    /// Role of the signed-in user
    #[arg(short, long, value_enum, default_value = "customer")]
    role: RoleArg,

    /// Config file (defaults to ~/.bookchat/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// REST API base URL, overrides the config file
    #[arg(long)]
    api_url: Option<String>,

    /// Push channel URL, overrides the config file
    #[arg(long)]
    ws_url: Option<String>,

    /// Bearer token for the REST API
    #[arg(long)]
    token: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Customer,
    Employee,
    Admin,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Customer => Role::Customer,
            RoleArg::Employee => Role::Employee,
            RoleArg::Admin => Role::Admin,
        }
    }
}

fn show_help() {
    println!("\nCommands:");
    println!("  help, h                      Show this help");
    println!("  list, l                      List conversations");
    println!("  open, o <conversation>       Open a conversation");
    println!("  book <other-party> <booking> Open (or start) a booking's conversation");
    println!("  send, s <text>               Send a message");
    println!("  image <path> [caption]       Send an image");
    println!("  older                        Load older messages");
    println!("  retry                        Retry opening after a failed load");
    println!("  close                        Close the open conversation");
    println!("  refresh, r                   Re-pull conversations and counts");
    println!("  badge, b                     Show the unread total");
    println!("  quit, q                      Exit");
}

fn print_conversations(snapshot: &ChatSnapshot, me: &str) {
    if let DirectoryStatus::Failed(reason) = &snapshot.directory {
        println!("Conversation list unavailable: {}", reason);
        return;
    }
    if snapshot.conversations.is_empty() {
        println!("No conversations yet");
        return;
    }
    for view in &snapshot.conversations {
        let conversation = &view.conversation;
        let unread = if view.unread > 0 {
            format!(" ({} unread)", view.unread)
        } else {
            String::new()
        };
        println!(
            "  {:<12} {:<20} {}{}",
            conversation.conversation_id,
            conversation.counterpart(me).name,
            conversation.last_message.as_deref().unwrap_or("-"),
            unread
        );
    }
}

fn print_message(message: &bookchat_transport::Message) {
    let who = message.sender_name.as_deref().unwrap_or(&message.sender_id);
    let time = message.created_at.format("%H:%M");
    match &message.body {
        MessageBody::Text { content } => println!("[{}] {}: {}", time, who, content),
        MessageBody::Image { image_url } => println!("[{}] {}: [image] {}", time, who, image_url),
    }
}

/// Print what changed in the open thread since the last snapshot
fn render_changes(previous: &ChatSnapshot, current: &ChatSnapshot) {
    if previous.banner != current.banner {
        match &current.banner {
            Some(banner) => println!("! {}", banner),
            None => println!("! Live updates restored"),
        }
    }

    let Some(session) = &current.session else {
        return;
    };
    let same_thread = previous
        .session
        .as_ref()
        .is_some_and(|p| p.conversation.conversation_id == session.conversation.conversation_id);
    if !same_thread {
        println!("--- {} ---", session.conversation.conversation_id);
        session.messages.iter().for_each(print_message);
        if !session.conversation.is_chattable() {
            println!("(this conversation is closed, messages are read-only)");
        }
        return;
    }

    let shown = previous
        .session
        .as_ref()
        .map(|p| p.messages.len())
        .unwrap_or(0);
    if session.messages.len() <= shown {
        return;
    }
    // Only appended messages are printed; prepended history is announced by `older`
    let newest_shown = previous
        .session
        .as_ref()
        .and_then(|p| p.messages.last())
        .map(|m| m.message_id.as_str());
    let appended = match newest_shown {
        None => true,
        Some(id) => session.messages[shown - 1].message_id == id,
    };
    if appended {
        session.messages[shown..].iter().for_each(print_message);
    }
}

async fn read_image(path: &Path) -> anyhow::Result<(String, Bytes)> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("image")
        .to_string();
    Ok((file_name, Bytes::from(data)))
}

/// Returns false when the user asked to quit
#[instrument(skip(handle, identity))]
async fn process_command(
    input: &str,
    handle: &SyncHandle,
    identity: &Identity,
) -> anyhow::Result<bool> {
    let (command, rest) = input.split_once(' ').unwrap_or((input, ""));
    let rest = rest.trim();

    match command {
        "help" | "h" | "?" => show_help(),
        "quit" | "exit" | "q" => return Ok(false),
        "list" | "l" => print_conversations(&handle.snapshot(), &identity.participant_id),
        "open" | "o" => {
            if rest.is_empty() {
                bail!("Usage: open <conversation>");
            }
            handle.open(rest).await?;
        }
        "book" => {
            let Some((other, booking)) = rest.split_once(' ') else {
                bail!("Usage: book <other-party> <booking>");
            };
            let me = identity.participant_id.clone();
            let (customer_id, employee_id) = match identity.role {
                Role::Customer => (me, other.to_string()),
                Role::Employee | Role::Admin => (other.to_string(), me),
            };
            let conversation = handle
                .open_booking(NewConversation {
                    customer_id,
                    employee_id,
                    booking_id: Some(booking.trim().to_string()),
                })
                .await?;
            println!("Opened {}", conversation.conversation_id);
        }
        "send" | "s" => handle.send_text(rest).await?,
        "image" => {
            let (path, caption) = rest.split_once(' ').unwrap_or((rest, ""));
            if path.is_empty() {
                bail!("Usage: image <path> [caption]");
            }
            let (file_name, data) = read_image(Path::new(path)).await?;
            let caption = Some(caption.trim().to_string()).filter(|c| !c.is_empty());
            handle.send_image(file_name, data, caption).await?;
        }
        "older" => {
            let added = handle.load_older().await?;
            println!("Loaded {} older message(s)", added);
        }
        "retry" => handle.retry_open().await?,
        "close" => handle.close().await?,
        "refresh" | "r" => {
            handle.refresh().await?;
            print_conversations(&handle.snapshot(), &identity.participant_id);
        }
        "badge" | "b" => {
            let badge = handle.badge();
            match badge.error {
                Some(error) => println!("Unread: {} (stale: {})", badge.total, error),
                None => println!("Unread: {}", badge.total),
            }
        }
        other => println!("Unknown command '{}', type 'help'", other),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut config = SyncConfig::load(args.config.as_deref()).context("Failed to load config")?;
    if let Some(api_url) = args.api_url {
        config.api_base_url = api_url.trim_end_matches('/').to_string();
    }
    if let Some(ws_url) = args.ws_url {
        config.ws_url = ws_url;
    }
    config.validate()?;

    let mut api = HttpChatApi::new(&config)?;
    if let Some(token) = args.token {
        api = api.with_token(token);
    }
    let identity = Identity::new(args.participant, args.role.into());
    info!(participant = %identity.participant_id, api = %config.api_base_url, "Starting bookchat");

    let (transport, events) = TransportChannel::new(Arc::new(WsDialer::new(config.ws_url.clone())));
    let handle = SyncEngine::spawn(config, identity.clone(), Arc::new(api), transport, events);

    show_help();

    let (stdin_tx, mut stdin_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let stdin_task = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if !line.is_empty() && stdin_tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut snapshots = handle.watch_snapshot();
    let mut previous = snapshots.borrow_and_update().clone();
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    warn!("Sync engine stopped");
                    break;
                }
                let current = snapshots.borrow_and_update().clone();
                render_changes(&previous, &current);
                previous = current;
            }
            input = stdin_rx.recv() => {
                let Some(input) = input else {
                    debug!("Stdin closed");
                    break;
                };
                match process_command(&input, &handle, &identity).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("Error: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    stdin_task.abort();
    if let Err(e) = handle.shutdown().await {
        debug!("Engine already stopped: {}", e);
    }
    println!("Goodbye!");
    Ok(())
}
