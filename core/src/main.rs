/// ChatSync terminal client - Main entry point
use chatsync_core::push::StaticToken;
use chatsync_core::utils::StoreChange;
use chatsync_core::{
    ChatContext, ConnectionManager, ConnectionState, Config, ConversationView, DeliveryState,
    Message,
};
use colored::*;
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let conversation_id = config
        .conversation_id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Usage: chatsync <conversation_id> [flags]"))?;

    let token = env::var("CHATSYNC_TOKEN").ok();
    if token.is_none() {
        warn!("CHATSYNC_TOKEN not set, connecting anonymously");
    }
    let context = ChatContext::new(config, Arc::new(StaticToken(token)))
        .map_err(|e| anyhow::anyhow!("Startup error: {}", e))?;

    info!("Opening conversation {}", conversation_id);
    let mut view = context
        .open_conversation(&conversation_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load conversation: {}", e))?;

    print_history(&view);
    print_help();

    let connection = context.connection();
    let mut states = connection.watch_state();
    let mut changes = view.store().subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(change) => print_change(&view, &change),
                Err(RecvError::Lagged(n)) => warn!("Missed {} store changes", n),
                Err(RecvError::Closed) => break,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                if let Some(banner) = connectivity_banner(state) {
                    println!("{}", banner);
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !run_command(&view, connection, line.trim()).await {
                    break;
                }
            }
        }
    }

    view.unmount();
    context.shutdown().await;
    Ok(())
}

fn print_help() {
    println!("{}", "Commands:".bright_white().bold());
    println!("  {}               Load older messages", "/older".cyan());
    println!("  {}     Edit a message", "/edit <id> <text>".cyan());
    println!("  {}          Delete a message", "/delete <id>".cyan());
    println!("  {}           Resend a failed message", "/retry <id>".cyan());
    println!("  {}           Reconnect after going offline", "/reconnect".cyan());
    println!("  {}                Leave", "/quit".cyan());
    println!("  Anything else is sent as a message.");
}

fn format_message(message: &Message) -> String {
    let time = message.created_at.format("%H:%M:%S").to_string().dimmed();
    let status = match message.delivery {
        DeliveryState::Confirmed => "✓".green(),
        DeliveryState::Pending => "…".yellow(),
        DeliveryState::Failed => "✗".red(),
    };
    let body = if message.is_deleted() {
        "(deleted)".dimmed().to_string()
    } else if message.body.is_empty() {
        format!("[{} attachments]", message.attachments.len())
    } else {
        message.body.clone()
    };
    let edited = if message.is_edited() && !message.is_deleted() {
        " (edited)".dimmed().to_string()
    } else {
        String::new()
    };
    format!(
        "{} {} {} {}{}  {}",
        time,
        status,
        message.sender_id.cyan(),
        body,
        edited,
        message.message_id.dimmed()
    )
}

fn print_history(view: &ConversationView) {
    // store is newest-first; print oldest at the top
    for message in view.store().messages().iter().rev() {
        println!("{}", format_message(message));
    }
}

fn print_change(view: &ConversationView, change: &StoreChange) {
    match change {
        StoreChange::Live { message_id, .. } | StoreChange::Updated { message_id } => {
            if let Some(message) = view.store().get(message_id) {
                println!("{}", format_message(&message));
            }
        }
        StoreChange::Older { added } if *added > 0 => {
            println!("{} {} older messages", "↑".cyan(), added);
            print_history(view);
        }
        StoreChange::Removed { message_id } => {
            println!("{} removed {}", "-".red(), message_id.dimmed());
        }
        StoreChange::FetchFailed { kind, error } => {
            println!("{} loading {:?} messages failed: {}", "✗".red().bold(), kind, error);
        }
        _ => {}
    }
}

/// Notice for a push connection state change; `None` while the first connect runs
fn connectivity_banner(state: ConnectionState) -> Option<String> {
    match state {
        ConnectionState::Connecting => None,
        ConnectionState::Connected => Some(format!("{} Back online", "●".green())),
        ConnectionState::Reconnecting => Some(format!(
            "{} Connection lost, reconnecting…",
            "●".yellow()
        )),
        ConnectionState::Disconnected => Some(format!(
            "{} Offline, type /reconnect to try again",
            "●".red()
        )),
    }
}

/// Returns false when the user asked to leave
async fn run_command(view: &ConversationView, connection: &ConnectionManager, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let result = match command {
        "/quit" => return false,
        "/reconnect" => {
            if connection.state() == ConnectionState::Disconnected {
                connection.resume_from_background();
            } else {
                println!("{}", "Already connected or reconnecting".dimmed());
            }
            return true;
        }
        "/older" => {
            if !view.store().has_older() {
                println!("{}", "No older messages".dimmed());
                return true;
            }
            view.store().load_older().await.map(|_| ())
        }
        "/edit" => match rest.split_once(' ') {
            Some((id, text)) => view.pipeline().edit(id, text).await,
            None => {
                println!("{} /edit <id> <text>", "Usage:".yellow());
                return true;
            }
        },
        "/delete" => view.pipeline().delete(rest.trim()).await,
        "/retry" => view.pipeline().retry(rest.trim()).await.map(|_| ()),
        _ => {
            view.pipeline().set_draft_text(line);
            view.pipeline().submit().await
        }
    };
    if let Err(e) = result {
        println!("{} {}", "✗".red().bold(), e);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_states_get_a_banner() {
        colored::control::set_override(false);
        assert_eq!(
            connectivity_banner(ConnectionState::Reconnecting).as_deref(),
            Some("● Connection lost, reconnecting…")
        );
        let offline = connectivity_banner(ConnectionState::Disconnected).unwrap();
        assert!(offline.contains("/reconnect"));
        assert_eq!(
            connectivity_banner(ConnectionState::Connected).as_deref(),
            Some("● Back online")
        );
        assert_eq!(connectivity_banner(ConnectionState::Connecting), None);
    }
}
