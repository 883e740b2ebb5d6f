use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, oneshot};

use medisense::chat::SubmissionReport;
use medisense::{
    ChatError, ChatResult, ClientConfig, Coordinator, HttpBackend, Message, MessageStore, Notifier,
    PendingAttachment, Role, StoreEvent,
};

#[derive(Parser)]
#[command(name = "medisense", version, about = "Medical assistant chat client")]
struct Cli {
    /// Conversation to work in.
    #[arg(long)]
    chat: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a message and stream the reply.
    Send {
        /// Files to attach (PDF lab reports, images, other documents).
        #[arg(long = "attach", value_name = "PATH")]
        attachments: Vec<PathBuf>,

        /// Message text.
        #[arg(trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Print the stored conversation.
    History,
}

fn print_message(message: &Message) {
    let who = match message.role {
        Role::User => "you",
        Role::Assistant => "assistant",
    };
    println!("[{}] {who}:", message.timestamp);
    if !message.content.is_empty() {
        println!("{}", message.content);
    }
    for attachment in &message.attachments {
        println!("  📎 {} ({})", attachment.display_name, attachment.locator);
    }
    println!();
}

/// User turns worth echoing as they enter the store.
fn user_turn(event: StoreEvent) -> Option<Message> {
    match event {
        StoreEvent::Inserted(message) if message.role == Role::User => Some(message),
        StoreEvent::ContentChanged { id, content } => {
            tracing::trace!(message_id = %id, len = content.len(), "content updated");
            None
        }
        _ => None,
    }
}

/// Takes the user turns still queued on `events` without waiting.
fn drain_user_turns(events: &mut broadcast::Receiver<StoreEvent>) -> Vec<Message> {
    let mut turns = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => turns.extend(user_turn(event)),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    turns
}

/// An empty submission is not an error for the user.
fn accept_submission(result: ChatResult<SubmissionReport>) -> Result<Option<SubmissionReport>> {
    match result {
        Ok(report) => Ok(Some(report)),
        Err(ChatError::Validation) => {
            tracing::debug!("nothing to send");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    medisense::logging::init();

    let cli = Cli::parse();
    let config = ClientConfig::from_env()?;
    let backend = HttpBackend::new(&config).context("failed to create backend client")?;
    let store = MessageStore::new(cli.chat.clone());
    let (notifier, mut notifications) = Notifier::channel();
    let coordinator = Coordinator::new(config, Arc::new(backend), store.clone(), notifier);

    // Failures are reported out of band.
    let notify_task = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            eprintln!("⚠ {}: {}", notification.title, notification.detail);
        }
    });

    match cli.command {
        Command::History => {
            coordinator.load_history().await?;
            for message in store.snapshot() {
                print_message(&message);
            }
        }
        Command::Send { attachments, text } => {
            let mut files = Vec::with_capacity(attachments.len());
            for path in &attachments {
                files.push(PendingAttachment::from_path(path).await?);
            }

            let mut events = store.subscribe();
            let (done_tx, mut done_rx) = oneshot::channel::<()>();
            let watcher = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        event = events.recv() => match event {
                            Ok(event) => {
                                if let Some(message) = user_turn(event) {
                                    print_message(&message);
                                }
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                tracing::debug!(skipped, "store events lagged");
                            }
                            Err(RecvError::Closed) => return,
                        },
                        _ = &mut done_rx => break,
                    }
                }
                // Print whatever was queued before the submission returned.
                for message in drain_user_turns(&mut events) {
                    print_message(&message);
                }
            });

            let result = coordinator.submit(text.join(" "), files).await;
            let _ = done_tx.send(());
            let _ = watcher.await;
            let Some(report) = accept_submission(result)? else {
                return Ok(());
            };

            for outcome in &report.outcomes {
                if let Some(message) = outcome.placeholder.as_ref().and_then(|id| store.get(id)) {
                    print_message(&message);
                }
            }
            tracing::info!(
                completed = report.completed(),
                failed = report.failed(),
                "submission finished"
            );
        }
    }

    drop(coordinator);
    drop(store);
    let _ = notify_task.await;
    Ok(())
}
