mod commands;
mod config;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    encode_attachment, fetch_user_directory, open_session, ClientConfig, SessionController,
    SessionOptions, SessionUpdate, ThreadId, UserId,
};
use commands::{mime_for, parse_command, Command, HELP};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Keep credentials in memory only.
    #[arg(long)]
    no_remember: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = config::load_settings(&args.config);
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(database_url) = args.database_url {
        settings.database_url = database_url;
    }
    if args.no_remember {
        settings.remember_credentials = false;
    }

    let controller = open_session(&ClientConfig {
        server_url: settings.server_url.clone(),
        database_url: config::normalize_database_url(&settings.database_url),
        reconnect: settings.reconnect_policy(),
        session: SessionOptions {
            remember_credentials: settings.remember_credentials,
            ..SessionOptions::default()
        },
    })
    .await?;
    tokio::spawn(controller.clone().run());
    tokio::spawn(print_updates(controller.clone()));

    controller.start().await;
    if let (Some(username), Some(password)) = (args.username, args.password) {
        controller.login(&username, &password).await?;
    }
    println!("using {}; type /help for commands", settings.server_url);

    let http = reqwest::Client::new();
    let mut target: Option<UserId> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(usage) => {
                println!("{usage}");
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        if let Err(err) = run_command(&controller, &http, &settings.server_url, &mut target, command).await {
            println!("error: {err:#}");
        }
    }

    Ok(())
}

async fn run_command(
    controller: &Arc<SessionController>,
    http: &reqwest::Client,
    server_url: &str,
    target: &mut Option<UserId>,
    command: Command,
) -> Result<()> {
    match command {
        Command::Say(text) => {
            controller.send_message(&text, target.clone(), None).await?;
        }
        Command::Login { username, password } => controller.login(&username, &password).await?,
        Command::To { peer, text } => {
            controller.send_message(&text, Some(peer), None).await?;
        }
        Command::Select(peer) => {
            let messages = match &peer {
                Some(peer) => controller.select_private_thread(peer).await?,
                None => controller.select_thread(ThreadId::broadcast()).await,
            };
            *target = peer;
            print_messages(&messages);
        }
        Command::History => {
            let thread_id = controller.selected_thread().await;
            print_messages(&controller.messages_for(&thread_id).await);
        }
        Command::Delete(message_id) => controller.delete_message(&message_id).await?,
        Command::Attach { path, caption } => {
            let mime_type = mime_for(&path).context("only images, PDF and Word documents can be attached")?;
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let attachment = encode_attachment(&name, mime_type, &bytes);
            controller
                .send_message(&caption, target.clone(), Some(attachment))
                .await?;
        }
        Command::Avatar(path) => {
            let mime_type = mime_for(&path).context("unsupported picture type")?;
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            controller
                .update_profile_picture(&encode_attachment("avatar", mime_type, &bytes))
                .await?;
        }
        Command::Password { old, new } => controller.change_password(&old, &new).await?,
        Command::Read => {
            let thread_id = controller.selected_thread().await;
            controller.mark_thread_read(&thread_id).await?;
        }
        Command::Who => println!("online: {}", join(&controller.online_users().await)),
        Command::Users => {
            for entry in fetch_user_directory(http, server_url).await? {
                let marker = if controller.is_online(&entry.username).await { "*" } else { " " };
                println!("{marker} {}", entry.username);
            }
        }
        Command::Peers => println!("peers: {}", join(&controller.known_peers().await)),
        Command::Logout => {
            controller.logout().await;
            *target = None;
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

async fn print_updates(controller: Arc<SessionController>) {
    let mut updates = controller.subscribe_updates();
    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "update printer fell behind");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };
        match update {
            SessionUpdate::StatusChanged(session) => match session.current_user {
                Some(user) => println!("[{:?} as {user}]", session.status),
                None => println!("[{:?}]", session.status),
            },
            SessionUpdate::AuthenticationFailed => println!("[login rejected; use /login]"),
            SessionUpdate::LoggedOut => println!("[logged out]"),
            SessionUpdate::PresenceChanged(users) => println!("[online: {}]", join(&users)),
            SessionUpdate::ThreadUpdated(thread_id) => {
                if thread_id == controller.selected_thread().await {
                    if let Some(last) = controller.messages_for(&thread_id).await.last() {
                        println!("{}", render(last));
                    }
                }
            }
            SessionUpdate::OfflineModeChanged(true) => println!("[offline: showing cached messages]"),
            SessionUpdate::OfflineModeChanged(false) => println!("[back online]"),
            SessionUpdate::PeerAdded(peer) => println!("[new private chat with {peer}]"),
            SessionUpdate::ProfilePictureUpdated(_) => println!("[profile picture updated]"),
            SessionUpdate::PasswordChanged { success } => {
                println!("[password {}]", if success { "changed" } else { "unchanged" })
            }
            SessionUpdate::DeletionRolledBack { thread_id, error } => {
                println!("[{error}; restoring {thread_id}]")
            }
            SessionUpdate::Error(err) => println!("[{:?}] {err}", err.kind()),
        }
    }
}

fn print_messages(messages: &[client_core::Message]) {
    for message in messages {
        println!("{}", render(message));
    }
}

fn render(message: &client_core::Message) -> String {
    let mut line = format!(
        "{} {} {}: {}",
        message.timestamp.format("%H:%M"),
        message.id,
        message.sender,
        message.body
    );
    if let Some(attachment) = &message.attachment {
        line.push_str(&format!(" [{} {}B]", attachment.name, attachment.size));
    }
    if !message.deleted_by.is_empty() {
        line.push_str(" (hidden by some)");
    }
    line
}

fn join(users: &[UserId]) -> String {
    users
        .iter()
        .map(UserId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
