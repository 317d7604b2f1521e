use std::{collections::HashSet, sync::Arc};

use anyhow::{anyhow, Result};
use clap::Parser;
use client_core::{ChatClient, ClientEvent, ConversationView, ViewMessage};
use shared::{
    domain::{MessageId, PresenceStatus},
    protocol::UpdateProfileRequest,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
    task::JoinHandle,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Line-oriented chat client")]
struct Args {
    #[arg(long, env = "CHAT_SERVER_URL", default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    email: String,
    #[arg(long, default_value = "")]
    name: String,
    #[arg(long, default_value = "general")]
    channel: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Say(String),
    React { message_id: MessageId, emoji: String },
    Thread(MessageId),
    Back,
    Older,
    Status { status: PresenceStatus, message: Option<String> },
    Channels,
    Join(String),
    Quit,
    Help,
}

fn parse_input(line: &str) -> Result<Option<Input>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(Input::Say(line.to_string())));
    };
    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let input = match name {
        "react" => {
            let id = parts.next().ok_or_else(|| anyhow!("usage: /react <id> <emoji>"))?;
            let emoji = parts.next().ok_or_else(|| anyhow!("usage: /react <id> <emoji>"))?;
            Input::React {
                message_id: MessageId(id.parse()?),
                emoji: emoji.to_string(),
            }
        }
        "thread" => {
            let id = parts.next().ok_or_else(|| anyhow!("usage: /thread <id>"))?;
            Input::Thread(MessageId(id.parse()?))
        }
        "back" => Input::Back,
        "older" => Input::Older,
        "status" => {
            let status = match parts.next() {
                Some("online") => PresenceStatus::Online,
                Some("away") => PresenceStatus::Away,
                Some("offline") => PresenceStatus::Offline,
                _ => return Err(anyhow!("usage: /status <online|away|offline> [message]")),
            };
            let message = parts.collect::<Vec<_>>().join(" ");
            Input::Status {
                status,
                message: (!message.is_empty()).then_some(message),
            }
        }
        "channels" => Input::Channels,
        "join" => Input::Join(
            parts
                .next()
                .ok_or_else(|| anyhow!("usage: /join <channel>"))?
                .to_string(),
        ),
        "quit" | "exit" => Input::Quit,
        "help" => Input::Help,
        other => return Err(anyhow!("unknown command /{other}, try /help")),
    };
    Ok(Some(input))
}

fn render(message: &ViewMessage) -> String {
    let reactions: Vec<String> = message
        .reactions
        .values()
        .map(|group| format!("{}{}", group.emoji, group.count))
        .collect();
    let mut line = format!(
        "[{}] {} {}: {}",
        message.key,
        message.created_at.format("%H:%M"),
        message.author.name,
        message.content
    );
    if message.reply_count > 0 {
        line.push_str(&format!(" ({} replies)", message.reply_count));
    }
    if !reactions.is_empty() {
        line.push_str(&format!("  {}", reactions.join(" ")));
    }
    line
}

/// Prints confirmed messages as they show up, and reprints ones whose
/// reactions change.
fn spawn_printer(view: Arc<ConversationView>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = view.subscribe_events();
        let mut printed: HashSet<MessageId> = HashSet::new();
        for message in view.messages().await {
            println!("{}", render(&message));
            printed.extend(message.id());
        }
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            match event {
                ClientEvent::MessagesChanged => {
                    for message in view.messages().await {
                        let Some(id) = message.id() else { continue };
                        if printed.insert(id) {
                            println!("{}", render(&message));
                        }
                    }
                }
                ClientEvent::ReactionsChanged { message_id } => {
                    let messages = view.messages().await;
                    if let Some(message) = messages.iter().find(|m| m.id() == Some(message_id)) {
                        println!("{}", render(message));
                    }
                }
                ClientEvent::Toast(text) => println!("! {text}"),
                ClientEvent::Error(text) => eprintln!("error: {text}"),
            }
        }
    })
}

struct Screen {
    view: Arc<ConversationView>,
    printer: JoinHandle<()>,
}

impl Screen {
    fn new(view: ConversationView) -> Self {
        let view = Arc::new(view);
        let printer = spawn_printer(view.clone());
        Self { view, printer }
    }
}

impl Drop for Screen {
    fn drop(&mut self) {
        self.printer.abort();
    }
}

async fn open_channel_by_name(client: &ChatClient, name: &str) -> Result<Screen> {
    let channel = client
        .backend()
        .list_channels()
        .await?
        .into_iter()
        .find(|c| c.name == name)
        .ok_or_else(|| anyhow!("no channel named {name}"))?;
    let view = match client.open_channel(channel.id).await {
        Ok(view) => view,
        Err(_) => {
            client.backend().join_channel(channel.id).await?;
            client.open_channel(channel.id).await?
        }
    };
    println!("-- #{} --", channel.name);
    Ok(Screen::new(view))
}

async fn handle(client: &ChatClient, stack: &mut Vec<Screen>, input: Input) -> Result<bool> {
    let Some(current) = stack.last() else {
        return Ok(false);
    };
    match input {
        Input::Say(text) => {
            current.view.send_message(&text).await?;
        }
        Input::React { message_id, emoji } => {
            current.view.toggle_reaction(message_id, &emoji).await?;
        }
        Input::Thread(parent_id) => {
            let channel_id = current.view.scope().channel_id();
            let thread = client.open_thread(channel_id, parent_id).await?;
            println!("-- thread {parent_id} (/back to leave) --");
            stack.push(Screen::new(thread));
        }
        Input::Back => {
            if stack.len() > 1 {
                stack.pop();
            }
        }
        Input::Older => {
            let added = current.view.load_older().await?;
            if added == 0 {
                println!("-- start of channel --");
            } else {
                for message in current.view.messages().await.iter().take(added) {
                    println!("{}", render(message));
                }
            }
        }
        Input::Status { status, message } => {
            client
                .backend()
                .update_profile(UpdateProfileRequest {
                    status: Some(status),
                    status_message: message,
                    ..UpdateProfileRequest::default()
                })
                .await?;
        }
        Input::Channels => {
            for channel in client.backend().list_channels().await? {
                let lock = if channel.is_private { " (private)" } else { "" };
                println!("#{}{lock}", channel.name);
            }
        }
        Input::Join(name) => {
            let screen = open_channel_by_name(client, &name).await?;
            stack.clear();
            stack.push(screen);
        }
        Input::Quit => return Ok(false),
        Input::Help => println!(
            "text to send, /react <id> <emoji>, /thread <id>, /back, /older, \
             /status <online|away|offline> [message], /channels, /join <name>, /quit"
        ),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let client = ChatClient::connect(&args.server_url, &args.email, &args.name).await?;
    println!("signed in as {} ({})", client.me().name, client.me().email);

    let mut stack = vec![open_channel_by_name(&client, &args.channel).await?];
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = match parse_input(&line) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(err) => {
                eprintln!("{err}");
                continue;
            }
        };
        match handle(&client, &mut stack, input).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => eprintln!("error: {err}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_messages() {
        assert_eq!(
            parse_input("  hello there ").expect("parse"),
            Some(Input::Say("hello there".into()))
        );
        assert_eq!(parse_input("   ").expect("parse"), None);
    }

    #[test]
    fn commands_parse_their_arguments() {
        assert_eq!(
            parse_input("/react 42 👍").expect("parse"),
            Some(Input::React {
                message_id: MessageId(42),
                emoji: "👍".into()
            })
        );
        assert_eq!(
            parse_input("/status away lunch break").expect("parse"),
            Some(Input::Status {
                status: PresenceStatus::Away,
                message: Some("lunch break".into())
            })
        );
        assert_eq!(parse_input("/thread 7").expect("parse"), Some(Input::Thread(MessageId(7))));
    }

    #[test]
    fn bad_commands_are_errors() {
        assert!(parse_input("/react 42").is_err());
        assert!(parse_input("/react abc 👍").is_err());
        assert!(parse_input("/dance").is_err());
    }
}
