use adchat::api::{ChatBackend, ChatClient};
use adchat::config::Config;
use adchat::state::{self, ControllerHandle, Phase, SessionId, SessionOptions, SessionView};
use adchat::types::{Feedback, Role};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

const HELP: &str = "commands: /retry /cancel /like <id> /dislike <id> /chats /quit";

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Message(&'a str),
    Retry,
    Cancel,
    Rate(&'a str, Feedback),
    Chats,
    Quit,
    Help,
    Unknown(&'a str),
    Blank,
}

fn parse_input(line: &str) -> Input<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Blank;
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return Input::Message(trimmed);
    };
    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map(|(name, arg)| (name, arg.trim()))
        .unwrap_or((command, ""));
    match (name, arg) {
        ("retry", "") => Input::Retry,
        ("cancel", "") => Input::Cancel,
        ("like", id) if !id.is_empty() => Input::Rate(id, Feedback::Like),
        ("dislike", id) if !id.is_empty() => Input::Rate(id, Feedback::Dislike),
        ("chats", "") => Input::Chats,
        ("quit" | "exit", "") => Input::Quit,
        ("help", "") => Input::Help,
        _ => Input::Unknown(trimmed),
    }
}

/// Writes reply text as it streams and settled turns once.
#[derive(Default)]
struct TranscriptPrinter {
    /// Session whose text is on the current line, and how many bytes of it.
    streaming: Option<SessionId>,
    streamed: usize,
    shown_replies: HashSet<String>,
    shown_attachments: HashSet<String>,
    shown_error: Option<String>,
}

impl TranscriptPrinter {
    fn print_history(&mut self, view: &SessionView, out: &mut impl Write) -> io::Result<()> {
        for turn in view.transcript.iter() {
            match turn.role {
                Role::User => writeln!(out, "> {}", turn.content)?,
                Role::Assistant => {
                    writeln!(out, "{}  [{}]", turn.content, turn.id)?;
                    self.shown_replies.insert(turn.id.clone());
                }
            }
        }
        self.shown_attachments.extend(view.attachments.keys().cloned());
        out.flush()
    }

    fn render(&mut self, view: &SessionView, out: &mut impl Write) -> io::Result<()> {
        if matches!(view.phase, Phase::Sending | Phase::Streaming) {
            if view.active_session != self.streaming {
                if self.streamed > 0 {
                    writeln!(out)?;
                }
                self.streaming = view.active_session;
                self.streamed = 0;
            }
            let content = view.streaming_content.as_str();
            if let Some(fresh) = content.get(self.streamed..).filter(|s| !s.is_empty()) {
                write!(out, "{fresh}")?;
                self.streamed = content.len();
            }
        }

        if view.phase == Phase::Idle {
            for turn in view.transcript.iter().filter(|t| t.role == Role::Assistant) {
                if !self.shown_replies.insert(turn.id.clone()) {
                    continue;
                }
                if self.streamed == 0 {
                    write!(out, "{}", turn.content)?;
                }
                writeln!(out, "  [{}]", turn.id)?;
                self.streamed = 0;
            }
            if self.streamed > 0 {
                writeln!(out)?;
                self.streamed = 0;
            }
        }

        for (message_id, ad) in view.attachments.iter() {
            if self.shown_attachments.insert(message_id.clone()) {
                writeln!(
                    out,
                    "  sponsored by {}: {} - {} ({}: {})",
                    ad.advertiser, ad.headline, ad.description, ad.cta_text, ad.url
                )?;
            }
        }

        if view.error != self.shown_error {
            if let Some(error) = &view.error {
                writeln!(out, "error: {error} (/retry to resend)")?;
            }
            self.shown_error = view.error.clone();
        }
        out.flush()
    }
}

async fn connect(config: &Config) -> Result<ChatClient> {
    let client = ChatClient::new(config)?;
    if client.has_auth_token() {
        return Ok(client);
    }
    let Some(email) = config.email.as_deref() else {
        return Ok(client);
    };
    let session = client
        .login(email)
        .await
        .with_context(|| format!("login failed for {email}"))?;
    tracing::info!(email = %session.email, "logged in");
    Ok(client.with_auth_token(session.token))
}

async fn print_chats(client: &ChatClient) -> Result<()> {
    let chats = client.list_chats().await?;
    let mut out = io::stdout().lock();
    if chats.is_empty() {
        writeln!(out, "no conversations yet")?;
    }
    for chat in chats {
        writeln!(
            out,
            "{}  {}  ({} messages, {})",
            chat.id, chat.title, chat.message_count, chat.created_at
        )?;
    }
    Ok(())
}

/// Reads lines until the first message, then creates a conversation for it.
async fn open_new_chat(
    client: &ChatClient,
    lines: &mut Lines<BufReader<Stdin>>,
) -> Result<Option<(String, String)>> {
    while let Some(line) = lines.next_line().await? {
        match parse_input(&line) {
            Input::Message(text) => {
                let chat = client.create_chat(text).await?;
                println!("conversation {}", chat.id);
                return Ok(Some((chat.id, text.to_string())));
            }
            Input::Quit => return Ok(None),
            Input::Chats => print_chats(client).await?,
            Input::Blank => {}
            _ => println!("start a conversation by typing a message; {HELP}"),
        }
    }
    Ok(None)
}

/// Returns false when the session should end.
async fn dispatch(client: &ChatClient, handle: &ControllerHandle, line: &str) -> bool {
    let result = match parse_input(line) {
        Input::Blank => Ok(()),
        Input::Quit => return false,
        Input::Message(text) => handle.send(text).await.map(|_| ()),
        Input::Retry => handle.retry().await.map(|_| ()),
        Input::Cancel => handle.cancel().await.map(|_| ()),
        Input::Rate(id, feedback) => handle
            .feedback(id, feedback)
            .await
            .map(|()| println!("{} recorded for {id}", feedback.as_str())),
        Input::Chats => {
            if let Err(error) = print_chats(client).await {
                eprintln!("error: {error:#}");
            }
            Ok(())
        }
        Input::Help => {
            println!("{HELP}");
            Ok(())
        }
        Input::Unknown(command) => {
            println!("unknown command {command}; {HELP}");
            Ok(())
        }
    };
    if let Err(error) = result {
        eprintln!("error: {error}");
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    config.validate()?;
    adchat::logging::init_tracing()?;

    let client = connect(&config).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let (chat_id, first_message) = match std::env::args().nth(1) {
        Some(chat_id) => (chat_id, None),
        None => match open_new_chat(&client, &mut lines).await? {
            Some((chat_id, text)) => (chat_id, Some(text)),
            None => return Ok(()),
        },
    };

    let backend: Arc<dyn ChatBackend> = Arc::new(client.clone());
    let handle = state::spawn(backend, chat_id.clone(), SessionOptions::from(&config));
    let mut printer = TranscriptPrinter::default();

    if first_message.is_none() {
        handle
            .load()
            .await
            .with_context(|| format!("failed to open conversation {chat_id}"))?;
        printer.print_history(&handle.view(), &mut io::stdout().lock())?;
    }
    if let Some(text) = first_message {
        handle.send(text).await?;
    }

    let mut views = handle.subscribe();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    // Piped input ran out; let the reply in flight finish.
                    stdin_open = false;
                    if !handle.view().is_busy() {
                        break;
                    }
                    continue;
                };
                if !dispatch(&client, &handle, &line).await {
                    break;
                }
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                printer.render(&view, &mut io::stdout().lock())?;
                if !stdin_open && !view.is_busy() {
                    break;
                }
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}
