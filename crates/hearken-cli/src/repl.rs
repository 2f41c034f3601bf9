//! REPL – line-based shell over a [`Backend`].
//!
//! Supported slash-commands:
//!   /sub <pattern>        – print every message on matching topics
//!   /unsub <pattern>      – stop printing for a pattern
//!   /pub <topic> <json>   – publish a JSON message (bare words are strings)
//!   /topics               – list the topics seen so far
//!   /state                – show the backend lifecycle state
//!   /help                 – show this list
//!   /quit | /exit         – close the backend and exit

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use colored::Colorize;
use hearken_bus::{Backend, Subscriber};
use hearken_types::{BusNotification, Message};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// A parsed shell line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Publish { topic: String, message: Message },
    Topics,
    State,
    Help,
    Quit,
}

/// Parse one input line.  `Ok(None)` for a blank line.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let command = match word {
        "/sub" => Command::Subscribe(required(rest, "/sub <pattern>")?),
        "/unsub" => Command::Unsubscribe(required(rest, "/unsub <pattern>")?),
        "/pub" => {
            let (topic, body) = match rest.split_once(char::is_whitespace) {
                Some((topic, body)) => (topic, body.trim()),
                None => (rest, ""),
            };
            let topic = required(topic, "/pub <topic> <json>")?;
            Command::Publish {
                topic,
                message: parse_message(body),
            }
        }
        "/topics" => Command::Topics,
        "/state" => Command::State,
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        other => return Err(format!("Unknown command: '{other}'")),
    };
    Ok(Some(command))
}

fn required(value: &str, usage: &str) -> Result<String, String> {
    if value.is_empty() {
        Err(format!("Usage: {usage}"))
    } else {
        Ok(value.to_string())
    }
}

/// JSON when it parses, otherwise the raw text as a string.  An empty body
/// is an absent message.
fn parse_message(body: &str) -> Message {
    if body.is_empty() {
        return Message::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Message::String(body.to_string()))
}

/// Run the shell until `/quit`, end of input, or Ctrl-C, then close the
/// backend.
pub async fn run(backend: Arc<dyn Backend>) {
    let watcher = tokio::spawn(watch_notifications(Arc::clone(&backend)));
    let mut subscriptions: HashMap<String, Subscriber> = HashMap::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("{} ", "hearken>".bold().cyan());
        std::io::stdout().flush().ok();

        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("{}", "⚠  Ctrl-C received – closing …".yellow().bold());
                break;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };

        match parse_command(&line) {
            Ok(None) => {}
            Ok(Some(Command::Quit)) => break,
            Ok(Some(command)) => execute(backend.as_ref(), &mut subscriptions, command).await,
            Err(e) => println!(
                "{} Type {} for available commands.",
                e.red(),
                "/help".bold()
            ),
        }
    }

    match backend.close().await {
        Ok(()) => println!("{}", "Goodbye.".green()),
        Err(e) => println!("{}: {}", "Close error".red(), e),
    }
    watcher.abort();
}

async fn execute(
    backend: &dyn Backend,
    subscriptions: &mut HashMap<String, Subscriber>,
    command: Command,
) {
    match command {
        Command::Subscribe(pattern) => {
            if subscriptions.contains_key(&pattern) {
                println!("  Already subscribed to {}", pattern.yellow());
                return;
            }
            let subscriber = printer();
            let result = match backend.subscribe(&pattern, subscriber.clone()) {
                Ok(done) => done.await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    println!("  {} subscribed to {}", "✓".green(), pattern.bold());
                    subscriptions.insert(pattern, subscriber);
                }
                Err(e) => println!("  {}: {}", "Subscribe failed".red(), e),
            }
        }
        Command::Unsubscribe(pattern) => {
            let Some(subscriber) = subscriptions.remove(&pattern) else {
                println!("  Not subscribed to {}", pattern.yellow());
                return;
            };
            let result = match backend.unsubscribe(&pattern, &subscriber) {
                Ok(done) => done.await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => println!("  {} unsubscribed from {}", "✓".green(), pattern.bold()),
                Err(e) => println!("  {}: {}", "Unsubscribe failed".red(), e),
            }
        }
        Command::Publish { topic, message } => {
            let result = match backend.publish(&topic, message) {
                Ok(done) => done.await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                println!("  {}: {}", "Publish failed".red(), e);
            }
        }
        Command::Topics => {
            let topics = backend.known_topics();
            if topics.is_empty() {
                println!("  {}", "No topics seen yet.".dimmed());
            }
            for topic in topics {
                println!("  • {}", topic);
            }
        }
        Command::State => println!("  State: {}", backend.state().to_string().bold()),
        Command::Help => cmd_help(),
        Command::Quit => {}
    }
}

fn printer() -> Subscriber {
    Subscriber::new(|topic, message| {
        let stamp = chrono::Local::now().format("%H:%M:%S%.3f");
        println!(
            "\n  {} {} {}",
            stamp.to_string().dimmed(),
            topic.bold().magenta(),
            message
        );
    })
}

async fn watch_notifications(backend: Arc<dyn Backend>) {
    let mut notifications = backend.notifications();
    loop {
        match notifications.recv().await {
            Ok(BusNotification::NewTopic(topic)) => debug!(topic = %topic, "new topic"),
            Ok(BusNotification::Error(e)) => {
                println!("\n  {}: {}", "Backend error".red(), e);
            }
            Ok(BusNotification::Closed) => break,
            Ok(BusNotification::Ready) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "notification listener lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn cmd_help() {
    println!();
    println!("{}", "hearken Commands".bold().underline());
    println!("  {}        – print messages on matching topics", "/sub <pattern>".bold().cyan());
    println!("  {}      – stop printing for a pattern", "/unsub <pattern>".bold().cyan());
    println!("  {}   – publish a JSON message", "/pub <topic> <json>".bold().cyan());
    println!("  {}               – list topics seen so far", "/topics".bold().cyan());
    println!("  {}                – show the backend state", "/state".bold().cyan());
    println!("  {}         – close the backend and exit", "/quit  /exit".bold().cyan());
    println!();
}
