//! Registration Bot Example
//!
//! A console bot that walks each user through a short sign-up dialogue.
//! Lines typed on stdin become text events from user `1`, and replies are
//! printed instead of sent to a messaging platform.
//!
//! # Conversation
//!
//! ```text
//! /start ──▶ AWAITING_NAME ──▶ AWAITING_AGE ──▶ (complete)
//!                 │                  │                ▲
//!                 └──── /cancel ─────┴────────────────┘
//! ```
//!
//! Try `/echo --times 2 hello` for a clap-parsed command, or prefix a line
//! with a number and a colon (`7: /start`) to speak as another user.
//!
//! # Usage
//!
//! ```bash
//! cargo run --package registration-bot
//! ```

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use courier::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

// ============================================================================
// Console Platform
// ============================================================================

/// Prints outbound actions instead of calling a platform API.
struct ConsoleClient;

#[async_trait]
impl PlatformClient for ConsoleClient {
    async fn send(&self, action: &OutboundAction) -> Result<PlatformResponse, SendError> {
        println!("[bot -> {}] {}", action.chat_id, action.text);
        Ok(PlatformResponse::default())
    }
}

/// Splits an optional `<user>:` prefix off an input line.
fn parse_line(line: &str) -> (UserId, &str) {
    if let Some((user, text)) = line.split_once(':')
        && let Ok(user) = user.trim().parse()
    {
        return (user, text.trim());
    }
    (1, line.trim())
}

// ============================================================================
// Handlers
// ============================================================================

async fn start(_turn: Turn) -> Step {
    Step::goto("AWAITING_NAME", ContextData::new()).reply("Welcome! What is your name?")
}

async fn cancel(turn: Turn) -> Step {
    match turn.state {
        Some(_) => Step::complete().reply("Registration cancelled."),
        None => Step::stay().reply("Nothing to cancel."),
    }
}

async fn awaiting_name(turn: Turn) -> Step {
    let name = turn.text().trim();
    if name.is_empty() || name.starts_with('/') {
        return Step::reject("Please send your name as plain text.");
    }
    let context = turn.context_with("name", name);
    Step::goto("AWAITING_AGE", context).reply(format!("Nice to meet you, {name}. How old are you?"))
}

async fn awaiting_age(turn: Turn) -> Step {
    let Ok(age) = turn.text().trim().parse::<u8>() else {
        return Step::reject("Age must be a number.");
    };
    let name: String = turn.get("name").unwrap_or_default();
    info!(user_id = turn.user_id(), %name, age, "Registration completed");
    Step::complete().reply(format!("Registered {name}, age {age}. Thanks!"))
}

#[derive(Parser, Debug)]
#[command(name = "/echo", about = "Repeat a message")]
struct Echo {
    /// How many times to repeat.
    #[arg(short, long, default_value_t = 1)]
    times: usize,
    /// Words to repeat.
    words: Vec<String>,
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let runtime = CourierRuntime::builder()
        .platform_client(Arc::new(ConsoleClient))
        .command("start", start)
        .global_command("cancel", cancel)
        .command(
            "echo",
            typed(|_turn: Turn, echo: CommandArgs<Echo>| async move {
                let line = echo.words.join(" ");
                Step::stay().reply(vec![line; echo.times.max(1)].join("\n"))
            }),
        )
        .state("AWAITING_NAME", awaiting_name)
        .state("AWAITING_AGE", awaiting_age)
        .fallback(|_turn: Turn| async { Step::stay().reply("Send /start to register.") })
        .build()
        .await?;

    let (tx, source) = ChannelSource::new(64);

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut next_id: u64 = 1;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    let (user_id, text) = parse_line(&line);
                    if tx.send(Event::text(next_id, user_id, text)).await.is_err() {
                        break;
                    }
                    next_id += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read stdin: {e}");
                    break;
                }
            }
        }
    });

    runtime.run(Arc::new(source)).await?;
    Ok(())
}
