//! Command token parsing and typed commands.
//!
//! Commands are matched on the first whitespace-separated token of a text
//! payload. A leading `/` and a trailing `@botname` are stripped, and the
//! rest must equal the registered name exactly (case-sensitive):
//!
//! | Input | Token |
//! |---|---|
//! | `/start` | `start` |
//! | `/start@courier_bot payload` | `start` |
//! | `help me` | `help` |
//!
//! With the `command` feature, a handler can declare a clap [`Parser`]
//! type and receive its arguments already parsed:
//!
//! ```rust,ignore
//! use clap::Parser;
//!
//! #[derive(Parser, Clone)]
//! struct Ban {
//!     user: i64,
//!     #[arg(long)]
//!     reason: Option<String>,
//! }
//!
//! router.command("ban", typed(|_turn: Turn, ban: CommandArgs<Ban>| async move {
//!     Step::stay().reply(format!("Banned {}", ban.user))
//! }));
//! ```

/// Extracts the command name from a message text.
///
/// Returns `None` for empty input or a token that is only `/`.
pub fn parse_command(text: &str) -> Option<&str> {
    let token = text.split_whitespace().next()?;
    let token = token.strip_prefix('/').unwrap_or(token);
    let name = match token.split_once('@') {
        Some((name, _bot)) => name,
        None => token,
    };
    (!name.is_empty()).then_some(name)
}

/// Shell-like splitting of command text.
///
/// Whitespace separates arguments; single and double quotes group them;
/// backslash escapes the next character inside double quotes.
pub fn shell_split(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut single = false;
    let mut double = false;
    let mut escaped = false;

    for ch in input.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if double => escaped = true,
            '\'' if !double => {
                single = !single;
                quoted = true;
            }
            '"' if !single => {
                double = !double;
                quoted = true;
            }
            c if c.is_whitespace() && !single && !double => {
                if !current.is_empty() || quoted {
                    args.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() || quoted {
        args.push(current);
    }
    args
}

#[cfg(feature = "command")]
pub use args::{CommandArgs, typed};

#[cfg(feature = "command")]
mod args {
    use std::ops::{Deref, DerefMut};

    use clap::Parser;
    use clap::error::ErrorKind;
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use tracing::debug;

    use super::shell_split;
    use crate::step::{IntoStep, Step, StepHandler, Turn};

    /// Arguments of a typed command, parsed by clap.
    #[derive(Debug, Clone)]
    pub struct CommandArgs<T>(pub T);

    impl<T> CommandArgs<T> {
        /// Unwraps the parsed value.
        pub fn into_inner(self) -> T {
            self.0
        }
    }

    impl<T> Deref for CommandArgs<T> {
        type Target = T;

        fn deref(&self) -> &T {
            &self.0
        }
    }

    impl<T> DerefMut for CommandArgs<T> {
        fn deref_mut(&mut self) -> &mut T {
            &mut self.0
        }
    }

    /// Wraps a handler taking clap-parsed arguments.
    ///
    /// The message text is shell-split; the first token stands in for the
    /// binary name. A parse error rejects the input with clap's message,
    /// while `--help` and `--version` reply without changing the session.
    pub fn typed<T, F, Fut, R>(handler: F) -> impl StepHandler
    where
        T: Parser + Send + 'static,
        F: Fn(Turn, CommandArgs<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoStep + 'static,
    {
        move |turn: Turn| -> BoxFuture<'static, Step> {
            let args = shell_split(turn.text());
            match T::try_parse_from(&args) {
                Ok(parsed) => handler(turn, CommandArgs(parsed))
                    .map(IntoStep::into_step)
                    .boxed(),
                Err(err) => {
                    let step = match err.kind() {
                        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                            Step::stay().reply(err.to_string())
                        }
                        kind => {
                            debug!(user_id = turn.user_id(), ?kind, "Command arguments rejected");
                            Step::reject(err.to_string())
                        }
                    };
                    futures::future::ready(step).boxed()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_strips_slash_and_mention() {
        assert_eq!(parse_command("/start"), Some("start"));
        assert_eq!(parse_command("  /start@courier_bot deep-link"), Some("start"));
        assert_eq!(parse_command("help me"), Some("help"));
        assert_eq!(parse_command("/"), None);
        assert_eq!(parse_command("   "), None);
    }

    #[test]
    fn test_parse_command_is_case_sensitive() {
        assert_eq!(parse_command("/Start"), Some("Start"));
        assert_ne!(parse_command("/Start"), Some("start"));
    }

    #[test]
    fn test_shell_split_quotes() {
        assert_eq!(
            shell_split(r#"/note "buy milk" 'and eggs' now"#),
            vec!["/note", "buy milk", "and eggs", "now"]
        );
        assert_eq!(shell_split(r#"/say "a \"b\"""#), vec!["/say", r#"a "b""#]);
        assert_eq!(shell_split(r#"/set key """#), vec!["/set", "key", ""]);
        assert!(shell_split(" \t ").is_empty());
    }

    #[cfg(feature = "command")]
    mod typed_commands {
        use clap::Parser;

        use courier_core::Event;

        use super::super::*;
        use crate::step::{Step, StepHandler, Transition, Turn};

        #[derive(Parser, Clone, Debug)]
        #[command(name = "ban")]
        struct Ban {
            user: i64,
            #[arg(long)]
            reason: Option<String>,
        }

        fn ban_handler() -> impl StepHandler {
            typed(|_turn: Turn, ban: CommandArgs<Ban>| async move {
                let reason = ban.reason.clone().unwrap_or_else(|| "none".into());
                Step::stay().reply(format!("banned {} ({reason})", ban.user))
            })
        }

        #[tokio::test]
        async fn test_typed_command_parses_arguments() {
            let step = ban_handler()
                .call(Turn::new(Event::text(1, 1, r#"/ban 42 --reason "spam links""#)))
                .await;
            assert_eq!(step.reply.as_deref(), Some("banned 42 (spam links)"));
        }

        #[tokio::test]
        async fn test_typed_command_rejects_bad_arguments() {
            let step = ban_handler()
                .call(Turn::new(Event::text(1, 1, "/ban not-a-number")))
                .await;
            assert!(step.is_reject());
        }

        #[tokio::test]
        async fn test_typed_command_help_replies_without_transition() {
            let step = ban_handler()
                .call(Turn::new(Event::text(1, 1, "/ban --help")))
                .await;
            assert_eq!(step.transition, Transition::Stay(None));
            assert!(step.reply.unwrap().contains("Usage"));
        }
    }
}
