//! Transport-independent command handling.
//!
//! A [`Command`] is a verb plus ordered string arguments; a [`Reply`] is the
//! value sent back. [`CommandHandler`] maps the `PING`, `INCR` and `GET` verbs
//! onto a [`KeyedGenerator`]. Malformed or failing commands always produce a
//! [`Reply::Error`], so a transport can keep the connection open.

use crate::KeyedGenerator;

/// Acknowledgement returned by `PING`.
pub const PONG: &str = "PONG";
/// Error message for a wrong argument count.
pub const INVALID_ARGUMENTS: &str = "invalid arguments";
/// Error message for an unknown verb.
pub const UNSUPPORTED_METHOD: &str = "unsupported method.";

/// The verbs understood by [`CommandHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Liveness probe.
    Ping,
    /// Allocate the next identifier for a key.
    Incr,
    /// Read the last issued identifier for a key.
    Get,
}

impl Verb {
    /// Parses a verb, ignoring ASCII case. Returns `None` for unknown verbs.
    pub fn parse(verb: &str) -> Option<Self> {
        [Self::Ping, Self::Incr, Self::Get]
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(verb))
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Incr => "INCR",
            Self::Get => "GET",
        }
    }
}

impl core::fmt::Display for Verb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Command {
    pub verb: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn new<V, I, A>(verb: V, args: I) -> Self
    where
        V: Into<String>,
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            verb: verb.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The argument of a single-key command, or `None` if there is not
    /// exactly one argument.
    fn single_key(&self) -> Option<&str> {
        match self.args.as_slice() {
            [key] => Some(key),
            _ => None,
        }
    }
}

/// The reply to a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A fixed acknowledgement token.
    Status(String),
    /// An integer value.
    Integer(i64),
    /// A string value.
    Text(String),
    /// A failed command; the connection stays usable.
    Error(String),
}

impl Reply {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Maps commands onto a [`KeyedGenerator`].
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use genid::{Command, CommandHandler, MemoryCounterStore, Registry, Reply};
///
/// let registry = Registry::new(Arc::new(MemoryCounterStore::new()), 10).unwrap();
/// registry.enable_keys(["order"]).unwrap();
/// let handler = CommandHandler::new(registry);
///
/// assert_eq!(handler.handle(&Command::new("incr", ["order"])), Reply::Integer(1));
/// assert_eq!(handler.handle(&Command::new("GET", ["order"])), Reply::Text("1".into()));
/// assert_eq!(
///     handler.handle(&Command::new("FOO", Vec::<String>::new())),
///     Reply::Error("unsupported method.".into())
/// );
/// ```
#[derive(Debug)]
pub struct CommandHandler<G> {
    generator: G,
}

impl<G: KeyedGenerator> CommandHandler<G> {
    pub const fn new(generator: G) -> Self {
        Self { generator }
    }

    pub const fn generator(&self) -> &G {
        &self.generator
    }

    /// Executes `command` and encodes the outcome. Never panics on input.
    pub fn handle(&self, command: &Command) -> Reply {
        let Some(verb) = Verb::parse(&command.verb) else {
            return Reply::error(UNSUPPORTED_METHOD);
        };
        match verb {
            Verb::Ping => Reply::Status(PONG.to_owned()),
            Verb::Incr => match command.single_key() {
                None => Reply::error(INVALID_ARGUMENTS),
                Some(key) => match self.generator.next(key) {
                    Ok(id) => Reply::Integer(id),
                    Err(e) => Reply::Error(e.to_string()),
                },
            },
            Verb::Get => match command.single_key() {
                None => Reply::error(INVALID_ARGUMENTS),
                Some(key) => match self.generator.current(key) {
                    Ok(id) => Reply::Text(id.to_string()),
                    Err(e) => Reply::Error(e.to_string()),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FlakyStore;
    use crate::{MemoryCounterStore, Registry};
    use std::sync::Arc;

    fn handler() -> CommandHandler<Registry<MemoryCounterStore>> {
        let registry = Registry::new(Arc::new(MemoryCounterStore::new()), 100).unwrap();
        registry.enable_keys(["order"]).unwrap();
        CommandHandler::new(registry)
    }

    fn cmd(verb: &str, args: &[&str]) -> Command {
        Command::new(verb, args.iter().copied())
    }

    #[test]
    fn verbs_parse_case_insensitively() {
        assert_eq!(Verb::parse("ping"), Some(Verb::Ping));
        assert_eq!(Verb::parse("InCr"), Some(Verb::Incr));
        assert_eq!(Verb::parse("GET"), Some(Verb::Get));
        assert_eq!(Verb::parse("FOO"), None);
        assert_eq!(Verb::parse(""), None);
    }

    #[test]
    fn ping_replies_pong() {
        let handler = handler();
        assert_eq!(handler.handle(&cmd("PING", &[])), Reply::Status("PONG".into()));
        assert_eq!(handler.handle(&cmd("ping", &["x"])), Reply::Status("PONG".into()));
    }

    #[test]
    fn incr_returns_integer_and_get_returns_text() {
        let handler = handler();
        assert_eq!(handler.handle(&cmd("INCR", &["order"])), Reply::Integer(1));
        assert_eq!(handler.handle(&cmd("incr", &["order"])), Reply::Integer(2));
        assert_eq!(handler.handle(&cmd("GET", &["order"])), Reply::Text("2".into()));
        assert_eq!(handler.handle(&cmd("get", &["order"])), Reply::Text("2".into()));
    }

    #[test]
    fn wrong_argument_count_is_invalid() {
        let handler = handler();
        let invalid = Reply::Error(INVALID_ARGUMENTS.into());
        assert_eq!(handler.handle(&cmd("INCR", &[])), invalid);
        assert_eq!(handler.handle(&cmd("INCR", &["order", "user"])), invalid);
        assert_eq!(handler.handle(&cmd("GET", &[])), invalid);
        assert_eq!(handler.handle(&cmd("GET", &["a", "b"])), invalid);
        // Rejected commands allocate nothing.
        assert_eq!(handler.handle(&cmd("GET", &["order"])), Reply::Text("0".into()));
    }

    #[test]
    fn unknown_verb_is_unsupported() {
        let handler = handler();
        assert_eq!(
            handler.handle(&cmd("FOO", &["order"])),
            Reply::Error("unsupported method.".into())
        );
    }

    #[test]
    fn generator_errors_become_error_replies() {
        let handler = handler();
        let reply = handler.handle(&cmd("INCR", &["missing"]));
        assert_eq!(reply, Reply::Error("key \"missing\" does not exist".into()));
        assert!(handler.handle(&cmd("GET", &["missing"])).is_error());
    }

    #[test]
    fn store_failures_become_error_replies() {
        let store = Arc::new(FlakyStore::new());
        let registry = Registry::new(Arc::clone(&store), 1).unwrap();
        registry.enable_keys(["order"]).unwrap();
        let handler = CommandHandler::new(registry);

        assert_eq!(handler.handle(&cmd("INCR", &["order"])), Reply::Integer(1));
        store.set_unreachable(true);
        assert_eq!(
            handler.handle(&cmd("INCR", &["order"])),
            Reply::Error("store unreachable".into())
        );
        store.set_unreachable(false);
        assert_eq!(handler.handle(&cmd("INCR", &["order"])), Reply::Integer(2));
    }
}
