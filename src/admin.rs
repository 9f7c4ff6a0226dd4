//! Operator command parsing
//!
//! Commands arrive as text lines, optionally prefixed with `!` the way chat
//! commands are written.

use thiserror::Error;

const PREFIX: char = '!';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Load(String),
    Unload(String),
    /// Unload, wait for reclamation, load again.
    Reload(String),
    List,
    Sweep,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command `{0}`; try `help`")]
    Unknown(String),
    #[error("`{0}` expects a unit name")]
    MissingArgument(&'static str),
    #[error("`{command}` takes at most one argument, got `{extra}`")]
    UnexpectedArgument { command: &'static str, extra: String },
}

impl AdminCommand {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        let line = line.strip_prefix(PREFIX).unwrap_or(line);
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err(ParseError::Empty);
        };
        let verb = verb.to_ascii_lowercase();

        let command = match verb.as_str() {
            "load" => Self::Load(required(&mut words, "load")?),
            "unload" => Self::Unload(required(&mut words, "unload")?),
            "reload" => Self::Reload(required(&mut words, "reload")?),
            "list" | "ls" => Self::List,
            "sweep" | "gc" => Self::Sweep,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => return Err(ParseError::Unknown(verb)),
        };

        if let Some(extra) = words.next() {
            return Err(ParseError::UnexpectedArgument {
                command: command.verb(),
                extra: extra.to_string(),
            });
        }
        Ok(command)
    }

    #[must_use]
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Load(_) => "load",
            Self::Unload(_) => "unload",
            Self::Reload(_) => "reload",
            Self::List => "list",
            Self::Sweep => "sweep",
            Self::Help => "help",
            Self::Quit => "quit",
        }
    }

    #[must_use]
    pub fn usage() -> &'static str {
        "Available commands:\n  \
         load <unit>    - Load a unit and activate its modules\n  \
         unload <unit>  - Unload a unit\n  \
         reload <unit>  - Unload, wait for reclamation, load again\n  \
         list           - Show loaded and unloading units\n  \
         sweep          - Check unloading units for reclamation\n  \
         help           - Show this message\n  \
         quit           - Unload everything and exit"
    }
}

fn required<'a>(
    words: &mut impl Iterator<Item = &'a str>,
    command: &'static str,
) -> Result<String, ParseError> {
    words
        .next()
        .map(str::to_string)
        .ok_or(ParseError::MissingArgument(command))
}
