//! Parser for the `!`-prefixed interactive commands.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Help,
    Who,
    Connect,
    Quit,
    Disconnect,
    Show,
    Shot,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Invalid command {0}.")]
    Unknown(String),
}

/// Split a typed line into a verb and its optional trimmed argument.
/// Verbs are case-insensitive; whatever follows the first whitespace run
/// is the argument.
pub fn parse(line: &str) -> Result<(Verb, Option<&str>), CommandError> {
    let s = line.trim();
    let (verb, rest) = match s.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (s, ""),
    };

    let verb = match verb.to_ascii_lowercase().as_str() {
        "!help"       => Verb::Help,
        "!who"        => Verb::Who,
        "!connect"    => Verb::Connect,
        "!quit"       => Verb::Quit,
        "!disconnect" => Verb::Disconnect,
        "!show"       => Verb::Show,
        "!shot"       => Verb::Shot,
        _ => return Err(CommandError::Unknown(verb.to_string())),
    };

    Ok((verb, (!rest.is_empty()).then_some(rest)))
}
