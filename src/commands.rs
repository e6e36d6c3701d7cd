// Parses terminal input into session commands

use thiserror::Error;

/// A command typed at the prompt. Message numbers are shown 1-based and
/// converted to 0-based indices here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Generate(String),
    Regenerate,
    RegenerateAt(usize),
    Edit(usize),
    Cancel,
    History,
    New,
    List,
    Open(String),
    Delete(String),
    Models,
    Help,
    Quit,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command: /{0} (try /help)")]
    Unknown(String),

    #[error("/{command} expects a message number, got '{got}'")]
    BadNumber { command: &'static str, got: String },

    #[error("/{0} needs an argument")]
    MissingArgument(&'static str),
}

pub const HELP: &str = "\
commands:
  <text>         send a prompt
  /regen [N]     regenerate the last response, or response N
  /edit N        drop message N and everything after it, returning its prompt
  /cancel        stop the current response
  /history       show the conversation
  /new           start a new conversation
  /list          list saved conversations
  /open ID       open a saved conversation
  /delete ID     delete a saved conversation
  /models        list models on the server
  /quit          exit";

/// Returns `None` for blank input.
pub fn parse_command(input: &str) -> Option<Result<Command, CommandError>> {
    let line = input.trim();
    if line.is_empty() {
        return None;
    }

    let Some(rest) = line.strip_prefix('/') else {
        return Some(Ok(Command::Generate(line.to_string())));
    };

    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

    let command = match (name, arg) {
        ("regen", None) => Ok(Command::Regenerate),
        ("regen", Some(n)) => message_index("regen", n).map(Command::RegenerateAt),
        ("edit", Some(n)) => message_index("edit", n).map(Command::Edit),
        ("edit", None) => Err(CommandError::MissingArgument("edit")),
        ("cancel", _) => Ok(Command::Cancel),
        ("history", _) => Ok(Command::History),
        ("new", _) => Ok(Command::New),
        ("list", _) => Ok(Command::List),
        ("open", Some(id)) => Ok(Command::Open(id.to_string())),
        ("open", None) => Err(CommandError::MissingArgument("open")),
        ("delete", Some(id)) => Ok(Command::Delete(id.to_string())),
        ("delete", None) => Err(CommandError::MissingArgument("delete")),
        ("models", _) => Ok(Command::Models),
        ("help", _) => Ok(Command::Help),
        ("quit", _) | ("exit", _) => Ok(Command::Quit),
        (other, _) => Err(CommandError::Unknown(other.to_string())),
    };
    Some(command)
}

fn message_index(command: &'static str, raw: &str) -> Result<usize, CommandError> {
    match raw.parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n - 1),
        _ => Err(CommandError::BadNumber {
            command,
            got: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<Command, CommandError> {
        parse_command(input).expect("non-blank input")
    }

    #[test]
    fn blank_input_is_ignored() {
        assert!(parse_command("   \n").is_none());
    }

    #[test]
    fn plain_text_is_a_prompt() {
        assert_eq!(parse("  why is the sky blue? "), Ok(Command::Generate("why is the sky blue?".into())));
    }

    #[test]
    fn numbers_are_one_based() {
        assert_eq!(parse("/regen 1"), Ok(Command::RegenerateAt(0)));
        assert_eq!(parse("/edit 3"), Ok(Command::Edit(2)));
    }

    #[test]
    fn zero_and_garbage_are_rejected() {
        assert_eq!(
            parse("/edit 0"),
            Err(CommandError::BadNumber { command: "edit", got: "0".into() })
        );
        assert!(matches!(parse("/regen two"), Err(CommandError::BadNumber { .. })));
    }

    #[test]
    fn bare_commands() {
        assert_eq!(parse("/regen"), Ok(Command::Regenerate));
        assert_eq!(parse("/cancel"), Ok(Command::Cancel));
        assert_eq!(parse("/exit"), Ok(Command::Quit));
        assert_eq!(parse("/open abc-123"), Ok(Command::Open("abc-123".into())));
        assert_eq!(parse("/delete abc-123"), Ok(Command::Delete("abc-123".into())));
    }

    #[test]
    fn missing_and_unknown() {
        assert_eq!(parse("/edit"), Err(CommandError::MissingArgument("edit")));
        assert_eq!(parse("/frobnicate"), Err(CommandError::Unknown("frobnicate".into())));
    }
}
