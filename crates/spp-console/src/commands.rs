//! Console command parsing

use thiserror::Error;

/// Which device a `connect` refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// 1-based position in the `devices` listing
    Index(usize),
    /// Literal device address
    Address(String),
}

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Scan,
    Stop,
    Devices,
    Connect(Target),
    Disconnect,
    Send(String),
    Status,
    Settings,
    Help,
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command `{0}` (type `help`)")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parse a line; blank lines yield `None`
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim_start().trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    // Only the one separator after the word is dropped; `send` keeps the rest verbatim
    let (word, raw) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = raw.trim();

    let command = match word.to_lowercase().as_str() {
        "scan" => Command::Scan,
        "stop" => Command::Stop,
        "devices" | "ls" => Command::Devices,
        "connect" | "c" => {
            if rest.is_empty() {
                return Err(CommandError::Usage("connect <address|index>"));
            }
            match rest.parse::<usize>() {
                Ok(0) => return Err(CommandError::Usage("connect <address|index>")),
                Ok(index) => Command::Connect(Target::Index(index)),
                Err(_) => Command::Connect(Target::Address(rest.to_uppercase())),
            }
        }
        "disconnect" | "dc" => Command::Disconnect,
        // An empty line is a valid payload
        "send" | "s" => Command::Send(raw.to_string()),
        "status" => Command::Status,
        "settings" => Command::Settings,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

pub const HELP: &str = "\
commands:
  scan                      discover nearby devices
  stop                      stop discovery
  devices                   list discovered devices
  connect <address|index>   open a serial link
  disconnect                close the link
  send <text>               send one line
  status                    show session state
  settings                  open system settings
  quit                      exit";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_commands() {
        assert_eq!(parse("scan"), Ok(Some(Command::Scan)));
        assert_eq!(parse("  STOP "), Ok(Some(Command::Stop)));
        assert_eq!(parse("q"), Ok(Some(Command::Quit)));
        assert_eq!(parse(""), Ok(None));
        assert_eq!(parse("   "), Ok(None));
    }

    #[test]
    fn test_parse_connect_targets() {
        assert_eq!(
            parse("connect 2"),
            Ok(Some(Command::Connect(Target::Index(2))))
        );
        assert_eq!(
            parse("connect 98:d3:31:f5:12:34"),
            Ok(Some(Command::Connect(Target::Address(
                "98:D3:31:F5:12:34".into()
            ))))
        );
        assert!(matches!(parse("connect"), Err(CommandError::Usage(_))));
        assert!(matches!(parse("connect 0"), Err(CommandError::Usage(_))));
    }

    #[test]
    fn test_parse_send_keeps_text() {
        assert_eq!(
            parse("send AT+NAME=bt  serial"),
            Ok(Some(Command::Send("AT+NAME=bt  serial".into())))
        );
        assert_eq!(parse("send"), Ok(Some(Command::Send(String::new()))));
        assert_eq!(parse("send AT  "), Ok(Some(Command::Send("AT  ".into()))));
        assert_eq!(parse("send  x\r"), Ok(Some(Command::Send(" x".into()))));
        assert_eq!(parse("stop  "), Ok(Some(Command::Stop)));
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(
            parse("frobnicate now"),
            Err(CommandError::Unknown("frobnicate".into()))
        );
    }
}
