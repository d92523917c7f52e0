//! Operator command lines: `<station> <set|start|stop|setpoint> [value]`

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub const USAGE: &str = "<station> <set|start|stop|setpoint> [value]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    /// Override the drawn current until the next sample
    Set(i64),
    Start,
    Stop,
    Setpoint(i64),
}

impl CommandAction {
    pub fn name(&self) -> &'static str {
        match self {
            CommandAction::Set(_) => "set",
            CommandAction::Start => "start",
            CommandAction::Stop => "stop",
            CommandAction::Setpoint(_) => "setpoint",
        }
    }
}

/// A parsed command addressed to a station by its 1-based index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub station: usize,
    pub action: CommandAction,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Empty command, expected {}", USAGE)]
    Empty,

    #[error("Invalid station index '{0}'")]
    InvalidStation(String),

    #[error("Missing action, expected one of set, start, stop, setpoint")]
    MissingAction,

    #[error("Unknown action '{0}', expected one of set, start, stop, setpoint")]
    UnknownAction(String),

    #[error("Action {action} requires a value")]
    MissingValue { action: &'static str },

    #[error("Invalid value '{value}' for {action}")]
    InvalidValue { action: &'static str, value: String },

    #[error("Unexpected argument '{0}'")]
    UnexpectedArgument(String),
}

fn parse_value(action: &'static str, token: Option<&str>) -> Result<i64, CommandError> {
    let token = token.ok_or(CommandError::MissingValue { action })?;
    token.parse().map_err(|_| CommandError::InvalidValue {
        action,
        value: token.to_string(),
    })
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut tokens = line.split_whitespace();

        let station_token = tokens.next().ok_or(CommandError::Empty)?;
        let station = station_token
            .parse::<usize>()
            .map_err(|_| CommandError::InvalidStation(station_token.to_string()))?;

        let action_token = tokens.next().ok_or(CommandError::MissingAction)?;
        let action = match action_token.to_ascii_lowercase().as_str() {
            "set" => CommandAction::Set(parse_value("set", tokens.next())?),
            "setpoint" => CommandAction::Setpoint(parse_value("setpoint", tokens.next())?),
            "start" => CommandAction::Start,
            "stop" => CommandAction::Stop,
            _ => return Err(CommandError::UnknownAction(action_token.to_string())),
        };

        if let Some(extra) = tokens.next() {
            return Err(CommandError::UnexpectedArgument(extra.to_string()));
        }

        Ok(Command { station, action })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.action {
            CommandAction::Set(value) | CommandAction::Setpoint(value) => {
                write!(f, "{} {} {}", self.station, self.action.name(), value)
            }
            CommandAction::Start | CommandAction::Stop => {
                write!(f, "{} {}", self.station, self.action.name())
            }
        }
    }
}
