// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

/// Commands understood by the bot adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Stop,
    Status,
    Retry,
    New,
    Help,
    Whoami,
    Session,
    LastResult,
}

/// A parsed `/command` with its optional payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub kind: CommandType,
    pub payload: Option<String>,
}

/// Parse a `/command [payload]` message. Returns `None` for plain text
/// (handled as an implicit `/new`) and for unknown commands.
pub fn parse_command(text: &str) -> Option<ParsedCommand> {
    let text = text.trim();
    if !text.starts_with('/') {
        return None;
    }
    let mut parts = text.splitn(2, char::is_whitespace);
    let head = parts.next()?;
    let payload = parts
        .next()
        .map(str::trim)
        .filter(|rest| !rest.is_empty())
        .map(str::to_owned);
    let kind = match head[1..].to_lowercase().as_str() {
        "stop" => CommandType::Stop,
        "status" => CommandType::Status,
        "retry" => CommandType::Retry,
        "new" => CommandType::New,
        "help" => CommandType::Help,
        "whoami" => CommandType::Whoami,
        "session" => CommandType::Session,
        "lastresult" => CommandType::LastResult,
        _ => return None,
    };
    Some(ParsedCommand { kind, payload })
}

#[cfg(test)]
#[path = "commands_tests.rs"]
mod tests;
