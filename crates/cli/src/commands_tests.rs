// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::{parse_command, CommandType};

#[test]
fn parses_known_commands() {
    let cmd = parse_command("/stop").map(|c| c.kind);
    assert_eq!(cmd, Some(CommandType::Stop));
    let cmd = parse_command("/LASTRESULT").map(|c| c.kind);
    assert_eq!(cmd, Some(CommandType::LastResult));
}

#[test]
fn parses_payload() -> anyhow::Result<()> {
    let cmd = parse_command("/new  deploy the fix  ")
        .ok_or_else(|| anyhow::anyhow!("expected a command"))?;
    assert_eq!(cmd.kind, CommandType::New);
    assert_eq!(cmd.payload.as_deref(), Some("deploy the fix"));
    Ok(())
}

#[test]
fn plain_text_is_not_a_command() {
    assert!(parse_command("hello there").is_none());
    assert!(parse_command("").is_none());
}

#[test]
fn unknown_commands_are_ignored() {
    assert!(parse_command("/frobnicate now").is_none());
}

#[test]
fn command_without_payload_has_none() {
    let cmd = parse_command("/new");
    assert_eq!(cmd.and_then(|c| c.payload), None);
}
