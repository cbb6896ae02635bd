// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::io::Write;

use super::{
    build_runtime_config, load_app_config, load_toml_config, resolve_env_placeholders, InputMode,
    ReasoningMode,
};

fn env_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn write_config(dir: &std::path::Path, content: &str) -> anyhow::Result<std::path::PathBuf> {
    let path = dir.join("config.toml");
    let mut file = std::fs::File::create(&path)?;
    file.write_all(content.as_bytes())?;
    Ok(path)
}

#[test]
fn resolves_env_placeholders() -> anyhow::Result<()> {
    let env = env_of(&[("TELEGRAM_BOT_TOKEN_1", "abc")]);
    let value = resolve_env_placeholders("${ENV:TELEGRAM_BOT_TOKEN_1}", &env)?;
    assert_eq!(value, "abc");

    let value = resolve_env_placeholders("pre-${ENV:TELEGRAM_BOT_TOKEN_1}-post", &env)?;
    assert_eq!(value, "pre-abc-post");
    Ok(())
}

#[test]
fn unresolved_placeholder_is_an_error() {
    let env = HashMap::new();
    assert!(resolve_env_placeholders("${ENV:MISSING_KEY}", &env).is_err());
}

#[test]
fn loads_valid_config() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(
        dir.path(),
        r#"
[base]
db_path = "data/app.db"

[[bots]]
name = "bot-alpha"
token = "${ENV:TELEGRAM_BOT_TOKEN_1}"
allowed_user_ids = [1, 2]
resume_id = "resume-1"
codex_workdir = "/app/project-alpha"
"#,
    )?;

    let result = load_toml_config(&path, &env_of(&[("TELEGRAM_BOT_TOKEN_1", "abc")]))?;
    assert!(result.errors.is_empty());
    assert_eq!(result.app_config.bots.len(), 1);
    let bot = &result.app_config.bots[0];
    assert_eq!(bot.token, "abc");
    assert_eq!(bot.codex_workdir, "/app/project-alpha");
    assert!(bot.allowed_user_ids.contains(&1));
    assert!(bot.allowed_user_ids.contains(&2));

    let base = &result.app_config.base;
    assert_eq!(base.codex_cli_cmd, "codex");
    assert_eq!(base.codex_cli_input_mode, InputMode::Stdin);
    assert_eq!(base.jsonl_reasoning_mode, ReasoningMode::Hidden);
    assert_eq!(base.message_chunk_limit, 3500);
    assert_eq!(base.lock_path, std::path::Path::new("data/app.lock"));
    Ok(())
}

#[test]
fn bot_with_missing_fields_is_skipped() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(
        dir.path(),
        r#"
[base]
db_path = "data/app.db"

[[bots]]
name = "bot-alpha"
token = "token"
allowed_user_ids = [1]
"#,
    )?;

    let result = load_toml_config(&path, &HashMap::new())?;
    assert!(!result.errors.is_empty());
    assert!(result.app_config.bots.is_empty());
    assert!(result.errors[0].contains("resume_id"));
    Ok(())
}

#[test]
fn unresolved_bot_placeholder_skips_that_bot() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(
        dir.path(),
        r#"
[[bots]]
name = "bot-alpha"
token = "${ENV:NOT_SET_ANYWHERE}"
allowed_user_ids = [1]
resume_id = "resume-1"
codex_workdir = "/tmp"

[[bots]]
name = "bot-beta"
token = "token"
allowed_user_ids = "3, 4"
resume_id = "resume-2"
codex_workdir = "/tmp"
"#,
    )?;

    let result = load_toml_config(&path, &HashMap::new())?;
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.app_config.bots.len(), 1);
    assert_eq!(result.app_config.bots[0].name, "bot-beta");
    assert!(result.app_config.bots[0].allowed_user_ids.contains(&3));
    Ok(())
}

#[test]
fn empty_base_args_fall_back_to_env_alias() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(
        dir.path(),
        r#"
[base]
codex_cli_args = []

[[bots]]
name = "bot-alpha"
token = "token"
allowed_user_ids = [1]
resume_id = "resume-1"
codex_workdir = "/tmp"
"#,
    )?;

    let result = load_toml_config(
        &path,
        &env_of(&[("CODEX_CLI_ARGS", "--dangerously-bypass-approvals-and-sandbox")]),
    )?;
    assert!(result.errors.is_empty());
    assert_eq!(
        result.app_config.base.codex_cli_args,
        vec!["--dangerously-bypass-approvals-and-sandbox".to_string()]
    );
    Ok(())
}

#[test]
fn bot_args_override_base_args() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(
        dir.path(),
        r#"
[base]
codex_cli_args = ["--model", "base"]

[[bots]]
name = "bot-alpha"
token = "token"
allowed_user_ids = [1]
resume_id = "resume-1"
codex_workdir = "/tmp"
codex_cli_args = ["--model", "override"]
"#,
    )?;

    let result = load_toml_config(&path, &HashMap::new())?;
    assert!(result.errors.is_empty());
    let runtime = build_runtime_config(&result.app_config.base, &result.app_config.bots[0]);
    assert_eq!(runtime.codex_cli_args, vec!["--model".to_string(), "override".to_string()]);
    assert_eq!(runtime.codex_cli_resume_id.as_deref(), Some("resume-1"));
    Ok(())
}

#[test]
#[serial_test::serial]
fn env_fallback_requires_token() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let missing = dir.path().join("no-such-config.toml");
    std::env::remove_var("TELEGRAM_BOT_TOKEN");
    std::env::remove_var("TELEGRAM_ALLOWED_USER_IDS");
    std::env::remove_var("CODEX_CLI_RESUME_ID");

    let err = match load_app_config(&missing) {
        Err(err) => err,
        Ok(_) => anyhow::bail!("expected missing token error"),
    };
    assert!(err.to_string().contains("TELEGRAM_BOT_TOKEN"));
    Ok(())
}

#[test]
#[serial_test::serial]
fn env_fallback_builds_single_bot() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let missing = dir.path().join("no-such-config.toml");
    std::env::set_var("TELEGRAM_BOT_TOKEN", "tok");
    std::env::set_var("TELEGRAM_ALLOWED_USER_IDS", "7, 8");
    std::env::set_var("CODEX_CLI_RESUME_ID", "resume-env");
    std::env::set_var("CODEX_WORKDIR", "/tmp");

    let result = load_app_config(&missing);
    std::env::remove_var("TELEGRAM_BOT_TOKEN");
    std::env::remove_var("TELEGRAM_ALLOWED_USER_IDS");
    std::env::remove_var("CODEX_CLI_RESUME_ID");
    std::env::remove_var("CODEX_WORKDIR");

    let app = result?;
    assert_eq!(app.bots.len(), 1);
    let bot = &app.bots[0];
    assert_eq!(bot.name, "default");
    assert_eq!(bot.token, "tok");
    assert_eq!(bot.resume_id, "resume-env");
    assert!(bot.allowed_user_ids.contains(&7) && bot.allowed_user_ids.contains(&8));
    Ok(())
}
