// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TOML + environment configuration: a `[base]` table of operational
//! knobs and an array of `[[bots]]`. String values may embed
//! `${ENV:VAR}` placeholders; every base key also has an upper-cased
//! environment alias consulted as its default.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use regex::Regex;

/// How the prompt reaches the child: on stdin (default) or as a final
/// positional argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Stdin,
    Arg,
}

impl InputMode {
    fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("arg") {
            Self::Arg
        } else {
            Self::Stdin
        }
    }
}

/// What to do with agent reasoning events from the rollout stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningMode {
    Hidden,
    Summary,
}

impl ReasoningMode {
    fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("summary") {
            Self::Summary
        } else {
            Self::Hidden
        }
    }
}

/// Shared `[base]` knobs.
#[derive(Debug, Clone)]
pub struct BaseConfig {
    pub db_path: PathBuf,
    pub lock_path: PathBuf,
    pub codex_cli_cmd: String,
    pub codex_cli_args: Vec<String>,
    pub codex_cli_input_mode: InputMode,
    pub codex_cli_approvals_mode: Option<String>,
    pub codex_cli_skip_git_check: bool,
    pub codex_cli_use_pty: bool,
    pub stream_flush_interval: f64,
    pub stream_include_stderr: bool,
    pub progress_tick_interval: f64,
    pub run_timeout_seconds: f64,
    pub context_compaction_idle_timeout_seconds: f64,
    pub no_output_idle_timeout_seconds: f64,
    pub final_result_idle_timeout_seconds: f64,
    pub jsonl_sync_interval_seconds: f64,
    pub jsonl_stream_events: bool,
    pub jsonl_reasoning_throttle_seconds: f64,
    pub jsonl_reasoning_mode: ReasoningMode,
    pub message_chunk_limit: usize,
}

/// One `[[bots]]` entry after validation.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub name: String,
    pub token: String,
    pub allowed_user_ids: BTreeSet<i64>,
    pub resume_id: String,
    pub codex_workdir: String,
    /// Overrides `base.codex_cli_args` when present.
    pub codex_cli_args: Option<Vec<String>>,
}

/// Fully loaded application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base: BaseConfig,
    pub bots: Vec<BotConfig>,
}

/// Load outcome: the config plus non-fatal per-bot errors.
#[derive(Debug)]
pub struct ConfigLoadResult {
    pub app_config: AppConfig,
    pub errors: Vec<String>,
}

/// The flattened per-bot runtime view consumed by the driver,
/// orchestrator, and adapter.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub telegram_bot_token: String,
    pub telegram_allowed_user_ids: BTreeSet<i64>,
    pub codex_cli_cmd: String,
    pub codex_cli_args: Vec<String>,
    pub codex_cli_input_mode: InputMode,
    pub codex_cli_resume_id: Option<String>,
    pub codex_cli_approvals_mode: Option<String>,
    pub codex_cli_skip_git_check: bool,
    pub codex_cli_use_pty: bool,
    pub codex_workdir: String,
    pub stream_flush_interval: f64,
    pub stream_include_stderr: bool,
    pub progress_tick_interval: f64,
    pub run_timeout_seconds: f64,
    pub context_compaction_idle_timeout_seconds: f64,
    pub no_output_idle_timeout_seconds: f64,
    pub final_result_idle_timeout_seconds: f64,
    pub jsonl_sync_interval_seconds: f64,
    pub jsonl_stream_events: bool,
    pub jsonl_reasoning_throttle_seconds: f64,
    pub jsonl_reasoning_mode: ReasoningMode,
    pub message_chunk_limit: usize,
}

/// Merge the base knobs with one bot's overrides.
pub fn build_runtime_config(base: &BaseConfig, bot: &BotConfig) -> RuntimeConfig {
    let codex_cli_args =
        bot.codex_cli_args.clone().unwrap_or_else(|| base.codex_cli_args.clone());
    RuntimeConfig {
        telegram_bot_token: bot.token.clone(),
        telegram_allowed_user_ids: bot.allowed_user_ids.clone(),
        codex_cli_cmd: base.codex_cli_cmd.clone(),
        codex_cli_args,
        codex_cli_input_mode: base.codex_cli_input_mode,
        codex_cli_resume_id: Some(bot.resume_id.clone()),
        codex_cli_approvals_mode: base.codex_cli_approvals_mode.clone(),
        codex_cli_skip_git_check: base.codex_cli_skip_git_check,
        codex_cli_use_pty: base.codex_cli_use_pty,
        codex_workdir: bot.codex_workdir.clone(),
        stream_flush_interval: base.stream_flush_interval,
        stream_include_stderr: base.stream_include_stderr,
        progress_tick_interval: base.progress_tick_interval,
        run_timeout_seconds: base.run_timeout_seconds,
        context_compaction_idle_timeout_seconds: base.context_compaction_idle_timeout_seconds,
        no_output_idle_timeout_seconds: base.no_output_idle_timeout_seconds,
        final_result_idle_timeout_seconds: base.final_result_idle_timeout_seconds,
        jsonl_sync_interval_seconds: base.jsonl_sync_interval_seconds,
        jsonl_stream_events: base.jsonl_stream_events,
        jsonl_reasoning_throttle_seconds: base.jsonl_reasoning_throttle_seconds,
        jsonl_reasoning_mode: base.jsonl_reasoning_mode,
        message_chunk_limit: base.message_chunk_limit,
    }
}

fn placeholder_pattern() -> anyhow::Result<Regex> {
    Regex::new(r"\$\{ENV:([A-Z0-9_]+)\}").context("placeholder pattern")
}

/// Substitute every `${ENV:VAR}` in `value` from `env`. Unresolved
/// placeholders are an error.
pub fn resolve_env_placeholders(
    value: &str,
    env: &HashMap<String, String>,
) -> anyhow::Result<String> {
    let pattern = placeholder_pattern()?;
    let mut out = String::new();
    let mut last = 0;
    for caps in pattern.captures_iter(value) {
        let whole = match caps.get(0) {
            Some(m) => m,
            None => continue,
        };
        let key = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let replacement = env.get(key).ok_or_else(|| anyhow::anyhow!("缺少环境变量 {key}"))?;
        out.push_str(&value[last..whole.start()]);
        out.push_str(replacement);
        last = whole.end();
    }
    out.push_str(&value[last..]);
    Ok(out)
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_int_set(value: &str) -> anyhow::Result<BTreeSet<i64>> {
    let mut out = BTreeSet::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        out.insert(part.parse::<i64>().with_context(|| format!("无效的用户 ID: {part}"))?);
    }
    Ok(out)
}

fn parse_optional(value: &str) -> Option<String> {
    let text = value.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Resolve a TOML value into a plain string, substituting placeholders
/// in string values.
fn resolve_value(value: &toml::Value, env: &HashMap<String, String>) -> anyhow::Result<String> {
    match value {
        toml::Value::String(s) => resolve_env_placeholders(s, env),
        toml::Value::Integer(n) => Ok(n.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        other => Ok(other.to_string()),
    }
}

/// Split a user-supplied argument string on whitespace. TOML arrays are
/// the first-class form; strings are a convenience.
fn split_args(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_owned).collect()
}

fn resolve_args_value(
    value: &toml::Value,
    env: &HashMap<String, String>,
) -> anyhow::Result<Vec<String>> {
    match value {
        toml::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_value(item, env)?);
            }
            Ok(out)
        }
        other => Ok(split_args(&resolve_value(other, env)?)),
    }
}

/// Keyed lookup over `[base]` with the env-alias fallback: the TOML
/// value wins, then `env[KEY.upper()]`, then the built-in default.
struct BaseLookup<'a> {
    table: &'a toml::value::Table,
    env: &'a HashMap<String, String>,
}

impl BaseLookup<'_> {
    fn get(&self, key: &str, default: &str) -> anyhow::Result<String> {
        match self.table.get(key) {
            Some(value) => resolve_value(value, self.env),
            None => match self.env.get(&key.to_uppercase()) {
                Some(value) => resolve_env_placeholders(value, self.env),
                None => Ok(default.to_string()),
            },
        }
    }

    fn get_bool(&self, key: &str, default: &str) -> anyhow::Result<bool> {
        if let Some(toml::Value::Boolean(b)) = self.table.get(key) {
            return Ok(*b);
        }
        Ok(parse_bool(&self.get(key, default)?))
    }

    fn get_f64(&self, key: &str, default: &str) -> anyhow::Result<f64> {
        let raw = self.get(key, default)?;
        raw.trim().parse::<f64>().with_context(|| format!("{key} 不是数字: {raw}"))
    }

    fn get_usize(&self, key: &str, default: &str) -> anyhow::Result<usize> {
        let raw = self.get(key, default)?;
        raw.trim().parse::<usize>().with_context(|| format!("{key} 不是整数: {raw}"))
    }
}

fn build_base_config(
    env: &HashMap<String, String>,
    base_table: &toml::value::Table,
) -> anyhow::Result<BaseConfig> {
    let lookup = BaseLookup { table: base_table, env };

    let db_path = PathBuf::from(lookup.get("db_path", "data/app.db")?);
    let default_lock = db_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join("app.lock");
    let lock_path = match base_table.get("lock_path") {
        Some(value) => PathBuf::from(resolve_value(value, env)?),
        None => match env.get("LOCK_PATH") {
            Some(value) => PathBuf::from(resolve_env_placeholders(value, env)?),
            None => default_lock,
        },
    };

    // An empty args list falls back to the env alias, like an absent key.
    let codex_cli_args = match base_table.get("codex_cli_args") {
        Some(value) => {
            let args = resolve_args_value(value, env)?;
            if args.is_empty() {
                split_args(env.get("CODEX_CLI_ARGS").map(String::as_str).unwrap_or(""))
            } else {
                args
            }
        }
        None => split_args(env.get("CODEX_CLI_ARGS").map(String::as_str).unwrap_or("")),
    };

    Ok(BaseConfig {
        db_path,
        lock_path,
        codex_cli_cmd: lookup.get("codex_cli_cmd", "codex")?,
        codex_cli_args,
        codex_cli_input_mode: InputMode::parse(&lookup.get("codex_cli_input_mode", "stdin")?),
        codex_cli_approvals_mode: parse_optional(&lookup.get("codex_cli_approvals_mode", "3")?),
        codex_cli_skip_git_check: lookup.get_bool("codex_cli_skip_git_check", "1")?,
        codex_cli_use_pty: lookup.get_bool("codex_cli_use_pty", "0")?,
        stream_flush_interval: lookup.get_f64("stream_flush_interval", "1.5")?,
        stream_include_stderr: lookup.get_bool("stream_include_stderr", "0")?,
        progress_tick_interval: lookup.get_f64("progress_tick_interval", "15")?,
        run_timeout_seconds: lookup.get_f64("run_timeout_seconds", "900")?,
        context_compaction_idle_timeout_seconds: lookup
            .get_f64("context_compaction_idle_timeout_seconds", "60")?,
        no_output_idle_timeout_seconds: lookup.get_f64("no_output_idle_timeout_seconds", "900")?,
        final_result_idle_timeout_seconds: lookup
            .get_f64("final_result_idle_timeout_seconds", "30")?,
        jsonl_sync_interval_seconds: lookup.get_f64("jsonl_sync_interval_seconds", "3")?,
        jsonl_stream_events: lookup.get_bool("jsonl_stream_events", "1")?,
        jsonl_reasoning_throttle_seconds: lookup
            .get_f64("jsonl_reasoning_throttle_seconds", "10")?,
        jsonl_reasoning_mode: ReasoningMode::parse(&lookup.get("jsonl_reasoning_mode", "hidden")?),
        message_chunk_limit: lookup.get_usize("message_chunk_limit", "3500")?,
    })
}

fn parse_allowed_user_ids(
    value: &toml::Value,
    env: &HashMap<String, String>,
) -> anyhow::Result<BTreeSet<i64>> {
    match value {
        toml::Value::Array(items) => {
            let mut out = BTreeSet::new();
            for item in items {
                match item {
                    toml::Value::Integer(n) => {
                        out.insert(*n);
                    }
                    other => {
                        out.insert(
                            resolve_value(other, env)?
                                .trim()
                                .parse::<i64>()
                                .context("无效的用户 ID")?,
                        );
                    }
                }
            }
            Ok(out)
        }
        other => parse_int_set(&resolve_value(other, env)?),
    }
}

fn parse_bot(raw: &toml::Value, env: &HashMap<String, String>) -> anyhow::Result<BotConfig> {
    let table = raw.as_table().ok_or_else(|| anyhow::anyhow!("配置格式错误"))?;

    let get_str = |key: &str| -> anyhow::Result<String> {
        match table.get(key) {
            Some(value) => Ok(resolve_value(value, env)?.trim().to_string()),
            None => Ok(String::new()),
        }
    };

    let name = get_str("name")?;
    let token = get_str("token")?;
    let resume_id = get_str("resume_id")?;
    let codex_workdir = get_str("codex_workdir")?;
    let allowed_user_ids = match table.get("allowed_user_ids") {
        Some(value) => parse_allowed_user_ids(value, env)?,
        None => BTreeSet::new(),
    };

    let mut missing = Vec::new();
    if name.is_empty() {
        missing.push("name");
    }
    if token.is_empty() {
        missing.push("token");
    }
    if allowed_user_ids.is_empty() {
        missing.push("allowed_user_ids");
    }
    if resume_id.is_empty() {
        missing.push("resume_id");
    }
    if codex_workdir.is_empty() {
        missing.push("codex_workdir");
    }
    if !missing.is_empty() {
        bail!("缺少字段: {}", missing.join(", "));
    }

    let codex_cli_args = match table.get("codex_cli_args") {
        Some(value) => Some(resolve_args_value(value, env)?),
        None => None,
    };

    Ok(BotConfig { name, token, allowed_user_ids, resume_id, codex_workdir, codex_cli_args })
}

/// Parse a config file against the given environment. Per-bot problems
/// are collected into `errors`; the bot is skipped.
pub fn load_toml_config(
    path: &Path,
    env: &HashMap<String, String>,
) -> anyhow::Result<ConfigLoadResult> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let data: toml::Value = raw.parse().context("parse config TOML")?;
    let empty = toml::value::Table::new();
    let base_table = data.get("base").and_then(|v| v.as_table()).unwrap_or(&empty);
    let bots_data = data.get("bots").and_then(|v| v.as_array()).cloned().unwrap_or_default();

    let base = build_base_config(env, base_table)?;
    let mut errors = Vec::new();
    let mut bots = Vec::new();
    for (idx, raw_bot) in bots_data.iter().enumerate() {
        match parse_bot(raw_bot, env) {
            Ok(bot) => bots.push(bot),
            Err(err) => errors.push(format!("bots[{idx}] {err}")),
        }
    }

    Ok(ConfigLoadResult { app_config: AppConfig { base, bots }, errors })
}

fn process_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

/// Load configuration: `.env` preload, then the TOML file when present,
/// else the legacy single-bot environment fallback.
pub fn load_app_config(path: &Path) -> anyhow::Result<AppConfig> {
    dotenv::dotenv().ok();
    let env = process_env();

    if path.exists() {
        let result = load_toml_config(path, &env)?;
        for err in &result.errors {
            tracing::warn!("配置警告: {err}");
        }
        if result.app_config.bots.is_empty() {
            bail!("{} 未配置可用的 bot", path.display());
        }
        return Ok(result.app_config);
    }

    let token = env.get("TELEGRAM_BOT_TOKEN").map(|s| s.trim().to_string()).unwrap_or_default();
    let allowed_user_ids =
        parse_int_set(env.get("TELEGRAM_ALLOWED_USER_IDS").map(String::as_str).unwrap_or(""))?;
    let resume_id =
        env.get("CODEX_CLI_RESUME_ID").and_then(|s| parse_optional(s)).unwrap_or_default();
    let codex_workdir = match env.get("CODEX_WORKDIR") {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?.display().to_string(),
    };
    if token.is_empty() {
        bail!("TELEGRAM_BOT_TOKEN 未配置");
    }
    if allowed_user_ids.is_empty() {
        bail!("TELEGRAM_ALLOWED_USER_IDS 未配置");
    }
    if resume_id.is_empty() {
        bail!("CODEX_CLI_RESUME_ID 未配置");
    }

    let base = build_base_config(&env, &toml::value::Table::new())?;
    let bot = BotConfig {
        name: "default".to_string(),
        token,
        allowed_user_ids,
        resume_id,
        codex_workdir,
        codex_cli_args: None,
    };
    Ok(AppConfig { base, bots: vec![bot] })
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
