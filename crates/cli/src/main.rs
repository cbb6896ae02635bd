// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;
use tracing::error;

#[derive(Parser)]
#[command(name = "codexgate", version, about = "Telegram supervisor for Codex CLI sessions.")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "CONFIG_PATH", default_value = "config.toml")]
    config: PathBuf,
}

fn main() {
    codexgate::run::init_tracing();
    let cli = Cli::parse();

    if let Err(e) = codexgate::run::run(&cli.config) {
        error!("启动失败：{e:#}");
        std::process::exit(1);
    }
}
