// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level supervisor: config, single-instance lock, store, and one
//! adapter per configured bot on its own scheduling context.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use crate::config::{self, build_runtime_config};
use crate::driver::{CodexDriver, Runner};
use crate::lock::ProcessLock;
use crate::orchestrator::Orchestrator;
use crate::session::SessionManager;
use crate::store::Store;
use crate::telegram::TelegramAdapter;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Load config, acquire the instance lock, open the store, then run
/// every bot until all of them exit.
pub fn run(config_path: &Path) -> anyhow::Result<()> {
    let app_config = config::load_app_config(config_path)?;

    if let Some(parent) = app_config.base.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create store dir {}", parent.display()))?;
        }
    }
    // Held for the whole process lifetime; released on drop.
    let _process_lock = ProcessLock::acquire(&app_config.base.lock_path)?;

    let store = Arc::new(Store::open(&app_config.base.db_path)?);
    store.init()?;

    let mut handles = Vec::new();
    for bot in &app_config.bots {
        let runtime = Arc::new(build_runtime_config(&app_config.base, bot));
        let store = store.clone();
        let bot_name = bot.name.clone();
        // One single-threaded scheduler per bot; they share only the
        // store.
        let handle = std::thread::Builder::new()
            .name(format!("bot-{bot_name}"))
            .spawn(move || -> anyhow::Result<()> {
                let scheduler = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context("build bot runtime")?;
                scheduler.block_on(async move {
                    let sessions = Arc::new(SessionManager::new(store.clone(), bot_name.clone()));
                    let runner: Arc<dyn Runner> = Arc::new(CodexDriver::new(runtime.clone()));
                    let orchestrator = Arc::new(Orchestrator::new(
                        runtime.clone(),
                        sessions,
                        store,
                        runner,
                        bot_name,
                    ));
                    let adapter = Arc::new(TelegramAdapter::new(runtime, orchestrator));
                    adapter.run().await
                })
            })
            .context("spawn bot thread")?;
        handles.push(handle);
    }

    for handle in handles {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("bot 线程异常退出"),
        }
    }
    Ok(())
}
