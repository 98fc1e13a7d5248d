use anyhow::{bail, Context};
use rollout_clients::{GatewayChannel, GraphqlStore};
use rollout_core::config::WarnLevel;
use rollout_core::engine::RunDb;
use rollout_core::{Engine, EngineSettings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub fn run(config_path: &Path, bind: Option<String>, db: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = super::load_config(config_path)?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(db) = db {
        config.engine.database = db;
    }

    let warnings = config.validate();
    for w in &warnings {
        match w.level {
            WarnLevel::Warning => warn!("{}", w.message),
            WarnLevel::Error => eprintln!("[error] {}", w.message),
        }
    }
    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        bail!("refusing to start with an invalid configuration");
    }

    let db = RunDb::open(&config.engine.database).with_context(|| {
        format!(
            "failed to open run database {}",
            config.engine.database.display()
        )
    })?;
    let store = GraphqlStore::new(&config.store)?;
    let channel = GatewayChannel::new()?;
    let engine = Engine::new(
        db,
        Arc::new(store),
        Arc::new(channel),
        EngineSettings::from_config(&config),
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let report = engine.recover().await?;
        info!(
            resumed = report.resumed.len(),
            abandoned = report.abandoned.len(),
            "startup recovery complete"
        );

        // Keep the signal backlog bounded to its window.
        let pruner = engine.clone();
        let period = config.engine.signal_backlog().max(Duration::from_secs(60));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                match pruner.prune_backlog() {
                    Ok(0) => {}
                    Ok(n) => info!(pruned = n, "pruned signal backlog"),
                    Err(e) => warn!(error = %e, "failed to prune signal backlog"),
                }
            }
        });

        let listener = tokio::net::TcpListener::bind(&config.server.bind)
            .await
            .with_context(|| format!("failed to bind {}", config.server.bind))?;
        println!("rollout listening on http://{}", listener.local_addr()?);

        rollout_server::serve_on(engine, listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    })
}
