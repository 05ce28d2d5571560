//! `pingflow serve` and `pingflow tick`.

use anyhow::Result;
use console::style;
use tokio_util::sync::CancellationToken;

use crate::http;
use crate::state::AppState;

pub async fn serve(state: AppState, host: Option<String>, port: Option<u16>, workers: bool) -> Result<()> {
    let config = state.engine.config();
    let host = host.unwrap_or_else(|| config.http.host.clone());
    let port = port.unwrap_or(config.http.port);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let cancel = CancellationToken::new();
    let handles = if workers {
        state.engine.spawn_workers(cancel.clone())
    } else {
        Vec::new()
    };

    println!(
        "  {} pingflow API listening on {}",
        style("⚡").bold(),
        style(format!("http://{addr}")).cyan()
    );
    if workers {
        println!(
            "  {} {} workers, {} workflows registered",
            style("⚙").bold(),
            config.workers,
            state.engine.registry().len()
        );
    }
    println!("  {}", style("Press Ctrl+C to stop").dim());

    let router = http::router::build_router(state.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "background loop ended abnormally");
        }
    }

    println!("\n  Server stopped.");
    Ok(())
}

/// Wake due sleepers, fire due cron slots, then drain claimable runs.
pub async fn tick(state: &AppState, json: bool) -> Result<()> {
    let engine = &state.engine;
    let now = engine.now();
    let woken = engine.scan_due(now).await?;
    let fired = engine.tick(now).await?;
    let worker_id = format!("cli-{}", std::process::id());
    let advanced = engine.drain(&worker_id).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "woken": woken,
                "cron_runs": fired,
                "advanced": advanced,
            }))?
        );
    } else {
        println!(
            "  {} woke {}, fired {} cron run(s), advanced {} run(s)",
            style("✓").green().bold(),
            woken.len(),
            fired.len(),
            advanced
        );
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
