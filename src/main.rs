//! daydream - command-line entry point
//!
//! Usage: `daydream [TARGET]`. Everything else comes from the environment;
//! see [`daydream::config`].

use std::path::Path;
use std::sync::Arc;

use daydream::orchestrator::{install_hint, RunReport};
use daydream::{ActiveBackends, AgentRunner, Config, Orchestrator};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(target) = std::env::args().nth(1) {
        config = config.with_target(target);
    }

    init_logging(&config.target, config.debug)?;
    for backend in config.registry().list() {
        info!(backend = %backend.kind, model = %backend.model, cli = %backend.cli_path, "Backend");
    }

    let active = ActiveBackends::new();
    let runner = AgentRunner::new(active.clone());
    let orchestrator = Orchestrator::new(config.run_config(), runner, Arc::new(config.registry()))?;

    // Ctrl-C cancels the run: in-flight turns stop and queued ones never
    // start, so the run unwinds with a cancellation error.
    let interrupt = tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling agent turns");
            let signalled = active.cancel_all().await;
            info!(signalled, "Cancellation requested");
        }
    });

    let result = orchestrator.run().await;
    interrupt.abort();

    match result {
        Ok(report) => {
            log_report(&report);
            std::process::exit(report.exit_code());
        }
        Err(e) => {
            if let Some(skill) = e.missing_capability() {
                error!("Skill '{}' is not available", skill);
                error!("{}", install_hint(skill));
            } else if e.is_cancellation() {
                warn!("Run cancelled");
            } else {
                error!("Run failed: {}", e);
            }
            std::process::exit(1);
        }
    }
}

fn init_logging(target: &Path, debug: bool) -> anyhow::Result<()> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "daydream=info".into())
    };

    let debug_layer = if debug {
        let path = target.join(format!(
            ".review-debug-{}.log",
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        ));
        let file = std::fs::File::create(&path)?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .with_filter(tracing_subscriber::EnvFilter::new("daydream=debug")),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter()))
        .with(debug_layer)
        .init();
    Ok(())
}

fn log_report(report: &RunReport) {
    let summary = &report.summary;
    info!(
        skill = %summary.skill,
        dir = %summary.target.display(),
        feedback = summary.feedback_count,
        fixed = summary.fixes_applied,
        failed = summary.fixes_failed,
        test_retries = summary.test_retries,
        tests_passed = summary.tests_passed,
        "Run summary"
    );
    if summary.loop_mode {
        info!(iterations = summary.iterations_used, "Loop iterations used");
    }
    match serde_json::to_string(&report.outcome) {
        Ok(outcome) => info!("Outcome: {}", outcome),
        Err(_) => info!("Outcome: {:?}", report.outcome),
    }
}
