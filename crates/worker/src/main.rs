use anyhow::Context;
use patchline_worker::config::WorkerConfig;
use patchline_worker::driver::{self, INSTALL_OUTCOME_TIMEOUT};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    tracing::info!(
        work_dir = %config.work_dir.display(),
        install_dir = %config.install_dir.display(),
        operations = config.operations.len(),
        "Worker starting",
    );

    let services = driver::local_services(&config);
    match driver::run_job(&config, services, INSTALL_OUTCOME_TIMEOUT).await {
        Ok(report) => {
            tracing::info!(
                exported_bytes = ?report.exported_bytes,
                install = ?report.install,
                "Job complete",
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Job failed");
            Err(e)
        }
    }
}

/// `RUST_LOG` controls filtering; `PATCHLINE_LOG_JSON=1` switches to JSON
/// output.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "patchline_worker=debug,patchline_pipeline=debug".into());

    let json = std::env::var("PATCHLINE_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
