use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use surge::report::{EXIT_CONFIG, EXIT_FAILED};
use surge::{Engine, RunConfig};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Expose the engine's counters for scraping during long runs
fn setup_prometheus_listener() -> anyhow::Result<()> {
    let Ok(addr) = std::env::var("SURGE_METRICS_ADDR") else {
        return Ok(());
    };
    let addr: SocketAddr = addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(code as u8)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "surge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    setup_prometheus_listener()?;

    let plan = std::env::args().nth(1).map(PathBuf::from);
    let config = match RunConfig::load(plan) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Ok(exit(EXIT_CONFIG));
        }
    };
    let report_path = config.report_path.clone();

    let report = match Engine::new(config).run().await {
        Ok(report) => report,
        Err(e) => {
            error!("Run did not complete: {}", e);
            return Ok(exit(EXIT_CONFIG));
        }
    };

    if let Err(e) = report.write(&report_path) {
        error!("{}", e);
        return Ok(exit(EXIT_CONFIG));
    }
    info!("Report written to {:?}", report_path);

    if let Some(breach) = &report.aborted {
        error!(
            "Run aborted at {:.1}s: {} (observed {:.4})",
            breach.elapsed_secs, breach.rule, breach.observed
        );
    }

    let code = report.exit_code();
    if code == EXIT_FAILED {
        error!("Run failed: {}", report.assessment.narrative);
    }
    Ok(exit(code))
}
