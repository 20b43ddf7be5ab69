use bobs_corn::app::build_app_pair;
use bobs_corn::config::{LogFormat, ServerConfig};
use bobs_corn::ledger::Ledger;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    info!(version = env!("CARGO_PKG_VERSION"), "bobs-corn starting");
    info!(
        api = %config.api_addr,
        management = %config.management_addr,
        db = %config.db_path.display(),
        window_secs = config.window.as_secs(),
        retry_after = ?config.retry_after,
        cors_permissive = config.cors_permissive,
        request_logging = config.request_logging,
        "Configuration loaded"
    );

    let ledger = match Ledger::open_with_busy_timeout(&config.db_path, config.busy_timeout) {
        Ok(ledger) => ledger,
        Err(e) => {
            error!(error = %e, "failed to open purchase ledger");
            return ExitCode::from(1);
        }
    };

    let (api_app, mgmt_app) = build_app_pair(&config, ledger);

    let api_listener = match tokio::net::TcpListener::bind(config.api_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %config.api_addr, "failed to bind api listener");
            return ExitCode::from(1);
        }
    };
    let mgmt_listener = match tokio::net::TcpListener::bind(config.management_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(
                error = %e,
                addr = %config.management_addr,
                "failed to bind management listener"
            );
            return ExitCode::from(1);
        }
    };

    info!(addr = %config.api_addr, "Server running");

    let (api, mgmt) = tokio::join!(
        async { axum::serve(api_listener, api_app).await },
        async { axum::serve(mgmt_listener, mgmt_app).await },
    );
    if let Err(e) = api.and(mgmt) {
        error!(error = %e, "server error");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}
