//! `voicemeter-server`: the metering HTTP service.
//!
//! Configuration comes from `VOICEMETER_*` environment variables layered over
//! an optional JSON file (`VOICEMETER_CONFIG`, default `voicemeter.json`).

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use voicemeter::config::{ConfigBuilder, Settings};
use voicemeter::http::{AppState, router};
use voicemeter::service::{MeteringService, open_store};
use voicemeter::{TracingConfig, init_tracing};

const CONFIG_PATH_VAR: &str = "VOICEMETER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "voicemeter.json";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config_path =
        std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = ConfigBuilder::new().env().file(&config_path).build();
    let settings = Settings::load(&config).await?;

    init_tracing(&TracingConfig::default().json(settings.log_json))?;

    let store = open_store(&settings).await?;
    info!(backend = store.name(), config = %config_path, "Store ready");

    let service = Arc::new(MeteringService::from_settings(&settings, store)?);
    if !service.webhooks_enabled() {
        info!("No billing webhook secret set; webhook route disabled");
    }
    let app = router(AppState::from_settings(service.clone(), &settings));

    let listener = TcpListener::bind(settings.server.bind).await?;
    info!(addr = %listener.local_addr()?, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await;
    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
