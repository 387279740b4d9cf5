use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use palaver::app::DEFAULT_AGENT_LABEL;
use palaver::{SettingsStore, TerminalApp};
use palaver_client::{ChatTransport, DemoTransport, HttpTransport, SessionClient};
use palaver_core::ChatEngine;
use palaver_storage::FilePersistence;
use tracing_subscriber::EnvFilter;

const DEMO_LATENCY: Duration = Duration::from_millis(300);

#[tokio::main]
async fn main() -> ExitCode {
    let default_level = "info";
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    // Chat output owns stdout.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();

    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();

    let transport: Arc<dyn ChatTransport> = if settings.is_demo() {
        tracing::warn!("no endpoint configured, using the offline demo backend");
        Arc::new(DemoTransport::default().with_latency(DEMO_LATENCY))
    } else {
        Arc::new(HttpTransport::new(&settings.service.endpoint))
    };
    tracing::info!(
        transport = transport.name(),
        config_path = ?settings_store.config_path(),
        "starting chat client"
    );

    let persistence = Arc::new(FilePersistence::new(SettingsStore::default_session_path()));
    let client = SessionClient::new(settings.service.clone(), transport, persistence);
    let (engine, events) = ChatEngine::new(settings.engine_config(), client);

    let agent_label = settings
        .service
        .title
        .clone()
        .unwrap_or_else(|| DEFAULT_AGENT_LABEL.to_string());

    match TerminalApp::new(engine, events, agent_label).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "chat client stopped");
            ExitCode::FAILURE
        }
    }
}
