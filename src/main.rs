use std::sync::Arc;

use snapanswer::{
    config::AppConfig,
    http::{self, AppState},
    model::{ClientFactory, MockClientFactory, OpenAiCompatFactory},
    orchestrator::CompletionOrchestrator,
    settings::{FileSettingsStore, PostgresSettingsStore, SettingsStore},
};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;

    let settings = build_settings_store(&config).await?;
    let factory = build_client_factory(&config)?;
    let orchestrator = Arc::new(CompletionOrchestrator::new(settings, factory).await?);

    let app = http::router(AppState { orchestrator });
    let listener = TcpListener::bind(config.http_bind).await?;
    info!("snapanswer HTTP API listening on {}", config.http_bind);

    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .init();
}

async fn build_settings_store(config: &AppConfig) -> anyhow::Result<Arc<dyn SettingsStore>> {
    if let Some(database_url) = &config.database_url {
        let store = PostgresSettingsStore::connect(database_url).await?;
        info!("Connected to Postgres settings store");
        Ok(Arc::new(store))
    } else {
        let store = FileSettingsStore::open(&config.settings_dir).await?;
        info!(dir = %store.dir().display(), "DATABASE_URL not set; using file settings store");
        Ok(Arc::new(store))
    }
}

fn build_client_factory(config: &AppConfig) -> anyhow::Result<Arc<dyn ClientFactory>> {
    let backend = config.model_backend.to_lowercase();
    match backend.as_str() {
        "mock" => {
            warn!("MODEL_BACKEND=mock; completions are answered offline");
            Ok(Arc::new(MockClientFactory))
        }
        "auto" | "openai" => Ok(Arc::new(openai_factory(config)?)),
        other => {
            warn!(
                backend = %other,
                "unknown MODEL_BACKEND value; valid values are auto|openai|mock; falling back to auto"
            );
            Ok(Arc::new(openai_factory(config)?))
        }
    }
}

fn openai_factory(config: &AppConfig) -> anyhow::Result<OpenAiCompatFactory> {
    let http = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .build()?;
    Ok(OpenAiCompatFactory::new(http))
}
