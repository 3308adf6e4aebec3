use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_bind: SocketAddr,
    pub settings_dir: PathBuf,
    pub database_url: Option<String>,
    pub model_backend: String,
    pub connect_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = env::var("PORT").unwrap_or_else(|_| "8080".to_owned());
        let http_bind = env::var("HTTP_BIND").unwrap_or_else(|_| format!("127.0.0.1:{port}"));
        let http_bind = http_bind.parse()?;

        let connect_timeout = match env::var("REQUEST_TIMEOUT_SECS") {
            Ok(raw) => Duration::from_secs(raw.trim().parse()?),
            Err(_) => Duration::from_secs(30),
        };

        Ok(Self {
            http_bind,
            settings_dir: env::var("SETTINGS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("snapanswer-settings")),
            database_url: env::var("DATABASE_URL").ok(),
            model_backend: env::var("MODEL_BACKEND").unwrap_or_else(|_| "auto".to_owned()),
            connect_timeout,
        })
    }
}
