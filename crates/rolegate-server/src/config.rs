use serde::Deserialize;
use std::path::Path;

use rolegate_client::ClientOptions;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub authz: AuthzConfig,
    pub log: LogConfig,
    pub tracing: TracingConfig,
    pub bootstrap: BootstrapConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

/// Where the enforcement engine lives. An empty endpoint runs the
/// in-process engine.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AuthzConfig {
    pub endpoint: String,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub api_key: String,
}

impl std::fmt::Debug for AuthzConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthzConfig")
            .field("endpoint", &self.endpoint)
            .field("timeout_ms", &self.timeout_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field(
                "api_key",
                &(!self.api_key.is_empty()).then_some("[REDACTED]"),
            )
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    pub enabled: bool,
    pub otlp_endpoint: String,
    pub service_name: String,
    pub sample_rate: f64,
}

/// Directory rows created at startup. The in-memory backend starts empty,
/// so this is how it gets a tenant to serve.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub seed_roles: bool,
    pub partner: String,
    pub organization: String,
    pub projects: Vec<String>,
    pub groups: Vec<String>,
}

impl BootstrapConfig {
    pub fn tenant(&self) -> Option<(&str, &str)> {
        let partner = self.partner.trim();
        let organization = self.organization.trim();
        (!partner.is_empty() && !organization.is_empty()).then_some((partner, organization))
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 11000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost:5432/rolegate".to_string(),
            max_connections: 10,
        }
    }
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            api_key: String::new(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: "http://localhost:4317".to_string(),
            service_name: "rolegate".to_string(),
            sample_rate: 1.0,
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e.to_string()))?;
            toml::from_str::<AppConfig>(&contents)
                .map_err(|e| ConfigError::ParseToml(e.to_string()))?
        } else {
            AppConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ROLEGATE_HTTP_HOST") {
            self.http.host = v;
        }
        if let Ok(v) = std::env::var("ROLEGATE_HTTP_PORT")
            && let Ok(port) = v.parse()
        {
            self.http.port = port;
        }
        if let Ok(v) = std::env::var("ROLEGATE_DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("ROLEGATE_DATABASE_MAX_CONNECTIONS")
            && let Ok(n) = v.parse()
        {
            self.database.max_connections = n;
        }
        if let Ok(v) = std::env::var("ROLEGATE_STORAGE_BACKEND") {
            match v.as_str() {
                "memory" => self.storage.backend = StorageBackend::Memory,
                "postgres" => self.storage.backend = StorageBackend::Postgres,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("ROLEGATE_AUTHZ_ENDPOINT") {
            self.authz.endpoint = v;
        }
        if let Ok(v) = std::env::var("ROLEGATE_AUTHZ_API_KEY") {
            self.authz.api_key = v;
        }
        if let Ok(v) = std::env::var("ROLEGATE_AUTHZ_TIMEOUT_MS")
            && let Ok(n) = v.parse()
        {
            self.authz.timeout_ms = n;
        }
        if let Ok(v) = std::env::var("ROLEGATE_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = std::env::var("ROLEGATE_LOG_FORMAT") {
            match v.as_str() {
                "json" => self.log.format = LogFormat::Json,
                "pretty" => self.log.format = LogFormat::Pretty,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("ROLEGATE_TRACING_ENABLED") {
            self.tracing.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("ROLEGATE_TRACING_OTLP_ENDPOINT") {
            self.tracing.otlp_endpoint = v;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.http.port == 0 {
            return Err(ConfigError::Validation(
                "http.port must be non-zero".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Validation(
                "database.max_connections must be non-zero".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::Postgres && self.database.url.is_empty() {
            return Err(ConfigError::Validation(
                "database.url is required for the postgres backend".to_string(),
            ));
        }
        if self.authz.timeout_ms == 0 || self.authz.connect_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "authz timeouts must be non-zero".to_string(),
            ));
        }
        if self.bootstrap.tenant().is_none()
            && (!self.bootstrap.projects.is_empty() || !self.bootstrap.groups.is_empty())
        {
            return Err(ConfigError::Validation(
                "bootstrap.projects and bootstrap.groups need bootstrap.partner and bootstrap.organization".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.tracing.sample_rate) {
            return Err(ConfigError::Validation(
                "tracing.sample_rate must be between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http.host, self.http.port)
    }

    /// The engine endpoint, or `None` for the in-process engine.
    pub fn authz_endpoint(&self) -> Option<&str> {
        Some(self.authz.endpoint.trim()).filter(|e| !e.is_empty())
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions::from_millis(
            self.authz.timeout_ms,
            self.authz.connect_timeout_ms,
            Some(self.authz.api_key.clone()),
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    ReadFile(String, String),

    #[error("failed to parse TOML config: {0}")]
    ParseToml(String),

    #[error("config validation failed: {0}")]
    Validation(String),
}
