use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

/// 环境变量前缀，例如 `VCD__SERVER__WS_PORT=5300`
/// Environment prefix, e.g. `VCD__SERVER__WS_PORT=5300`
const ENV_PREFIX: &str = "VCD";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub ws_port: u16,
    /// 连接后必须在此时间内发送 hello / A hello frame must arrive within this window
    pub hello_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), ws_port: 5200, hello_timeout_ms: 1000 }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// 每个邮箱的缓冲槽位 / Buffered slots per mailbox
    pub mailbox_capacity: usize,
    pub max_inflight_publishes: usize,
    /// 每个路由键离线队列上限；默认不限。设置后超出部分丢弃最旧事件，离线事件可能丢失
    /// Per-key pending cap; unbounded by default. When set, the oldest entries beyond
    /// it are dropped, so offline events can be lost.
    pub max_pending_per_key: Option<usize>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self { mailbox_capacity: 3, max_inflight_publishes: 1024, max_pending_per_key: None }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { backend: StorageBackend::Memory, database_url: None }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub delivery: DeliveryConfig,
    pub storage: StorageConfig,
}

/// 加载配置：默认文件 -> 生产文件 -> 指定文件 -> 环境变量（后者优先）
/// Load config: default file -> production file -> explicit file -> env (later wins)
pub fn load(path: Option<&str>) -> Result<AppConfig> {
    let mut builder = Config::builder()
        .add_source(File::new("config/default.toml", FileFormat::Toml).required(false))
        .add_source(File::new("config/production.toml", FileFormat::Toml).required(false));
    if let Some(path) = path {
        if !std::path::Path::new(path).exists() {
            return Err(anyhow!("配置文件不存在 / Config file not found: {}", path));
        }
        builder = builder.add_source(File::with_name(path));
    }
    let cfg = builder
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true))
        .build()
        .map_err(|e| anyhow!("构建配置失败 / Failed to build config: {}", e))?;
    let app: AppConfig = cfg
        .try_deserialize()
        .map_err(|e| anyhow!("解析配置失败 / Failed to parse config: {}", e))?;
    validate(&app)?;
    Ok(app)
}

fn validate(cfg: &AppConfig) -> Result<()> {
    if cfg.delivery.mailbox_capacity == 0 {
        return Err(anyhow!("delivery.mailbox_capacity must be > 0"));
    }
    if cfg.delivery.max_inflight_publishes == 0 {
        return Err(anyhow!("delivery.max_inflight_publishes must be > 0"));
    }
    if cfg.delivery.max_pending_per_key == Some(0) {
        return Err(anyhow!("delivery.max_pending_per_key must be > 0 when set"));
    }
    if cfg.storage.backend == StorageBackend::Postgres && cfg.storage.database_url.is_none() {
        return Err(anyhow!("storage.database_url is required for the postgres backend"));
    }
    Ok(())
}
