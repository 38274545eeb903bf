use std::fmt::Write as _;

use anyhow::Result;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, EnvFilter};

/// 本地时间到毫秒 / Local time with milliseconds
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

struct LocalMillis;

impl fmt::time::FormatTime for LocalMillis {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format(TIME_FORMAT))
    }
}

/// 初始化日志；`RUST_LOG` 优先于配置级别 / Init logging; `RUST_LOG` wins over the configured level
pub fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{},sqlx=warn", level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    LogTracer::init().ok();
    fmt::SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_timer(LocalMillis)
        .compact()
        .with_target(false)
        .try_init()
        .ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_format_round_trips() {
        let rendered = chrono::Local::now().format(TIME_FORMAT).to_string();
        assert!(chrono::NaiveDateTime::parse_from_str(&rendered, TIME_FORMAT).is_ok());
        assert_eq!(rendered.len(), "2026-01-01 00:00:00.000".len());
    }

    #[test]
    fn test_init_is_repeatable() {
        assert!(init_tracing("debug").is_ok());
        assert!(init_tracing("info").is_ok());
    }
}
