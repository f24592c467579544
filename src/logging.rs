use chrono::{Datelike, Timelike};
use tracing_subscriber::{fmt, EnvFilter};

struct LogTimer;

impl fmt::time::FormatTime for LogTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        let cs = now.timestamp_subsec_millis() / 10;
        let s = format!(
            "{:04}-{:02}-{:02}:{:02}:{:02}:{:02}:{:02}",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            cs
        );
        w.write_str(&s)
    }
}

/// 初始化日志 / Install the tracing subscriber
///
/// `RUST_LOG` 优先，其次为配置中的 `logging.level`。
/// `RUST_LOG` wins over the configured `logging.level`. `log` records are bridged by
/// tracing-subscriber's `tracing-log` feature during `try_init`.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{},tokio_tungstenite=warn,tungstenite=warn", level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_timer(LogTimer)
        .compact()
        .with_target(false)
        .try_init()
        .ok();
}
