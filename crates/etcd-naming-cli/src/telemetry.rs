//! Logging setup
//!
//! Environment variables:
//! - `RUST_LOG` - filter directives (default: `info`)
//! - `LOG_FORMAT` - set to `json` for JSON output (default: `text`)

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string()),
        }
    }
}

impl TracingConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    fn is_json(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// Install the global subscriber. Logs go to stderr so stdout stays free for
/// membership output.
pub fn init_tracing(config: &TracingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    if config.is_json() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }

    tracing::debug!(format = %config.log_format, "Tracing initialized");
    Ok(())
}
