//! Tracing subscriber setup for the Serena binary.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "serena_llm" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout; human-readable output otherwise.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

/// Returned by [`init_telemetry`]; keep it alive for the process lifetime.
pub struct TelemetryGuard {
    filter: String,
    installed: bool,
}

impl TelemetryGuard {
    /// The filter directive in effect.
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// False when another global subscriber was already installed.
    pub fn installed(&self) -> bool {
        self.installed
    }
}

/// Parse a level name such as `"debug"` or `"WARN"`.
pub fn parse_level(raw: &str) -> Option<Level> {
    raw.trim().parse().ok()
}

/// Build the `EnvFilter` directive string from the config.
pub fn filter_directive(config: &TelemetryConfig) -> String {
    let mut filter = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

/// Initialize the global subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let configured = filter_directive(&config);
    let (env_filter, filter) = match EnvFilter::try_from_default_env() {
        Ok(f) => {
            let directive = f.to_string();
            (f, directive)
        }
        Err(_) => (EnvFilter::new(&configured), configured),
    };

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let installed = tracing_subscriber::registry().with(fmt_layer).try_init().is_ok();
    if installed {
        tracing::debug!(filter = %filter, "telemetry initialized");
    }

    TelemetryGuard { filter, installed }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_includes_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![
                ("serena_engine".into(), Level::DEBUG),
                ("serena_server".into(), Level::TRACE),
            ],
            json: true,
        };
        assert_eq!(
            filter_directive(&config),
            "warn,serena_engine=debug,serena_server=trace"
        );
    }

    #[test]
    fn parse_level_is_case_insensitive() {
        assert_eq!(parse_level("DEBUG"), Some(Level::DEBUG));
        assert_eq!(parse_level(" info "), Some(Level::INFO));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn default_is_json_info() {
        let config = TelemetryConfig::default();
        assert!(config.json);
        assert_eq!(filter_directive(&config), "info");
    }
}
