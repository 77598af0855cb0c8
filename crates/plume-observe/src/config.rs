use std::io::IsTerminal;

use crate::{error::LoggerError, format::LoggerFormat};

/// Variable holding the log format.
pub const ENV_FORMAT: &str = "PLUME_LOG_FORMAT";
/// Variable holding the filter directives, e.g. `info,plume_lock=debug`.
pub const ENV_LEVEL: &str = "PLUME_LOG";

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub format: LoggerFormat,
    /// `EnvFilter` directives.
    pub level: String,
    pub with_targets: bool,
    pub use_color: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            format: LoggerFormat::Text,
            level: "info".to_string(),
            with_targets: true,
            use_color: std::io::stdout().is_terminal(),
        }
    }
}

impl LoggerConfig {
    /// Defaults overridden by `PLUME_LOG_FORMAT` and `PLUME_LOG`.
    pub fn from_env() -> Result<Self, LoggerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LoggerError> {
        let mut cfg = Self::default();
        if let Some(format) = lookup(ENV_FORMAT) {
            cfg.format = format.parse()?;
        }
        if let Some(level) = lookup(ENV_LEVEL).filter(|l| !l.trim().is_empty()) {
            cfg.level = level;
        }
        if cfg.format != LoggerFormat::Text {
            cfg.use_color = false;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn environment_overrides_defaults() {
        let cfg = LoggerConfig::from_lookup(lookup(&[
            (ENV_FORMAT, "json"),
            (ENV_LEVEL, "warn,plume_lock=debug"),
        ]))
        .unwrap();
        assert_eq!(cfg.format, LoggerFormat::Json);
        assert_eq!(cfg.level, "warn,plume_lock=debug");
        assert!(!cfg.use_color);
    }

    #[test]
    fn missing_variables_keep_defaults() {
        let cfg = LoggerConfig::from_lookup(lookup(&[(ENV_LEVEL, "  ")])).unwrap();
        assert_eq!(cfg.format, LoggerFormat::Text);
        assert_eq!(cfg.level, "info");
    }

    #[test]
    fn bad_format_is_rejected() {
        assert!(matches!(
            LoggerConfig::from_lookup(lookup(&[(ENV_FORMAT, "yaml")])),
            Err(LoggerError::InvalidFormat(_))
        ));
    }
}
