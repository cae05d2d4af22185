//! Configuration validation

use super::Config;

/// Validation outcome: errors block lock generation, warnings do not
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            eprintln!("[WARN] {}", warning);
        }
        for error in &self.errors {
            eprintln!("[ERROR] {}", error);
        }
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_dispatch(config, &mut result);
    validate_logging(config, &mut result);

    result
}

fn validate_dispatch(config: &Config, result: &mut ValidationResult) {
    let dispatch = &config.dispatch;

    if dispatch.conntrack_interval_secs == 0 {
        result.error("dispatch.conntrack_interval_secs must be non-zero");
    }
    if dispatch.cleaner_interval_secs == 0 {
        result.error("dispatch.cleaner_interval_secs must be non-zero");
    }
    if dispatch.plugin_timeout_secs == 0 {
        result.error("dispatch.plugin_timeout_secs must be non-zero");
    }
    if dispatch.session_idle_secs < dispatch.cleaner_interval_secs {
        result.warn(format!(
            "dispatch.session_idle_secs ({}) is shorter than the cleaner interval ({}); \
             sessions may outlive the idle window by a full sweep",
            dispatch.session_idle_secs, dispatch.cleaner_interval_secs
        ));
    }
    if dispatch.plugin_timeout_secs > 300 {
        result.warn(format!(
            "dispatch.plugin_timeout_secs ({}) is unusually long; a stalled plugin \
             holds its priority layer for the full timeout",
            dispatch.plugin_timeout_secs
        ));
    }
}

fn validate_logging(config: &Config, result: &mut ValidationResult) {
    match config.logging.level.to_lowercase().as_str() {
        "error" | "warn" | "info" | "debug" | "trace" => {}
        other => result.error(format!("logging.level '{}' is not a valid level", other)),
    }
    match config.logging.format.as_str() {
        "pretty" | "compact" | "json" => {}
        other => result.error(format!("logging.format '{}' is not a valid format", other)),
    }
}
