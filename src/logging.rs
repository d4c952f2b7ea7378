//! # Structured Logging Module
//!
//! Environment-aware structured logging for the mutation engine and the graph
//! orchestrator. Console output is human readable in development and JSON in
//! production so that log shippers can index the structured fields.

use chrono::{DateTime, Utc};
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

        let json = environment == "production";
        let console = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // Embedders and the test harness may already own the global subscriber
        if tracing_subscriber::registry().with(console).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            log_level = %log_level,
            json = json,
            "STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
pub fn get_environment() -> String {
    std::env::var("DM_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "test" => "debug".to_string(),
        "development" => "debug".to_string(),
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for mutation engine operations
pub fn log_mutation_operation(
    operation: &str,
    mutation: &str,
    root: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        mutation = %mutation,
        root = %root,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "MUTATION_OPERATION"
    );
}

/// Log an accepted attempt state transition, stamped with the time the
/// attempt recorded for it
pub fn log_attempt_transition(
    attempt: &str,
    from: &str,
    to: &str,
    execution: Option<u32>,
    at: DateTime<Utc>,
) {
    tracing::info!(
        attempt = %attempt,
        from = %from,
        to = %to,
        execution = execution,
        timestamp = %at.to_rfc3339(),
        "ATTEMPT_TRANSITION"
    );
}

/// Log structured data for distributor registry operations
pub fn log_registry_operation(
    operation: &str,
    config_name: Option<&str>,
    kind: Option<&str>,
    version: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        config_name = config_name,
        kind = kind,
        version = version,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "REGISTRY_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("unknown"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_structured_logging();
        init_structured_logging();
        log_mutation_operation("journal", "ScheduleExecution", "attempt:q|00000001", "ok", None);
    }
}
