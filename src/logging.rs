//! # Structured Logging Module
//!
//! Environment-aware structured logging for cache and lock operations.
//! Production emits JSON lines; every other environment gets human-readable output.
//! `RUST_LOG` overrides the per-environment default level.

use crate::identity::ContainerIdentity;
use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
///
/// Safe to call more than once; an embedding application that already installed a
/// global subscriber keeps it.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));

        let layer = if environment == "production" {
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
                .with_filter(filter)
                .boxed()
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            container = %ContainerIdentity::process(),
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("CACHE_ENV")
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

/// Log a connection lifecycle transition
pub fn log_connection_event(
    component: &str,
    container: &ContainerIdentity,
    event: &str,
    endpoint: Option<&str>,
    details: Option<&str>,
) {
    tracing::info!(
        component = %component,
        container = %container,
        event = %event,
        endpoint = endpoint,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔌 CONNECTION_EVENT"
    );
}

/// Log a failed store operation once, at the point the failure is classified
pub fn log_operation_failure(
    component: &str,
    container: &ContainerIdentity,
    operation: &str,
    key: Option<&str>,
    error_kind: &str,
    details: &str,
) {
    tracing::warn!(
        component = %component,
        container = %container,
        operation = %operation,
        key = key,
        error_kind = %error_kind,
        details = %details,
        timestamp = %Utc::now().to_rfc3339(),
        "⚠️ STORE_OPERATION_FAILED"
    );
}
