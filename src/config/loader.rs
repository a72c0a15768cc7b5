//! Configuration Loader
//!
//! Layers settings sources with the `config` crate, lowest precedence first:
//!
//! 1. Built-in defaults (`CacheSettings::default()`)
//! 2. An optional file (`config/cache.{toml,yaml,json}` or an explicit path)
//! 3. `CACHE__SECTION__FIELD` environment variables, e.g. `CACHE__STORE__OPERATION_TIMEOUT_MS`
//! 4. `REDIS_URL` (cache store) and `REDIS_LOCK_URLS` (comma separated lock endpoints)

use super::error::{ConfigResult, ConfigurationError};
use super::CacheSettings;
use config::{Config, Environment, File, Map};
use std::path::Path;
use tracing::debug;

/// File looked up (with any supported extension) when no explicit path is given
pub const DEFAULT_CONFIG_BASENAME: &str = "config/cache";

/// Prefix for structured environment overrides
pub const ENV_PREFIX: &str = "CACHE";

/// Connection string for the cache store
pub const REDIS_URL_VAR: &str = "REDIS_URL";

/// Comma separated connection strings for the lock quorum
pub const REDIS_LOCK_URLS_VAR: &str = "REDIS_LOCK_URLS";

/// Load settings from the default file location and the process environment
pub fn load_settings() -> ConfigResult<CacheSettings> {
    load_settings_from(None)
}

/// Load settings from an explicit file (required when given) and the process environment
pub fn load_settings_from(path: Option<&Path>) -> ConfigResult<CacheSettings> {
    assemble(path, None)
}

/// Layer all sources; `env` replaces the process environment when provided
pub(crate) fn assemble(
    path: Option<&Path>,
    env: Option<Map<String, String>>,
) -> ConfigResult<CacheSettings> {
    let defaults = Config::try_from(&CacheSettings::default())
        .map_err(|e| ConfigurationError::source_error("defaults", e))?;

    let file_source = match path {
        Some(path) => File::from(path).required(true),
        None => File::with_name(DEFAULT_CONFIG_BASENAME).required(false),
    };

    let lookup = |name: &str| -> Option<String> {
        match &env {
            Some(map) => map.get(name).cloned(),
            None => std::env::var(name).ok(),
        }
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    };

    let redis_url = lookup(REDIS_URL_VAR);
    let lock_urls: Option<Vec<String>> = lookup(REDIS_LOCK_URLS_VAR).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect()
    });

    let builder = Config::builder()
        .add_source(defaults)
        .add_source(file_source)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("lock.endpoints")
                .source(env.clone()),
        )
        .set_override_option("store.url", redis_url)
        .map_err(|e| ConfigurationError::source_error(REDIS_URL_VAR, e))?
        .set_override_option("lock.endpoints", lock_urls)
        .map_err(|e| ConfigurationError::source_error(REDIS_LOCK_URLS_VAR, e))?;

    let source_name = path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| DEFAULT_CONFIG_BASENAME.to_string());

    let settings: CacheSettings = builder
        .build()
        .map_err(|e| ConfigurationError::source_error(source_name, e))?
        .try_deserialize()
        .map_err(ConfigurationError::deserialize_error)?;

    settings.validate()?;

    debug!(
        settings = %serde_json::to_string(&settings.redacted())
            .unwrap_or_else(|_| "[serialization error]".to_string()),
        "Cache configuration loaded"
    );

    Ok(settings)
}
