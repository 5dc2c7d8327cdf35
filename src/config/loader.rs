//! Configuration loader

use super::Config;
use crate::error::{ProxyError, Result};
use std::path::Path;

/// Load configuration from a YAML file
///
/// Also applies CREDPROXY_* env var overrides after loading.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    load_config_from_str(&contents)
}

/// Load configuration from a YAML string (useful for testing)
pub fn load_config_from_str(yaml: &str) -> Result<Config> {
    let mut config: Config = serde_yaml::from_str(yaml)?;
    resolve_config_env_vars(&mut config);
    apply_env_overrides(&mut config);
    config.validate().map_err(ProxyError::Config)?;
    Ok(config)
}

/// Apply CREDPROXY_* environment variable overrides to a config.
///
/// Supported env vars:
/// - `CREDPROXY_ADDR` - Override the listen address
/// - `CREDPROXY_LOG_LEVEL` - Override log level
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("CREDPROXY_ADDR") {
        debug!("Overriding server.addr from CREDPROXY_ADDR");
        config.server.addr = val;
    }
    if let Ok(val) = std::env::var("CREDPROXY_LOG_LEVEL") {
        debug!("Overriding log level from CREDPROXY_LOG_LEVEL");
        config.logging.level = val;
    }
}

/// Resolve environment variables in a string value
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - curly brace syntax
/// - `$VAR_NAME` - simple syntax (for single variable values)
///
/// If the environment variable is not set, the original value is preserved.
fn resolve_env_var(value: &str) -> String {
    let var_name = if value.starts_with("${") && value.ends_with('}') {
        &value[2..value.len() - 1]
    } else if value.starts_with('$') && !value.contains(' ') && value.len() > 1 {
        &value[1..]
    } else {
        return value.to_string();
    };

    match std::env::var(var_name) {
        Ok(env_value) => {
            debug!("Resolved env var {} from config", var_name);
            env_value
        }
        Err(_) => {
            debug!("Env var {} not set, keeping original value", var_name);
            value.to_string()
        }
    }
}

/// Resolve environment variables in the credential and token fields
fn resolve_config_env_vars(config: &mut Config) {
    let identity = &mut config.fake_identity;
    identity.username = resolve_env_var(&identity.username);
    identity.password = resolve_env_var(&identity.password);

    if let Some(ref mut remote) = config.confidential.yaml {
        remote.host = resolve_env_var(&remote.host);
        remote.username = resolve_env_var(&remote.username);
        remote.password = resolve_env_var(&remote.password);
        remote.dbname = resolve_env_var(&remote.dbname);
    }

    if let Some(ref mut vault) = config.confidential.vault {
        vault.addr = resolve_env_var(&vault.addr);
        vault.token = resolve_env_var(&vault.token);
    }
}
