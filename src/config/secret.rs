//! Where the real database credential comes from
//!
//! The static `yaml` block is validated once; the vault source is queried
//! on every call so rotated secrets are picked up by new sessions.

use std::time::Duration;

use serde_json::Value;

use super::types::{ConfidentialConfig, RemoteMysql, SecretStorage, VaultConfig};
use crate::error::{ProxyError, Result};

const VAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Supplies `{host, port, username, password, dbname}` for the backend.
#[derive(Debug, Clone)]
pub enum SecretSource {
    Static(RemoteMysql),
    Vault {
        config: VaultConfig,
        client: reqwest::Client,
    },
}

impl SecretSource {
    pub fn from_config(confidential: &ConfidentialConfig) -> Result<Self> {
        match confidential.storage {
            SecretStorage::Yaml => {
                let remote = confidential.yaml.clone().ok_or_else(|| {
                    ProxyError::Config("confidential.yaml is required for yaml storage".into())
                })?;
                Ok(SecretSource::Static(remote))
            }
            SecretStorage::Vault => {
                let config = confidential.vault.clone().ok_or_else(|| {
                    ProxyError::Config("confidential.vault is required for vault storage".into())
                })?;
                let client = reqwest::Client::builder().timeout(VAULT_TIMEOUT).build()?;
                Ok(SecretSource::Vault { config, client })
            }
        }
    }

    /// Current backend address and credential.
    pub async fn remote_mysql(&self) -> Result<RemoteMysql> {
        let remote = match self {
            SecretSource::Static(remote) => remote.clone(),
            SecretSource::Vault { config, client } => fetch_vault(client, config).await?,
        };
        remote.validate().map_err(ProxyError::Secret)?;
        Ok(remote)
    }
}

fn vault_url(config: &VaultConfig) -> String {
    format!(
        "{}/v1/secret/data/{}",
        config.addr.trim_end_matches('/'),
        config.data_path
    )
}

async fn fetch_vault(client: &reqwest::Client, config: &VaultConfig) -> Result<RemoteMysql> {
    let url = vault_url(config);
    debug!(url = %url, "Requesting database secret from vault");

    let body: Value = client
        .get(&url)
        .header("X-Vault-Token", &config.token)
        .send()
        .await
        .map_err(|e| ProxyError::Secret(format!("request vault err: {}", e)))?
        .json()
        .await
        .map_err(|e| ProxyError::Secret(format!("read vault response body err: {}", e)))?;

    parse_vault_body(&body)
}

/// Extract the credential from a KV v2 read response.
fn parse_vault_body(body: &Value) -> Result<RemoteMysql> {
    if let Some(errors) = body.get("errors") {
        let has_errors = match errors {
            Value::Array(list) => !list.is_empty(),
            Value::Null => false,
            _ => true,
        };
        if has_errors {
            return Err(ProxyError::Secret(format!("request vault err: {}", errors)));
        }
    }

    let data = body
        .pointer("/data/data")
        .and_then(Value::as_object)
        .filter(|data| !data.is_empty())
        .ok_or_else(|| ProxyError::Secret("vault response has no data.data".into()))?;

    let text = |key: &str| -> String {
        match data.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    };
    let port = match data.get("port") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    };

    Ok(RemoteMysql {
        host: text("host"),
        port,
        username: text("username"),
        password: text("password"),
        dbname: text("dbname"),
    })
}
