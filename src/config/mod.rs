//! Configuration module for mysql-credential-proxy
//!
//! ```yaml
//! server:
//!   addr: "0.0.0.0:3307"
//!   mode: relay
//! confidential:
//!   storage: vault
//!   vault:
//!     addr: "https://vault.internal:8200"
//!     token: "${VAULT_TOKEN}"
//!     dataPath: "mysql/prod"
//! fakeIdentity:
//!   username: "proxyuser"
//!   password: "secret"
//! ```

mod loader;
mod secret;
mod types;

pub use loader::{apply_env_overrides, load_config, load_config_from_str};
pub use secret::SecretSource;
pub use types::*;
