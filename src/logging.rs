//! Logging macros that pin every event to the `mysql_credential_proxy` target.
//!
//! Without an explicit target, tracing uses the full module path
//! (e.g. `mysql_credential_proxy::server::command`), which makes `RUST_LOG`
//! filters and log collectors key on a dozen different names. These macros
//! keep the whole crate under one target.

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "mysql_credential_proxy", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "mysql_credential_proxy", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "mysql_credential_proxy", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "mysql_credential_proxy", $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "mysql_credential_proxy", $($arg)*) };
}
