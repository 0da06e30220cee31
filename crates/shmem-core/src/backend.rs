//! Numbered backend channels.
//!
//! Library callers that only know a numeric backend id resolve it through
//! this table. Each entry names an environment prefix; `<PREFIX>_CHANNEL`
//! overrides the default channel name.

use crate::error::{Error, Result};

/// Static description of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendInfo {
    /// Environment variable prefix
    pub prefix: &'static str,
    /// Channel name used when `<PREFIX>_CHANNEL` is unset
    pub channel: &'static str,
    /// Whether payloads to this backend are compressed
    pub compress: bool,
}

/// Known backends, indexed by id
pub const BACKENDS: &[BackendInfo] = &[BackendInfo {
    prefix: "STREAM",
    channel: "stream",
    compress: true,
}];

/// A backend with its channel name resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBackend {
    /// Backend id
    pub id: usize,
    /// Channel (segment) name
    pub channel: String,
    /// Whether compression is requested
    pub compress: bool,
}

/// Resolve backend `id` against the process environment.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] for an unknown id.
pub fn resolve_backend(id: usize) -> Result<ResolvedBackend> {
    resolve_backend_with(id, |key| std::env::var(key).ok())
}

/// Resolve backend `id` using `lookup` for environment overrides.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] for an unknown id.
pub fn resolve_backend_with<F>(id: usize, lookup: F) -> Result<ResolvedBackend>
where
    F: Fn(&str) -> Option<String>,
{
    let info = BACKENDS
        .get(id)
        .ok_or_else(|| Error::InvalidConfig(format!("unknown backend id {id}")))?;
    let channel = lookup(&format!("{}_CHANNEL", info.prefix))
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| info.channel.to_string());

    tracing::debug!("Backend {} ({}) -> channel {}", id, info.prefix, channel);

    Ok(ResolvedBackend {
        id,
        channel,
        compress: info.compress,
    })
}
