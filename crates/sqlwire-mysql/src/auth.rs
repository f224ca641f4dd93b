//! MySQL authentication plugins.
//!
//! The server names a plugin in its greeting (and again in any auth switch
//! request) together with a scramble. The client answers with a response
//! computed by the plugin of that name.
//!
//! # mysql_native_password
//!
//! Password scramble algorithm:
//! ```text
//! SHA1(password) XOR SHA1(scramble[..20] + SHA1(SHA1(password)))
//! ```
//!
//! Further plugins can be registered on the configuration through the
//! [`AuthPlugin`] trait.

use std::sync::Arc;

use sha1::{Digest, Sha1};
use sqlwire_core::{Error, Result};

/// Well-known authentication plugin names.
pub mod plugins {
    /// SHA1-based authentication
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
}

/// Length of the scramble used by `mysql_native_password`.
pub const SCRAMBLE_LENGTH: usize = 20;

/// A client-side authentication plugin.
pub trait AuthPlugin: std::fmt::Debug + Send + Sync {
    /// Plugin name as it appears on the wire.
    fn name(&self) -> &str;

    /// Compute the auth response for `password` and the server's scramble.
    fn scramble(&self, password: &str, scramble: &[u8]) -> Result<Vec<u8>>;
}

/// The built-in `mysql_native_password` plugin.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativePassword;

impl AuthPlugin for NativePassword {
    fn name(&self) -> &str {
        plugins::MYSQL_NATIVE_PASSWORD
    }

    fn scramble(&self, password: &str, scramble: &[u8]) -> Result<Vec<u8>> {
        Ok(mysql_native_password(password, scramble))
    }
}

/// Compute mysql_native_password authentication response.
///
/// Only the first 20 bytes of the scramble are used; servers append a NUL.
/// Returns an empty response for an empty password.
pub fn mysql_native_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let seed = &scramble[..scramble.len().min(SCRAMBLE_LENGTH)];

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let stage3 = Sha1::new().chain_update(seed).chain_update(stage2).finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Find the plugin named `name`.
///
/// Registered plugins take precedence over the built-in one.
pub fn resolve(name: &str, registered: &[Arc<dyn AuthPlugin>]) -> Result<Arc<dyn AuthPlugin>> {
    if let Some(plugin) = registered.iter().find(|p| p.name() == name) {
        return Ok(Arc::clone(plugin));
    }
    if name == plugins::MYSQL_NATIVE_PASSWORD {
        return Ok(Arc::new(NativePassword));
    }
    Err(Error::UnsupportedAuthPlugin(name.to_string()))
}
