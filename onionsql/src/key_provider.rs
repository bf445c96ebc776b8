//! Key provider abstraction for the proxy's master key.

use crate::error::KeyProviderError;
use secrecy::SecretVec;

/// Supplies the master key every layer key is derived from.
///
/// Implementations must be thread-safe (`Send + Sync`) so a provider can be
/// shared between proxies opened over different stores.
///
/// # Example
///
/// ```rust,ignore
/// use onionsql::key_provider::KeyProvider;
///
/// struct EnvProvider;
///
/// impl KeyProvider for EnvProvider {
///     fn master_key(&self) -> Result<SecretVec<u8>, KeyProviderError> {
///         // Implementation
///     }
/// }
/// ```
pub trait KeyProvider: Send + Sync {
    /// Returns the master key.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::KeyNotFound` if no key is available, or
    /// `KeyProviderError::InvalidKey` if the stored key is malformed.
    fn master_key(&self) -> Result<SecretVec<u8>, KeyProviderError>;
}

/// Provider over a key already held in memory.
pub struct StaticKeyProvider {
    key: SecretVec<u8>,
}

impl StaticKeyProvider {
    /// Wraps an in-memory master key.
    #[must_use]
    pub const fn new(key: SecretVec<u8>) -> Self {
        Self { key }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn master_key(&self) -> Result<SecretVec<u8>, KeyProviderError> {
        use secrecy::ExposeSecret;

        Ok(SecretVec::new(self.key.expose_secret().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_static_provider_returns_key() {
        let provider = StaticKeyProvider::new(SecretVec::new(vec![7u8; 32]));
        let key = provider.master_key().unwrap();
        assert_eq!(key.expose_secret(), &vec![7u8; 32]);
    }
}
