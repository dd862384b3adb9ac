//! Ethereum wallet material
//!
//! One secp256k1 wallet per account, generated at account-opening time.
//! The private key is stored hex-encoded and never leaves the process
//! except through [`SigningKey::expose`] on its way into the ledger row or
//! a signer.

use alloy::primitives::keccak256;
use alloy::signers::local::PrivateKeySigner;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),
}

/// Hex-encoded secp256k1 private key (64 chars, no `0x` prefix).
///
/// `Debug` is redacted so the key cannot leak through logs or error chains.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey(String);

impl SigningKey {
    pub fn new(hex_key: impl Into<String>) -> Self {
        let key: String = hex_key.into();
        Self(key.trim().trim_start_matches("0x").to_string())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Build an alloy signer for this key
    pub fn signer(&self) -> Result<PrivateKeySigner, WalletError> {
        let bytes =
            hex::decode(&self.0).map_err(|e| WalletError::InvalidPrivateKey(e.to_string()))?;
        PrivateKeySigner::from_slice(&bytes)
            .map_err(|e| WalletError::InvalidPrivateKey(e.to_string()))
    }

    /// Whether this key signs for `address` (case-insensitive)
    pub fn controls(&self, address: &str) -> Result<bool, WalletError> {
        let derived = format!("{:?}", self.signer()?.address());
        Ok(derived.eq_ignore_ascii_case(address.trim()))
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

/// Freshly generated wallet: public address plus its signing key.
#[derive(Debug, Clone)]
pub struct EthereumWallet {
    pub address: String,
    pub signing_key: SigningKey,
}

/// Generate a new secp256k1 wallet.
///
/// Address derivation: keccak256 of the uncompressed public key without its
/// `0x04` prefix, last 20 bytes, `0x`-prefixed lower-case hex.
pub fn generate() -> EthereumWallet {
    let key = k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
    let public = key.verifying_key().to_encoded_point(false);
    let hash = keccak256(&public.as_bytes()[1..]);
    let address = format!("0x{}", hex::encode(&hash[12..]));

    EthereumWallet {
        address,
        signing_key: SigningKey(hex::encode(key.to_bytes())),
    }
}

/// `0x` followed by exactly 40 hex digits
pub fn is_valid_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .is_some_and(|body| body.len() == 40 && body.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_address_matches_signer() {
        let wallet = generate();
        assert!(is_valid_address(&wallet.address));

        let signer = wallet.signing_key.signer().unwrap();
        assert_eq!(
            format!("{:?}", signer.address()).to_lowercase(),
            wallet.address
        );
    }

    #[test]
    fn test_key_controls_only_its_own_address() {
        let wallet = generate();
        let other = generate();
        assert!(wallet.signing_key.controls(&wallet.address).unwrap());
        assert!(
            wallet
                .signing_key
                .controls(&wallet.address.to_uppercase().replace("0X", "0x"))
                .unwrap()
        );
        assert!(!wallet.signing_key.controls(&other.address).unwrap());
        assert!(SigningKey::new("0xabcdef").controls(&wallet.address).is_err());
    }

    #[test]
    fn test_wallets_are_unique() {
        let a = generate();
        let b = generate();
        assert_ne!(a.address, b.address);
        assert_ne!(a.signing_key, b.signing_key);
    }

    #[test]
    fn test_signing_key_redacted() {
        let wallet = generate();
        let debug = format!("{:?}", wallet);
        assert!(!debug.contains(wallet.signing_key.expose()));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address("0x52908400098527886E0F7030069857D2E4169EE7"));
        assert!(!is_valid_address("52908400098527886E0F7030069857D2E4169EE7"));
        assert!(!is_valid_address("0x1234"));
        assert!(!is_valid_address("0xZZ908400098527886E0F7030069857D2E4169EE7"));
    }

    #[test]
    fn test_signing_key_strips_prefix() {
        let key = SigningKey::new("0xabcdef");
        assert_eq!(key.expose(), "abcdef");
        assert!(key.signer().is_err());
    }
}
