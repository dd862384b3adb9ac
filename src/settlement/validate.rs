//! Input checks run before any store access

use rust_decimal::Decimal;

use super::error::ValidationError;
use crate::core_types::{AssetCode, UserId};
use crate::wallet;

/// Wei precision
pub const CRYPTO_SCALE: u32 = 18;

pub fn user(user: &UserId) -> Result<(), ValidationError> {
    if user.is_blank() {
        return Err(ValidationError::BlankUser);
    }
    Ok(())
}

pub fn asset(asset: &AssetCode) -> Result<(), ValidationError> {
    if asset.is_blank() {
        return Err(ValidationError::BlankAsset);
    }
    Ok(())
}

/// Strictly positive, at most `max_scale` significant decimal places
pub fn amount(amount: Decimal, max_scale: u32) -> Result<(), ValidationError> {
    if amount <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveAmount(amount));
    }
    if amount.normalize().scale() > max_scale {
        return Err(ValidationError::PrecisionExceeded { amount, max_scale });
    }
    Ok(())
}

pub fn address(address: &str) -> Result<(), ValidationError> {
    if !wallet::is_valid_address(address) {
        return Err(ValidationError::InvalidAddress(address.to_string()));
    }
    Ok(())
}

/// Payout recipients are e-mail addresses
pub fn recipient(recipient: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidRecipient(recipient.to_string());
    if recipient.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = recipient.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') || !domain.contains('.') {
        return Err(invalid());
    }
    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(invalid());
    }
    Ok(())
}

pub fn external_ref(external_ref: &str) -> Result<(), ValidationError> {
    if external_ref.trim().is_empty() {
        return Err(ValidationError::MissingExternalRef);
    }
    Ok(())
}

pub fn pair(base: &AssetCode, quote: &AssetCode) -> Result<(), ValidationError> {
    asset(base)?;
    asset(quote)?;
    if base == quote {
        return Err(ValidationError::SameAsset(base.clone()));
    }
    Ok(())
}
