//! Exact ether / gwei / wei conversion
//!
//! Decimal scaling only. Amounts with more than 18 fractional digits are
//! refused rather than rounded.

use alloy::primitives::U256;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use super::GatewayError;

pub const ETHER_DECIMALS: u32 = 18;
const WEI_PER_ETHER: u64 = 1_000_000_000_000_000_000;
const WEI_PER_GWEI: u64 = 1_000_000_000;

pub fn ether_to_wei(amount: Decimal) -> Result<U256, GatewayError> {
    if amount < Decimal::ZERO {
        return Err(GatewayError::InvalidInput(format!("negative amount {amount}")));
    }
    let wei = amount
        .checked_mul(Decimal::from(WEI_PER_ETHER))
        .ok_or_else(|| GatewayError::InvalidInput(format!("amount {amount} overflows wei")))?;
    if !wei.fract().is_zero() {
        return Err(GatewayError::InvalidInput(format!(
            "amount {amount} has more than {ETHER_DECIMALS} decimal places"
        )));
    }
    wei.to_u128()
        .map(U256::from)
        .ok_or_else(|| GatewayError::InvalidInput(format!("amount {amount} overflows wei")))
}

pub fn wei_to_ether(wei: U256) -> Result<Decimal, GatewayError> {
    let too_large = || GatewayError::InvalidInput(format!("{wei} wei exceeds decimal range"));
    let wei = u128::try_from(wei).map_err(|_| too_large())?;
    let wei = i128::try_from(wei).map_err(|_| too_large())?;
    Decimal::try_from_i128_with_scale(wei, ETHER_DECIMALS)
        .map(|d| d.normalize())
        .map_err(|_| too_large())
}

pub fn gwei_to_wei(gwei: Decimal) -> Result<u128, GatewayError> {
    let wei = gwei
        .checked_mul(Decimal::from(WEI_PER_GWEI))
        .filter(|w| *w >= Decimal::ZERO && w.fract().is_zero())
        .ok_or_else(|| GatewayError::InvalidInput(format!("invalid gas price {gwei} gwei")))?;
    wei.to_u128()
        .ok_or_else(|| GatewayError::InvalidInput(format!("invalid gas price {gwei} gwei")))
}

pub fn wei_to_gwei(wei: u128) -> Decimal {
    match i128::try_from(wei).ok().and_then(|w| Decimal::try_from_i128_with_scale(w, 9).ok()) {
        Some(gwei) => gwei.normalize(),
        None => Decimal::MAX,
    }
}

/// `gas_limit × gas_price` in ether
pub fn fee_ether(gas_limit: u64, gas_price_gwei: Decimal) -> Decimal {
    (Decimal::from(gas_limit) * gas_price_gwei * Decimal::new(1, 9)).normalize()
}
