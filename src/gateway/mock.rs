//! Scripted gateways for tests and local runs (`mock-api` feature)
//!
//! Results are served from a script queue; with an empty script every call
//! succeeds. Counters let tests assert how many irreversible calls happened.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{
    ChainClient, Confirmation, FeeQuote, GatewayError, PayoutClient, PayoutRequest,
    PreparedTransfer, TransferRequest,
};
use crate::core_types::ExternalRef;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A transfer that reached `send_prepared` successfully
#[derive(Debug, Clone, PartialEq)]
pub struct SentTransfer {
    pub hash: String,
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub gas_price_gwei: Decimal,
    pub nonce: u64,
}

pub struct MockChain {
    balances: DashMap<String, Decimal>,
    quote: Mutex<FeeQuote>,
    prepared: DashMap<String, SentTransfer>,
    /// Next nonce per sender, advanced by every accepted send
    nonces: DashMap<String, u64>,
    prepare_script: Mutex<VecDeque<GatewayError>>,
    send_script: Mutex<VecDeque<Result<(), GatewayError>>>,
    send_delay: Mutex<Option<Duration>>,
    confirmations: DashMap<String, Confirmation>,
    sent: Mutex<Vec<SentTransfer>>,
    send_attempts: AtomicUsize,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            balances: DashMap::new(),
            quote: Mutex::new(FeeQuote {
                gas_price_gwei: Decimal::new(30, 0),
                gas_limit: 21_000,
            }),
            prepared: DashMap::new(),
            nonces: DashMap::new(),
            prepare_script: Mutex::new(VecDeque::new()),
            send_script: Mutex::new(VecDeque::new()),
            send_delay: Mutex::new(None),
            confirmations: DashMap::new(),
            sent: Mutex::new(Vec::new()),
            send_attempts: AtomicUsize::new(0),
        }
    }

    pub fn set_balance(&self, address: &str, amount: Decimal) {
        self.balances.insert(address.to_ascii_lowercase(), amount);
    }

    pub fn set_gas_price(&self, gwei: Decimal) {
        lock(&self.quote).gas_price_gwei = gwei;
    }

    /// Queue a failure for the next `prepare_transfer`
    pub fn push_prepare_error(&self, error: GatewayError) {
        lock(&self.prepare_script).push_back(error);
    }

    /// Queue the outcome of the next `send_prepared`
    pub fn push_send_result(&self, result: Result<(), GatewayError>) {
        lock(&self.send_script).push_back(result);
    }

    /// Delay every send, e.g. to trip the saga timeout
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        *lock(&self.send_delay) = delay;
    }

    pub fn set_confirmation(&self, hash: &str, confirmation: Confirmation) {
        self.confirmations.insert(hash.to_string(), confirmation);
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentTransfer> {
        lock(&self.sent).clone()
    }
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn balance(&self, address: &str) -> Result<Decimal, GatewayError> {
        Ok(self
            .balances
            .get(&address.to_ascii_lowercase())
            .map(|b| *b)
            .unwrap_or(Decimal::ZERO))
    }

    async fn fee_quote(&self) -> FeeQuote {
        *lock(&self.quote)
    }

    async fn prepare_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<PreparedTransfer, GatewayError> {
        if let Some(error) = lock(&self.prepare_script).pop_front() {
            return Err(error);
        }
        let sender = request.from.to_ascii_lowercase();
        let nonce = self.nonces.get(&sender).map(|n| *n).unwrap_or(0);
        let hash = format!(
            "0x{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        self.prepared.insert(
            hash.clone(),
            SentTransfer {
                hash: hash.clone(),
                from: request.from.clone(),
                to: request.to.clone(),
                amount: request.amount,
                gas_price_gwei: request.gas_price_gwei,
                nonce,
            },
        );
        Ok(PreparedTransfer {
            hash,
            raw: Vec::new(),
            sender,
            nonce,
        })
    }

    async fn send_prepared(
        &self,
        prepared: &PreparedTransfer,
    ) -> Result<ExternalRef, GatewayError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.send_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = lock(&self.send_script).pop_front().unwrap_or(Ok(()));
        scripted?;

        let transfer = self
            .prepared
            .get(&prepared.hash)
            .map(|t| t.clone())
            .ok_or_else(|| GatewayError::Rejected("unknown transaction".to_string()))?;

        {
            let mut next = self.nonces.entry(prepared.sender.clone()).or_insert(0);
            if prepared.nonce != *next {
                return Err(GatewayError::Rejected(format!(
                    "nonce {} already used, next is {}",
                    prepared.nonce, *next
                )));
            }
            *next += 1;
        }

        let from = transfer.from.to_ascii_lowercase();
        if let Some(mut balance) = self.balances.get_mut(&from) {
            *balance = (*balance - transfer.amount).max(Decimal::ZERO);
        }
        *self
            .balances
            .entry(transfer.to.to_ascii_lowercase())
            .or_insert(Decimal::ZERO) += transfer.amount;

        lock(&self.sent).push(transfer);
        Ok(prepared.hash.clone())
    }

    async fn confirmation(&self, tx_hash: &str) -> Result<Confirmation, GatewayError> {
        if let Some(scripted) = self.confirmations.get(tx_hash) {
            return Ok(*scripted);
        }
        let known = lock(&self.sent).iter().any(|t| t.hash == tx_hash);
        Ok(if known {
            Confirmation::Confirmed
        } else {
            Confirmation::Unknown
        })
    }
}

pub struct MockPayout {
    script: Mutex<VecDeque<Result<ExternalRef, GatewayError>>>,
    delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<PayoutRequest>>,
    attempts: AtomicUsize,
}

impl MockPayout {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn push_result(&self, result: Result<ExternalRef, GatewayError>) {
        lock(&self.script).push_back(result);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Requests that were paid out
    pub fn paid(&self) -> Vec<PayoutRequest> {
        lock(&self.requests).clone()
    }
}

impl Default for MockPayout {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PayoutClient for MockPayout {
    async fn payout(&self, request: &PayoutRequest) -> Result<ExternalRef, GatewayError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| Ok(format!("PAYOUT-{}", request.batch_id)));
        let batch_id = scripted?;
        lock(&self.requests).push(request.clone());
        Ok(batch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet;

    fn transfer(from: &str, to: &str, amount: Decimal) -> TransferRequest {
        TransferRequest {
            from: from.to_string(),
            to: to.to_string(),
            amount,
            gas_price_gwei: Decimal::new(30, 0),
            signing_key: wallet::generate().signing_key,
        }
    }

    #[tokio::test]
    async fn test_mock_chain_moves_balance() {
        let chain = MockChain::new();
        chain.set_balance("0xAA", Decimal::new(5, 0));

        let hash = chain
            .broadcast(&transfer("0xaa", "0xbb", Decimal::new(2, 0)))
            .await
            .unwrap();

        assert_eq!(chain.balance("0xaa").await.unwrap(), Decimal::new(3, 0));
        assert_eq!(chain.balance("0xbb").await.unwrap(), Decimal::new(2, 0));
        assert_eq!(chain.confirmation(&hash).await.unwrap(), Confirmation::Confirmed);
        assert_eq!(chain.send_attempts(), 1);
    }

    #[tokio::test]
    async fn test_mock_chain_rejects_reused_nonce() {
        let chain = MockChain::new();
        chain.set_balance("0xaa", Decimal::new(5, 0));
        let first = chain
            .prepare_transfer(&transfer("0xaa", "0xbb", Decimal::ONE))
            .await
            .unwrap();
        let second = chain
            .prepare_transfer(&transfer("0xAA", "0xcc", Decimal::ONE))
            .await
            .unwrap();
        assert_eq!((first.nonce, second.nonce), (0, 0));

        chain.send_prepared(&first).await.unwrap();
        let err = chain.send_prepared(&second).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));
        assert_eq!(chain.sent().len(), 1);
        assert_eq!(chain.balance("0xcc").await.unwrap(), Decimal::ZERO);

        let third = chain
            .prepare_transfer(&transfer("0xaa", "0xcc", Decimal::ONE))
            .await
            .unwrap();
        assert_eq!(third.nonce, 1);
        chain.send_prepared(&third).await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_chain_script() {
        let chain = MockChain::new();
        chain.push_send_result(Err(GatewayError::Network("down".into())));

        let err = chain
            .broadcast(&transfer("0xaa", "0xbb", Decimal::ONE))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(chain.sent().is_empty());
        assert_eq!(
            chain.confirmation("0xmissing").await.unwrap(),
            Confirmation::Unknown
        );
    }

    #[tokio::test]
    async fn test_mock_payout_default_and_script() {
        let payout = MockPayout::new();
        payout.push_result(Err(GatewayError::RecipientInvalid("no such user".into())));
        let request = PayoutRequest {
            batch_id: "tx-1".into(),
            amount: Decimal::TEN,
            recipient: "bob@example.com".into(),
        };

        assert!(payout.payout(&request).await.is_err());
        assert_eq!(payout.payout(&request).await.unwrap(), "PAYOUT-tx-1");
        assert_eq!(payout.attempts(), 2);
        assert_eq!(payout.paid().len(), 1);
    }
}
