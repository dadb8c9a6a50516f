//! Nonce-sequenced transaction queue
//!
//! One lane per signer. Normal jobs on a lane broadcast strictly one after
//! another: each job waits for the previous job's *broadcast step*, never for
//! its confirmation. Priority jobs skip the wait but share the lane's nonce
//! counter.
//!
//! Nonces are read from `getTransactionCount(pending)` the first time a lane
//! is used and then handed out from memory, once per job. A stale-nonce error
//! resyncs from the node; a job that fails after taking a nonce marks the lane
//! for resync so the gap is reused.

pub mod gas;
pub mod retry;

use alloy_primitives::{Address, B256};
use backoff::backoff::Backoff;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::{Future, IntoFuture};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::audit::{AuditEntry, AuditLog, AuditPhase};
use crate::chain::{BlockTag, ChainClient, Receipt, TransactionRequest};
use crate::config::QueueConfig;
use crate::error::{BroadcastFailure, Error, Result};
use crate::events::{Event, EventBus, TxErrorNotice, TxNotice, TxPhase};

use retry::{RetryDecision, RetryState};

/// Builds the request for an allocated nonce. Called again on every retry.
pub type TxBuilder =
    Arc<dyn Fn(u64) -> BoxFuture<'static, Result<TransactionRequest>> + Send + Sync>;

/// Wrap an async closure as a [`TxBuilder`]
pub fn builder<F, Fut>(f: F) -> TxBuilder
where
    F: Fn(u64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TransactionRequest>> + Send + 'static,
{
    Arc::new(move |nonce| f(nonce).boxed())
}

/// Builder for a request that does not depend on chain state
pub fn fixed(request: TransactionRequest) -> TxBuilder {
    builder(move |_| {
        let request = request.clone();
        async move { Ok(request) }
    })
}

/// Per-job options
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub label: String,
    /// Skip the lane's ordering chain
    pub priority: bool,
    /// Resolve with the mined receipt instead of the sent hash
    pub wait_for_confirm: bool,
    /// Resolve with the hash as soon as the node accepts it; wins over
    /// `wait_for_confirm`
    pub resolve_on_sent: bool,
    /// Trade whose history receives this job's phases
    pub trade: Option<String>,
    /// Free-form action kind for the audit log (`buy`, `approve`, `sell`)
    pub action: Option<String>,
}

impl EnqueueOptions {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn priority(mut self) -> Self {
        self.priority = true;
        self
    }

    pub fn wait_for_confirm(mut self) -> Self {
        self.wait_for_confirm = true;
        self
    }

    pub fn resolve_on_sent(mut self) -> Self {
        self.resolve_on_sent = true;
        self
    }

    pub fn trade(mut self, trade_id: impl Into<String>) -> Self {
        self.trade = Some(trade_id.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    fn waits(&self) -> bool {
        self.wait_for_confirm && !self.resolve_on_sent
    }
}

/// What the caller of [`TxQueue::enqueue`] receives
#[derive(Debug, Clone)]
pub enum QueueOutcome {
    Sent { hash: B256, nonce: u64 },
    Confirmed(Receipt),
}

impl QueueOutcome {
    pub fn hash(&self) -> B256 {
        match self {
            QueueOutcome::Sent { hash, .. } => *hash,
            QueueOutcome::Confirmed(receipt) => receipt.transaction_hash,
        }
    }

    pub fn receipt(&self) -> Option<&Receipt> {
        match self {
            QueueOutcome::Confirmed(receipt) => Some(receipt),
            QueueOutcome::Sent { .. } => None,
        }
    }
}

/// How a broadcast job ended on chain
#[derive(Debug, Clone)]
pub enum Settlement {
    Mined(Receipt),
    Reverted(Receipt),
    /// Not mined within `confirm_timeout_ms`, or the receipt was unreadable.
    /// The transaction may still land.
    Unknown(String),
}

/// Settles once with the outcome chosen by the job's options
pub struct JobHandle {
    label: String,
    rx: oneshot::Receiver<Result<QueueOutcome>>,
    settlement: oneshot::Receiver<Settlement>,
}

impl JobHandle {
    /// Resolve once the node accepts the transaction, keeping its on-chain
    /// outcome for later. Errors here are broadcast failures only.
    pub async fn into_sent(self) -> Result<SentJob> {
        let JobHandle {
            label,
            rx,
            settlement,
        } = self;
        let outcome = rx.await.unwrap_or_else(|_| Err(Error::JobDropped(label)))?;
        Ok(SentJob {
            hash: outcome.hash(),
            settlement,
        })
    }
}

impl IntoFuture for JobHandle {
    type Output = Result<QueueOutcome>;
    type IntoFuture = BoxFuture<'static, Result<QueueOutcome>>;

    fn into_future(self) -> Self::IntoFuture {
        let label = self.label;
        let rx = self.rx;
        async move { rx.await.unwrap_or_else(|_| Err(Error::JobDropped(label))) }.boxed()
    }
}

/// A broadcast the node accepted, with its confirmation still running
pub struct SentJob {
    pub hash: B256,
    settlement: oneshot::Receiver<Settlement>,
}

impl SentJob {
    pub async fn settled(self) -> Settlement {
        self.settlement
            .await
            .unwrap_or_else(|_| Settlement::Unknown("confirmation task dropped".into()))
    }
}

#[derive(Debug, Default)]
struct NonceState {
    next: u64,
    initialized: bool,
}

#[derive(Default)]
struct SignerLane {
    nonce: tokio::sync::Mutex<NonceState>,
    /// Completion signal of the last normal job's broadcast step
    tail: Mutex<Option<oneshot::Receiver<()>>>,
}

impl SignerLane {
    async fn allocate(&self, client: &dyn ChainClient, signer: Address) -> Result<u64> {
        let mut state = self.nonce.lock().await;
        if !state.initialized {
            state.next = client
                .get_transaction_count(signer, BlockTag::Pending)
                .await?;
            state.initialized = true;
            debug!("Initialized nonce for {} at {}", signer, state.next);
        }
        let nonce = state.next;
        state.next += 1;
        Ok(nonce)
    }

    async fn resync(&self, client: &dyn ChainClient, signer: Address) -> Result<u64> {
        let mut state = self.nonce.lock().await;
        let pending = client
            .get_transaction_count(signer, BlockTag::Pending)
            .await?;
        state.next = pending + 1;
        state.initialized = true;
        Ok(pending)
    }

    async fn invalidate(&self) {
        self.nonce.lock().await.initialized = false;
    }
}

/// Releases the next normal job when dropped
struct TailRelease(Option<oneshot::Sender<()>>);

impl TailRelease {
    fn release(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TailRelease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Where a job reports back to its [`JobHandle`]
struct JobReply {
    result: oneshot::Sender<Result<QueueOutcome>>,
    settlement: oneshot::Sender<Settlement>,
}

/// Per-signer broadcast queue
pub struct TxQueue {
    client: Arc<dyn ChainClient>,
    config: QueueConfig,
    events: EventBus,
    audit: AuditLog,
    lanes: DashMap<Address, Arc<SignerLane>>,
}

impl TxQueue {
    pub fn new(
        client: Arc<dyn ChainClient>,
        config: QueueConfig,
        events: EventBus,
        audit: AuditLog,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            events,
            audit,
            lanes: DashMap::new(),
        })
    }

    fn lane(&self, signer: Address) -> Arc<SignerLane> {
        self.lanes.entry(signer).or_default().clone()
    }

    /// Next nonce the lane would hand out, if it has been initialized
    pub async fn next_nonce(&self, signer: Address) -> Option<u64> {
        let lane = self.lanes.get(&signer)?.clone();
        let state = lane.nonce.lock().await;
        state.initialized.then_some(state.next)
    }

    /// Queue a broadcast for `signer`.
    ///
    /// Ordering is fixed here, synchronously: a normal job always follows the
    /// normal job enqueued before it on the same signer.
    pub fn enqueue(
        self: &Arc<Self>,
        signer: Address,
        builder: TxBuilder,
        opts: EnqueueOptions,
    ) -> JobHandle {
        let (result_tx, result_rx) = oneshot::channel();
        let (settle_tx, settle_rx) = oneshot::channel();
        let lane = self.lane(signer);

        let (previous, release) = if opts.priority {
            (None, TailRelease(None))
        } else {
            let (done_tx, done_rx) = oneshot::channel();
            let mut tail = lane.tail.lock().unwrap_or_else(|p| p.into_inner());
            let previous = tail.replace(done_rx);
            (previous, TailRelease(Some(done_tx)))
        };

        let label = opts.label.clone();
        let queue = self.clone();
        tokio::spawn(async move {
            if let Some(previous) = previous {
                // Err only means the previous job went away; keep going
                let _ = previous.await;
            }
            let reply = JobReply {
                result: result_tx,
                settlement: settle_tx,
            };
            queue.run_job(lane, signer, builder, opts, release, reply).await;
        });

        JobHandle {
            label,
            rx: result_rx,
            settlement: settle_rx,
        }
    }

    async fn run_job(
        &self,
        lane: Arc<SignerLane>,
        signer: Address,
        builder: TxBuilder,
        opts: EnqueueOptions,
        mut release: TailRelease,
        reply: JobReply,
    ) {
        let JobReply {
            result: result_tx,
            settlement: settle_tx,
        } = reply;
        let sent = self.broadcast(&lane, signer, &builder, &opts).await;
        // The lane must be marked stale before the next job may allocate
        if sent.is_err() {
            lane.invalidate().await;
        }
        release.release();

        let (hash, nonce) = match sent {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Broadcast failed for {}: {}", opts.label, e);
                self.events.emit(Event::TxError(TxErrorNotice {
                    address: signer,
                    hash: None,
                    label: opts.label.clone(),
                    phase: TxPhase::Broadcast,
                    error: e.to_string(),
                    trade: opts.trade.clone(),
                }));
                let mut entry = self.entry(AuditPhase::Error, signer, &opts);
                entry.error = Some(e.to_string());
                self.audit.record(&entry).await;
                let _ = result_tx.send(Err(e));
                return;
            }
        };

        info!("Sent {} nonce={} hash={}", opts.label, nonce, hash);
        self.events.emit(Event::TxSent(TxNotice {
            address: signer,
            hash,
            label: opts.label.clone(),
            nonce,
            trade: opts.trade.clone(),
            block_number: None,
        }));
        let mut entry = self.entry(AuditPhase::Sent, signer, &opts);
        entry.hash = Some(hash);
        entry.nonce = Some(nonce);
        self.audit.record(&entry).await;

        let waiter = if opts.waits() {
            Some(result_tx)
        } else {
            let _ = result_tx.send(Ok(QueueOutcome::Sent { hash, nonce }));
            None
        };

        let mined = self
            .client
            .wait_for_receipt(
                hash,
                Duration::from_millis(self.config.confirm_timeout_ms),
                Duration::from_millis(self.config.receipt_poll_ms),
            )
            .await;

        let settlement = match mined {
            Ok(receipt) if receipt.status => {
                info!(
                    "Confirmed {} nonce={} block={}",
                    opts.label, nonce, receipt.block_number
                );
                self.events.emit(Event::TxConfirmed(TxNotice {
                    address: signer,
                    hash,
                    label: opts.label.clone(),
                    nonce,
                    trade: opts.trade.clone(),
                    block_number: Some(receipt.block_number),
                }));
                let mut entry = self.entry(AuditPhase::Confirmed, signer, &opts);
                entry.hash = Some(hash);
                entry.nonce = Some(nonce);
                entry.block_number = Some(receipt.block_number);
                self.audit.record(&entry).await;
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(QueueOutcome::Confirmed(receipt.clone())));
                }
                Settlement::Mined(receipt)
            }
            failed => {
                let (e, settlement) = match failed {
                    Ok(receipt) => (
                        Error::Reverted {
                            hash: hash.to_string(),
                        },
                        Settlement::Reverted(receipt),
                    ),
                    Err(e) => {
                        let reason = e.to_string();
                        (e, Settlement::Unknown(reason))
                    }
                };
                warn!("Confirmation failed for {} ({}): {}", opts.label, hash, e);
                self.events.emit(Event::TxError(TxErrorNotice {
                    address: signer,
                    hash: Some(hash),
                    label: opts.label.clone(),
                    phase: TxPhase::Confirmation,
                    error: e.to_string(),
                    trade: opts.trade.clone(),
                }));
                let mut entry = self.entry(AuditPhase::Error, signer, &opts);
                entry.hash = Some(hash);
                entry.nonce = Some(nonce);
                entry.error = Some(e.to_string());
                self.audit.record(&entry).await;
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(e));
                }
                settlement
            }
        };
        let _ = settle_tx.send(settlement);
    }

    /// Allocate a nonce and broadcast with retries. Returns hash and nonce.
    async fn broadcast(
        &self,
        lane: &SignerLane,
        signer: Address,
        builder: &TxBuilder,
        opts: &EnqueueOptions,
    ) -> Result<(B256, u64)> {
        let client = self.client.as_ref();
        let mut nonce = lane.allocate(client, signer).await?;
        let mut state = RetryState::default();
        let mut backoff = retry::broadcast_backoff(&self.config);

        loop {
            let mut request = (**builder)(nonce).await?;
            request.from = signer;
            request.nonce = Some(nonce);
            if !request.has_fees() {
                let fee = client.get_fee_data().await?;
                gas::fill_fees(&mut request, &fee);
            }
            gas::apply_gas_policy(&mut request, self.config.gas_cap_wei());

            let err = match client.send_transaction(&request).await {
                Ok(hash) => return Ok((hash, nonce)),
                Err(e) => e,
            };
            let kind = err.broadcast_failure();

            match state.decide(kind, &self.config) {
                RetryDecision::Resync => {
                    let fresh = lane.resync(client, signer).await?;
                    warn!(
                        "{}: nonce {} rejected ({}), resynced to {}",
                        opts.label, nonce, err, fresh
                    );
                    nonce = fresh;
                }
                RetryDecision::Backoff { probe } => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_millis(self.config.max_backoff_ms));
                    warn!(
                        "{}: broadcast attempt {}/{} failed ({:?}): {} - retrying in {:?}",
                        opts.label, state.attempts, self.config.max_attempts, kind, err, delay
                    );
                    tokio::time::sleep(delay).await;
                    if probe {
                        if let Err(e) = client.get_block_number().await {
                            debug!("Connectivity probe failed: {}", e);
                        }
                    }
                }
                RetryDecision::Fail => {
                    return Err(match kind {
                        BroadcastFailure::InsufficientFunds => {
                            Error::InsufficientFunds(err.to_string())
                        }
                        _ => Error::Broadcast {
                            kind,
                            label: opts.label.clone(),
                            message: err.to_string(),
                        },
                    });
                }
            }
        }
    }

    fn entry(&self, phase: AuditPhase, signer: Address, opts: &EnqueueOptions) -> AuditEntry {
        let mut entry = AuditEntry::new(phase, signer, opts.label.clone());
        entry.action = opts.action.clone();
        entry.trade = opts.trade.clone();
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AUDIT_KEY;
    use crate::chain::mock::MockChain;
    use crate::store::{KvStore, MemoryStore};
    use std::collections::HashSet;
    use tokio_test::assert_ok;

    fn signer() -> Address {
        Address::repeat_byte(0xaa)
    }

    fn test_config() -> QueueConfig {
        QueueConfig {
            base_backoff_ms: 1,
            max_backoff_ms: 5,
            receipt_poll_ms: 5,
            confirm_timeout_ms: 500,
            ..Default::default()
        }
    }

    fn queue_with(chain: Arc<MockChain>, config: QueueConfig) -> (Arc<TxQueue>, Arc<MemoryStore>, EventBus) {
        let store = Arc::new(MemoryStore::new());
        let events = EventBus::new(256);
        let audit = AuditLog::new(store.clone(), 100);
        (TxQueue::new(chain, config, events.clone(), audit), store, events)
    }

    fn transfer() -> TransactionRequest {
        TransactionRequest::self_transfer(signer())
    }

    #[tokio::test]
    async fn test_nonces_follow_call_order() {
        let chain = Arc::new(MockChain::with_nonces(7, 7));
        let (queue, _, _) = queue_with(chain.clone(), test_config());

        let handles: Vec<_> = (0..5u64)
            .map(|i| {
                // Earlier builders are slower
                let delay = Duration::from_millis(25 - i * 5);
                let b = builder(move |_nonce| async move {
                    tokio::time::sleep(delay).await;
                    Ok(TransactionRequest::self_transfer(signer()))
                });
                queue.enqueue(signer(), b, EnqueueOptions::new(format!("job-{}", i)))
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(chain.sent_nonces(), vec![7, 8, 9, 10, 11]);
    }

    #[tokio::test]
    async fn test_concurrent_enqueue_distinct_nonces() {
        let chain = Arc::new(MockChain::with_nonces(0, 3));
        let (queue, _, _) = queue_with(chain.clone(), test_config());

        let mut handles = Vec::new();
        for i in 0..10 {
            let opts = if i % 3 == 0 {
                EnqueueOptions::new("manual").priority()
            } else {
                EnqueueOptions::new("auto")
            };
            handles.push(queue.enqueue(signer(), fixed(transfer()), opts));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let nonces = chain.sent_nonces();
        let unique: HashSet<_> = nonces.iter().copied().collect();
        assert_eq!(nonces.len(), 10);
        assert_eq!(unique.len(), 10);
        assert_eq!(unique, (3..13).collect());
    }

    #[tokio::test]
    async fn test_nonce_too_low_resyncs_without_consuming_attempt() {
        let chain = Arc::new(MockChain::with_nonces(5, 5));
        let config = QueueConfig {
            max_attempts: 1,
            ..test_config()
        };
        let (queue, _, _) = queue_with(chain.clone(), config);

        queue
            .enqueue(signer(), fixed(transfer()), EnqueueOptions::new("first"))
            .await
            .unwrap();
        assert_eq!(queue.next_nonce(signer()).await, Some(6));

        // Another sender using the same key took nonce 6
        chain.state.lock().unwrap().pending_nonce = 7;
        chain.fail_next_sends(["nonce too low: next nonce 7, tx nonce 6"]);

        let outcome = queue
            .enqueue(signer(), fixed(transfer()), EnqueueOptions::new("buy"))
            .await
            .unwrap();
        assert!(matches!(outcome, QueueOutcome::Sent { nonce: 7, .. }));
        assert_eq!(chain.sent_nonces(), vec![5, 7]);
        assert_eq!(queue.next_nonce(signer()).await, Some(8));
        // Initial read plus one resync
        assert_eq!(chain.state.lock().unwrap().nonce_queries, 2);
    }

    #[tokio::test]
    async fn test_insufficient_funds_fails_fast() {
        let chain = Arc::new(MockChain::with_nonces(0, 0));
        chain.fail_next_sends(["insufficient funds for gas * price + value"]);
        let (queue, store, _) = queue_with(chain.clone(), test_config());

        let err = queue
            .enqueue(signer(), fixed(transfer()), EnqueueOptions::new("buy").trade("t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds(_)));
        assert!(chain.sent().is_empty());

        let history = store.lrange("trade:t1:history", 0, -1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].contains("\"error\""));

        // Lane keeps working and reuses the unspent nonce
        queue
            .enqueue(signer(), fixed(transfer()), EnqueueOptions::new("next"))
            .await
            .unwrap();
        assert_eq!(chain.sent_nonces(), vec![0]);
    }

    #[tokio::test]
    async fn test_transient_errors_retry_then_succeed() {
        let chain = Arc::new(MockChain::with_nonces(0, 0));
        chain.fail_next_sends(["502 Bad Gateway", "request timed out"]);
        let (queue, _, _) = queue_with(chain.clone(), test_config());

        let outcome = queue
            .enqueue(signer(), fixed(transfer()), EnqueueOptions::new("buy"))
            .await
            .unwrap();
        assert!(matches!(outcome, QueueOutcome::Sent { nonce: 0, .. }));
        assert_eq!(chain.sent_nonces(), vec![0]);
    }

    #[tokio::test]
    async fn test_other_errors_exhaust_attempts() {
        let chain = Arc::new(MockChain::with_nonces(0, 0));
        chain.fail_next_sends(["execution reverted", "execution reverted", "execution reverted"]);
        let config = QueueConfig {
            max_attempts: 3,
            ..test_config()
        };
        let (queue, _, _) = queue_with(chain.clone(), config);

        let err = queue
            .enqueue(signer(), fixed(transfer()), EnqueueOptions::new("buy"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Broadcast {
                kind: BroadcastFailure::Other,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_wait_for_confirm_returns_receipt() {
        let chain = Arc::new(MockChain::with_nonces(0, 0));
        let (queue, store, events) = queue_with(chain.clone(), test_config());
        let mut rx = events.subscribe();

        let outcome = queue
            .enqueue(
                signer(),
                fixed(transfer()),
                EnqueueOptions::new("buy").wait_for_confirm().trade("t9"),
            )
            .await
            .unwrap();
        assert!(outcome.receipt().is_some());

        assert_eq!(rx.recv().await.unwrap().name(), "tx:sent");
        assert_eq!(rx.recv().await.unwrap().name(), "tx:confirmed");
        assert_eq!(store.lrange(AUDIT_KEY, 0, -1).await.unwrap().len(), 2);
        assert_eq!(store.lrange("trade:t9:history", 0, -1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_confirmation_failure_only_reported() {
        let chain = Arc::new(MockChain::with_nonces(0, 0));
        chain.state.lock().unwrap().auto_mine = false;
        let config = QueueConfig {
            confirm_timeout_ms: 30,
            ..test_config()
        };
        let (queue, _, events) = queue_with(chain.clone(), config);
        let mut rx = events.subscribe();

        // Caller resolves on send; the timeout surfaces as an event only
        let outcome = queue
            .enqueue(signer(), fixed(transfer()), EnqueueOptions::new("sell"))
            .await
            .unwrap();
        assert!(matches!(outcome, QueueOutcome::Sent { .. }));

        assert_eq!(rx.recv().await.unwrap().name(), "tx:sent");
        match rx.recv().await.unwrap() {
            Event::TxError(notice) => assert_eq!(notice.phase, TxPhase::Confirmation),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reverted_rejects_waiting_caller() {
        let chain = Arc::new(MockChain::with_nonces(0, 0));
        chain.state.lock().unwrap().auto_mine = false;
        let (queue, _, _) = queue_with(chain.clone(), test_config());

        let handle = queue.enqueue(
            signer(),
            fixed(transfer()),
            EnqueueOptions::new("buy").wait_for_confirm(),
        );
        let hash = crate::chain::mock::tx_hash(1_001);
        tokio::time::sleep(Duration::from_millis(20)).await;
        chain.insert_receipt(Receipt {
            transaction_hash: hash,
            block_number: 101,
            status: false,
            from: signer(),
            to: Some(signer()),
            gas_used: None,
            logs: vec![],
        });

        let err = handle.await.unwrap_err();
        assert!(matches!(err, Error::Reverted { .. }));
    }

    #[tokio::test]
    async fn test_normal_jobs_do_not_wait_for_confirmation() {
        let chain = Arc::new(MockChain::with_nonces(0, 0));
        chain.state.lock().unwrap().auto_mine = false;
        let (queue, _, _) = queue_with(chain.clone(), test_config());

        let first = queue.enqueue(
            signer(),
            fixed(transfer()),
            EnqueueOptions::new("first").wait_for_confirm(),
        );
        let second = queue.enqueue(signer(), fixed(transfer()), EnqueueOptions::new("second"));

        // Second broadcasts while the first is still unmined
        let outcome = tokio::time::timeout(Duration::from_millis(200), second)
            .await
            .expect("second job blocked on confirmation")
            .unwrap();
        assert!(matches!(outcome, QueueOutcome::Sent { nonce: 1, .. }));
        drop(first);
    }

    #[tokio::test]
    async fn test_already_known_is_not_rebroadcast() {
        let chain = Arc::new(MockChain::with_nonces(0, 0));
        chain.fail_next_sends(["already known"]);
        let (queue, _, _) = queue_with(chain.clone(), test_config());

        let err = queue
            .enqueue(signer(), fixed(transfer()), EnqueueOptions::new("buy"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Broadcast {
                kind: BroadcastFailure::AlreadyKnown,
                ..
            }
        ));
        assert!(chain.sent().is_empty());
        // No resync, no second nonce
        assert_eq!(chain.state.lock().unwrap().nonce_queries, 1);

        // The node's pool holds nonce 0; the next job starts after it
        chain.state.lock().unwrap().pending_nonce = 1;
        let outcome = queue
            .enqueue(signer(), fixed(transfer()), EnqueueOptions::new("next"))
            .await
            .unwrap();
        assert!(matches!(outcome, QueueOutcome::Sent { nonce: 1, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_job_nonce_reused_by_next_in_line() {
        for _ in 0..50 {
            let chain = Arc::new(MockChain::with_nonces(0, 0));
            chain.fail_next_sends(["insufficient funds for gas * price + value"]);
            let (queue, _, _) = queue_with(chain.clone(), test_config());

            // Both queued before either runs; the second follows the first
            let first = queue.enqueue(signer(), fixed(transfer()), EnqueueOptions::new("first"));
            let second = queue.enqueue(signer(), fixed(transfer()), EnqueueOptions::new("second"));

            assert!(first.await.is_err());
            let outcome = second.await.unwrap();
            assert!(matches!(outcome, QueueOutcome::Sent { nonce: 0, .. }));
            assert_eq!(chain.sent_nonces(), vec![0]);
        }
    }

    #[tokio::test]
    async fn test_into_sent_delivers_settlement() {
        let chain = Arc::new(MockChain::with_nonces(0, 0));
        let (queue, _, _) = queue_with(chain.clone(), test_config());

        let sent = queue
            .enqueue(signer(), fixed(transfer()), EnqueueOptions::new("buy"))
            .into_sent()
            .await
            .unwrap();
        assert_eq!(sent.hash, crate::chain::mock::tx_hash(1_001));
        match sent.settled().await {
            Settlement::Mined(receipt) => assert_eq!(receipt.transaction_hash, crate::chain::mock::tx_hash(1_001)),
            other => panic!("unexpected settlement {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_into_sent_reports_timeout_as_unknown() {
        let chain = Arc::new(MockChain::with_nonces(0, 0));
        chain.state.lock().unwrap().auto_mine = false;
        let config = QueueConfig {
            confirm_timeout_ms: 30,
            ..test_config()
        };
        let (queue, _, _) = queue_with(chain.clone(), config);

        let sent = queue
            .enqueue(signer(), fixed(transfer()), EnqueueOptions::new("sell"))
            .into_sent()
            .await
            .unwrap();
        assert!(matches!(sent.settled().await, Settlement::Unknown(_)));
    }

    #[tokio::test]
    async fn test_fee_cap_applied() {
        let chain = Arc::new(MockChain::with_nonces(0, 0));
        let config = QueueConfig {
            max_gas_price_gwei: 10.0,
            ..test_config()
        };
        let (queue, _, _) = queue_with(chain.clone(), config);

        tokio_test::assert_ok!(
            queue
                .enqueue(signer(), fixed(transfer()), EnqueueOptions::new("capped"))
                .await
        );
        let sent = chain.sent();
        assert_eq!(sent[0].max_fee_per_gas, Some(10_000_000_000));
        assert_eq!(sent[0].max_priority_fee_per_gas, Some(1_000_000_000));
    }
}
