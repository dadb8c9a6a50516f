//! Log subscriber
//!
//! Keeps a log subscription open for the union of every strategy's filters and
//! feeds matching logs into the detection [`Pipeline`]:
//!
//! `Disconnected -> Connecting -> Subscribed -> Disconnected (backoff) -> ...`
//!
//! Filters are re-read from the registry every `filter_refresh_secs`; a change
//! re-subscribes without waiting for the connection to drop. Transports
//! without push subscriptions fall back to polling `eth_getLogs` over a small
//! block window.

pub mod batch;
pub mod pipeline;

pub use pipeline::{primary_token, Pipeline};

use backoff::backoff::Backoff;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, LogFilter, LogStream};
use crate::config::SubscriberConfig;
use crate::error::{Error, Result};
use crate::queue::retry::exponential;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Disconnected,
    Connecting,
    Subscribed,
    /// No push transport; polling `eth_getLogs`
    Polling,
}

/// Why a live subscription ended
enum StreamEnd {
    Cancelled,
    FiltersChanged,
    Closed(String),
}

pub struct Subscriber {
    client: Arc<dyn ChainClient>,
    pipeline: Arc<Pipeline>,
    config: SubscriberConfig,
    state: watch::Sender<SubscriberState>,
}

impl Subscriber {
    pub fn new(client: Arc<dyn ChainClient>, pipeline: Arc<Pipeline>, config: SubscriberConfig) -> Self {
        let (state, _) = watch::channel(SubscriberState::Disconnected);
        Self {
            client,
            pipeline,
            config,
            state,
        }
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SubscriberState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Subscriber {:?} -> {:?}", previous, state);
        }
    }

    fn filters(&self) -> Vec<LogFilter> {
        self.pipeline.registry().log_filters()
    }

    /// Run until cancelled
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut backoff = exponential(
            Duration::from_millis(self.config.reconnect_delay_ms),
            Duration::from_millis(self.config.max_reconnect_delay_ms),
        );
        let refresh = Duration::from_secs(self.config.filter_refresh_secs.max(1));

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let filters = self.filters();
            if filters.is_empty() {
                debug!("No log filters registered, waiting");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(refresh) => continue,
                }
            }

            self.set_state(SubscriberState::Connecting);
            match self.client.subscribe_logs(filters.clone()).await {
                Ok(stream) => {
                    info!("Subscribed to logs with {} filters", filters.len());
                    self.set_state(SubscriberState::Subscribed);
                    backoff.reset();
                    match self.consume(stream, &filters, refresh, &cancel).await {
                        StreamEnd::Cancelled => break,
                        StreamEnd::FiltersChanged => {
                            info!("Strategy filters changed, resubscribing");
                            self.set_state(SubscriberState::Disconnected);
                            continue;
                        }
                        StreamEnd::Closed(reason) => warn!("Log subscription ended: {}", reason),
                    }
                }
                Err(Error::SubscriptionUnsupported) => {
                    info!("Log subscriptions unavailable, polling every {}ms", self.config.poll_interval_ms);
                    self.poll_loop(&cancel).await;
                    break;
                }
                Err(e) => warn!("Log subscription failed: {}", e),
            }

            self.set_state(SubscriberState::Disconnected);
            let delay = backoff
                .next_backoff()
                .unwrap_or(Duration::from_millis(self.config.max_reconnect_delay_ms));
            warn!("Reconnecting in {:?}...", delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(SubscriberState::Disconnected);
        info!("Subscriber stopped");
        Ok(())
    }

    async fn consume(
        &self,
        mut stream: LogStream,
        filters: &[LogFilter],
        refresh: Duration,
        cancel: &CancellationToken,
    ) -> StreamEnd {
        let mut refresh_timer = tokio::time::interval(refresh);
        refresh_timer.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                _ = refresh_timer.tick() => {
                    if self.filters() != filters {
                        return StreamEnd::FiltersChanged;
                    }
                }
                next = stream.next() => match next {
                    Some(Ok(log)) => self.pipeline.ingest(log),
                    Some(Err(e)) => return StreamEnd::Closed(e.to_string()),
                    None => return StreamEnd::Closed("stream ended".into()),
                },
            }
        }
    }

    async fn poll_loop(&self, cancel: &CancellationToken) {
        self.set_state(SubscriberState::Polling);
        let mut cursor = None;
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            match self.poll_once(&mut cursor).await {
                Ok(0) => {}
                Ok(n) => debug!("Polled {} logs", n),
                Err(e) => warn!("Log poll failed, retrying the same window: {}", e),
            }
        }
    }

    /// Fetch one block window and feed its logs to the pipeline.
    ///
    /// `cursor` is the next block to fetch; it only advances when every
    /// filter's fetch succeeded. The first poll starts at the most recent
    /// window.
    pub async fn poll_once(&self, cursor: &mut Option<u64>) -> Result<usize> {
        let window = self.config.poll_block_window.max(1);
        let head = self.client.get_block_number().await?;
        let from = cursor.unwrap_or_else(|| (head + 1).saturating_sub(window));
        if from > head {
            return Ok(0);
        }
        let to = head.min(from + window - 1);

        let mut logs = Vec::new();
        for filter in self.filters() {
            logs.extend(self.client.get_logs(&filter, from, to).await?);
        }

        let count = logs.len();
        for log in logs {
            self.pipeline.ingest(log);
        }
        *cursor = Some(to + 1);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::pipeline::stub::{StubStrategy, Verdict};
    use super::*;
    use crate::chain::mock::{tx_hash, MockChain};
    use crate::chain::{Log, Receipt};
    use crate::events::EventBus;
    use crate::ledger::ExposureLedger;
    use crate::strategy::Registry;
    use alloy_primitives::{Address, Bytes, B256};

    fn log_at(n: u64, block: u64) -> Log {
        Log {
            address: Address::repeat_byte(0xfa),
            topics: vec![B256::repeat_byte(0x01)],
            data: Bytes::new(),
            transaction_hash: tx_hash(n),
            block_number: Some(block),
            log_index: Some(0),
            removed: false,
        }
    }

    fn receipt(n: u64, block: u64) -> Receipt {
        Receipt {
            transaction_hash: tx_hash(n),
            block_number: block,
            status: true,
            from: Address::repeat_byte(1),
            to: None,
            gas_used: None,
            logs: vec![log_at(n, block)],
        }
    }

    fn setup(chain: Arc<MockChain>, config: SubscriberConfig) -> (Subscriber, Arc<Pipeline>, Arc<StubStrategy>) {
        let strategy = Arc::new(StubStrategy::new("stub", 0, Verdict::Match));
        let registry = Registry::new(Arc::new(ExposureLedger::new()));
        registry.register(strategy.clone()).unwrap();
        let pipeline = Pipeline::new(chain.clone(), Arc::new(registry), EventBus::new(64), &config);
        (Subscriber::new(chain, pipeline.clone(), config), pipeline, strategy)
    }

    #[tokio::test]
    async fn test_poll_advances_only_on_success() {
        let chain = Arc::new(MockChain::new());
        {
            let mut state = chain.state.lock().unwrap();
            state.logs = vec![log_at(1, 97), log_at(2, 100), log_at(3, 90)];
            state.failing_get_logs = 1;
        }
        chain.insert_receipt(receipt(1, 97));
        chain.insert_receipt(receipt(2, 100));
        let config = SubscriberConfig {
            debounce_ms: 60_000,
            poll_block_window: 5,
            ..Default::default()
        };
        let (subscriber, pipeline, strategy) = setup(chain.clone(), config);

        let mut cursor = None;
        assert!(subscriber.poll_once(&mut cursor).await.is_err());
        assert_eq!(cursor, None);

        // Window 96..=100 holds two of the three logs
        assert_eq!(subscriber.poll_once(&mut cursor).await.unwrap(), 2);
        assert_eq!(cursor, Some(101));
        for task in pipeline.flush().await {
            task.await.unwrap();
        }
        assert_eq!(strategy.processed(), 2);

        // Nothing new until the head moves
        assert_eq!(subscriber.poll_once(&mut cursor).await.unwrap(), 0);
        chain.state.lock().unwrap().block_number = 120;
        subscriber.poll_once(&mut cursor).await.unwrap();
        assert_eq!(cursor, Some(106));
    }

    #[tokio::test]
    async fn test_run_falls_back_to_polling() {
        let chain = Arc::new(MockChain::new());
        chain.state.lock().unwrap().logs = vec![log_at(5, 100)];
        chain.insert_receipt(receipt(5, 100));
        let config = SubscriberConfig {
            debounce_ms: 5,
            poll_interval_ms: 10,
            ..Default::default()
        };
        let (subscriber, _pipeline, strategy) = setup(chain, config);
        let subscriber = Arc::new(subscriber);
        let mut state = subscriber.watch_state();

        let cancel = CancellationToken::new();
        let runner = {
            let subscriber = subscriber.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { subscriber.run(cancel).await })
        };

        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == SubscriberState::Polling),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while strategy.processed() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        runner.await.unwrap().unwrap();
        assert_eq!(subscriber.state(), SubscriberState::Disconnected);
        assert_eq!(strategy.processed(), 1);
    }
}
