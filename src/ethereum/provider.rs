use alloy::{
    eips::BlockNumberOrTag,
    network::TransactionBuilder,
    primitives::{Address, Bytes, TxHash, B256, U256},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::{Filter, Log, TransactionRequest as RpcTransactionRequest},
    transports::http::{Client, Http},
};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::ethereum::RawLog;

/// Address and block range of a log query. `to_block == None` means the
/// range is open-ended, which is only meaningful for subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub from_block: BlockNumberOrTag,
    pub to_block: Option<u64>,
    pub event_signature: Option<B256>,
}

impl LogFilter {
    pub fn range(address: Address, from_block: u64, to_block: u64) -> Self {
        Self {
            address,
            from_block: BlockNumberOrTag::Number(from_block),
            to_block: Some(to_block),
            event_signature: None,
        }
    }

    /// Logs of blocks mined from now on.
    pub fn open(address: Address) -> Self {
        Self {
            address,
            from_block: BlockNumberOrTag::Latest,
            to_block: None,
            event_signature: None,
        }
    }

    pub fn with_event_signature(mut self, topic: B256) -> Self {
        self.event_signature = Some(topic);
        self
    }

    fn to_rpc_filter(&self) -> Filter {
        let mut filter = Filter::new()
            .address(self.address)
            .from_block(self.from_block);
        if let Some(to) = self.to_block {
            filter = filter.to_block(to);
        }
        if let Some(topic) = self.event_signature {
            filter = filter.event_signature(topic);
        }
        filter
    }
}

/// Producer half of a log subscription, held by whatever pushes logs.
#[derive(Debug)]
pub struct LogFeed {
    logs: mpsc::Sender<RawLog>,
    err: Option<oneshot::Sender<Error>>,
}

impl LogFeed {
    /// Push a log. Returns `false` once the consumer has unsubscribed.
    pub async fn send(&self, log: RawLog) -> bool {
        self.logs.send(log).await.is_ok()
    }

    /// Terminate the subscription with an error.
    pub fn fail(mut self, err: Error) {
        if let Some(tx) = self.err.take() {
            let _ = tx.send(err);
        }
    }

    /// Resolves when the consumer has unsubscribed or dropped the subscription.
    pub async fn closed(&self) {
        self.logs.closed().await
    }
}

/// Consumer half of a log subscription: a stream of logs plus an error channel.
#[derive(Debug)]
pub struct LogSubscription {
    logs: mpsc::Receiver<RawLog>,
    err: Option<oneshot::Receiver<Error>>,
}

impl LogSubscription {
    pub fn channel(buffer: usize) -> (LogFeed, LogSubscription) {
        let (logs_tx, logs_rx) = mpsc::channel(buffer);
        let (err_tx, err_rx) = oneshot::channel();
        (
            LogFeed {
                logs: logs_tx,
                err: Some(err_tx),
            },
            LogSubscription {
                logs: logs_rx,
                err: Some(err_rx),
            },
        )
    }

    /// Wait for the next log or the subscription error. Buffered logs are
    /// delivered before a pending error. `None` means the feed went away
    /// without reporting an error.
    pub async fn recv(&mut self) -> Option<Result<RawLog>> {
        let Self { logs, err } = self;
        loop {
            tokio::select! {
                biased;
                log = logs.recv() => {
                    return match log {
                        Some(log) => Some(Ok(log)),
                        // producer gone, surface its error if it left one
                        None => match err.take() {
                            Some(rx) => rx.await.ok().map(Err),
                            None => None,
                        },
                    };
                }
                result = async {
                    match err.as_mut() {
                        Some(rx) => rx.await,
                        None => std::future::pending().await,
                    }
                } => {
                    *err = None;
                    match result {
                        Ok(e) => return Some(Err(e)),
                        // feed dropped without error, keep draining logs
                        Err(_) => continue,
                    }
                }
            }
        }
    }

    /// Release the subscription. The producer observes this through
    /// [`LogFeed::closed`]. Idempotent.
    pub fn unsubscribe(&mut self) {
        self.logs.close();
        self.err = None;
    }
}

/// The RPC surface the contract layer needs from a node.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn pending_nonce(&self, address: Address) -> Result<u64>;

    async fn suggest_gas_price(&self) -> Result<u128>;

    async fn chain_id(&self) -> Result<u64>;

    /// Execute a read-only call against the latest block.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;

    async fn send_raw_transaction(&self, signed: Bytes) -> Result<TxHash>;

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>>;

    async fn subscribe_logs(&self, filter: &LogFilter) -> Result<LogSubscription>;
}

/// JSON-RPC client over HTTP backed by an alloy provider.
#[derive(Debug, Clone)]
pub struct RpcClient {
    provider: RootProvider<Http<Client>>,
    network: String,
}

impl RpcClient {
    pub fn new(network_config: &NetworkConfig) -> anyhow::Result<Self> {
        let provider = ProviderBuilder::new().on_http(network_config.rpc_url.parse()?);

        Ok(Self {
            provider,
            network: network_config.name.clone(),
        })
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Validates network connectivity with detailed error information
    pub async fn validate_connection(&self) -> anyhow::Result<u64> {
        self.provider.get_block_number().await.map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to network '{}': {}. Please check your RPC endpoint configuration and network connectivity.",
                self.network,
                super::utils::interpret_rpc_error(&e.to_string())
            )
        })
    }
}

#[async_trait]
impl ChainClient for RpcClient {
    async fn pending_nonce(&self, address: Address) -> Result<u64> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(|e| Error::collaborator("eth_getTransactionCount", e))
    }

    async fn suggest_gas_price(&self) -> Result<u128> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| Error::collaborator("eth_gasPrice", e))
    }

    async fn chain_id(&self) -> Result<u64> {
        self.provider
            .get_chain_id()
            .await
            .map_err(|e| Error::collaborator("eth_chainId", e))
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let request = RpcTransactionRequest::default()
            .with_to(to)
            .with_input(data);
        self.provider
            .call(&request)
            .await
            .map_err(|e| Error::collaborator("eth_call", e))
    }

    async fn send_raw_transaction(&self, signed: Bytes) -> Result<TxHash> {
        let pending = self
            .provider
            .send_raw_transaction(&signed)
            .await
            .map_err(|e| Error::collaborator("eth_sendRawTransaction", e))?;
        Ok(*pending.tx_hash())
    }

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>> {
        tracing::debug!(
            "eth_getLogs on {} for {} in blocks {}..={:?}",
            self.network,
            filter.address,
            filter.from_block,
            filter.to_block
        );
        let logs = self
            .provider
            .get_logs(&filter.to_rpc_filter())
            .await
            .map_err(|e| Error::collaborator("eth_getLogs", e))?;
        Ok(logs.into_iter().map(RawLog::from).collect())
    }

    async fn subscribe_logs(&self, filter: &LogFilter) -> Result<LogSubscription> {
        // HTTP has no push channel, so a node-side filter is installed and
        // polled for changes.
        let id = self
            .provider
            .new_filter(&filter.to_rpc_filter())
            .await
            .map_err(|e| Error::collaborator("eth_newFilter", e))?;
        tracing::debug!("Installed log filter {} on {}", id, self.network);

        let (feed, subscription) = LogSubscription::channel(256);
        tokio::spawn(poll_filter(
            self.clone(),
            id,
            self.provider.client().poll_interval(),
            feed,
        ));

        Ok(subscription)
    }
}

/// Polling access to a node-side log filter.
#[async_trait]
pub trait FilterPoll: Send + Sync + 'static {
    async fn filter_changes(&self, id: U256) -> Result<Vec<RawLog>>;

    async fn uninstall_filter(&self, id: U256) -> Result<bool>;
}

#[async_trait]
impl FilterPoll for RpcClient {
    async fn filter_changes(&self, id: U256) -> Result<Vec<RawLog>> {
        let logs: Vec<Log> = self
            .provider
            .get_filter_changes(id)
            .await
            .map_err(|e| Error::collaborator("eth_getFilterChanges", e))?;
        Ok(logs.into_iter().map(RawLog::from).collect())
    }

    async fn uninstall_filter(&self, id: U256) -> Result<bool> {
        self.provider
            .raw_request("eth_uninstallFilter".into(), (id,))
            .await
            .map_err(|e| Error::collaborator("eth_uninstallFilter", e))
    }
}

/// Forward the changes of filter `id` into `feed` until the consumer
/// unsubscribes or a poll fails. The filter is uninstalled either way; a poll
/// error is handed to the consumer as is.
pub async fn poll_filter<P: FilterPoll>(source: P, id: U256, interval: Duration, feed: LogFeed) {
    let mut ticker = tokio::time::interval(interval);
    let failure = 'poll: loop {
        tokio::select! {
            _ = feed.closed() => break 'poll None,
            _ = ticker.tick() => {}
        }

        match source.filter_changes(id).await {
            Ok(logs) => {
                for log in logs {
                    if !feed.send(log).await {
                        break 'poll None;
                    }
                }
            }
            Err(e) => break 'poll Some(e),
        }
    };

    if let Err(e) = source.uninstall_filter(id).await {
        tracing::debug!("Could not uninstall log filter {}: {}", id, e);
    }

    match failure {
        Some(e) => {
            tracing::warn!("Log filter {} stopped: {}", id, e);
            feed.fail(e);
        }
        None => tracing::debug!("Log filter {} released", id),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory chain used by unit tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug)]
    pub struct FakeChain {
        pub nonce: u64,
        pub gas_price: u128,
        pub chain_id: u64,
        pub logs: Mutex<Vec<RawLog>>,
        pub call_result: Mutex<Bytes>,
        /// Per-selector results, taking precedence over `call_result`.
        pub call_results: Mutex<HashMap<Vec<u8>, Bytes>>,
        pub sent: Mutex<Vec<Bytes>>,
        pub send_error: Mutex<Option<String>>,
        /// Returned once by the next `filter_logs`.
        pub filter_error: Mutex<Option<String>>,
        pub filters: Mutex<Vec<LogFilter>>,
        pub queries: AtomicUsize,
        pub feeds: Mutex<Vec<LogFeed>>,
    }

    impl Default for FakeChain {
        fn default() -> Self {
            Self {
                nonce: 7,
                gas_price: 2_000_000_000,
                chain_id: 5,
                logs: Mutex::new(Vec::new()),
                call_result: Mutex::new(Bytes::new()),
                call_results: Mutex::new(HashMap::new()),
                sent: Mutex::new(Vec::new()),
                send_error: Mutex::new(None),
                filter_error: Mutex::new(None),
                filters: Mutex::new(Vec::new()),
                queries: AtomicUsize::new(0),
                feeds: Mutex::new(Vec::new()),
            }
        }
    }

    impl FakeChain {
        pub fn with_logs(logs: Vec<RawLog>) -> Self {
            let chain = Self::default();
            *chain.logs.lock().unwrap() = logs;
            chain
        }

        /// Take the producer side of the most recent subscription.
        pub fn take_feed(&self) -> LogFeed {
            self.feeds
                .lock()
                .unwrap()
                .pop()
                .expect("no active subscription")
        }
    }

    #[async_trait]
    impl ChainClient for FakeChain {
        async fn pending_nonce(&self, _address: Address) -> Result<u64> {
            Ok(self.nonce)
        }

        async fn suggest_gas_price(&self) -> Result<u128> {
            Ok(self.gas_price)
        }

        async fn chain_id(&self) -> Result<u64> {
            Ok(self.chain_id)
        }

        async fn call(&self, _to: Address, data: Bytes) -> Result<Bytes> {
            let selector = data.get(..4).unwrap_or_default();
            if let Some(result) = self.call_results.lock().unwrap().get(selector) {
                return Ok(result.clone());
            }
            Ok(self.call_result.lock().unwrap().clone())
        }

        async fn send_raw_transaction(&self, signed: Bytes) -> Result<TxHash> {
            if let Some(message) = self.send_error.lock().unwrap().clone() {
                return Err(Error::collaborator("eth_sendRawTransaction", message));
            }
            let hash = alloy::primitives::keccak256(&signed);
            self.sent.lock().unwrap().push(signed);
            Ok(hash)
        }

        async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.filters.lock().unwrap().push(filter.clone());
            if let Some(message) = self.filter_error.lock().unwrap().take() {
                return Err(Error::collaborator("eth_getLogs", message));
            }
            Ok(self.logs.lock().unwrap().clone())
        }

        async fn subscribe_logs(&self, filter: &LogFilter) -> Result<LogSubscription> {
            self.filters.lock().unwrap().push(filter.clone());
            let (feed, subscription) = LogSubscription::channel(16);
            self.feeds.lock().unwrap().push(feed);
            Ok(subscription)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    fn log_at(block: u64) -> RawLog {
        RawLog {
            block_number: Some(block),
            ..Default::default()
        }
    }

    #[test]
    fn test_log_filter_builders() {
        let address = Address::repeat_byte(0x95);
        let filter = LogFilter::range(address, 8568585, 8568585);
        assert_eq!(filter.to_block, Some(8568585));
        assert!(filter.event_signature.is_none());

        assert_eq!(filter.from_block, BlockNumberOrTag::Number(8568585));

        let open = LogFilter::open(address).with_event_signature(B256::repeat_byte(1));
        assert_eq!(open.from_block, BlockNumberOrTag::Latest);
        assert_eq!(open.to_block, None);
        assert_eq!(open.event_signature, Some(B256::repeat_byte(1)));
    }

    #[tokio::test]
    async fn test_subscription_delivers_logs_before_error() {
        let (feed, mut sub) = LogSubscription::channel(4);
        assert!(feed.send(log_at(1)).await);
        assert!(feed.send(log_at(2)).await);
        feed.fail(Error::collaborator("eth_subscribe", "connection reset"));

        assert_eq!(sub.recv().await.unwrap().unwrap().block_number, Some(1));
        assert_eq!(sub.recv().await.unwrap().unwrap().block_number, Some(2));
        let err = sub.recv().await.unwrap().unwrap_err();
        assert_eq!(err, Error::collaborator("eth_subscribe", "connection reset"));
    }

    #[tokio::test]
    async fn test_subscription_ends_when_feed_dropped() {
        let (feed, mut sub) = LogSubscription::channel(4);
        assert!(feed.send(log_at(3)).await);
        drop(feed);

        assert!(sub.recv().await.unwrap().is_ok());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_notifies_feed() {
        let (feed, mut sub) = LogSubscription::channel(4);
        sub.unsubscribe();
        sub.unsubscribe();

        tokio::time::timeout(Duration::from_secs(1), feed.closed())
            .await
            .expect("feed should observe unsubscribe");
        assert!(!feed.send(log_at(4)).await);
    }

    /// Node-side filter that replays scripted poll results, then stays empty.
    #[derive(Default)]
    struct ScriptedFilter {
        polls: Mutex<VecDeque<Result<Vec<RawLog>>>>,
        uninstalled: Arc<Mutex<Vec<U256>>>,
    }

    #[async_trait]
    impl FilterPoll for ScriptedFilter {
        async fn filter_changes(&self, _id: U256) -> Result<Vec<RawLog>> {
            self.polls.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()))
        }

        async fn uninstall_filter(&self, id: U256) -> Result<bool> {
            self.uninstalled.lock().unwrap().push(id);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_poll_error_reaches_subscriber_unchanged() {
        let node_error = Error::collaborator("eth_getFilterChanges", "filter not found");
        let filter = ScriptedFilter::default();
        filter
            .polls
            .lock()
            .unwrap()
            .extend([Ok(vec![log_at(1), log_at(2)]), Err(node_error.clone())]);
        let uninstalled = filter.uninstalled.clone();

        let (feed, mut sub) = LogSubscription::channel(4);
        let poller = tokio::spawn(poll_filter(
            filter,
            U256::from(7),
            Duration::from_millis(5),
            feed,
        ));

        assert_eq!(sub.recv().await.unwrap().unwrap().block_number, Some(1));
        assert_eq!(sub.recv().await.unwrap().unwrap().block_number, Some(2));
        assert_eq!(sub.recv().await.unwrap().unwrap_err(), node_error);

        poller.await.unwrap();
        assert_eq!(*uninstalled.lock().unwrap(), vec![U256::from(7)]);
    }

    #[tokio::test]
    async fn test_unsubscribe_uninstalls_filter() {
        let filter = ScriptedFilter::default();
        let uninstalled = filter.uninstalled.clone();

        let (feed, mut sub) = LogSubscription::channel(4);
        let poller = tokio::spawn(poll_filter(
            filter,
            U256::from(9),
            Duration::from_millis(5),
            feed,
        ));
        sub.unsubscribe();

        tokio::time::timeout(Duration::from_secs(2), poller)
            .await
            .expect("poller should stop after unsubscribe")
            .unwrap();
        assert_eq!(*uninstalled.lock().unwrap(), vec![U256::from(9)]);
        assert!(sub.recv().await.is_none());
    }
}
