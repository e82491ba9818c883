use alloy::primitives::{Address, TxHash, U256};
use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::ethereum::{
    abi::{AbiResolver, AbiSource},
    codec,
    contract::{BoundContract, ContractDescriptor},
    film::FilmRegistry,
    provider::{ChainClient, RpcClient},
    stream::{EventStream, TypedStream},
    transaction::{LocalSigner, TransactOpts, TransactionSigner},
    utils, DecodedEvent, EventInfo,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionResult {
    pub function: String,
    pub transaction_hash: String,
}

impl TransactionResult {
    fn new(function: &str, hash: TxHash) -> Self {
        Self {
            function: function.to_string(),
            transaction_hash: format!("0x{:x}", hash),
        }
    }
}

/// Resolve the configured contract's ABI and build its descriptor.
pub async fn load_descriptor(config: &Config, chain_id: u64) -> Result<ContractDescriptor> {
    let address = config.contract.parsed_address()?;
    let resolver = AbiResolver::new(AbiSource::default());
    let abi = resolver
        .resolve(address, chain_id, config.contract.abi_path.as_deref())
        .await?;
    Ok(ContractDescriptor::from_json(address, &abi)?)
}

/// Reads the signing key from the named environment variable.
pub fn load_signer(env_name: &str) -> Result<LocalSigner> {
    let private_key = std::env::var(env_name).map_err(|_| {
        anyhow!(
            "{} is not set. Write commands need a hex private key in this environment variable",
            env_name
        )
    })?;
    LocalSigner::from_private_key(&private_key)
}

/// Calldata for a function call, without touching the network.
pub fn encode(descriptor: &ContractDescriptor, function: &str, args: &Value) -> Result<String> {
    utils::validate_function_name(function)?;
    let call = codec::call_from_json(descriptor.abi(), function, args)?;
    let calldata = codec::encode(descriptor.abi(), &call)?;
    Ok(format!("0x{}", hex::encode(calldata)))
}

/// Pull every event out of a stream, handing decoded ones to `on_event`.
/// Undecodable entries are logged and skipped; any other error ends the
/// drain.
pub async fn drain_events<F>(stream: &mut dyn EventStream, mut on_event: F) -> Result<usize>
where
    F: FnMut(EventInfo),
{
    let mut count = 0;
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                count += 1;
                on_event(EventInfo::from(&event));
            }
            Err(e) if e.is_per_entry() => warn!("Skipping log: {}", e),
            Err(e) => {
                stream.close();
                return Err(e.into());
            }
        }
    }
    Ok(count)
}

/// Pull every event of one type out of a typed stream, with the same error
/// handling as [`drain_events`].
pub async fn drain_typed<T, F>(stream: &mut TypedStream<T>, mut on_event: F) -> Result<usize>
where
    T: TryFrom<DecodedEvent, Error = Error>,
    F: FnMut(T),
{
    let mut count = 0;
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                count += 1;
                on_event(event);
            }
            Err(e) if e.is_per_entry() => warn!("Skipping log: {}", e),
            Err(e) => {
                stream.close();
                return Err(e.into());
            }
        }
    }
    Ok(count)
}

fn is_collaborator(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Error>(), Some(Error::Collaborator { .. }))
}

/// Token metadata read through the contract's view functions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenInfo {
    pub name: String,
    pub symbol: String,
    pub total_supply: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<String>,
}

pub struct App {
    config: Config,
    registry: FilmRegistry,
}

impl App {
    pub fn new(
        config: Config,
        client: Arc<dyn ChainClient>,
        descriptor: Arc<ContractDescriptor>,
    ) -> Self {
        let contract = BoundContract::new(descriptor, client)
            .with_default_gas_limit(config.gas.default_gas_limit);
        Self {
            config,
            registry: FilmRegistry::new(contract),
        }
    }

    /// Connect to the configured node and bind the configured contract.
    pub async fn connect(config: Config) -> Result<Self> {
        let client = RpcClient::new(&config.network)?;
        let block = client.validate_connection().await?;
        let chain_id = client.chain_id().await?;
        info!(
            "Connected to {} (chain id {}) at block {}",
            client.network(),
            chain_id,
            block
        );

        if let Some(expected) = config.network.chain_id {
            if expected != chain_id {
                return Err(anyhow!(
                    "Node reports chain id {} but network.chain_id is {}",
                    chain_id,
                    expected
                ));
            }
        }

        let descriptor = load_descriptor(&config, chain_id).await?;
        Ok(Self::new(config, Arc::new(client), Arc::new(descriptor)))
    }

    fn contract(&self) -> &BoundContract {
        self.registry.contract()
    }

    fn transact_opts(&self, value: Option<U256>) -> TransactOpts {
        TransactOpts {
            gas_price: self.config.gas.gas_price.map(u128::from),
            value,
            ..Default::default()
        }
    }

    pub async fn add_film(
        &self,
        signer: &dyn TransactionSigner,
        title: &str,
        year: U256,
        genre: u8,
    ) -> Result<TransactionResult> {
        let hash = self
            .registry
            .add_film(signer, title, year, genre, &self.transact_opts(None))
            .await?;
        Ok(TransactionResult::new("addFilm", hash))
    }

    pub async fn delete_film(
        &self,
        signer: &dyn TransactionSigner,
        title: &str,
    ) -> Result<TransactionResult> {
        let hash = self
            .registry
            .delete_film(signer, title, &self.transact_opts(None))
            .await?;
        Ok(TransactionResult::new("deleteFilm", hash))
    }

    pub async fn send(
        &self,
        signer: &dyn TransactionSigner,
        function: &str,
        args: &Value,
        value: Option<U256>,
    ) -> Result<TransactionResult> {
        utils::validate_function_name(function)?;
        let call = codec::call_from_json(self.contract().descriptor().abi(), function, args)?;
        let hash = self
            .contract()
            .transact(signer, &call, &self.transact_opts(value))
            .await?;
        Ok(TransactionResult::new(function, hash))
    }

    pub async fn call(&self, function: &str, args: &Value) -> Result<Value> {
        utils::validate_function_name(function)?;
        let call = codec::call_from_json(self.contract().descriptor().abi(), function, args)?;
        let values = self.contract().call(&call).await?;
        Ok(codec::values_to_json(&values))
    }

    pub async fn token_info(&self, account: Option<Address>) -> Result<TokenInfo> {
        let balance = match account {
            Some(account) => Some(self.registry.balance_of(account).await?.to_string()),
            None => None,
        };
        Ok(TokenInfo {
            name: self.registry.name().await?,
            symbol: self.registry.symbol().await?,
            total_supply: self.registry.total_supply().await?.to_string(),
            balance,
        })
    }

    /// Decode logs in a closed block range. A failed query is retried once.
    pub async fn logs<F>(
        &self,
        from_block: u64,
        to_block: u64,
        event: Option<&str>,
        mut on_event: F,
    ) -> Result<usize>
    where
        F: FnMut(EventInfo),
    {
        if from_block > to_block {
            return Err(anyhow!(
                "Invalid block range: from {} is after to {}",
                from_block,
                to_block
            ));
        }

        let mut batch = self.contract().filter_logs(from_block, to_block, event)?;
        let count = match drain_events(&mut batch, &mut on_event).await {
            Err(e) if is_collaborator(&e) => {
                warn!("Log query failed, retrying: {}", e);
                batch.restart();
                drain_events(&mut batch, &mut on_event).await?
            }
            result => result?,
        };
        info!(
            "Decoded {} events in blocks {}..={}",
            count, from_block, to_block
        );
        Ok(count)
    }

    /// Stream live events until Ctrl-C or a subscription failure.
    pub async fn watch<F>(&self, event: Option<&str>, on_event: F) -> Result<usize>
    where
        F: FnMut(EventInfo),
    {
        let mut live = self.contract().watch_logs(event).await?;
        let closer = live.closer();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, closing subscription");
                closer.close();
            }
        });

        let result = drain_events(&mut live, on_event).await;
        ctrl_c.abort();
        if let Some(reason) = live.termination() {
            info!("{}", reason);
        }
        result
    }

    /// Stream live `FilmAdded` events until Ctrl-C or a subscription failure.
    pub async fn watch_films<F>(&self, mut output: F) -> Result<usize>
    where
        F: FnMut(Value),
    {
        let (mut films, closer) = self.registry.watch_film_added().await?;
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, closing subscription");
                closer.close();
            }
        });

        let result = drain_typed(&mut films, |film| output(film.to_json())).await;
        ctrl_c.abort();
        result
    }

    /// The reference routine: add a film, delete it again, then decode the
    /// film events in the configured block range.
    pub async fn run<F>(&self, signer: &dyn TransactionSigner, mut output: F) -> Result<usize>
    where
        F: FnMut(Value),
    {
        let added = self.add_film(signer, "lol", U256::from(2023), 0).await?;
        output(serde_json::to_value(&added)?);

        let deleted = self.delete_film(signer, "lol").await?;
        output(serde_json::to_value(&deleted)?);

        let query = &self.config.query;
        if query.from_block > query.to_block {
            return Err(anyhow!(
                "Invalid block range: from {} is after to {}",
                query.from_block,
                query.to_block
            ));
        }

        let mut films = self
            .registry
            .filter_film_added(query.from_block, query.to_block)?;
        let mut count = drain_typed(&mut films, |film| output(film.to_json())).await?;

        let mut removals = self
            .registry
            .filter_film_deleted(query.from_block, query.to_block)?;
        count += drain_typed(&mut removals, |film| output(film.to_json())).await?;

        info!(
            "Decoded {} film events in blocks {}..={}",
            count, query.from_block, query.to_block
        );
        Ok(count)
    }
}

/// A user-facing hint for collaborator failures, if the error is one.
pub fn error_hint(err: &anyhow::Error) -> Option<String> {
    match err.downcast_ref::<Error>() {
        Some(Error::Collaborator { message, .. }) => Some(utils::interpret_rpc_error(message)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethereum::film::{emerald_token, DEFAULT_CONTRACT_ADDRESS, REFERENCE_BLOCK};
    use crate::ethereum::provider::{testing::FakeChain, LogFeed};
    use crate::ethereum::RawLog;
    use alloy::dyn_abi::DynSolValue;
    use alloy::eips::BlockNumberOrTag;
    use alloy::primitives::{keccak256, B256};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn film_added_log(title: &str) -> RawLog {
        RawLog {
            address: DEFAULT_CONTRACT_ADDRESS,
            topics: vec![keccak256("FilmAdded(string,uint256,uint8)")],
            data: DynSolValue::Tuple(vec![
                DynSolValue::String(title.to_string()),
                DynSolValue::Uint(U256::from(2023), 256),
                DynSolValue::Uint(U256::ZERO, 8),
            ])
            .abi_encode_params()
            .into(),
            block_number: Some(REFERENCE_BLOCK),
            ..Default::default()
        }
    }

    fn app(chain: Arc<FakeChain>) -> App {
        let descriptor = Arc::new(emerald_token(DEFAULT_CONTRACT_ADDRESS).unwrap());
        App::new(Config::default(), chain, descriptor)
    }

    #[test]
    fn test_encode_delete_film() {
        let descriptor = emerald_token(DEFAULT_CONTRACT_ADDRESS).unwrap();
        let calldata = encode(&descriptor, "deleteFilm", &json!(["lol"])).unwrap();

        let selector = &keccak256("deleteFilm(string)")[..4];
        assert!(calldata.starts_with(&format!("0x{}", hex::encode(selector))));
        // selector + offset + length + one padded word
        assert_eq!(calldata.len(), 2 + 2 * (4 + 3 * 32));

        assert!(encode(&descriptor, "delete-film", &json!(["lol"])).is_err());
        assert!(encode(&descriptor, "deleteFilm", &json!([1, 2])).is_err());
    }

    fn film_deleted_log(title: &str) -> RawLog {
        RawLog {
            address: DEFAULT_CONTRACT_ADDRESS,
            topics: vec![keccak256("FilmDeleted(string)")],
            data: DynSolValue::Tuple(vec![DynSolValue::String(title.to_string())])
                .abi_encode_params()
                .into(),
            block_number: Some(REFERENCE_BLOCK),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_sends_both_transactions_then_decodes_film_events() {
        let mut stray = film_added_log("x");
        stray.topics[0] = B256::repeat_byte(0xee);
        // the fake node ignores topic filters, so each typed query sees every log
        let chain = Arc::new(FakeChain::with_logs(vec![
            film_added_log("lol"),
            stray,
            film_deleted_log("lol"),
        ]));
        let app = app(chain.clone());
        let signer = LocalSigner::from_private_key(DEV_KEY).unwrap();

        let mut output = Vec::new();
        let count = app.run(&signer, |value| output.push(value)).await.unwrap();

        assert_eq!(count, 2);
        assert_eq!(chain.sent.lock().unwrap().len(), 2);
        assert_eq!(output.len(), 4);
        assert_eq!(output[0]["function"], "addFilm");
        assert_eq!(output[1]["function"], "deleteFilm");
        assert_eq!(output[2]["event"], "FilmAdded");
        assert_eq!(output[2]["title"], "lol");
        assert_eq!(output[2]["year"], "2023");
        assert_eq!(output[2]["genre"], 0);
        assert_eq!(output[3]["event"], "FilmDeleted");

        let filters = chain.filters.lock().unwrap();
        assert_eq!(filters[0].from_block, BlockNumberOrTag::Number(REFERENCE_BLOCK));
        assert_eq!(
            filters[0].event_signature,
            Some(keccak256("FilmAdded(string,uint256,uint8)"))
        );
        assert_eq!(filters[1].event_signature, Some(keccak256("FilmDeleted(string)")));
    }

    #[tokio::test]
    async fn test_send_applies_configured_gas_price() {
        let chain = Arc::new(FakeChain::default());
        let mut config = Config::default();
        config.gas.gas_price = Some(1);
        let descriptor = Arc::new(emerald_token(DEFAULT_CONTRACT_ADDRESS).unwrap());
        let app = App::new(config, chain.clone(), descriptor);
        let signer = LocalSigner::from_private_key(DEV_KEY).unwrap();

        let result = app
            .send(&signer, "deleteFilm", &json!({"title": "lol"}), None)
            .await
            .unwrap();
        assert_eq!(result.function, "deleteFilm");
        assert!(result.transaction_hash.starts_with("0x"));
        assert_eq!(chain.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_call_returns_json_values() {
        let chain = Arc::new(FakeChain::default());
        *chain.call_result.lock().unwrap() =
            DynSolValue::Tuple(vec![DynSolValue::String("EMR".into())])
                .abi_encode_params()
                .into();
        let app = app(chain);

        let value = app.call("symbol", &Value::Null).await.unwrap();
        assert_eq!(value, json!("EMR"));
    }

    #[tokio::test]
    async fn test_token_info_reads_view_functions() {
        let chain = Arc::new(FakeChain::default());
        {
            let mut results = chain.call_results.lock().unwrap();
            let mut reply = |signature: &str, value: DynSolValue| {
                results.insert(
                    keccak256(signature)[..4].to_vec(),
                    DynSolValue::Tuple(vec![value]).abi_encode_params().into(),
                );
            };
            reply("name()", DynSolValue::String("Emerald".into()));
            reply("symbol()", DynSolValue::String("EMR".into()));
            reply("totalSupply()", DynSolValue::Uint(U256::from(500), 256));
            reply("balanceOf(address)", DynSolValue::Uint(U256::from(20), 256));
        }
        let app = app(chain);

        let info = app.token_info(None).await.unwrap();
        assert_eq!(info.name, "Emerald");
        assert_eq!(info.symbol, "EMR");
        assert_eq!(info.total_supply, "500");
        assert_eq!(info.balance, None);

        let info = app.token_info(Some(Address::repeat_byte(1))).await.unwrap();
        assert_eq!(info.balance.as_deref(), Some("20"));
    }

    #[tokio::test]
    async fn test_logs_rejects_inverted_range() {
        let app = app(Arc::new(FakeChain::default()));
        assert!(app.logs(10, 1, None, |_| {}).await.is_err());
    }

    #[tokio::test]
    async fn test_logs_retries_failed_query_once() {
        let chain = Arc::new(FakeChain::with_logs(vec![film_added_log("lol")]));
        *chain.filter_error.lock().unwrap() = Some("request timed out".to_string());
        let app = app(chain.clone());

        let mut seen = Vec::new();
        let count = app
            .logs(REFERENCE_BLOCK, REFERENCE_BLOCK, None, |info| seen.push(info))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(seen.len(), 1);
        assert_eq!(chain.queries.load(Ordering::SeqCst), 2);
    }

    async fn feed_once(chain: &FakeChain) -> LogFeed {
        loop {
            if let Some(feed) = chain.feeds.lock().unwrap().pop() {
                return feed;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_watch_ends_with_subscription_failure() {
        let chain = Arc::new(FakeChain::default());
        let app = app(chain.clone());

        let mut seen = Vec::new();
        let node = async {
            let feed = feed_once(&chain).await;
            assert!(feed.send(film_added_log("lol")).await);
            feed.fail(Error::collaborator("eth_getFilterChanges", "filter not found"));
        };
        let (result, ()) = tokio::join!(app.watch(None, |info| seen.push(info)), node);

        assert_eq!(seen.len(), 1);
        let err = result.unwrap_err();
        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::SubscriptionTerminated {
                cause: Some("eth_getFilterChanges failed: filter not found".to_string())
            })
        );
    }

    #[tokio::test]
    async fn test_watch_films_prints_typed_events() {
        let chain = Arc::new(FakeChain::default());
        let app = app(chain.clone());

        let mut output = Vec::new();
        let node = async {
            let feed = feed_once(&chain).await;
            assert!(feed.send(film_added_log("lol")).await);
            assert!(feed.send(film_deleted_log("lol")).await);
            feed.fail(Error::collaborator("eth_getFilterChanges", "filter not found"));
        };
        let (result, ()) = tokio::join!(app.watch_films(|value| output.push(value)), node);

        assert!(result.is_err());
        assert_eq!(output.len(), 1);
        assert_eq!(output[0]["event"], "FilmAdded");
        assert_eq!(output[0]["title"], "lol");

        let filters = chain.filters.lock().unwrap();
        assert_eq!(filters[0].from_block, BlockNumberOrTag::Latest);
    }

    #[test]
    fn test_error_hint_only_for_collaborator_errors() {
        let err = anyhow::Error::from(Error::collaborator(
            "eth_sendRawTransaction",
            "insufficient funds for gas",
        ));
        assert!(error_hint(&err).unwrap().contains("Insufficient funds"));

        let err = anyhow::Error::from(Error::UnknownEvent("FilmRated".into()));
        assert!(error_hint(&err).is_none());
    }
}
