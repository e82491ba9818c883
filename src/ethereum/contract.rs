use alloy::{
    dyn_abi::DynSolValue,
    json_abi::{Event, JsonAbi},
    primitives::{Address, TxHash, B256},
};
use std::collections::HashMap;
use std::sync::Arc;

use super::codec::{self, FunctionCall};
use super::provider::{ChainClient, LogFilter};
use super::stream::{HistoricalBatch, LiveSubscription};
use super::transaction::{self, TransactOpts, TransactionSigner, DEFAULT_GAS_LIMIT};
use crate::error::{Error, Result};

/// A deployed contract: its address and parsed ABI, with events indexed by
/// their signature topic. Immutable once built and shared through `Arc`.
#[derive(Debug, Clone)]
pub struct ContractDescriptor {
    address: Address,
    abi: Arc<JsonAbi>,
    events: HashMap<B256, Event>,
}

impl ContractDescriptor {
    pub fn new(address: Address, abi: JsonAbi) -> Self {
        // anonymous events carry no signature topic and cannot be matched
        let events = abi
            .events()
            .filter(|event| !event.anonymous)
            .map(|event| (event.selector(), event.clone()))
            .collect();

        Self {
            address,
            abi: Arc::new(abi),
            events,
        }
    }

    pub fn from_json(address: Address, abi_json: &str) -> Result<Self> {
        let abi: JsonAbi = serde_json::from_str(abi_json)
            .map_err(|e| Error::InvalidAbi(format!("Failed to parse ABI JSON: {}", e)))?;
        Ok(Self::new(address, abi))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn abi(&self) -> &JsonAbi {
        &self.abi
    }

    pub fn event_by_topic(&self, topic: &B256) -> Option<&Event> {
        self.events.get(topic)
    }

    /// Look up an event by name, failing with `UnknownEvent` if absent.
    pub fn event(&self, name: &str) -> Result<&Event> {
        self.abi
            .event(name)
            .and_then(|events| events.first())
            .ok_or_else(|| Error::UnknownEvent(name.to_string()))
    }
}

/// A contract bound to a chain client, exposing its read, write and
/// event-filter capabilities.
#[derive(Clone)]
pub struct BoundContract {
    descriptor: Arc<ContractDescriptor>,
    client: Arc<dyn ChainClient>,
    default_gas_limit: u64,
}

impl BoundContract {
    pub fn new(descriptor: Arc<ContractDescriptor>, client: Arc<dyn ChainClient>) -> Self {
        Self {
            descriptor,
            client,
            default_gas_limit: DEFAULT_GAS_LIMIT,
        }
    }

    pub fn with_default_gas_limit(mut self, gas_limit: u64) -> Self {
        self.default_gas_limit = gas_limit;
        self
    }

    pub fn descriptor(&self) -> &Arc<ContractDescriptor> {
        &self.descriptor
    }

    pub fn address(&self) -> Address {
        self.descriptor.address()
    }

    /// Run a read-only call and decode its return values.
    pub async fn call(&self, call: &FunctionCall) -> Result<Vec<DynSolValue>> {
        let function = codec::resolve_function(self.descriptor.abi(), call)?;
        let calldata = codec::encode_with(function, &call.args)?;

        tracing::debug!("eth_call {} on {:?}", function.signature(), self.address());
        let result = self.client.call(self.address(), calldata).await?;
        codec::decode_output(function, &result)
    }

    /// Build, sign and broadcast a state-changing call.
    pub async fn transact(
        &self,
        signer: &dyn TransactionSigner,
        call: &FunctionCall,
        opts: &TransactOpts,
    ) -> Result<TxHash> {
        tracing::info!(
            "Sending {} to contract {:?} from {:?}",
            call.name,
            self.address(),
            signer.address()
        );
        transaction::submit(
            self.client.as_ref(),
            signer,
            &self.descriptor,
            call,
            opts,
            self.default_gas_limit,
        )
        .await
    }

    fn filter_for(&self, event: Option<&str>, filter: LogFilter) -> Result<LogFilter> {
        match event {
            Some(name) => {
                let event = self.descriptor.event(name)?;
                Ok(filter.with_event_signature(event.selector()))
            }
            None => Ok(filter),
        }
    }

    /// Logs of this contract in `[from_block, to_block]`, optionally limited
    /// to one event.
    pub fn filter_logs(
        &self,
        from_block: u64,
        to_block: u64,
        event: Option<&str>,
    ) -> Result<HistoricalBatch> {
        let filter =
            self.filter_for(event, LogFilter::range(self.address(), from_block, to_block))?;
        Ok(HistoricalBatch::new(
            self.client.clone(),
            self.descriptor.clone(),
            filter,
        ))
    }

    /// Live logs of this contract from now on, optionally limited to one event.
    pub async fn watch_logs(&self, event: Option<&str>) -> Result<LiveSubscription> {
        let filter = self.filter_for(event, LogFilter::open(self.address()))?;
        let subscription = self.client.subscribe_logs(&filter).await?;
        tracing::info!("Watching logs of {:?}", self.address());
        Ok(LiveSubscription::new(self.descriptor.clone(), subscription))
    }
}
