//! Assembly and signing of contract transactions.
//!
//! The builder only reads account state from the chain client; nonce
//! bookkeeping stays with the node. Two builds for the same account that run
//! concurrently observe the same pending nonce, so callers must keep a single
//! build-and-submit in flight per account.

use alloy::{
    eips::eip2718::Encodable2718,
    network::{EthereumWallet, TransactionBuilder as _},
    primitives::{Address, Bytes, U256},
    rpc::types::TransactionRequest as RpcTransactionRequest,
    signers::local::PrivateKeySigner,
};
use async_trait::async_trait;
use std::str::FromStr;
use tracing::{debug, info};

use super::codec::{self, FunctionCall};
use super::contract::ContractDescriptor;
use super::provider::ChainClient;
use crate::error::{Error, Result};

pub const DEFAULT_GAS_LIMIT: u64 = 300_000;

/// A complete, unsigned contract transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub from: Address,
    pub to: Address,
    pub input: Bytes,
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub value: U256,
    pub chain_id: Option<u64>,
}

impl TransactionRequest {
    /// Legacy-priced request understood by alloy's signers.
    pub fn to_rpc_request(&self) -> RpcTransactionRequest {
        let mut request = RpcTransactionRequest::default()
            .with_from(self.from)
            .with_to(self.to)
            .with_input(self.input.clone())
            .with_nonce(self.nonce)
            .with_gas_price(self.gas_price)
            .with_gas_limit(self.gas_limit)
            .with_value(self.value);
        if let Some(chain_id) = self.chain_id {
            request = request.with_chain_id(chain_id);
        }
        request
    }
}

/// Caller overrides for a transaction; unset fields come from the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactOpts {
    pub nonce: Option<u64>,
    pub gas_price: Option<u128>,
    pub gas_limit: Option<u64>,
    pub value: Option<U256>,
}

pub struct TransactionBuilder<'a> {
    client: &'a dyn ChainClient,
    default_gas_limit: u64,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(client: &'a dyn ChainClient) -> Self {
        Self {
            client,
            default_gas_limit: DEFAULT_GAS_LIMIT,
        }
    }

    pub fn with_default_gas_limit(mut self, gas_limit: u64) -> Self {
        self.default_gas_limit = gas_limit;
        self
    }

    pub async fn build(
        &self,
        descriptor: &ContractDescriptor,
        call: &FunctionCall,
        from: Address,
        opts: &TransactOpts,
    ) -> Result<TransactionRequest> {
        let input = codec::encode(descriptor.abi(), call)?;

        let nonce = match opts.nonce {
            Some(nonce) => nonce,
            None => self.client.pending_nonce(from).await?,
        };
        let gas_price = match opts.gas_price {
            Some(price) => price,
            None => self.client.suggest_gas_price().await?,
        };
        let chain_id = self.client.chain_id().await?;

        debug!(
            "Built {} for {:?}: nonce {}, gas price {}",
            call.name,
            descriptor.address(),
            nonce,
            gas_price
        );

        Ok(TransactionRequest {
            from,
            to: descriptor.address(),
            input,
            nonce,
            gas_price,
            gas_limit: opts.gas_limit.unwrap_or(self.default_gas_limit),
            value: opts.value.unwrap_or(U256::ZERO),
            chain_id: Some(chain_id),
        })
    }
}

/// Turns a transaction request into signed, broadcastable bytes.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    fn address(&self) -> Address;

    async fn sign(&self, request: &TransactionRequest) -> Result<Bytes>;
}

/// Signer holding a secp256k1 private key in memory.
#[derive(Clone)]
pub struct LocalSigner {
    wallet: EthereumWallet,
    address: Address,
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl LocalSigner {
    pub fn from_private_key(private_key: &str) -> anyhow::Result<Self> {
        let private_key = private_key.trim();
        let private_key = private_key
            .strip_prefix("0x")
            .or_else(|| private_key.strip_prefix("0X"))
            .unwrap_or(private_key);

        let signer = PrivateKeySigner::from_str(private_key)
            .map_err(|e| anyhow::anyhow!("Invalid private key: {}", e))?;
        let address = signer.address();

        Ok(Self {
            wallet: EthereumWallet::from(signer),
            address,
        })
    }
}

#[async_trait]
impl TransactionSigner for LocalSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign(&self, request: &TransactionRequest) -> Result<Bytes> {
        let envelope = request
            .to_rpc_request()
            .build(&self.wallet)
            .await
            .map_err(|e| Error::collaborator("sign", e))?;
        Ok(envelope.encoded_2718().into())
    }
}

/// Build, sign and broadcast a call, returning the transaction hash.
pub async fn submit(
    client: &dyn ChainClient,
    signer: &dyn TransactionSigner,
    descriptor: &ContractDescriptor,
    call: &FunctionCall,
    opts: &TransactOpts,
    default_gas_limit: u64,
) -> Result<alloy::primitives::TxHash> {
    let request = TransactionBuilder::new(client)
        .with_default_gas_limit(default_gas_limit)
        .build(descriptor, call, signer.address(), opts)
        .await?;
    let signed = signer.sign(&request).await?;
    let hash = client.send_raw_transaction(signed).await?;
    info!("Transaction {} sent with hash: {:?}", call.name, hash);
    Ok(hash)
}
