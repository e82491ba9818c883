//! Typed binding for the deployed Emerald token / film registry contract.

use alloy::{
    dyn_abi::DynSolValue,
    primitives::{address, Address, TxHash, U256},
};

use super::codec::FunctionCall;
use super::contract::BoundContract;
use super::stream::{SubscriptionCloser, TypedStream};
use super::transaction::{TransactOpts, TransactionSigner};
use super::{DecodedEvent, RawLog};
use crate::error::{Error, Result};

pub const EMERALD_TOKEN_ABI: &str = include_str!("../../abi/EmeraldToken.json");

/// Goerli deployment of the film registry.
pub const DEFAULT_CONTRACT_ADDRESS: Address = address!("95E72Ebd9F722e0F6AD5fcd3a29F446B7fDf7e5f");

/// Block holding the reference `addFilm`/`deleteFilm` transactions.
pub const REFERENCE_BLOCK: u64 = 8_568_585;

#[cfg(test)]
pub(crate) fn emerald_token(address: Address) -> Result<super::contract::ContractDescriptor> {
    super::contract::ContractDescriptor::from_json(address, EMERALD_TOKEN_ABI)
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilmAdded {
    pub title: String,
    pub year: U256,
    pub genre: u8,
    pub raw: RawLog,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilmDeleted {
    pub title: String,
    pub raw: RawLog,
}

fn expect_event(event: &DecodedEvent, name: &str) -> Result<()> {
    if event.name == name {
        Ok(())
    } else {
        Err(Error::UnknownEvent(format!(
            "expected {}, got {}",
            name, event.signature
        )))
    }
}

fn string_field(event: &DecodedEvent, name: &str) -> Result<String> {
    match event.field(name) {
        Some(DynSolValue::String(value)) => Ok(value.clone()),
        other => Err(Error::MalformedPayload(format!(
            "{}.{}: expected string, got {:?}",
            event.name, name, other
        ))),
    }
}

fn uint_field(event: &DecodedEvent, name: &str) -> Result<U256> {
    match event.field(name) {
        Some(DynSolValue::Uint(value, _)) => Ok(*value),
        other => Err(Error::MalformedPayload(format!(
            "{}.{}: expected uint, got {:?}",
            event.name, name, other
        ))),
    }
}

impl TryFrom<DecodedEvent> for FilmAdded {
    type Error = Error;

    fn try_from(event: DecodedEvent) -> Result<Self> {
        expect_event(&event, "FilmAdded")?;
        let genre = uint_field(&event, "genre")?;
        Ok(Self {
            title: string_field(&event, "title")?,
            year: uint_field(&event, "year")?,
            genre: u8::try_from(genre).map_err(|_| {
                Error::MalformedPayload(format!("FilmAdded.genre out of range: {}", genre))
            })?,
            raw: event.raw,
        })
    }
}

impl TryFrom<DecodedEvent> for FilmDeleted {
    type Error = Error;

    fn try_from(event: DecodedEvent) -> Result<Self> {
        expect_event(&event, "FilmDeleted")?;
        Ok(Self {
            title: string_field(&event, "title")?,
            raw: event.raw,
        })
    }
}

fn transaction_hash(raw: &RawLog) -> Option<String> {
    raw.transaction_hash.map(|h| format!("0x{:x}", h))
}

impl FilmAdded {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "event": "FilmAdded",
            "title": self.title,
            "year": self.year.to_string(),
            "genre": self.genre,
            "block_number": self.raw.block_number,
            "transaction_hash": transaction_hash(&self.raw),
        })
    }
}

impl FilmDeleted {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "event": "FilmDeleted",
            "title": self.title,
            "block_number": self.raw.block_number,
            "transaction_hash": transaction_hash(&self.raw),
        })
    }
}

/// Film registry operations on top of a [`BoundContract`].
#[derive(Clone)]
pub struct FilmRegistry {
    contract: BoundContract,
}

impl FilmRegistry {
    pub fn new(contract: BoundContract) -> Self {
        Self { contract }
    }

    pub fn contract(&self) -> &BoundContract {
        &self.contract
    }

    pub async fn add_film(
        &self,
        signer: &dyn TransactionSigner,
        title: &str,
        year: U256,
        genre: u8,
        opts: &TransactOpts,
    ) -> Result<TxHash> {
        let call = FunctionCall::new(
            "addFilm",
            vec![
                DynSolValue::String(title.to_string()),
                DynSolValue::Uint(year, 256),
                DynSolValue::Uint(U256::from(genre), 8),
            ],
        );
        self.contract.transact(signer, &call, opts).await
    }

    pub async fn delete_film(
        &self,
        signer: &dyn TransactionSigner,
        title: &str,
        opts: &TransactOpts,
    ) -> Result<TxHash> {
        let call = FunctionCall::new("deleteFilm", vec![DynSolValue::String(title.to_string())]);
        self.contract.transact(signer, &call, opts).await
    }

    async fn call_single(&self, function: &str, args: Vec<DynSolValue>) -> Result<DynSolValue> {
        let mut values = self
            .contract
            .call(&FunctionCall::new(function, args))
            .await?;
        if values.len() != 1 {
            return Err(Error::MalformedPayload(format!(
                "{} returned {} values, expected 1",
                function,
                values.len()
            )));
        }
        Ok(values.remove(0))
    }

    async fn call_string(&self, function: &str) -> Result<String> {
        match self.call_single(function, vec![]).await? {
            DynSolValue::String(value) => Ok(value),
            other => Err(Error::MalformedPayload(format!(
                "{} returned {:?}, expected string",
                function, other
            ))),
        }
    }

    async fn call_uint(&self, function: &str, args: Vec<DynSolValue>) -> Result<U256> {
        match self.call_single(function, args).await? {
            DynSolValue::Uint(value, _) => Ok(value),
            other => Err(Error::MalformedPayload(format!(
                "{} returned {:?}, expected uint",
                function, other
            ))),
        }
    }

    pub async fn name(&self) -> Result<String> {
        self.call_string("name").await
    }

    pub async fn symbol(&self) -> Result<String> {
        self.call_string("symbol").await
    }

    pub async fn total_supply(&self) -> Result<U256> {
        self.call_uint("totalSupply", vec![]).await
    }

    pub async fn balance_of(&self, account: Address) -> Result<U256> {
        self.call_uint("balanceOf", vec![DynSolValue::Address(account)])
            .await
    }

    pub fn filter_film_added(&self, from_block: u64, to_block: u64) -> Result<TypedStream<FilmAdded>> {
        let batch = self
            .contract
            .filter_logs(from_block, to_block, Some("FilmAdded"))?;
        Ok(TypedStream::new(batch))
    }

    pub fn filter_film_deleted(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<TypedStream<FilmDeleted>> {
        let batch = self
            .contract
            .filter_logs(from_block, to_block, Some("FilmDeleted"))?;
        Ok(TypedStream::new(batch))
    }

    /// Live `FilmAdded` events, with a handle to close the stream from
    /// another task.
    pub async fn watch_film_added(&self) -> Result<(TypedStream<FilmAdded>, SubscriptionCloser)> {
        let live = self.contract.watch_logs(Some("FilmAdded")).await?;
        let closer = live.closer();
        Ok((TypedStream::new(live), closer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethereum::codec;
    use crate::ethereum::events::decode_log;
    use crate::ethereum::provider::testing::FakeChain;
    use crate::ethereum::transaction::LocalSigner;
    use alloy::primitives::keccak256;
    use std::sync::Arc;

    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn film_added_log(title: &str, year: u64, genre: u8) -> RawLog {
        RawLog {
            address: DEFAULT_CONTRACT_ADDRESS,
            topics: vec![keccak256("FilmAdded(string,uint256,uint8)")],
            data: DynSolValue::Tuple(vec![
                DynSolValue::String(title.to_string()),
                DynSolValue::Uint(U256::from(year), 256),
                DynSolValue::Uint(U256::from(genre), 8),
            ])
            .abi_encode_params()
            .into(),
            block_number: Some(REFERENCE_BLOCK),
            ..Default::default()
        }
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

    fn registry(chain: Arc<FakeChain>) -> FilmRegistry {
        let descriptor = Arc::new(emerald_token(DEFAULT_CONTRACT_ADDRESS).unwrap());
        FilmRegistry::new(BoundContract::new(descriptor, chain))
    }

    #[test]
    fn test_embedded_abi_has_film_entries() {
        let descriptor = emerald_token(DEFAULT_CONTRACT_ADDRESS).unwrap();
        assert!(descriptor.abi().function("addFilm").is_some());
        assert!(descriptor.abi().function("deleteFilm").is_some());
        assert!(descriptor.event("FilmAdded").is_ok());
        assert!(descriptor.event("FilmDeleted").is_ok());
    }

    #[test]
    fn test_film_added_from_decoded_event() {
        let descriptor = emerald_token(DEFAULT_CONTRACT_ADDRESS).unwrap();
        let log = film_added_log("lol", 2023, 0);
        let event = decode_log(&descriptor, &log).unwrap();

        let film = FilmAdded::try_from(event).unwrap();
        assert_eq!(film.title, "lol");
        assert_eq!(film.year, U256::from(2023));
        assert_eq!(film.genre, 0);
        assert_eq!(film.raw, log);

        let json = film.to_json();
        assert_eq!(json["year"], "2023");
        assert_eq!(json["genre"], 0);
        assert_eq!(json["block_number"], REFERENCE_BLOCK);
    }

    #[test]
    fn test_film_added_rejects_other_events() {
        let descriptor = emerald_token(DEFAULT_CONTRACT_ADDRESS).unwrap();
        let event = decode_log(&descriptor, &film_deleted_log("lol")).unwrap();
        assert!(matches!(
            FilmAdded::try_from(event.clone()),
            Err(Error::UnknownEvent(_))
        ));
        assert_eq!(FilmDeleted::try_from(event).unwrap().title, "lol");
    }

    #[tokio::test]
    async fn test_add_and_delete_film_submit_encoded_calls() {
        let chain = Arc::new(FakeChain::default());
        let registry = registry(chain.clone());
        let signer = LocalSigner::from_private_key(DEV_KEY).unwrap();

        registry
            .add_film(&signer, "lol", U256::from(2023), 0, &TransactOpts::default())
            .await
            .unwrap();
        registry
            .delete_film(&signer, "lol", &TransactOpts::default())
            .await
            .unwrap();

        let sent = chain.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);

        let abi = registry.contract().descriptor().abi();
        let delete = codec::encode(
            abi,
            &FunctionCall::new("deleteFilm", vec![DynSolValue::String("lol".into())]),
        )
        .unwrap();
        // the signed legacy envelope embeds the calldata verbatim
        assert!(sent[1]
            .windows(delete.len())
            .any(|window| window == delete.as_ref()));
    }

    #[tokio::test]
    async fn test_read_only_accessors() {
        let chain = Arc::new(FakeChain::default());
        let registry = registry(chain.clone());

        *chain.call_result.lock().unwrap() =
            DynSolValue::Tuple(vec![DynSolValue::String("Emerald".into())])
                .abi_encode_params()
                .into();
        assert_eq!(registry.name().await.unwrap(), "Emerald");

        *chain.call_result.lock().unwrap() =
            DynSolValue::Tuple(vec![DynSolValue::Uint(U256::from(500), 256)])
                .abi_encode_params()
                .into();
        assert_eq!(registry.total_supply().await.unwrap(), U256::from(500));
        assert_eq!(
            registry.balance_of(Address::repeat_byte(1)).await.unwrap(),
            U256::from(500)
        );
    }

    #[tokio::test]
    async fn test_filter_film_added_yields_typed_events() {
        let chain = Arc::new(FakeChain::with_logs(vec![film_added_log("lol", 2023, 0)]));
        let registry = registry(chain.clone());

        let mut films = registry
            .filter_film_added(REFERENCE_BLOCK, REFERENCE_BLOCK)
            .unwrap();
        let film = films.next().await.unwrap().unwrap();
        assert_eq!(film.title, "lol");
        assert_eq!(film.year, U256::from(2023));
        assert!(films.next().await.is_none());

        let filters = chain.filters.lock().unwrap();
        assert_eq!(filters[0].address, DEFAULT_CONTRACT_ADDRESS);
        assert_eq!(
            filters[0].event_signature,
            Some(keccak256("FilmAdded(string,uint256,uint8)"))
        );
    }

    #[tokio::test]
    async fn test_filter_film_deleted_yields_typed_events() {
        let chain = Arc::new(FakeChain::with_logs(vec![film_deleted_log("lol")]));
        let registry = registry(chain);

        let mut films = registry
            .filter_film_deleted(REFERENCE_BLOCK, REFERENCE_BLOCK)
            .unwrap();
        assert_eq!(films.next().await.unwrap().unwrap().title, "lol");
        assert!(films.next().await.is_none());
    }

    #[tokio::test]
    async fn test_watch_film_added_until_closed() {
        let chain = Arc::new(FakeChain::default());
        let registry = registry(chain.clone());

        let (mut films, closer) = registry.watch_film_added().await.unwrap();
        let feed = chain.take_feed();
        assert!(feed.send(film_added_log("lol", 2023, 0)).await);

        assert_eq!(films.next().await.unwrap().unwrap().title, "lol");
        closer.close();
        assert!(films.next().await.is_none());
    }
}
