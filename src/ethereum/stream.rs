//! Lazy sequences of decoded contract events.
//!
//! [`HistoricalBatch`] runs one `eth_getLogs` query over a closed block range
//! and yields its results; [`LiveSubscription`] yields events pushed by the
//! node until it fails or the caller closes it. Both implement
//! [`EventStream`].
//!
//! Decode failures are per entry: the stream yields `Some(Err(..))` for the
//! offending log and carries on with the next one. A live stream that loses
//! its feed yields a single `SubscriptionTerminated` error and then ends.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::watch;

use super::contract::ContractDescriptor;
use super::events;
use super::provider::{ChainClient, LogFilter, LogSubscription};
use super::{DecodedEvent, RawLog};
use crate::error::{Error, Result};

#[async_trait]
pub trait EventStream: Send {
    /// The next decoded event; `None` once the sequence has ended.
    async fn next(&mut self) -> Option<Result<DecodedEvent>>;

    /// Release the underlying query or subscription. Idempotent.
    fn close(&mut self);
}

pub struct HistoricalBatch {
    client: Arc<dyn ChainClient>,
    descriptor: Arc<ContractDescriptor>,
    filter: LogFilter,
    buffer: VecDeque<RawLog>,
    queried: bool,
    closed: bool,
}

impl HistoricalBatch {
    /// The query is deferred until the first call to [`next`](Self::next).
    pub fn new(
        client: Arc<dyn ChainClient>,
        descriptor: Arc<ContractDescriptor>,
        filter: LogFilter,
    ) -> Self {
        Self {
            client,
            descriptor,
            filter,
            buffer: VecDeque::new(),
            queried: false,
            closed: false,
        }
    }

    pub async fn next(&mut self) -> Option<Result<DecodedEvent>> {
        if self.closed {
            return None;
        }

        if !self.queried {
            self.queried = true;
            match self.client.filter_logs(&self.filter).await {
                Ok(logs) => {
                    tracing::debug!(
                        "Fetched {} logs for {} in blocks {}..={:?}",
                        logs.len(),
                        self.filter.address,
                        self.filter.from_block,
                        self.filter.to_block
                    );
                    self.buffer = logs.into();
                }
                Err(e) => return Some(Err(e)),
            }
        }

        let log = self.buffer.pop_front()?;
        Some(events::decode_log(&self.descriptor, &log))
    }

    /// Discard buffered results so the next pull queries the node again.
    pub fn restart(&mut self) {
        self.buffer.clear();
        self.queried = false;
        self.closed = false;
    }

    pub fn close(&mut self) {
        self.buffer.clear();
        self.closed = true;
    }
}

#[async_trait]
impl EventStream for HistoricalBatch {
    async fn next(&mut self) -> Option<Result<DecodedEvent>> {
        HistoricalBatch::next(self).await
    }

    fn close(&mut self) {
        HistoricalBatch::close(self)
    }
}

/// Handle that closes a [`LiveSubscription`] from another task.
#[derive(Debug, Clone)]
pub struct SubscriptionCloser {
    cancel: Arc<watch::Sender<bool>>,
}

impl SubscriptionCloser {
    pub fn close(&self) {
        self.cancel.send_replace(true);
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct LiveSubscription {
    descriptor: Arc<ContractDescriptor>,
    subscription: LogSubscription,
    closer: SubscriptionCloser,
    cancel: watch::Receiver<bool>,
    termination: Option<Error>,
}

impl LiveSubscription {
    pub fn new(descriptor: Arc<ContractDescriptor>, subscription: LogSubscription) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            descriptor,
            subscription,
            closer: SubscriptionCloser {
                cancel: Arc::new(tx),
            },
            cancel: rx,
            termination: None,
        }
    }

    pub fn closer(&self) -> SubscriptionCloser {
        self.closer.clone()
    }

    /// Why the subscription ended, once it has. A `None` cause means it was
    /// closed by the caller.
    pub fn termination(&self) -> Option<&Error> {
        self.termination.as_ref()
    }

    /// Wait for the next log, a feed error or cancellation, whichever comes
    /// first. Cancellation wins over logs that are already buffered.
    pub async fn next(&mut self) -> Option<Result<DecodedEvent>> {
        if self.termination.is_some() {
            return None;
        }

        let received = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => None,
            received = self.subscription.recv() => Some(received),
        };

        match received {
            None => {
                self.finish(None);
                None
            }
            Some(Some(Ok(log))) => Some(events::decode_log(&self.descriptor, &log)),
            Some(Some(Err(e))) => {
                tracing::warn!("Log subscription terminated: {}", e);
                let err = self.finish(Some(e.to_string()));
                Some(Err(err))
            }
            Some(None) => {
                tracing::warn!("Log feed closed without an error");
                let err = self.finish(Some("log feed closed".to_string()));
                Some(Err(err))
            }
        }
    }

    pub fn close(&mut self) {
        self.closer.close();
        if self.termination.is_none() {
            self.finish(None);
        }
    }

    fn finish(&mut self, cause: Option<String>) -> Error {
        self.subscription.unsubscribe();
        let err = Error::SubscriptionTerminated { cause };
        self.termination = Some(err.clone());
        err
    }
}

#[async_trait]
impl EventStream for LiveSubscription {
    async fn next(&mut self) -> Option<Result<DecodedEvent>> {
        LiveSubscription::next(self).await
    }

    fn close(&mut self) {
        LiveSubscription::close(self)
    }
}

/// An event stream narrowed to one event type.
pub struct TypedStream<T> {
    inner: Box<dyn EventStream>,
    _event: PhantomData<fn() -> T>,
}

impl<T> TypedStream<T>
where
    T: TryFrom<DecodedEvent, Error = Error>,
{
    pub fn new(inner: impl EventStream + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            _event: PhantomData,
        }
    }

    pub async fn next(&mut self) -> Option<Result<T>> {
        let event = self.inner.next().await?;
        Some(event.and_then(T::try_from))
    }

    pub fn close(&mut self) {
        self.inner.close()
    }
}
