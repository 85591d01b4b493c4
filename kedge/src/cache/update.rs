//! The update channel.
//!
//! Cached strategies that can learn something newer than the value they
//! already returned deliver it here: the channel resolves exactly once,
//! either with the fetched body or with a non-fatal
//! [`NoUpdate`](crate::FetchError::NoUpdate) signal. The initial value is
//! never mutated.

use std::marker::PhantomData;

use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::error::FetchError;
use crate::transport::TransportResponse;

pub(crate) type UpdateSender = oneshot::Sender<Result<TransportResponse, FetchError>>;
pub(crate) type UpdateReceiver = oneshot::Receiver<Result<TransportResponse, FetchError>>;

/// A decoded JSON response body with its response metadata.
#[derive(Debug, Clone)]
pub struct JsonBody<T> {
    /// The decoded value.
    pub value: T,
    /// Response status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
}

/// Result of a JSON fetch, plus the optional update channel.
#[derive(Debug)]
pub struct JsonFetch<T> {
    /// The decoded value.
    pub value: T,
    /// Response status (`200` when served from cache).
    pub status: StatusCode,
    /// Response headers (the cached ones when served from cache).
    pub headers: HeaderMap,
    /// Present when the request asked for `update = true` on a strategy
    /// that supports it.
    pub update: Option<UpdateChannel<T>>,
}

/// Eventually-resolved second result of a cached request.
pub struct UpdateChannel<T> {
    rx: UpdateReceiver,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for UpdateChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UpdateChannel")
    }
}

impl<T> UpdateChannel<T> {
    pub(crate) fn new(rx: UpdateReceiver) -> Self {
        UpdateChannel {
            rx,
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> UpdateChannel<T> {
    /// Await the update.
    ///
    /// Resolves with the newer body, or with
    /// [`FetchError::NoUpdate`] when there is nothing newer to deliver.
    /// A channel whose producer was cancelled resolves to `Aborted`.
    pub async fn recv(self) -> Result<JsonBody<T>, FetchError> {
        match self.rx.await {
            Ok(Ok(response)) => Ok(JsonBody {
                value: serde_json::from_slice(&response.body)?,
                status: response.status,
                headers: response.headers,
            }),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(FetchError::Aborted(None)),
        }
    }
}

/// A channel that is already resolved with `value`.
pub(crate) fn resolved_channel(value: Result<TransportResponse, FetchError>) -> UpdateReceiver {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(value);
    rx
}

/// `(sender, receiver)` when an update was requested, `(None, None)`
/// otherwise.
pub(crate) fn channel_if(update: bool) -> (Option<UpdateSender>, Option<UpdateReceiver>) {
    if update {
        let (tx, rx) = oneshot::channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    }
}

/// Resolve an optional sender, ignoring a dropped receiver.
pub(crate) fn resolve(tx: Option<UpdateSender>, value: Result<TransportResponse, FetchError>) {
    if let Some(tx) = tx {
        let _ = tx.send(value);
    }
}
