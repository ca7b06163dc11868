// Copyright (c) 2024 Botho Foundation

//! Request/response correlation over one connection.
//!
//! Every request gets a fresh id and a [`Completion`] stored in a concurrent
//! map. When a complete message arrives, its id selects the completion,
//! which is removed and fired exactly once. Messages carrying [`PUSH_ID`]
//! go to push subscribers instead.
//!
//! Completions never run on the reader task: a channel completion wakes the
//! awaiting task, and a callback completion is spawned onto the runtime.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{TransportError, TransportResult};
use crate::wire::framer::PUSH_ID;

/// Continuation invoked with the outcome of a request.
pub type Callback = Box<dyn FnOnce(TransportResult<Bytes>) + Send + Sync + 'static>;

/// How a pending request is completed.
pub enum Completion {
    /// Resolve a [`RequestHandle`].
    Channel(oneshot::Sender<TransportResult<Bytes>>),
    /// Run a callback on its own task.
    Callback(Callback),
}

impl Completion {
    fn complete(self, result: TransportResult<Bytes>) {
        match self {
            Completion::Channel(tx) => {
                // The receiver may have been dropped; nothing to do then.
                let _ = tx.send(result);
            }
            Completion::Callback(callback) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { callback(result) });
                }
                Err(_) => callback(result),
            },
        }
    }
}

/// Awaitable response to one request.
#[derive(Debug)]
pub struct RequestHandle {
    id: u32,
    rx: oneshot::Receiver<TransportResult<Bytes>>,
}

impl RequestHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wait for the response payload.
    pub async fn response(self) -> TransportResult<Bytes> {
        self.rx.await.unwrap_or(Err(TransportError::ConnectionClosed))
    }

    /// Wait for the response and decode it. A decode failure is scoped to
    /// this request.
    pub async fn decode<T, E, F>(self, decode: F) -> TransportResult<T>
    where
        F: FnOnce(&[u8]) -> Result<T, E>,
        E: std::fmt::Display,
    {
        let payload = self.response().await?;
        decode(&payload).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

/// Identifier of a push subscription.
pub type SubscriptionId = u64;

/// What happened to a completed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Response(u32),
    Push { subscribers: usize },
    /// No pending request had this id.
    Unknown(u32),
}

/// Pending-request table and push fan-out.
pub struct RequestMultiplexer {
    next_id: AtomicU32,
    pending: DashMap<u32, Completion>,
    subscribers: Mutex<Vec<(SubscriptionId, mpsc::UnboundedSender<Bytes>)>>,
    next_subscription: Mutex<SubscriptionId>,
    closed: AtomicBool,
}

impl Default for RequestMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestMultiplexer {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            pending: DashMap::new(),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: Mutex::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Allocate the next request id. Wraps before the reserved ids.
    pub fn next_id(&self) -> u32 {
        let mut id = self.next_id.fetch_add(1, Ordering::Relaxed);
        while id == 0 || id >= PUSH_ID {
            id = self.next_id.fetch_add(1, Ordering::Relaxed);
        }
        id
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register a completion under a fresh id.
    ///
    /// After [`fail_all`](Self::fail_all) the completion fires immediately
    /// with [`TransportError::ConnectionClosed`].
    pub fn register(&self, completion: Completion) -> u32 {
        // After a wrap the counter can land on a request that is still
        // outstanding; skip it rather than replace its completion.
        let id = loop {
            let id = self.next_id();
            match self.pending.entry(id) {
                Entry::Occupied(_) => trace!(msg_id = id, "request id still pending, skipping"),
                Entry::Vacant(slot) => {
                    slot.insert(completion);
                    break id;
                }
            }
        };

        // fail_all may have drained the table between the check and insert.
        if self.is_closed() {
            self.fail(id, TransportError::ConnectionClosed);
        }
        id
    }

    /// Register a request resolved through a [`RequestHandle`].
    pub fn register_handle(&self) -> RequestHandle {
        let (tx, rx) = oneshot::channel();
        let id = self.register(Completion::Channel(tx));
        RequestHandle { id, rx }
    }

    /// Route a reassembled message.
    pub fn on_complete_message(&self, id: u32, payload: Bytes) -> Dispatch {
        if id == PUSH_ID {
            let subscribers = self.publish(payload);
            return Dispatch::Push { subscribers };
        }

        match self.pending.remove(&id) {
            Some((_, completion)) => {
                debug!(msg_id = id, bytes = payload.len(), "response delivered");
                completion.complete(Ok(payload));
                Dispatch::Response(id)
            }
            None => {
                warn!(msg_id = id, "dropping response for unknown request");
                Dispatch::Unknown(id)
            }
        }
    }

    /// Fail one pending request. Returns whether it was pending.
    pub fn fail(&self, id: u32, err: TransportError) -> bool {
        match self.pending.remove(&id) {
            Some((_, completion)) => {
                completion.complete(Err(err));
                true
            }
            None => false,
        }
    }

    /// Fail every pending request and refuse new ones. Idempotent.
    pub fn fail_all(&self, err: TransportError) -> usize {
        self.closed.store(true, Ordering::Release);
        self.subscribers.lock().clear();

        let ids: Vec<u32> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if self.fail(id, err.clone()) {
                failed += 1;
            }
        }
        if failed > 0 {
            debug!(failed, "resolved pending requests at teardown");
        }
        failed
    }

    /// Subscribe to push notifications through a channel.
    pub fn push_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut next = self.next_subscription.lock();
            *next += 1;
            *next
        };
        if !self.is_closed() {
            self.subscribers.lock().push((id, tx));
        }
        (id, rx)
    }

    /// Subscribe a handler. It runs on its own task, one notification at a
    /// time in arrival order. Must be called within a tokio runtime.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        let (id, mut rx) = self.push_channel();
        let handler = Arc::new(handler);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                handler(payload);
            }
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        subscribers.len() != before
    }

    fn publish(&self, payload: Bytes) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        if subscribers.is_empty() {
            debug!("push notification with no subscribers");
        }
        subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_ids_are_monotonic_and_skip_reserved() {
        let mux = RequestMultiplexer::new();
        assert_eq!(mux.next_id(), 1);
        assert_eq!(mux.next_id(), 2);

        mux.next_id.store(PUSH_ID - 1, Ordering::Relaxed);
        assert_eq!(mux.next_id(), PUSH_ID - 1);
        // PUSH_ID, INVALID_ID and 0 are skipped.
        assert_eq!(mux.next_id(), 1);
    }

    #[test]
    fn test_wrapped_id_skips_outstanding_request() {
        let mux = RequestMultiplexer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let callback = |fired: Arc<AtomicUsize>| -> Completion {
            Completion::Callback(Box::new(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            }))
        };

        let first = mux.register(callback(fired.clone()));
        assert_eq!(first, 1);

        // Wrap the counter so the next candidate is the outstanding id 1.
        mux.next_id.store(PUSH_ID, Ordering::Relaxed);
        let second = mux.register(callback(fired.clone()));
        assert_eq!(second, 2);
        assert_eq!(mux.pending_count(), 2);

        // No runtime here, so both callbacks run inline.
        assert_eq!(mux.fail_all(TransportError::ConnectionClosed), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_response_resolves_handle() {
        let mux = RequestMultiplexer::new();
        let handle = mux.register_handle();
        let id = handle.id();

        assert_eq!(
            mux.on_complete_message(id, Bytes::from_static(b"ok")),
            Dispatch::Response(id)
        );
        assert_eq!(handle.response().await.unwrap(), Bytes::from_static(b"ok"));

        // Second delivery for the same id is dropped.
        assert_eq!(
            mux.on_complete_message(id, Bytes::from_static(b"again")),
            Dispatch::Unknown(id)
        );
    }

    #[tokio::test]
    async fn test_callback_runs_once_on_other_task() {
        let mux = RequestMultiplexer::new();
        let (tx, rx) = oneshot::channel();
        let id = mux.register(Completion::Callback(Box::new(move |result| {
            let _ = tx.send(result);
        })));

        mux.on_complete_message(id, Bytes::from_static(b"cb"));
        mux.on_complete_message(id, Bytes::from_static(b"cb"));
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"cb"));
        assert_eq!(mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_resolves_everything() {
        let mux = RequestMultiplexer::new();
        let a = mux.register_handle();
        let b = mux.register_handle();

        assert_eq!(mux.fail_all(TransportError::ConnectionClosed), 2);
        assert_eq!(mux.fail_all(TransportError::ConnectionClosed), 0);
        assert!(matches!(
            a.response().await,
            Err(TransportError::ConnectionClosed)
        ));
        assert!(matches!(
            b.response().await,
            Err(TransportError::ConnectionClosed)
        ));

        // Late registrations fail immediately.
        let late = mux.register_handle();
        assert!(matches!(
            late.response().await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_decode_error_scoped_to_request() {
        let mux = RequestMultiplexer::new();
        let bad = mux.register_handle();
        let good = mux.register_handle();
        mux.on_complete_message(bad.id(), Bytes::from_static(b"xyz"));
        mux.on_complete_message(good.id(), Bytes::from_static(b"42"));

        let parse = |b: &[u8]| std::str::from_utf8(b).unwrap_or("").parse::<u32>();
        assert!(matches!(
            bad.decode(parse).await,
            Err(TransportError::Decode(_))
        ));
        assert_eq!(good.decode(parse).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_push_routing() {
        let mux = RequestMultiplexer::new();
        let (_, mut rx) = mux.push_channel();

        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        mux.subscribe(move |payload| {
            seen.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.send(payload);
        });

        assert_eq!(
            mux.on_complete_message(PUSH_ID, Bytes::from_static(b"block")),
            Dispatch::Push { subscribers: 2 }
        );
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"block"));
        assert_eq!(done_rx.recv().await.unwrap(), Bytes::from_static(b"block"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let mux = RequestMultiplexer::new();
        let (id, _rx) = mux.push_channel();
        assert!(mux.unsubscribe(id));
        assert!(!mux.unsubscribe(id));
        assert_eq!(
            mux.on_complete_message(PUSH_ID, Bytes::new()),
            Dispatch::Push { subscribers: 0 }
        );
    }
}
