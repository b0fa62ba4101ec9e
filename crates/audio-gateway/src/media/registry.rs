//! Shared registry mapping stream identifiers to publisher media handles.
//!
//! Viewers may request a stream before its publisher has negotiated. The
//! registry parks such viewers on a one-shot waiter that fires the moment the
//! publisher registers, so no registration can be missed in between the
//! lookup and the wait.

use crate::media::control::MediaHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

/// Outcome of a source lookup.
#[derive(Debug)]
pub enum SourceResolution {
    /// The publisher is already registered.
    Ready(MediaHandle),
    /// No publisher yet; the receiver fires when one registers.
    Pending(oneshot::Receiver<MediaHandle>),
}

#[derive(Debug, Default)]
struct Inner {
    sources: HashMap<String, MediaHandle>,
    waiters: HashMap<String, Vec<oneshot::Sender<MediaHandle>>>,
}

/// Registry of active publisher sources, shared across the router and every
/// session. Cloning is cheap and refers to the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the publisher handle for a stream and wake every parked
    /// waiter. A re-registration overwrites the previous handle.
    pub fn register(&self, stream_id: &str, handle: MediaHandle) {
        let waiters = {
            let mut inner = self.locked();
            inner
                .sources
                .insert(stream_id.to_string(), handle.clone());
            inner.waiters.remove(stream_id).unwrap_or_default()
        };

        debug!(
            target: "sfu.media.registry",
            stream_id,
            handle = %handle,
            waiters = waiters.len(),
            "registered audio source"
        );

        for waiter in waiters {
            // Waiters whose session stopped in the meantime are gone; that
            // is fine.
            let _ = waiter.send(handle.clone());
        }
    }

    /// Remove a stream's source, returning the handle if one was registered.
    /// Parked waiters survive removal and fire on the next registration.
    pub fn remove(&self, stream_id: &str) -> Option<MediaHandle> {
        let removed = self.locked().sources.remove(stream_id);
        if let Some(handle) = &removed {
            debug!(
                target: "sfu.media.registry",
                stream_id,
                handle = %handle,
                "unregistered audio source"
            );
        }
        removed
    }

    /// Current handle for a stream, if its publisher is registered.
    pub fn get(&self, stream_id: &str) -> Option<MediaHandle> {
        self.locked().sources.get(stream_id).cloned()
    }

    /// Resolve a stream to its source, parking the caller if the publisher
    /// has not negotiated yet.
    ///
    /// The lookup and the waiter registration happen under one lock, so a
    /// registration arriving concurrently either wins the lookup or fires
    /// the waiter.
    pub fn resolve(&self, stream_id: &str) -> SourceResolution {
        let mut inner = self.locked();
        if let Some(handle) = inner.sources.get(stream_id) {
            return SourceResolution::Ready(handle.clone());
        }

        let (tx, rx) = oneshot::channel();
        inner
            .waiters
            .entry(stream_id.to_string())
            .or_default()
            .push(tx);
        SourceResolution::Pending(rx)
    }

    pub fn len(&self) -> usize {
        self.locked().sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked().sources.is_empty()
    }
}
