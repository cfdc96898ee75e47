//! Lifecycle event bus
//!
//! Subscribers register on a named channel or on the global channel `*`.
//! Every subscription carries the [`Lease`] of the module that owns its
//! callback; a subscription whose lease was revoked is removed the next time
//! its channel dispatches and is never invoked.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rust_module_host_sdk::event::{channels, LifecycleEvent};
use rust_module_host_sdk::host::{EventCallback, SubscriptionId};

use super::context::ImageBound;
use super::lease::{ContextId, Lease};
use crate::error::panic_message;

struct Subscription {
    id: SubscriptionId,
    lease: Arc<Lease>,
    callback: Arc<ImageBound<EventCallback>>,
}

/// Multicast of lifecycle events
pub struct EventBus {
    channels: Mutex<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe `callback` to `channel`. A subscription offered with an
    /// already revoked lease is dropped and gets id 0.
    pub fn subscribe(&self, channel: &str, lease: Arc<Lease>, callback: ImageBound<EventCallback>) -> SubscriptionId {
        if !lease.is_live() {
            return 0;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().entry(channel.to_string()).or_default().push(Subscription {
            id,
            lease,
            callback: Arc::new(callback),
        });
        id
    }

    /// Subscribe a host callback that lives as long as the bus
    pub fn subscribe_host<F>(&self, channel: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(callback);
        self.subscribe(channel, Lease::host(), ImageBound::host(callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut channels = self.lock();
            channels.values_mut().find_map(|subs| {
                let idx = subs.iter().position(|s| s.id == id)?;
                Some(subs.remove(idx))
            })
        };
        removed.is_some()
    }

    /// Drop every subscription owned by `owner`. Returns how many were removed.
    pub fn revoke(&self, owner: ContextId) -> usize {
        let removed: Vec<Subscription> = {
            let mut channels = self.lock();
            let mut removed = Vec::new();
            for subs in channels.values_mut() {
                let (gone, kept): (Vec<Subscription>, Vec<Subscription>) = std::mem::take(subs)
                    .into_iter()
                    .partition(|s| s.lease.is_owned_by(owner));
                *subs = kept;
                removed.extend(gone);
            }
            removed
        };
        removed.len()
    }

    /// Dispatch on the event's channel, then on the global channel
    pub fn publish(&self, event: LifecycleEvent) {
        let channel = event.channel().to_string();
        self.dispatch(&channel, &event);
        if channel != channels::GLOBAL {
            self.dispatch(channels::GLOBAL, &event);
        }
    }

    fn dispatch(&self, channel: &str, event: &LifecycleEvent) {
        let (live, dead) = {
            let mut channels = self.lock();
            let Some(subs) = channels.get_mut(channel) else {
                return;
            };
            let (live, dead): (Vec<Subscription>, Vec<Subscription>) =
                std::mem::take(subs).into_iter().partition(|s| s.lease.is_live());

            let snapshot: Vec<(Arc<Lease>, Arc<ImageBound<EventCallback>>)> = live
                .iter()
                .rev()
                .map(|s| (s.lease.clone(), s.callback.clone()))
                .collect();
            *subs = live;
            (snapshot, dead)
        };

        if !dead.is_empty() {
            tracing::debug!(channel = %channel, pruned = dead.len(), "Pruned subscriptions of unloaded modules");
        }
        // Released outside the lock: this may be the last hold on a module image
        drop(dead);

        for (lease, callback) in live {
            if !lease.is_live() {
                continue;
            }
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                tracing::error!(
                    channel = %channel,
                    owner = ?lease.owner(),
                    error = %panic_message(payload.as_ref()),
                    "Event handler panicked"
                );
            }
        }
    }

    /// Number of subscriptions across all channels, including not yet pruned ones
    pub fn subscription_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Subscription>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
