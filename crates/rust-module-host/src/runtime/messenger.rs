//! Inter-module messenger
//!
//! Messages are addressed `module[.subpath]`. A message carrying
//! `respond_to` first tries to complete the waiter registered under that id;
//! otherwise it goes to the target module's handler, if that module is still
//! alive. Every send is published as a `MessageSent` event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rust_module_host_sdk::event::LifecycleEvent;
use rust_module_host_sdk::host::MessageHandler;
use rust_module_host_sdk::message::{Message, MessageId};
use tokio::sync::oneshot;

use super::context::ImageBound;
use super::events::EventBus;
use super::lease::{ContextId, Lease};
use crate::error::{panic_message, MessengerError};

struct HandlerEntry {
    lease: Arc<Lease>,
    handler: ImageBound<MessageHandler>,
}

pub struct Messenger {
    handlers: DashMap<String, Arc<HandlerEntry>>,
    pending: DashMap<MessageId, oneshot::Sender<Message>>,
    next_id: AtomicU64,
    events: Arc<EventBus>,
}

impl Messenger {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            handlers: DashMap::new(),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    fn allocate_id(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `module`'s handler, replacing any previous one.
    /// Returns false if the lease is already revoked.
    pub fn subscribe(&self, module: &str, lease: Arc<Lease>, handler: ImageBound<MessageHandler>) -> bool {
        if !lease.is_live() {
            return false;
        }
        self.handlers
            .insert(module.to_lowercase(), Arc::new(HandlerEntry { lease, handler }));
        true
    }

    pub fn unsubscribe(&self, module: &str) -> bool {
        self.handlers.remove(&module.to_lowercase()).is_some()
    }

    /// Remove handlers owned by an unloaded context
    pub fn revoke(&self, owner: ContextId) -> usize {
        let before = self.handlers.len();
        self.handlers.retain(|_, entry| !entry.lease.is_owned_by(owner));
        before - self.handlers.len()
    }

    /// Send a message under a fresh id. Any id set by the caller is
    /// replaced. Returns whether it reached a waiter or a handler.
    pub fn send(&self, mut message: Message) -> bool {
        message.id = self.allocate_id();
        self.send_with_id(message)
    }

    /// Send a message whose id was already allocated by this messenger
    fn send_with_id(&self, message: Message) -> bool {
        let mut delivered = false;
        let mut consumed = false;

        if let Some(reply_to) = message.respond_to {
            if let Some((_, waiter)) = self.pending.remove(&reply_to) {
                consumed = true;
                delivered = waiter.send(message.clone()).is_ok();
            }
        }

        if !consumed {
            delivered = self.deliver(&message);
        }

        self.events.publish(LifecycleEvent::MessageSent {
            id: message.id,
            to: message.to.clone(),
            from: message.from.clone(),
            respond_to: message.respond_to,
            delivered,
            message: message.clone(),
        });

        if !delivered {
            tracing::warn!(
                id = message.id,
                to = %message.to,
                from = %message.from,
                "Message undeliverable, dropped"
            );
        }

        delivered
    }

    fn deliver(&self, message: &Message) -> bool {
        let target = message.target_module();
        let Some(entry) = self.handlers.get(&target).map(|e| e.value().clone()) else {
            return false;
        };

        if !entry.lease.is_live() {
            self.handlers.remove_if(&target, |_, current| Arc::ptr_eq(current, &entry));
            return false;
        }

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (entry.handler)(message.clone()))) {
            tracing::error!(
                module = %target,
                id = message.id,
                error = %panic_message(payload.as_ref()),
                "Message handler panicked"
            );
        }
        true
    }

    /// Send and wait for the reply. Exactly one of reply or timeout is
    /// returned, and no waiter for the message remains afterwards.
    pub async fn send_and_wait(&self, mut message: Message, timeout: Duration) -> Result<Message, MessengerError> {
        let id = self.allocate_id();
        message.id = id;

        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _slot = PendingSlot { pending: &self.pending, id };

        self.send_with_id(message);

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(MessengerError::Timeout { id, timeout }),
            Err(_) => {
                if self.pending.remove(&id).is_some() {
                    tracing::debug!(id, ?timeout, "No reply before timeout");
                    return Err(MessengerError::Timeout { id, timeout });
                }
                // A reply removed the waiter as the timer fired
                rx.await.map_err(|_| MessengerError::Timeout { id, timeout })
            }
        }
    }

    /// Reply to `original`: `to`/`from` swapped, `respond_to` set to its id
    pub fn reply(&self, original: &Message, data: rust_module_host_sdk::Payload) -> bool {
        self.send(original.reply(data))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// Removes a waiter if its `send_and_wait` future is dropped early
struct PendingSlot<'a> {
    pending: &'a DashMap<MessageId, oneshot::Sender<Message>>,
    id: MessageId,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}
