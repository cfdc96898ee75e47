//! Host services available to a module
//!
//! The host implements these traits and hands each module a [`ModuleContext`]
//! bound to that module. Everything a module registers through its context
//! (message handler, event callbacks) is tied to the module's lifetime by the
//! host and dropped when the module unloads.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::ffi::c_void;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::HandlerError;
use crate::event::LifecycleEvent;
use crate::message::Message;
use crate::payload::Payload;

/// Type alias for boxed futures crossing the host/module boundary
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback invoked for each message addressed to a module
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Callback invoked for each event on a subscribed channel
pub type EventCallback = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Identifies an event subscription
pub type SubscriptionId = u64;

/// Default `send_and_wait` timeout
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Inter-module messaging
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget send. Returns whether the message reached a handler
    /// or a waiter; an undeliverable message is never an error.
    fn send(&self, message: Message) -> bool;

    /// Send and wait for the reply, failing with [`HandlerError::Timeout`]
    fn send_and_wait(&self, message: Message, timeout: Duration) -> BoxFuture<'static, Result<Message, HandlerError>>;

    /// Register the module's message handler, replacing any previous one
    fn on_message(&self, handler: MessageHandler);
}

/// Subscription side of the lifecycle event feed
pub trait EventFeed: Send + Sync {
    /// Subscribe to a named channel, or to [`crate::event::channels::GLOBAL`]
    fn subscribe(&self, channel: &str, callback: EventCallback) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Publish a [`LifecycleEvent::Custom`] event on `channel`
    fn publish(&self, channel: &str, data: Payload);
}

/// A shared library resolved through a module's dependency scope.
///
/// The library stays loaded while any handle to it exists.
pub trait Dependency: Send + Sync {
    fn name(&self) -> &str;

    /// File the library was opened from
    fn path(&self) -> &Path;

    /// Address of an exported symbol, `None` if it is not exported.
    /// Casting it to the symbol's real type is up to the caller.
    fn symbol(&self, symbol: &str) -> Option<*const c_void>;
}

/// Resolves dependency libraries for one module: its cache first, then its
/// private dependency directory, then default platform resolution.
pub trait DependencyResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<Arc<dyn Dependency>, HandlerError>;
}

/// Key-value persistence by collection and id
pub trait KeyValueStore: Send + Sync {
    fn get(&self, collection: &str, id: &str) -> Result<Option<JsonValue>, HandlerError>;

    fn get_all(&self, collection: &str) -> Result<Vec<(String, JsonValue)>, HandlerError>;

    /// Insert or replace
    fn set(&self, collection: &str, id: &str, value: JsonValue) -> Result<(), HandlerError>;

    /// Returns whether a record was removed
    fn delete(&self, collection: &str, id: &str) -> Result<bool, HandlerError>;

    fn exists(&self, collection: &str, id: &str) -> Result<bool, HandlerError>;
}

impl dyn KeyValueStore + '_ {
    /// Get a record deserialized into `T`
    pub fn get_as<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>, HandlerError> {
        match self.get(collection, id)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Store a serializable record
    pub fn set_as<T: Serialize>(&self, collection: &str, id: &str, value: &T) -> Result<(), HandlerError> {
        self.set(collection, id, serde_json::to_value(value)?)
    }
}

/// Per-client session data with sliding expiry
pub trait SessionStore: Send + Sync {
    /// Read a key; refreshes the session's expiry. Expired sessions read as empty.
    fn get(&self, session_id: &str, key: &str) -> Result<Option<JsonValue>, HandlerError>;

    /// Write a key, creating the session if needed
    fn set(&self, session_id: &str, key: &str, value: JsonValue) -> Result<(), HandlerError>;

    fn remove(&self, session_id: &str, key: &str) -> Result<(), HandlerError>;

    /// Whether the session exists and has not expired
    fn exists(&self, session_id: &str) -> Result<bool, HandlerError>;

    fn refresh(&self, session_id: &str) -> Result<(), HandlerError>;

    fn remove_session(&self, session_id: &str) -> Result<(), HandlerError>;
}

/// Context handed to a module by the host
///
/// Cheap to clone. Route handlers receive a clone for every request.
#[derive(Clone)]
pub struct ModuleContext {
    module_name: Arc<str>,
    messages: Arc<dyn MessageBus>,
    events: Arc<dyn EventFeed>,
    dependencies: Option<Arc<dyn DependencyResolver>>,
    storage: Option<Arc<dyn KeyValueStore>>,
    sessions: Option<Arc<dyn SessionStore>>,
    reply_timeout: Duration,
}

impl ModuleContext {
    pub fn new(module_name: &str, messages: Arc<dyn MessageBus>, events: Arc<dyn EventFeed>) -> Self {
        Self {
            module_name: Arc::from(module_name),
            messages,
            events,
            dependencies: None,
            storage: None,
            sessions: None,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    /// A context not attached to any host: sends are dropped, waits fail,
    /// subscriptions are never called. Useful for testing modules in isolation.
    pub fn detached(module_name: &str) -> Self {
        let host = Arc::new(DetachedHost);
        Self::new(module_name, host.clone(), host)
    }

    pub fn with_dependencies(mut self, dependencies: Arc<dyn DependencyResolver>) -> Self {
        self.dependencies = Some(dependencies);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn KeyValueStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Name the host registered this module under
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Send `data` to `to`, from this module
    pub fn send(&self, to: &str, data: Payload) -> bool {
        self.messages.send(Message::new(to, self.module_name(), data))
    }

    pub fn send_message(&self, message: Message) -> bool {
        self.messages.send(message)
    }

    /// Send `data` to `to` and wait for the reply using the default timeout
    pub fn request(&self, to: &str, data: Payload) -> BoxFuture<'static, Result<Message, HandlerError>> {
        self.messages
            .send_and_wait(Message::new(to, self.module_name(), data), self.reply_timeout)
    }

    pub fn send_and_wait(&self, message: Message, timeout: Duration) -> BoxFuture<'static, Result<Message, HandlerError>> {
        self.messages.send_and_wait(message, timeout)
    }

    /// Reply to a received message
    pub fn reply(&self, original: &Message, data: Payload) -> bool {
        self.messages.send(original.reply(data))
    }

    /// Register this module's message handler
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.messages.on_message(Arc::new(handler));
    }

    pub fn subscribe<F>(&self, channel: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(channel, Arc::new(callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Publish a custom event on `channel`
    pub fn publish(&self, channel: &str, data: Payload) {
        self.events.publish(channel, data);
    }

    /// Resolve a shared library through this module's dependency scope
    pub fn dependency(&self, name: &str) -> Result<Arc<dyn Dependency>, HandlerError> {
        self.dependencies
            .as_ref()
            .ok_or_else(|| HandlerError::ServiceUnavailable("dependencies".into()))?
            .resolve(name)
    }

    pub fn storage(&self) -> Result<&dyn KeyValueStore, HandlerError> {
        self.storage
            .as_deref()
            .ok_or_else(|| HandlerError::ServiceUnavailable("storage".into()))
    }

    pub fn sessions(&self) -> Result<&dyn SessionStore, HandlerError> {
        self.sessions
            .as_deref()
            .ok_or_else(|| HandlerError::ServiceUnavailable("sessions".into()))
    }
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("module_name", &self.module_name)
            .field("dependencies", &self.dependencies.is_some())
            .field("storage", &self.storage.is_some())
            .field("sessions", &self.sessions.is_some())
            .field("reply_timeout", &self.reply_timeout)
            .finish()
    }
}

struct DetachedHost;

impl MessageBus for DetachedHost {
    fn send(&self, _message: Message) -> bool {
        false
    }

    fn send_and_wait(&self, _message: Message, _timeout: Duration) -> BoxFuture<'static, Result<Message, HandlerError>> {
        Box::pin(async { Err(HandlerError::ServiceUnavailable("messaging".into())) })
    }

    fn on_message(&self, _handler: MessageHandler) {}
}

impl EventFeed for DetachedHost {
    fn subscribe(&self, _channel: &str, _callback: EventCallback) -> SubscriptionId {
        0
    }

    fn unsubscribe(&self, _id: SubscriptionId) -> bool {
        false
    }

    fn publish(&self, _channel: &str, _data: Payload) {}
}
