//! Lifecycle events published by the host

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::message::{Message, MessageId};
use crate::payload::Payload;

/// Channel names used by the host's event bus
pub mod channels {
    /// Receives every event regardless of its own channel
    pub const GLOBAL: &str = "*";
    pub const MODULE_LOADED: &str = "module.loaded";
    pub const MODULE_UNLOADED: &str = "module.unloaded";
    pub const MODULE_RELOADED: &str = "module.reloaded";
    pub const MESSAGE_SENT: &str = "message.sent";
    pub const REQUEST_RECEIVED: &str = "request.received";
}

/// An event on the host's lifecycle feed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ModuleLoaded {
        name: String,
        path: PathBuf,
    },

    ModuleUnloaded {
        name: String,
    },

    /// Published after the `ModuleLoaded` event of a reload
    ModuleReloaded {
        name: String,
        path: PathBuf,
    },

    /// Published for every message, whether or not it was delivered
    MessageSent {
        id: MessageId,
        to: String,
        from: String,
        respond_to: Option<MessageId>,
        delivered: bool,
        message: Message,
    },

    RequestReceived {
        request_id: String,
        method: String,
        path: String,
        /// Module the path resolved to, if any
        module: Option<String>,
        cors_passed: bool,
        origin_passed: bool,
        headers_passed: bool,
    },

    /// Event published by a module on a channel of its own choosing
    Custom {
        channel: String,
        source: String,
        data: Payload,
    },
}

impl LifecycleEvent {
    /// The named channel this event is dispatched on (before the global one)
    pub fn channel(&self) -> &str {
        match self {
            LifecycleEvent::ModuleLoaded { .. } => channels::MODULE_LOADED,
            LifecycleEvent::ModuleUnloaded { .. } => channels::MODULE_UNLOADED,
            LifecycleEvent::ModuleReloaded { .. } => channels::MODULE_RELOADED,
            LifecycleEvent::MessageSent { .. } => channels::MESSAGE_SENT,
            LifecycleEvent::RequestReceived { .. } => channels::REQUEST_RECEIVED,
            LifecycleEvent::Custom { channel, .. } => channel,
        }
    }

    /// Module the event is about, where there is one
    pub fn module_name(&self) -> Option<&str> {
        match self {
            LifecycleEvent::ModuleLoaded { name, .. }
            | LifecycleEvent::ModuleUnloaded { name }
            | LifecycleEvent::ModuleReloaded { name, .. } => Some(name),
            LifecycleEvent::RequestReceived { module, .. } => module.as_deref(),
            LifecycleEvent::Custom { source, .. } => Some(source),
            LifecycleEvent::MessageSent { .. } => None,
        }
    }
}
