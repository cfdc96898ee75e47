//! Host services as seen by one module
//!
//! [`ModuleBridge`] implements the SDK's host-service traits on behalf of a
//! single module. Callbacks registered through it are bound to the module's
//! lease and code image. The bridge only holds the image weakly: modules keep
//! their `ModuleContext`, and a strong reference here would keep their own
//! library mapped forever. For the same reason the execution context used
//! for dependency resolution is held weakly.

use std::sync::{Arc, Weak};
use std::time::Duration;

use rust_module_host_sdk::event::LifecycleEvent;
use rust_module_host_sdk::host::{
    BoxFuture, Dependency, DependencyResolver, EventCallback, EventFeed, MessageBus, MessageHandler,
    SubscriptionId,
};
use rust_module_host_sdk::{HandlerError, Message, Payload};

use super::context::{CodeImage, ExecutionContext, ImageBound};
use super::events::EventBus;
use super::lease::Lease;
use super::messenger::Messenger;
use crate::error::ContextError;

pub struct ModuleBridge {
    module: String,
    lease: Arc<Lease>,
    image: Weak<CodeImage>,
    context: Weak<ExecutionContext>,
    messenger: Arc<Messenger>,
    events: Arc<EventBus>,
}

impl ModuleBridge {
    pub fn new(
        module: &str,
        lease: Arc<Lease>,
        image: Weak<CodeImage>,
        messenger: Arc<Messenger>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            module: module.to_string(),
            lease,
            image,
            context: Weak::new(),
            messenger,
            events,
        }
    }

    /// Resolve dependencies through `context`
    pub fn with_context(mut self, context: Weak<ExecutionContext>) -> Self {
        self.context = context;
        self
    }

    /// Bind a module callback to the image, or `None` once it is gone
    fn bind<T>(&self, value: T) -> Option<ImageBound<T>> {
        match self.image.upgrade() {
            Some(image) => Some(ImageBound::new(value, image)),
            None if self.lease.owner().is_none() => Some(ImageBound::host(value)),
            None => None,
        }
    }
}

impl MessageBus for ModuleBridge {
    fn send(&self, message: Message) -> bool {
        self.messenger.send(message)
    }

    fn send_and_wait(&self, message: Message, timeout: Duration) -> BoxFuture<'static, Result<Message, HandlerError>> {
        let messenger = self.messenger.clone();
        Box::pin(async move {
            messenger
                .send_and_wait(message, timeout)
                .await
                .map_err(HandlerError::from)
        })
    }

    fn on_message(&self, handler: MessageHandler) {
        let Some(handler) = self.bind(handler) else {
            tracing::warn!(module = %self.module, "Message handler registered after unload, ignored");
            return;
        };
        self.messenger.subscribe(&self.module, self.lease.clone(), handler);
    }
}

impl EventFeed for ModuleBridge {
    fn subscribe(&self, channel: &str, callback: EventCallback) -> SubscriptionId {
        let Some(callback) = self.bind(callback) else {
            tracing::warn!(module = %self.module, channel = %channel, "Subscription after unload, ignored");
            return 0;
        };
        self.events.subscribe(channel, self.lease.clone(), callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    fn publish(&self, channel: &str, data: Payload) {
        self.events.publish(LifecycleEvent::Custom {
            channel: channel.to_string(),
            source: self.module.clone(),
            data,
        });
    }
}

impl DependencyResolver for ModuleBridge {
    fn resolve(&self, name: &str) -> Result<Arc<dyn Dependency>, HandlerError> {
        let context = self.context.upgrade().ok_or(ContextError::Unloaded)?;
        let library: Arc<dyn Dependency> = context.resolve(name).map_err(|err| {
            tracing::warn!(module = %self.module, dependency = %name, error = %err, "Dependency resolution failed");
            err
        })?;
        Ok(library)
    }
}
