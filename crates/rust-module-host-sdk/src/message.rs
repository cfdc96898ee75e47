//! Inter-module messages

use serde::{Deserialize, Serialize};

use crate::payload::Payload;

/// Message identifier. Assigned by the host on every send; any value set by
/// the sender is overwritten.
pub type MessageId = u64;

/// A message addressed from one module to another.
///
/// `to` is hierarchical: the first `.`-separated segment names the target
/// module, the remainder is interpreted by that module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: MessageId,

    pub to: String,

    pub from: String,

    #[serde(default)]
    pub data: Payload,

    /// Id of the message this one answers
    #[serde(default)]
    pub respond_to: Option<MessageId>,
}

impl Message {
    /// Create a new outbound message.
    ///
    /// # Example
    /// ```ignore
    /// let msg = Message::new("billing.invoice", "shop", Payload::new().with("order", 42));
    /// ```
    pub fn new(to: impl Into<String>, from: impl Into<String>, data: Payload) -> Self {
        Self {
            id: 0,
            to: to.into(),
            from: from.into(),
            data,
            respond_to: None,
        }
    }

    /// Name of the module this message is addressed to (lowercase)
    pub fn target_module(&self) -> String {
        self.to.split('.').next().unwrap_or_default().to_lowercase()
    }

    /// Address part after the module name, if any
    pub fn subpath(&self) -> Option<&str> {
        self.to.split_once('.').map(|(_, rest)| rest)
    }

    /// Build the reply to this message: `to` and `from` swapped and
    /// `respond_to` pointing at this message's id.
    pub fn reply(&self, data: Payload) -> Message {
        Message {
            id: 0,
            to: self.from.clone(),
            from: self.to.clone(),
            data,
            respond_to: Some(self.id),
        }
    }

    pub fn is_reply(&self) -> bool {
        self.respond_to.is_some()
    }
}
