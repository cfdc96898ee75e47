//! Revocable tokens tying callbacks to the execution context that owns their code

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Unique id of an execution context
pub type ContextId = u64;

/// Liveness token for everything a module registers with the host.
///
/// The registry revokes a module's lease at the start of unload; the message
/// and event dispatchers check [`Lease::is_live`] before every invocation.
/// Host-owned leases have no owner and cannot be revoked.
#[derive(Debug)]
pub struct Lease {
    owner: Option<ContextId>,
    revoked: AtomicBool,
}

impl Lease {
    pub fn new(owner: ContextId) -> Arc<Self> {
        Arc::new(Self {
            owner: Some(owner),
            revoked: AtomicBool::new(false),
        })
    }

    /// A lease that never expires, for host subscriptions
    pub fn host() -> Arc<Self> {
        Arc::new(Self {
            owner: None,
            revoked: AtomicBool::new(false),
        })
    }

    pub fn owner(&self) -> Option<ContextId> {
        self.owner
    }

    pub fn is_owned_by(&self, id: ContextId) -> bool {
        self.owner == Some(id)
    }

    pub fn is_live(&self) -> bool {
        !self.revoked.load(Ordering::Acquire)
    }

    /// Returns true if this call revoked the lease
    pub fn revoke(&self) -> bool {
        if self.owner.is_none() {
            return false;
        }
        !self.revoked.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revoke_once() {
        let lease = Lease::new(3);
        assert!(lease.is_live());
        assert!(lease.is_owned_by(3));
        assert!(lease.revoke());
        assert!(!lease.revoke());
        assert!(!lease.is_live());
    }

    #[test]
    fn test_host_lease_never_expires() {
        let lease = Lease::host();
        assert!(!lease.revoke());
        assert!(lease.is_live());
        assert_eq!(lease.owner(), None);
    }
}
