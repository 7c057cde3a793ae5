//! Per-process leases on the single running slot of each (owner, group).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::TimerError;
use crate::types::KindGroup;

type SlotKey = (String, KindGroup);

/// Shared table of held slots. Clones see the same table.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    slots: Arc<Mutex<HashMap<SlotKey, String>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `holder` (a session id). Fails if anyone, the same
    /// holder included, already holds it.
    pub fn claim(&self, owner: &str, group: KindGroup, holder: &str) -> Result<SessionLease, TimerError> {
        let key = (owner.to_string(), group);
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| TimerError::GroupBusy { group })?;
        if let Some(current) = slots.get(&key) {
            debug!(owner, %group, holder = %current, "slot already held");
            return Err(TimerError::GroupBusy { group });
        }
        slots.insert(key.clone(), holder.to_string());
        Ok(SessionLease {
            slots: Arc::clone(&self.slots),
            key,
            holder: holder.to_string(),
        })
    }

    pub fn holder(&self, owner: &str, group: KindGroup) -> Option<String> {
        self.slots
            .lock()
            .ok()
            .and_then(|slots| slots.get(&(owner.to_string(), group)).cloned())
    }
}

/// Held slot; released on drop.
#[derive(Debug)]
pub struct SessionLease {
    slots: Arc<Mutex<HashMap<SlotKey, String>>>,
    key: SlotKey,
    holder: String,
}

impl SessionLease {
    pub fn group(&self) -> KindGroup {
        self.key.1
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Ok(mut slots) = self.slots.lock() {
            if slots.get(&self.key) == Some(&self.holder) {
                slots.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_in_group_is_rejected() {
        let registry = SessionRegistry::new();
        let _lease = registry.claim("alice", KindGroup::Pomodoro, "s1").unwrap();
        assert_eq!(
            registry.claim("alice", KindGroup::Pomodoro, "s2").unwrap_err(),
            TimerError::GroupBusy {
                group: KindGroup::Pomodoro
            }
        );
        assert_eq!(
            registry.holder("alice", KindGroup::Pomodoro).as_deref(),
            Some("s1")
        );
    }

    #[test]
    fn test_groups_and_owners_are_independent() {
        let registry = SessionRegistry::new();
        let _a = registry.claim("alice", KindGroup::Pomodoro, "s1").unwrap();
        let _b = registry.claim("alice", KindGroup::Leisure, "l1").unwrap();
        let _c = registry.claim("bob", KindGroup::Pomodoro, "s2").unwrap();
    }

    #[test]
    fn test_drop_releases_slot() {
        let registry = SessionRegistry::new();
        let lease = registry.claim("alice", KindGroup::Study, "s1").unwrap();
        assert_eq!(lease.group(), KindGroup::Study);
        drop(lease);
        assert!(registry.holder("alice", KindGroup::Study).is_none());
        assert!(registry.claim("alice", KindGroup::Study, "s2").is_ok());
    }

    #[test]
    fn test_clones_share_slots() {
        let registry = SessionRegistry::new();
        let other = registry.clone();
        let _lease = registry.claim("alice", KindGroup::Leisure, "l1").unwrap();
        assert!(other.claim("alice", KindGroup::Leisure, "l2").is_err());
    }
}
