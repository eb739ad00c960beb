//! Mutual exclusion between outputs in the same interlock group.
//!
//! A group entry holds a weak reference to the output currently allowed to be
//! energised. A claim goes through two steps: `try_reserve` before the hardware
//! write (so two outputs racing for a free group cannot both pass the gate) and
//! `confirm` after the write succeeds. Only confirmed claims are reported by
//! [InterlockRegistry::holder].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{error, warn};
use serde::Deserialize;

/// Identity an output presents to the registry. Dropping it frees any group it held.
#[derive(Debug)]
pub struct InterlockToken {
    output_id: i64,
    name: String,
}

impl InterlockToken {
    pub fn new(output_id: i64, name: &str) -> Arc<Self> {
        Arc::new(Self {
            output_id,
            name: name.to_owned(),
        })
    }

    pub fn output_id(&self) -> i64 {
        self.output_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// What to do with a group that did not fit in the table.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Unregistered groups never block.
    #[default]
    FailOpen,
    /// Unregistered groups never allow an output ON.
    FailClosed,
}

#[derive(Debug)]
enum Claim {
    Free,
    Pending(Weak<InterlockToken>),
    Active(Weak<InterlockToken>),
}

impl Claim {
    fn holder(&self) -> Option<Arc<InterlockToken>> {
        match self {
            Claim::Free => None,
            Claim::Pending(weak) | Claim::Active(weak) => weak.upgrade(),
        }
    }

    fn is_held_by(&self, token: &Arc<InterlockToken>) -> bool {
        self.holder().is_some_and(|holder| Arc::ptr_eq(&holder, token))
    }
}

pub struct InterlockRegistry {
    max_groups: usize,
    overflow: OverflowPolicy,
    groups: Mutex<HashMap<u32, Claim>>,
}

impl InterlockRegistry {
    pub fn new(max_groups: usize, overflow: OverflowPolicy) -> Self {
        Self {
            max_groups,
            overflow,
            groups: Mutex::new(HashMap::new()),
        }
    }

    fn groups(&self) -> MutexGuard<'_, HashMap<u32, Claim>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make room for `group`. Returns false (and logs) when the table is full.
    pub fn register(&self, group: u32) -> bool {
        let mut groups = self.groups();
        if groups.contains_key(&group) {
            return true;
        }
        if groups.len() >= self.max_groups {
            error!(
                "Interlock table full ({} groups); group {} is unregistered and will {}",
                self.max_groups,
                group,
                match self.overflow {
                    OverflowPolicy::FailOpen => "never block",
                    OverflowPolicy::FailClosed => "block every output",
                }
            );
            return false;
        }
        groups.insert(group, Claim::Free);
        true
    }

    pub fn is_registered(&self, group: u32) -> bool {
        self.groups().contains_key(&group)
    }

    /// True if `group` is unclaimed or already claimed by `requester`.
    pub fn is_available(&self, group: u32, requester: &Arc<InterlockToken>) -> bool {
        match self.groups().get(&group) {
            None => self.overflow == OverflowPolicy::FailOpen,
            Some(claim) => match claim.holder() {
                None => true,
                Some(holder) => Arc::ptr_eq(&holder, requester),
            },
        }
    }

    /// Check availability and, if available, hold the group for `requester`
    /// until [confirm](Self::confirm) or [abandon](Self::abandon).
    pub fn try_reserve(&self, group: u32, requester: &Arc<InterlockToken>) -> bool {
        let mut groups = self.groups();
        let Some(claim) = groups.get_mut(&group) else {
            return self.overflow == OverflowPolicy::FailOpen;
        };
        match claim.holder() {
            Some(holder) if Arc::ptr_eq(&holder, requester) => true,
            Some(_) => false,
            None => {
                *claim = Claim::Pending(Arc::downgrade(requester));
                true
            }
        }
    }

    /// The hardware is now ON: publish the claim.
    pub fn confirm(&self, group: u32, requester: &Arc<InterlockToken>) {
        let mut groups = self.groups();
        if let Some(claim) = groups.get_mut(&group) {
            if claim.is_held_by(requester) {
                *claim = Claim::Active(Arc::downgrade(requester));
            } else if claim.holder().is_some() {
                warn!(
                    "Interlock group {}: {} confirmed a claim it does not hold",
                    group,
                    requester.name()
                );
            }
        }
    }

    /// Drop a reservation that never reached the hardware.
    pub fn abandon(&self, group: u32, requester: &Arc<InterlockToken>) {
        let mut groups = self.groups();
        if let Some(claim) = groups.get_mut(&group) {
            if matches!(claim, Claim::Pending(_)) && claim.is_held_by(requester) {
                *claim = Claim::Free;
            }
        }
    }

    /// Release `group` if `requester` holds it.
    pub fn release(&self, group: u32, requester: &Arc<InterlockToken>) {
        let mut groups = self.groups();
        if let Some(claim) = groups.get_mut(&group) {
            if claim.is_held_by(requester) {
                *claim = Claim::Free;
            }
        }
    }

    /// Output whose ON state is confirmed for `group`.
    pub fn holder(&self, group: u32) -> Option<Arc<InterlockToken>> {
        match self.groups().get(&group) {
            Some(Claim::Active(weak)) => weak.upgrade(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_holder_per_group() {
        let registry = InterlockRegistry::new(4, OverflowPolicy::FailOpen);
        let a = InterlockToken::new(1, "A");
        let b = InterlockToken::new(2, "B");
        assert!(registry.register(1));

        assert!(registry.try_reserve(1, &a));
        assert!(registry.holder(1).is_none());
        registry.confirm(1, &a);
        assert_eq!(registry.holder(1).unwrap().output_id(), 1);

        assert!(!registry.is_available(1, &b));
        assert!(!registry.try_reserve(1, &b));
        assert!(registry.is_available(1, &a));
        assert!(registry.try_reserve(1, &a));

        registry.release(1, &b);
        assert!(registry.holder(1).is_some());
        registry.release(1, &a);
        assert!(registry.try_reserve(1, &b));
    }

    #[test]
    fn pending_reservation_blocks_others() {
        let registry = InterlockRegistry::new(4, OverflowPolicy::FailOpen);
        let a = InterlockToken::new(1, "A");
        let b = InterlockToken::new(2, "B");
        registry.register(7);

        assert!(registry.try_reserve(7, &a));
        assert!(!registry.try_reserve(7, &b));
        registry.abandon(7, &a);
        assert!(registry.try_reserve(7, &b));
    }

    #[test]
    fn dropped_holder_frees_group() {
        let registry = InterlockRegistry::new(4, OverflowPolicy::FailOpen);
        let b = InterlockToken::new(2, "B");
        registry.register(3);
        {
            let a = InterlockToken::new(1, "A");
            assert!(registry.try_reserve(3, &a));
            registry.confirm(3, &a);
            assert!(!registry.is_available(3, &b));
        }
        assert!(registry.is_available(3, &b));
        assert!(registry.holder(3).is_none());
    }

    #[test_log::test]
    fn overflow_follows_policy() {
        let token = InterlockToken::new(1, "A");

        let open = InterlockRegistry::new(1, OverflowPolicy::FailOpen);
        assert!(open.register(1));
        assert!(!open.register(2));
        assert!(!open.is_registered(2));
        assert!(open.is_available(2, &token));
        assert!(open.try_reserve(2, &token));

        let closed = InterlockRegistry::new(1, OverflowPolicy::FailClosed);
        assert!(closed.register(1));
        assert!(!closed.register(2));
        assert!(!closed.is_available(2, &token));
        assert!(!closed.try_reserve(2, &token));
    }
}
