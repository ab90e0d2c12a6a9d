//! Local address cache fed by a [`Watcher`](crate::Watcher).
//!
//! On a watcher error keep the set as it is: an error means discovery is
//! temporarily unavailable, not that every instance left.

use crate::watcher::{MembershipUpdate, Operation};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    addresses: BTreeSet<String>,
}

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch in order. Returns true if the set changed.
    pub fn apply(&mut self, updates: &[MembershipUpdate]) -> bool {
        let mut changed = false;
        for update in updates {
            changed |= match update.op {
                Operation::Add => self.addresses.insert(update.address.clone()),
                Operation::Remove => self.addresses.remove(&update.address),
            };
        }
        changed
    }

    pub fn contains(&self, address: &str) -> bool {
        self.addresses.contains(address)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Sorted copy of the current addresses.
    pub fn snapshot(&self) -> Vec<String> {
        self.addresses.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_in_order() {
        let mut set = AddressSet::new();
        assert!(set.apply(&[
            MembershipUpdate::add("10.0.0.2:80"),
            MembershipUpdate::add("10.0.0.1:80"),
            MembershipUpdate::remove("10.0.0.2:80"),
        ]));
        assert_eq!(set.snapshot(), vec!["10.0.0.1:80".to_string()]);
    }

    #[test]
    fn test_duplicate_add_is_not_a_change() {
        let mut set = AddressSet::new();
        set.apply(&[MembershipUpdate::add("10.0.0.1:80")]);
        // Lease-attached refresh re-puts the same key
        assert!(!set.apply(&[MembershipUpdate::add("10.0.0.1:80")]));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut set = AddressSet::new();
        assert!(!set.apply(&[MembershipUpdate::remove("10.0.0.9:80")]));
        assert!(set.is_empty());
    }
}
