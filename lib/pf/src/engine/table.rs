// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Address tables.
//!
//! A table is a named set of prefixes referenced by rules and pools.
//! Lookups pick the longest matching prefix; a negated entry that
//! wins the lookup excludes the address. Tables are shared between
//! rules and can grow while rules are active (overload tables), so
//! the entries sit behind a lock.

use crate::ddi::sync::KRwLock;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use pf_api::Af;
use pf_api::PfAddr;
use pf_api::PfCidr;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TableEntry {
    pub cidr: PfCidr,
    pub neg: bool,
}

#[derive(Debug)]
pub struct AddrTable {
    name: String,
    entries: KRwLock<Vec<TableEntry>>,
    matches: AtomicU64,
    misses: AtomicU64,
}

impl AddrTable {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            entries: KRwLock::new(Vec::new()),
            matches: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_entries<I>(name: &str, cidrs: I) -> Self
    where
        I: IntoIterator<Item = PfCidr>,
    {
        let tbl = Self::new(name);
        for cidr in cidrs {
            tbl.insert(cidr);
        }
        tbl
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn entries(&self) -> Vec<TableEntry> {
        self.entries.read().clone()
    }

    /// Add a prefix. Returns false if it was already present.
    pub fn insert(&self, cidr: PfCidr) -> bool {
        self.insert_entry(TableEntry { cidr, neg: false })
    }

    /// Add a negated prefix, excluding the addresses it covers from
    /// any shorter prefix.
    pub fn insert_negated(&self, cidr: PfCidr) -> bool {
        self.insert_entry(TableEntry { cidr, neg: true })
    }

    fn insert_entry(&self, entry: TableEntry) -> bool {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.cidr == entry.cidr) {
            return false;
        }
        entries.push(entry);
        true
    }

    pub fn remove(&self, cidr: &PfCidr) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.cidr != *cidr);
        entries.len() != before
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Is `addr` in the table?
    pub fn contains(&self, af: Af, addr: PfAddr) -> bool {
        let hit = self
            .entries
            .read()
            .iter()
            .filter(|e| e.cidr.contains(af, addr))
            .max_by_key(|e| e.cidr.prefix_len())
            .is_some_and(|e| !e.neg);
        let ctr = if hit { &self.matches } else { &self.misses };
        ctr.fetch_add(1, Ordering::Relaxed);
        hit
    }

    /// The (matches, misses) lookup counters.
    pub fn stats(&self) -> (u64, u64) {
        let matches = self.matches.load(Ordering::Relaxed);
        (matches, self.misses.load(Ordering::Relaxed))
    }

    /// Step a round-robin pool cursor through the table's
    /// non-negated prefixes of family `af`.
    ///
    /// `idx` is the entry the cursor is in and `counter` the next
    /// address to hand out. If the counter is still inside entry
    /// `idx` it is used as is; otherwise the walk moves on to the
    /// next usable entry, starting the counter at its first address.
    /// Returns the (idx, address) to use, or `None` once the walk has
    /// passed the last usable entry.
    pub fn pool_get(
        &self,
        af: Af,
        idx: Option<usize>,
        counter: PfAddr,
    ) -> Option<(usize, PfAddr)> {
        let entries = self.entries.read();
        let usable = |e: &TableEntry| !e.neg && e.cidr.af == af;

        if let Some(i) = idx {
            if let Some(e) = entries.get(i) {
                if usable(e) && e.cidr.contains(af, counter) {
                    return Some((i, counter));
                }
            }
        }

        let start = idx.map(|i| i + 1).unwrap_or(0);
        (start..entries.len())
            .find(|&i| usable(&entries[i]))
            .map(|i| (i, entries[i].cidr.addr))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(s: &str) -> PfAddr {
        PfAddr::from_ip(s.parse().unwrap()).1
    }

    #[test]
    fn longest_prefix_with_negation() {
        let t = AddrTable::with_entries("t", ["10.0.0.0/8".parse().unwrap()]);
        t.insert_negated("10.1.0.0/16".parse().unwrap());
        t.insert("10.1.2.3".parse().unwrap());

        assert!(t.contains(Af::Inet, addr("10.9.9.9")));
        assert!(!t.contains(Af::Inet, addr("10.1.9.9")));
        assert!(t.contains(Af::Inet, addr("10.1.2.3")));
        assert!(!t.contains(Af::Inet, addr("11.0.0.1")));
        assert_eq!(t.stats(), (2, 2));
    }

    #[test]
    fn duplicate_insert() {
        let t = AddrTable::new("overload");
        assert!(t.insert("192.0.2.1".parse().unwrap()));
        assert!(!t.insert("192.0.2.1".parse().unwrap()));
        assert_eq!(t.len(), 1);
        assert!(t.remove(&"192.0.2.1".parse().unwrap()));
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn pool_walks_entries_of_family() {
        let t = AddrTable::with_entries(
            "pool",
            [
                "192.0.2.0/31".parse().unwrap(),
                "fd00::/127".parse().unwrap(),
                "198.51.100.7".parse().unwrap(),
            ],
        );
        let (i, a) = t.pool_get(Af::Inet, None, PfAddr::ANY).unwrap();
        assert_eq!((i, a), (0, addr("192.0.2.0")));
        let (i, a) = t.pool_get(Af::Inet, Some(i), a.inc(Af::Inet)).unwrap();
        assert_eq!((i, a), (0, addr("192.0.2.1")));
        // Past the end of the first entry: skip the v6 entry.
        let (i, a) = t.pool_get(Af::Inet, Some(i), a.inc(Af::Inet)).unwrap();
        assert_eq!((i, a), (2, addr("198.51.100.7")));
        // The walk ends after the last entry.
        assert!(t.pool_get(Af::Inet, Some(i), a.inc(Af::Inet)).is_none());

        let empty = AddrTable::new("e");
        assert!(empty.pool_get(Af::Inet, None, PfAddr::ANY).is_none());
    }
}
