//! The reference-counted data model: addresses, table entries, tables,
//! hosts, and the root state tying them together.
//!
//! The keyed collections below are plain ordered maps rather than intrusive
//! tree nodes: tables are keyed by name, hosts by hostname, and table
//! entries by address, each in its own `BTreeMap` rather than embedded RB
//! tree links inside the entity structs. Lookup returns a handle (a
//! `&mut`/`&` borrow through the map); nothing holds a raw pointer across an
//! await point.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Which address family a resolve cycle or address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn as_u16(self) -> u16 {
        match self {
            Family::V4 => 1,
            Family::V6 => 2,
        }
    }

    pub fn from_u16(v: u16) -> Option<Family> {
        match v {
            1 => Some(Family::V4),
            2 => Some(Family::V6),
            _ => None,
        }
    }
}

/// A single address/prefix value. Comparable by family, then address bytes,
/// then prefix length — the order the co-sorted diff in `controller.rs`
/// relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Address {
    V4 { addr: Ipv4Addr, prefixlen: u8 },
    V6 { addr: Ipv6Addr, prefixlen: u8 },
}

impl Address {
    pub fn family(&self) -> Family {
        match self {
            Address::V4 { .. } => Family::V4,
            Address::V6 { .. } => Family::V6,
        }
    }

    /// Builds an address from a DNS answer, applying the default prefix
    /// length for a record with no explicit mask (32 for A, 128 for AAAA).
    pub fn from_v4(addr: Ipv4Addr) -> Address {
        Address::V4 { addr, prefixlen: 32 }
    }

    pub fn from_v6(addr: Ipv6Addr) -> Address {
        Address::V6 { addr, prefixlen: 128 }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::V4 { addr, prefixlen } => write!(f, "{addr}/{prefixlen}"),
            Address::V6 { addr, prefixlen } => write!(f, "{addr}/{prefixlen}"),
        }
    }
}

/// One address/prefix membership record inside a `Table`.
///
/// Invariant: `refcount == 0` implies `static_` — a learned entry with no
/// remaining contributor must already have been removed from its table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub address: Address,
    pub static_: bool,
    pub negate: bool,
    pub refcount: u32,
}

impl TableEntry {
    pub fn new_static(address: Address, negate: bool) -> TableEntry {
        TableEntry {
            address,
            static_: true,
            negate,
            refcount: 0,
        }
    }

    pub fn new_learned(address: Address) -> TableEntry {
        TableEntry {
            address,
            static_: false,
            negate: false,
            refcount: 1,
        }
    }

    /// `true` once this entry has no reason to keep existing in its table.
    pub fn is_orphaned(&self) -> bool {
        self.refcount == 0 && !self.static_
    }
}

/// A named set of address/prefix entries, mirrored into the kernel table of
/// the same name.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub name: String,
    pub entries: BTreeMap<Address, TableEntry>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Table {
        Table {
            name: name.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Increments the refcount of the entry for `address`, creating it
    /// (starting at 1) if this is the first contributor.
    pub fn add_ref(&mut self, address: Address) {
        self.entries
            .entry(address)
            .and_modify(|e| e.refcount += 1)
            .or_insert_with(|| TableEntry::new_learned(address));
    }

    /// Decrements the refcount of the entry for `address`. Saturates at
    /// zero and logs an inconsistency rather than underflowing if the
    /// entry was already at zero or absent. Removes the entry once it
    /// is orphaned.
    pub fn remove_ref(&mut self, address: Address) {
        let Some(entry) = self.entries.get_mut(&address) else {
            tracing::warn!(
                table = %self.name, address = %address,
                "refcount decrement for an address with no table entry; ignoring"
            );
            return;
        };

        if entry.refcount == 0 {
            tracing::warn!(
                table = %self.name, address = %address,
                "refcount underflow detected, saturating at zero"
            );
        } else {
            entry.refcount -= 1;
        }

        if entry.is_orphaned() {
            self.entries.remove(&address);
        }
    }
}

/// The per-family resolve state for one `Host`: the last-known sorted
/// address list, the consecutive-failure counter used for backoff, and
/// whether a request is currently outstanding (the single-flight rule).
#[derive(Debug, Clone, Default)]
pub struct FamilyState {
    pub addresses: Vec<Address>,
    pub tries: u32,
    pub in_flight: bool,
}

/// An operator-declared DNS name contributing addresses to zero or more
/// tables.
#[derive(Debug, Clone)]
pub struct Host {
    pub hostname: String,
    /// Names of the tables this host belongs to. Hosts never outlive the
    /// tables they reference because reload destroys hosts before tables
    /// (see `controller::reload`).
    pub tables: BTreeSet<String>,
    pub v4: FamilyState,
    pub v6: FamilyState,
}

impl Host {
    pub fn new(hostname: impl Into<String>, tables: BTreeSet<String>) -> Host {
        Host {
            hostname: hostname.into(),
            tables,
            v4: FamilyState::default(),
            v6: FamilyState::default(),
        }
    }

    pub fn family_state(&self, family: Family) -> &FamilyState {
        match family {
            Family::V4 => &self.v4,
            Family::V6 => &self.v6,
        }
    }

    pub fn family_state_mut(&mut self, family: Family) -> &mut FamilyState {
        match family {
            Family::V4 => &mut self.v4,
            Family::V6 => &mut self.v6,
        }
    }

    /// The union of this host's current v4 and v6 addresses, in the order
    /// the hints file wants them (v4 then v6).
    pub fn current_addresses(&self) -> impl Iterator<Item = &Address> {
        self.v4.addresses.iter().chain(self.v6.addresses.iter())
    }
}

/// DNSSEC enforcement level, ordered `none < log < validate < force`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DnssecLevel {
    #[default]
    None,
    Log,
    Validate,
    Force,
}

/// The in-memory root state: all tables, all hosts, and the bounds/options
/// that govern how they are resolved. Owned exclusively by the controller's
/// event loop; nothing else holds a reference to it across an await point —
/// callbacks borrow it for the duration of one event-loop iteration.
#[derive(Debug, Default)]
pub struct RootState {
    pub tables: BTreeMap<String, Table>,
    pub hosts: BTreeMap<String, Host>,
    pub min_ttl: u32,
    pub max_ttl: u32,
    pub dnssec_level: DnssecLevel,
}

impl RootState {
    /// Checks the reference invariant for every host and
    /// every table it references. Used by tests; not called on the hot
    /// path.
    #[cfg(any(test, debug_assertions))]
    pub fn check_reference_invariant(&self) -> Result<(), String> {
        use std::collections::HashMap;

        let mut expected_refcount: HashMap<(&str, Address), u32> = HashMap::new();
        for host in self.hosts.values() {
            for table_name in &host.tables {
                for addr in host.current_addresses() {
                    *expected_refcount
                        .entry((table_name.as_str(), *addr))
                        .or_insert(0) += 1;
                }
            }
        }

        for table in self.tables.values() {
            for (addr, entry) in &table.entries {
                let expected = expected_refcount
                    .get(&(table.name.as_str(), *addr))
                    .copied()
                    .unwrap_or(0);
                if entry.static_ {
                    continue;
                }
                if entry.refcount != expected {
                    return Err(format!(
                        "table {} entry {} has refcount {} but {} hosts reference it",
                        table.name, addr, entry.refcount, expected
                    ));
                }
                if entry.refcount == 0 {
                    return Err(format!(
                        "table {} has a non-static entry {} with refcount 0",
                        table.name, addr
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_add_ref_creates_entry_at_one() {
        let mut t = Table::new("bad");
        let a = Address::from_v4(Ipv4Addr::new(10, 0, 0, 1));
        t.add_ref(a);
        assert_eq!(t.entries[&a].refcount, 1);
        assert!(!t.entries[&a].static_);
    }

    #[test]
    fn table_remove_ref_drops_learned_entry_at_zero() {
        let mut t = Table::new("bad");
        let a = Address::from_v4(Ipv4Addr::new(10, 0, 0, 1));
        t.add_ref(a);
        t.add_ref(a);
        assert_eq!(t.entries[&a].refcount, 2);
        t.remove_ref(a);
        assert_eq!(t.entries[&a].refcount, 1);
        t.remove_ref(a);
        assert!(!t.entries.contains_key(&a));
    }

    #[test]
    fn static_entry_survives_refcount_zero() {
        let mut t = Table::new("t");
        let a = Address::V4 {
            addr: Ipv4Addr::new(192, 0, 2, 0),
            prefixlen: 24,
        };
        t.entries.insert(a, TableEntry::new_static(a, false));
        t.remove_ref(a);
        assert!(t.entries.contains_key(&a));
        assert_eq!(t.entries[&a].refcount, 0);
    }

    #[test]
    fn remove_ref_on_missing_entry_is_a_noop() {
        let mut t = Table::new("t");
        let a = Address::from_v4(Ipv4Addr::new(10, 0, 0, 1));
        t.remove_ref(a);
        assert!(t.entries.is_empty());
    }

    #[test]
    fn address_ordering_is_family_then_bytes_then_prefix() {
        let v4 = Address::from_v4(Ipv4Addr::new(10, 0, 0, 1));
        let v6 = Address::from_v6(Ipv6Addr::LOCALHOST);
        assert!(v4 < v6);

        let a = Address::V4 {
            addr: Ipv4Addr::new(10, 0, 0, 1),
            prefixlen: 24,
        };
        let b = Address::V4 {
            addr: Ipv4Addr::new(10, 0, 0, 1),
            prefixlen: 32,
        };
        assert!(a < b);
    }
}
