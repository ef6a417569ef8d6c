//! The kernel table administrative interface, narrowed to a trait
//! so the reconciliation engine in `controller.rs` can be exercised against
//! a `MockKernelTable` instead of a real `/dev/pf` device.
//!
//! `replace` corresponds to the `DIOCRSETADDRS` ioctl, `clear` to
//! `DIOCRCLRADDRS`, `create` to `DIOCRADDTABLES`. The
//! create-on-missing-then-retry-once behavior is lifted out into
//! `push_table` below so it applies uniformly to every backend rather
//! than being duplicated in each `impl KernelTableAdmin`.

use crate::error::PfError;
use crate::model::Table;

/// Maximum table name length the kernel interface accepts (`PF_TABLE_NAME_SIZE`).
pub const MAX_TABLE_NAME_LEN: usize = 32;

/// One entry as the kernel table interface wants it: family is implied by
/// the address, so only family, address bytes, prefix length, and a
/// negate flag are carried across the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PfEntry {
    pub address: crate::model::Address,
    pub negate: bool,
}

impl From<&crate::model::TableEntry> for PfEntry {
    fn from(e: &crate::model::TableEntry) -> PfEntry {
        PfEntry {
            address: e.address,
            negate: e.negate,
        }
    }
}

/// The administrative operations the kernel table interface exposes.
pub trait KernelTableAdmin: Send {
    /// Atomically replaces the full entry set of `table_name` with `entries`.
    fn replace(&mut self, table_name: &str, entries: &[PfEntry]) -> Result<(), PfError>;

    /// Clears all entries of `table_name`, leaving the table itself in place.
    fn clear(&mut self, table_name: &str) -> Result<(), PfError>;

    /// Creates `table_name` if it does not already exist.
    fn create(&mut self, table_name: &str) -> Result<(), PfError>;

    /// Test hook: gives tests holding a `Box<dyn KernelTableAdmin>` a way
    /// to inspect the call log of the `MockKernelTable` underneath, without
    /// requiring a full downcast machinery for a single backend.
    #[cfg(test)]
    fn as_mock(&mut self) -> Option<&mut MockKernelTable> {
        None
    }
}

fn check_name(table_name: &str) -> Result<(), PfError> {
    if table_name.len() >= MAX_TABLE_NAME_LEN {
        return Err(PfError::NameTooLong(table_name.to_string()));
    }
    Ok(())
}

/// Pushes the current entry set of `table` to `admin`, creating the table
/// and retrying exactly once if the kernel reports it does not exist.
/// Any other failure is left for the caller to log; in-memory
/// state is never rolled back — the next successful push converges.
pub fn push_table(admin: &mut dyn KernelTableAdmin, table: &Table) -> Result<(), PfError> {
    check_name(&table.name)?;
    let entries: Vec<PfEntry> = table.entries.values().map(PfEntry::from).collect();

    match admin.replace(&table.name, &entries) {
        Ok(()) => Ok(()),
        Err(PfError::NoSuchTable(_)) => {
            tracing::warn!(table = %table.name, "pf table does not exist, creating it");
            admin.create(&table.name)?;
            admin.replace(&table.name, &entries)
        }
        Err(e) => Err(e),
    }
}

/// Clears every table named in `table_names`, used at shutdown and at the
/// start of reload so stale learned entries never persist across a
/// configuration change.
pub fn clear_all(admin: &mut dyn KernelTableAdmin, table_names: impl IntoIterator<Item = impl AsRef<str>>) {
    for name in table_names {
        let name = name.as_ref();
        if let Err(e) = admin.clear(name) {
            tracing::warn!(table = name, error = %e, "failed to clear pf table");
        }
    }
}

/// An in-memory stand-in for the kernel table interface, used by
/// `controller.rs`'s own tests and by any non-OpenBSD build where the real
/// `/dev/pf` device is unavailable.
#[derive(Debug, Default)]
pub struct MockKernelTable {
    pub tables: std::collections::BTreeMap<String, Vec<PfEntry>>,
    pub replace_calls: Vec<(String, Vec<PfEntry>)>,
    pub clear_calls: Vec<String>,
    pub create_calls: Vec<String>,
}

impl KernelTableAdmin for MockKernelTable {
    fn replace(&mut self, table_name: &str, entries: &[PfEntry]) -> Result<(), PfError> {
        check_name(table_name)?;
        self.replace_calls
            .push((table_name.to_string(), entries.to_vec()));
        if !self.tables.contains_key(table_name) {
            return Err(PfError::NoSuchTable(table_name.to_string()));
        }
        self.tables.insert(table_name.to_string(), entries.to_vec());
        Ok(())
    }

    fn clear(&mut self, table_name: &str) -> Result<(), PfError> {
        check_name(table_name)?;
        self.clear_calls.push(table_name.to_string());
        self.tables.insert(table_name.to_string(), Vec::new());
        Ok(())
    }

    fn create(&mut self, table_name: &str) -> Result<(), PfError> {
        check_name(table_name)?;
        self.create_calls.push(table_name.to_string());
        self.tables.entry(table_name.to_string()).or_default();
        Ok(())
    }

    #[cfg(test)]
    fn as_mock(&mut self) -> Option<&mut MockKernelTable> {
        Some(self)
    }
}

/// The real kernel table interface, built on `ioctl(2)` calls against
/// `/dev/pf` exactly as `pftable.c` does (`DIOCRSETADDRS`, `DIOCRCLRADDRS`,
/// `DIOCRADDTABLES`). Only meaningful on OpenBSD, which is the only
/// operating system that exposes this device.
#[cfg(target_os = "openbsd")]
pub mod openbsd {
    use super::*;
    use std::os::unix::io::RawFd;

    // These constants and the `pfioc_table`/`pfr_addr`/`pfr_table` layouts
    // mirror <net/pfvar.h>; nix's ioctl macros generate the `ioctl(2)`
    // wrappers from them.
    const PFR_TFLAG_PERSIST: u32 = 0x0000_0001;

    #[repr(C)]
    struct PfrTable {
        pfrt_anchor: [u8; 1024],
        pfrt_name: [u8; MAX_TABLE_NAME_LEN],
        pfrt_flags: u32,
        pfrt_fback: u8,
    }

    #[repr(C)]
    struct PfrAddr {
        pfra_u: [u8; 16],
        pfra_ifname: [u8; 16],
        pfra_states: u32,
        pfra_weight: u16,
        pfra_af: u8,
        pfra_net: u8,
        pfra_not: u8,
        pfra_fback: u8,
        pfra_type: u8,
        pfra_pad: [u8; 3],
    }

    #[repr(C)]
    struct PfiocTable {
        pfrio_table: PfrTable,
        pfrio_buffer: *mut std::ffi::c_void,
        pfrio_esize: i32,
        pfrio_size: i32,
        pfrio_size2: i32,
        pfrio_nadd: i32,
        pfrio_ndel: i32,
        pfrio_nchange: i32,
        pfrio_flags: i32,
        pfrio_ticket: u32,
    }

    nix::ioctl_readwrite!(diocr_set_addrs, b'D', 67, PfiocTable);
    nix::ioctl_readwrite!(diocr_clr_addrs, b'D', 65, PfiocTable);
    nix::ioctl_readwrite!(diocr_add_tables, b'D', 60, PfiocTable);

    fn table_name(name: &str) -> Result<[u8; MAX_TABLE_NAME_LEN], PfError> {
        check_name(name)?;
        let mut buf = [0u8; MAX_TABLE_NAME_LEN];
        buf[..name.len()].copy_from_slice(name.as_bytes());
        Ok(buf)
    }

    fn pfr_table(name: &str) -> Result<PfrTable, PfError> {
        Ok(PfrTable {
            pfrt_anchor: [0; 1024],
            pfrt_name: table_name(name)?,
            pfrt_flags: PFR_TFLAG_PERSIST,
            pfrt_fback: 0,
        })
    }

    fn pfr_addr(entry: &PfEntry) -> PfrAddr {
        let mut pfra_u = [0u8; 16];
        let af = match entry.address {
            crate::model::Address::V4 { addr, .. } => {
                pfra_u[..4].copy_from_slice(&addr.octets());
                libc_af_inet()
            }
            crate::model::Address::V6 { addr, .. } => {
                pfra_u.copy_from_slice(&addr.octets());
                libc_af_inet6()
            }
        };
        let net = match entry.address {
            crate::model::Address::V4 { prefixlen, .. } => prefixlen,
            crate::model::Address::V6 { prefixlen, .. } => prefixlen,
        };
        PfrAddr {
            pfra_u,
            pfra_ifname: [0; 16],
            pfra_states: 0,
            pfra_weight: 0,
            pfra_af: af,
            pfra_net: net,
            pfra_not: entry.negate as u8,
            pfra_fback: 0,
            pfra_type: 0,
            pfra_pad: [0; 3],
        }
    }

    fn libc_af_inet() -> u8 {
        2 // AF_INET
    }

    fn libc_af_inet6() -> u8 {
        24 // AF_INET6 on OpenBSD
    }

    /// A live `KernelTableAdmin` backed by an open `/dev/pf` descriptor.
    pub struct PfDevice {
        fd: RawFd,
    }

    impl PfDevice {
        pub fn open() -> std::io::Result<PfDevice> {
            use std::os::unix::io::IntoRawFd;
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/pf")?;
            Ok(PfDevice {
                fd: file.into_raw_fd(),
            })
        }
    }

    impl KernelTableAdmin for PfDevice {
        fn replace(&mut self, table_name: &str, entries: &[PfEntry]) -> Result<(), PfError> {
            let mut buffer: Vec<PfrAddr> = entries.iter().map(pfr_addr).collect();
            let mut io = PfiocTable {
                pfrio_table: pfr_table(table_name)?,
                pfrio_buffer: buffer.as_mut_ptr().cast(),
                pfrio_esize: std::mem::size_of::<PfrAddr>() as i32,
                pfrio_size: buffer.len() as i32,
                pfrio_size2: 0,
                pfrio_nadd: 0,
                pfrio_ndel: 0,
                pfrio_nchange: 0,
                pfrio_flags: 0,
                pfrio_ticket: 0,
            };

            let res = unsafe { diocr_set_addrs(self.fd, &mut io) };
            match res {
                Ok(_) => Ok(()),
                Err(nix::errno::Errno::ESRCH) => Err(PfError::NoSuchTable(table_name.to_string())),
                Err(e) => Err(PfError::Ioctl(std::io::Error::from(e))),
            }
        }

        fn clear(&mut self, table_name: &str) -> Result<(), PfError> {
            let mut io = PfiocTable {
                pfrio_table: pfr_table(table_name)?,
                pfrio_buffer: std::ptr::null_mut(),
                pfrio_esize: std::mem::size_of::<PfrAddr>() as i32,
                pfrio_size: 0,
                pfrio_size2: 0,
                pfrio_nadd: 0,
                pfrio_ndel: 0,
                pfrio_nchange: 0,
                pfrio_flags: 0,
                pfrio_ticket: 0,
            };
            unsafe { diocr_clr_addrs(self.fd, &mut io) }
                .map(|_| ())
                .map_err(|e| PfError::Ioctl(std::io::Error::from(e)))
        }

        fn create(&mut self, table_name: &str) -> Result<(), PfError> {
            let mut table = pfr_table(table_name)?;
            let mut io = PfiocTable {
                pfrio_table: pfr_table(table_name)?,
                pfrio_buffer: (&mut table as *mut PfrTable).cast(),
                pfrio_esize: std::mem::size_of::<PfrTable>() as i32,
                pfrio_size: 1,
                pfrio_size2: 0,
                pfrio_nadd: 0,
                pfrio_ndel: 0,
                pfrio_nchange: 0,
                pfrio_flags: 0,
                pfrio_ticket: 0,
            };
            unsafe { diocr_add_tables(self.fd, &mut io) }
                .map(|_| ())
                .map_err(|e| PfError::Ioctl(std::io::Error::from(e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Address, Table, TableEntry};
    use std::net::Ipv4Addr;

    #[test]
    fn push_table_creates_missing_table_and_retries_once() {
        let mut admin = MockKernelTable::default();
        let mut table = Table::new("bad");
        let addr = Address::from_v4(Ipv4Addr::new(10, 0, 0, 1));
        table.entries.insert(addr, TableEntry::new_learned(addr));

        push_table(&mut admin, &table).expect("push should succeed after create");

        assert_eq!(admin.create_calls, vec!["bad".to_string()]);
        assert_eq!(admin.replace_calls.len(), 2);
        assert_eq!(admin.tables["bad"].len(), 1);
    }

    #[test]
    fn push_table_rejects_over_long_names() {
        let mut admin = MockKernelTable::default();
        let table = Table::new("a".repeat(40));
        let err = push_table(&mut admin, &table).unwrap_err();
        assert!(matches!(err, PfError::NameTooLong(_)));
    }

    #[test]
    fn clear_all_clears_every_named_table() {
        let mut admin = MockKernelTable::default();
        admin.tables.insert("t1".into(), vec![]);
        admin.tables.insert("t2".into(), vec![]);
        clear_all(&mut admin, ["t1", "t2"]);
        assert_eq!(admin.clear_calls, vec!["t1".to_string(), "t2".to_string()]);
    }
}
