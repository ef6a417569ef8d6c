//! The hints file writer: a best-effort human-readable dump of
//! the current in-memory state, refreshed on `SIGHUP`/`SIGUSR1` and at
//! shutdown.
//!
//! The format is one `<table>:` heading per table, then one
//! `- <hostname>: addr, addr` line per host that references it (v4
//! addresses before v6), then a blank line between tables.

use std::io::Write;
use std::path::Path;

use crate::model::RootState;

/// Writes the hints file to `path`, in table order, host order (both the
/// `BTreeMap` iteration order).
///
/// Failures are logged and swallowed: the hints file is informational
/// only and must never affect the controller's own state.
pub fn write_hints_file(state: &RootState, path: &Path) {
    if let Err(e) = write_hints_file_inner(state, path) {
        tracing::error!(path = %path.display(), error = %e, "failed to write hints file");
    }
}

fn write_hints_file_inner(state: &RootState, path: &Path) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp_path)?;

    for table in state.tables.values() {
        writeln!(file, "{}:", table.name)?;

        for host in state.hosts.values() {
            if !host.tables.contains(&table.name) {
                continue;
            }

            write!(file, "- {}:", host.hostname)?;
            let mut first = true;
            for addr in host.current_addresses() {
                if first {
                    write!(file, " {addr}")?;
                    first = false;
                } else {
                    write!(file, ", {addr}")?;
                }
            }
            writeln!(file)?;
        }

        writeln!(file)?;
    }

    file.flush()?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Address, Host, Table};
    use std::collections::BTreeSet;
    use std::net::Ipv4Addr;

    #[test]
    fn writes_expected_layout() {
        let mut state = RootState::default();
        state.tables.insert("web".into(), Table::new("web"));

        let mut host = Host::new("a.test", BTreeSet::from(["web".to_string()]));
        host.v4.addresses = vec![Address::from_v4(Ipv4Addr::new(10, 0, 0, 1))];
        state.hosts.insert(host.hostname.clone(), host);

        let dir = std::env::temp_dir().join(format!("tablesyncd-hints-test-{}", std::process::id()));
        let path = dir.with_extension("hints");
        write_hints_file(&state, &path);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "web:\n- a.test: 10.0.0.1/32\n\n");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn host_with_no_addresses_gets_bare_line() {
        let mut state = RootState::default();
        state.tables.insert("web".into(), Table::new("web"));
        state
            .hosts
            .insert("a.test".into(), Host::new("a.test", BTreeSet::from(["web".to_string()])));

        let dir = std::env::temp_dir().join(format!("tablesyncd-hints-test2-{}", std::process::id()));
        let path = dir.with_extension("hints");
        write_hints_file(&state, &path);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "web:\n- a.test:\n\n");
        let _ = std::fs::remove_file(&path);
    }
}
