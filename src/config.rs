//! Configuration file parsing: TOML via `serde` + `toml`, producing
//! the initial table/host graph the controller loads into a `RootState`.
//!
//! Validation follows a bounded-length, early-return posture on untrusted
//! strings, generalized from domain-name syntax to table-name and
//! hostname syntax.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use crate::model::{Address, DnssecLevel, Host, RootState, Table, TableEntry};
use crate::pftable::MAX_TABLE_NAME_LEN;

const MAX_HOSTNAME_LEN: usize = 255;
const DEFAULT_MIN_TTL: u32 = 10;
const DEFAULT_MAX_TTL: u32 = 86400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("table name {0:?} exceeds {MAX_TABLE_NAME_LEN} bytes")]
    TableNameTooLong(String),

    #[error("duplicate table name {0:?}")]
    DuplicateTable(String),

    #[error("hostname {0:?} exceeds {MAX_HOSTNAME_LEN} bytes")]
    HostnameTooLong(String),

    #[error("malformed static entry {0:?}: {1}")]
    MalformedStaticEntry(String, String),
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_min_ttl")]
    min_ttl: u32,
    #[serde(default = "default_max_ttl")]
    max_ttl: u32,
    hints_file: Option<PathBuf>,
    #[serde(default)]
    resolvers: Vec<String>,
    outbound_ip: Option<IpAddr>,
    #[serde(default)]
    use_dot: bool,
    cert_bundle: Option<PathBuf>,
    #[serde(default)]
    dnssec_level: RawDnssecLevel,
    trust_anchor: Option<PathBuf>,
    #[serde(default, rename = "table")]
    tables: Vec<RawTable>,
    #[serde(default = "default_unprivileged_user")]
    unprivileged_user: String,
    #[serde(default = "default_chroot_dir")]
    chroot_dir: PathBuf,
    control_socket: Option<PathBuf>,
}

fn default_unprivileged_user() -> String {
    "_tablesyncd".to_string()
}

fn default_chroot_dir() -> PathBuf {
    PathBuf::from("/var/empty")
}

fn default_min_ttl() -> u32 {
    DEFAULT_MIN_TTL
}

fn default_max_ttl() -> u32 {
    DEFAULT_MAX_TTL
}

#[derive(Debug, Default, Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum RawDnssecLevel {
    #[default]
    None,
    Log,
    Validate,
    Force,
}

impl From<RawDnssecLevel> for DnssecLevel {
    fn from(v: RawDnssecLevel) -> DnssecLevel {
        match v {
            RawDnssecLevel::None => DnssecLevel::None,
            RawDnssecLevel::Log => DnssecLevel::Log,
            RawDnssecLevel::Validate => DnssecLevel::Validate,
            RawDnssecLevel::Force => DnssecLevel::Force,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTable {
    name: String,
    #[serde(default)]
    static_entries: Vec<String>,
    #[serde(default)]
    hosts: Vec<String>,
}

/// Everything the resolver worker needs to configure the stub resolver,
/// parsed alongside the table/host graph.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub resolvers: Vec<String>,
    pub outbound_ip: Option<IpAddr>,
    pub use_dot: bool,
    pub cert_bundle: Option<PathBuf>,
    pub dnssec_level: DnssecLevel,
    pub trust_anchor: Option<PathBuf>,
}

/// The fully parsed configuration: a `RootState` ready for the controller
/// plus the resolver options and hints file path that live outside it.
#[derive(Debug)]
pub struct Config {
    pub state: RootState,
    pub resolver: ResolverConfig,
    pub hints_file: Option<PathBuf>,
    pub unprivileged_user: String,
    pub chroot_dir: PathBuf,
    pub control_socket: Option<PathBuf>,
}

fn validate_table_name(name: &str) -> Result<(), ConfigError> {
    if name.len() >= MAX_TABLE_NAME_LEN {
        return Err(ConfigError::TableNameTooLong(name.to_string()));
    }
    Ok(())
}

fn validate_hostname(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.len() > MAX_HOSTNAME_LEN {
        return Err(ConfigError::HostnameTooLong(name.to_string()));
    }
    Ok(())
}

/// Parses `address/prefixlen`, with an optional leading `!` for negation,
/// into a static `TableEntry`.
fn parse_static_entry(raw: &str) -> Result<TableEntry, ConfigError> {
    let (negate, rest) = match raw.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };

    let (addr_part, prefix_part) = rest.split_once('/').ok_or_else(|| {
        ConfigError::MalformedStaticEntry(raw.to_string(), "missing /prefixlen".into())
    })?;

    let prefixlen: u8 = prefix_part
        .parse()
        .map_err(|_| ConfigError::MalformedStaticEntry(raw.to_string(), "bad prefixlen".into()))?;

    let address = if let Ok(v4) = addr_part.parse::<std::net::Ipv4Addr>() {
        if prefixlen > 32 {
            return Err(ConfigError::MalformedStaticEntry(
                raw.to_string(),
                "v4 prefixlen out of range".into(),
            ));
        }
        Address::V4 { addr: v4, prefixlen }
    } else if let Ok(v6) = addr_part.parse::<std::net::Ipv6Addr>() {
        if prefixlen > 128 {
            return Err(ConfigError::MalformedStaticEntry(
                raw.to_string(),
                "v6 prefixlen out of range".into(),
            ));
        }
        Address::V6 { addr: v6, prefixlen }
    } else {
        return Err(ConfigError::MalformedStaticEntry(
            raw.to_string(),
            "unparseable address".into(),
        ));
    };

    Ok(TableEntry::new_static(address, negate))
}

/// Loads and validates a configuration file. A parse error here is fatal at
/// startup and non-fatal (logged, prior state kept) at reload — the caller
/// decides which.
pub fn load(path: &std::path::Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: RawConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut state = RootState {
        min_ttl: raw.min_ttl,
        max_ttl: raw.max_ttl,
        dnssec_level: raw.dnssec_level.into(),
        ..RootState::default()
    };

    for raw_table in &raw.tables {
        validate_table_name(&raw_table.name)?;
        if state.tables.contains_key(&raw_table.name) {
            return Err(ConfigError::DuplicateTable(raw_table.name.clone()));
        }

        let mut table = Table::new(raw_table.name.clone());
        for raw_entry in &raw_table.static_entries {
            let entry = parse_static_entry(raw_entry)?;
            table.entries.insert(entry.address, entry);
        }
        state.tables.insert(raw_table.name.clone(), table);

        for hostname in &raw_table.hosts {
            validate_hostname(hostname)?;
            state
                .hosts
                .entry(hostname.clone())
                .and_modify(|h| {
                    h.tables.insert(raw_table.name.clone());
                })
                .or_insert_with(|| {
                    Host::new(hostname.clone(), BTreeSet::from([raw_table.name.clone()]))
                });
        }
    }

    Ok(Config {
        state,
        resolver: ResolverConfig {
            resolvers: raw.resolvers,
            outbound_ip: raw.outbound_ip,
            use_dot: raw.use_dot,
            cert_bundle: raw.cert_bundle,
            dnssec_level: raw.dnssec_level.into(),
            trust_anchor: raw.trust_anchor,
        },
        hints_file: raw.hints_file,
        unprivileged_user: raw.unprivileged_user,
        chroot_dir: raw.chroot_dir,
        control_socket: raw.control_socket,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "tablesyncd-config-test-{}-{:?}.toml",
            std::process::id(),
            std::thread::current().id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn parses_tables_hosts_and_static_entries() {
        let path = write_temp(
            r#"
            min_ttl = 30
            max_ttl = 600
            resolvers = ["9.9.9.9:53"]

            [[table]]
            name = "web"
            static_entries = ["192.0.2.0/24", "!203.0.113.5/32"]
            hosts = ["a.test", "b.test"]
            "#,
        );

        let cfg = load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(cfg.state.min_ttl, 30);
        assert_eq!(cfg.state.max_ttl, 600);
        let table = &cfg.state.tables["web"];
        assert_eq!(table.entries.len(), 2);
        assert_eq!(cfg.state.hosts.len(), 2);
        assert!(cfg.state.hosts["a.test"].tables.contains("web"));
    }

    #[test]
    fn rejects_duplicate_table_names() {
        let path = write_temp(
            r#"
            [[table]]
            name = "web"
            [[table]]
            name = "web"
            "#,
        );
        let err = load(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(err, ConfigError::DuplicateTable(_)));
    }

    #[test]
    fn rejects_malformed_static_entry() {
        let path = write_temp(
            r#"
            [[table]]
            name = "web"
            static_entries = ["not-an-address"]
            "#,
        );
        let err = load(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(err, ConfigError::MalformedStaticEntry(_, _)));
    }

    #[test]
    fn rejects_over_long_table_name() {
        let path = write_temp(&format!(
            "[[table]]\nname = \"{}\"\n",
            "a".repeat(MAX_TABLE_NAME_LEN + 1)
        ));
        let err = load(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(err, ConfigError::TableNameTooLong(_)));
    }

    #[test]
    fn host_shared_across_tables_gets_both_table_refs() {
        let path = write_temp(
            r#"
            [[table]]
            name = "web"
            hosts = ["shared.test"]
            [[table]]
            name = "mail"
            hosts = ["shared.test"]
            "#,
        );
        let cfg = load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        let host = &cfg.state.hosts["shared.test"];
        assert_eq!(host.tables.len(), 2);
    }
}
