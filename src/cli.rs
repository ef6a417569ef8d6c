//! Command-line interface for the daemon binary and the control CLI.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::model::DnssecLevel;

/// `tablesyncd`: the privilege-separated daemon.
#[derive(Parser)]
#[command(name = "tablesyncd", about = "Syncs firewall address tables to DNS", version)]
pub struct DaemonArgs {
    /// Path to the configuration file.
    #[arg(short = 'f', long = "file", default_value = "/etc/tablesyncd.toml")]
    pub config_file: PathBuf,

    /// Upstream resolver, `ip:port`. May be given more than once.
    #[arg(short = 'r', long = "resolver")]
    pub resolvers: Vec<String>,

    /// Source address for outbound DNS queries.
    #[arg(short = 'i', long = "outbound-ip")]
    pub outbound_ip: Option<String>,

    /// Use DNS-over-TLS to the configured resolvers.
    #[arg(short = 'T', long = "dot")]
    pub use_dot: bool,

    /// Additional CA bundle for DNS-over-TLS.
    #[arg(short = 'C', long = "cert-bundle")]
    pub cert_bundle: Option<PathBuf>,

    /// DNSSEC enforcement level.
    #[arg(short = 'S', long = "dnssec-level", default_value = "none")]
    pub dnssec_level: CliDnssecLevel,

    /// Trust anchor file, required when --dnssec-level is validate or force.
    #[arg(short = 'A', long = "trust-anchor")]
    pub trust_anchor: Option<PathBuf>,

    /// Minimum refresh interval in seconds.
    #[arg(short = 'm', long = "min-ttl")]
    pub min_ttl: Option<u32>,

    /// Maximum refresh interval in seconds.
    #[arg(short = 'M', long = "max-ttl")]
    pub max_ttl: Option<u32>,

    /// Hints file path, overriding the configuration file's `hints_file`.
    #[arg(short = 'h', long = "hints-file")]
    pub hints_file: Option<PathBuf>,

    /// Stay in the foreground and log to stderr instead of syslog.
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Parse the configuration and exit without touching the kernel tables.
    #[arg(short = 'n', long = "no-action")]
    pub no_action: bool,

    /// Increase log verbosity (info instead of warn).
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliDnssecLevel {
    None,
    Log,
    Validate,
    Force,
}

impl From<CliDnssecLevel> for DnssecLevel {
    fn from(v: CliDnssecLevel) -> DnssecLevel {
        match v {
            CliDnssecLevel::None => DnssecLevel::None,
            CliDnssecLevel::Log => DnssecLevel::Log,
            CliDnssecLevel::Validate => DnssecLevel::Validate,
            CliDnssecLevel::Force => DnssecLevel::Force,
        }
    }
}

/// `tablesyncctl`: talks to a running daemon over its control socket.
#[derive(Parser)]
#[command(name = "tablesyncctl", about = "Control a running tablesyncd", version)]
pub struct CtlArgs {
    /// Control socket path.
    #[arg(short = 's', long = "socket", default_value = "/var/run/tablesyncd.sock")]
    pub socket: PathBuf,

    #[command(subcommand)]
    pub command: CtlCommand,
}

#[derive(Subcommand)]
pub enum CtlCommand {
    /// Change the running daemon's log level without restarting it.
    Log {
        #[arg(value_enum)]
        level: CtlLogLevel,
    },
    /// Trigger a configuration reload (equivalent to sending SIGHUP).
    Reload,
    /// Trigger a hints file write (equivalent to sending SIGUSR1).
    Hints,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CtlLogLevel {
    Warn,
    Notice,
    Info,
    Debug,
}
