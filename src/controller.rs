//! The controller event loop: owns the entire data
//! model, the per-host refresh timers, the kernel-table push path and the
//! hints file writer, and drives the resolver worker over the message
//! link.
//!
//! The address diff follows a co-sorted linear merge over sorted
//! addresses rather than a hash-set difference, and the refcount
//! bookkeeping walks owned `BTreeMap` entries rather than RB-tree
//! pointers. Signal dispatch matches on HUP/USR1/PIPE/INT/TERM/CHLD, and
//! the event loop itself is an `anyhow::Result`-returning `run` function
//! taking ownership of the controller and its link.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::signal::unix::{signal, SignalKind};

use crate::config::{self, Config};
use crate::message::{self, Message, ResolveFail, ResolveOk, ResolveReq};
use crate::model::{Address, DnssecLevel, Family, Host, RootState, Table};
use crate::pftable::{self, KernelTableAdmin};
use crate::scheduler::{self, Scheduler};

/// Initial per-host timer delay at startup/reload, giving the worker time
/// to finish its warm-up query.
pub const STARTUP_DELAY: Duration = Duration::from_secs(2);

pub struct Controller {
    state: RootState,
    scheduler: Scheduler,
    pf: Box<dyn KernelTableAdmin>,
    hints_file: Option<PathBuf>,
    conffile: PathBuf,
}

impl Controller {
    pub fn new(conffile: PathBuf, config: Config, pf: Box<dyn KernelTableAdmin>) -> Controller {
        let mut controller = Controller {
            state: config.state,
            scheduler: Scheduler::new(),
            pf,
            hints_file: config.hints_file,
            conffile,
        };
        controller.push_all_tables();
        controller.arm_all_timers(STARTUP_DELAY);
        controller
    }

    pub fn dnssec_level(&self) -> DnssecLevel {
        self.state.dnssec_level
    }

    fn arm_all_timers(&mut self, delay: Duration) {
        let hostnames: Vec<String> = self.state.hosts.keys().cloned().collect();
        for hostname in hostnames {
            self.scheduler.arm(hostname.clone(), Family::V4, delay);
            self.scheduler.arm(hostname, Family::V6, delay);
        }
    }

    fn push_all_tables(&mut self) {
        let names: Vec<String> = self.state.tables.keys().cloned().collect();
        for name in names {
            self.push_table(&name);
        }
    }

    fn push_table(&mut self, name: &str) {
        let Some(table) = self.state.tables.get(name) else {
            return;
        };
        if let Err(e) = pftable::push_table(self.pf.as_mut(), table) {
            tracing::warn!(table = name, error = %e, "failed to push table to the kernel");
        }
    }

    fn clear_table(&mut self, name: &str) {
        if let Err(e) = self.pf.clear(name) {
            tracing::warn!(table = name, error = %e, "failed to clear table in the kernel");
        }
    }

    /// Sorts `new` and walks it against `old` (already sorted) in lockstep,
    /// returning `(removed, added, new)` — the set-difference in both
    /// directions, plus the sorted full new list the caller must store in
    /// place of `old` — without allocating a set.
    pub fn diff_addresses(
        old: &[Address],
        mut new: Vec<Address>,
    ) -> (Vec<Address>, Vec<Address>, Vec<Address>) {
        new.sort();
        let mut removed = Vec::new();
        let mut added = Vec::new();

        let (mut i, mut j) = (0, 0);
        while i < old.len() || j < new.len() {
            match (old.get(i), new.get(j)) {
                (Some(a), Some(b)) if a == b => {
                    i += 1;
                    j += 1;
                }
                (Some(a), Some(b)) if a < b => {
                    removed.push(*a);
                    i += 1;
                }
                (Some(_), Some(b)) => {
                    added.push(*b);
                    j += 1;
                }
                (Some(a), None) => {
                    removed.push(*a);
                    i += 1;
                }
                (None, Some(b)) => {
                    added.push(*b);
                    j += 1;
                }
                (None, None) => unreachable!(),
            }
        }

        (removed, added, new)
    }

    /// Applies a successful resolve: diffs addresses, updates refcounts
    /// across every table the host belongs to, pushes dirtied tables, and
    /// re-arms the timer from the answer's TTL.
    pub fn handle_resolve_ok(&mut self, ok: ResolveOk) {
        let min_ttl = self.state.min_ttl;
        let max_ttl = self.state.max_ttl;

        let Some(host) = self.state.hosts.get_mut(&ok.hostname) else {
            tracing::warn!(hostname = %ok.hostname, "resolve result for unknown host, dropping");
            return;
        };

        let fs = host.family_state_mut(ok.family);
        if !fs.in_flight {
            tracing::warn!(hostname = %ok.hostname, "resolve result with no in-flight request, dropping");
        }
        fs.in_flight = false;
        fs.tries = 0;

        let (removed, added, new_addrs) = Self::diff_addresses(&fs.addresses, ok.addrs);
        fs.addresses = new_addrs;
        let table_names: Vec<String> = host.tables.iter().cloned().collect();

        let mut dirty = BTreeSet::new();
        for table_name in &table_names {
            if let Some(table) = self.state.tables.get_mut(table_name) {
                for addr in &removed {
                    table.remove_ref(*addr);
                    dirty.insert(table_name.clone());
                }
                for addr in &added {
                    table.add_ref(*addr);
                    dirty.insert(table_name.clone());
                }
            }
        }

        for table_name in &dirty {
            self.push_table(table_name);
        }

        let interval = scheduler::success_interval(ok.ttl, min_ttl, max_ttl);
        self.scheduler
            .arm(ok.hostname, ok.family, Duration::from_secs(interval));
    }

    /// Applies a failed resolve: bumps the failure counter, logs, and
    /// re-arms with exponential backoff. The stored address list (and
    /// therefore table membership) is left untouched.
    pub fn handle_resolve_fail(&mut self, fail: ResolveFail) {
        let Some(host) = self.state.hosts.get_mut(&fail.hostname) else {
            tracing::warn!(hostname = %fail.hostname, "resolve failure for unknown host, dropping");
            return;
        };

        let fs = host.family_state_mut(fail.family);
        fs.in_flight = false;
        let interval = scheduler::failure_interval(fs.tries);
        fs.tries = fs.tries.saturating_add(1);
        tracing::warn!(
            hostname = %fail.hostname, family = ?fail.family, tries = fs.tries,
            "resolve failed, backing off {interval}s"
        );

        self.scheduler
            .arm(fail.hostname, fail.family, Duration::from_secs(interval));
    }

    /// Pops every timer that is currently due and returns the resolve
    /// requests the worker should be sent, marking each (host, family) as
    /// in-flight so a duplicate fire before the response arrives is a
    /// no-op re-arm rather than a second concurrent query.
    pub fn drain_due_requests(&mut self) -> Vec<ResolveReq> {
        let mut reqs = Vec::new();
        while let Some((hostname, family)) = self.scheduler.pop_due() {
            let Some(host) = self.state.hosts.get_mut(&hostname) else {
                continue;
            };
            let fs = host.family_state_mut(family);
            if fs.in_flight {
                continue;
            }
            fs.in_flight = true;
            reqs.push(ResolveReq { family, hostname });
        }
        reqs
    }

    /// Reload: tear down every Host and Table, re-parse the
    /// configuration file, re-push all tables, re-arm all timers, and
    /// write the hints file. A parse failure leaves the controller with an
    /// empty data model rather than exiting — the caller
    /// is expected to log loudly since this is an operator-visible
    /// regression, not a silent no-op.
    pub fn reload(&mut self) {
        let table_names: Vec<String> = self.state.tables.keys().cloned().collect();
        for name in &table_names {
            self.clear_table(name);
        }
        self.state.hosts.clear();
        self.state.tables.clear();

        match config::load(&self.conffile) {
            Ok(cfg) => {
                self.state = cfg.state;
                self.hints_file = cfg.hints_file;
            }
            Err(e) => {
                tracing::error!(error = %e, "reload: failed to parse configuration, running with an empty table set");
            }
        }

        self.push_all_tables();
        self.arm_all_timers(STARTUP_DELAY);
        self.write_hints();
    }

    pub fn write_hints(&self) {
        if let Some(path) = &self.hints_file {
            crate::hints::write_hints_file(&self.state, path);
        } else {
            tracing::debug!("no hints file configured, skipping");
        }
    }

    #[cfg(any(test, debug_assertions))]
    pub fn check_invariant(&self) -> Result<(), String> {
        self.state.check_reference_invariant()
    }

    #[cfg(test)]
    pub fn state(&self) -> &RootState {
        &self.state
    }

    #[cfg(test)]
    pub fn host_mut(&mut self, hostname: &str) -> Option<&mut Host> {
        self.state.hosts.get_mut(hostname)
    }

    #[cfg(test)]
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.state.tables.get(name)
    }

    #[cfg(test)]
    pub fn pf_mut(&mut self) -> &mut dyn KernelTableAdmin {
        self.pf.as_mut()
    }
}

/// Runs the controller's single-threaded cooperative event loop over
/// `link` (the worker-link half owned by this process) until shutdown.
/// Driven by: the scheduler's next due timer, frames arriving from the
/// worker, and HUP/USR1/PIPE/INT/TERM/CHLD.
pub async fn run<S>(
    controller: &mut Controller,
    mut link: S,
    control: Option<&tokio::net::UnixListener>,
    log_handle: Option<&crate::logging::ReloadHandle>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut sig_hup = signal(SignalKind::hangup()).context("registering SIGHUP handler")?;
    let mut sig_usr1 = signal(SignalKind::user_defined1()).context("registering SIGUSR1 handler")?;
    let mut sig_pipe = signal(SignalKind::pipe()).context("registering SIGPIPE handler")?;
    let mut sig_int = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    let mut sig_term = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sig_chld = signal(SignalKind::child()).context("registering SIGCHLD handler")?;

    loop {
        for req in controller.drain_due_requests() {
            message::write_frame(&mut link, &Message::ResolveReq(req))
                .await
                .context("writing resolve request to worker")?;
        }

        let sleep_dur = controller
            .scheduler
            .next_fire()
            .map(|at| at.saturating_duration_since(tokio::time::Instant::now()))
            .unwrap_or(Duration::from_secs(3600));

        tokio::select! {
            _ = tokio::time::sleep(sleep_dur) => {}

            frame = message::read_frame(&mut link) => {
                match frame.context("reading frame from worker")? {
                    Some(Message::ResolveOk(ok)) => controller.handle_resolve_ok(ok),
                    Some(Message::ResolveFail(fail)) => controller.handle_resolve_fail(fail),
                    Some(Message::ResolveReq(_)) => {
                        anyhow::bail!("worker sent a ResolveReq, which only the controller may send");
                    }
                    None => {
                        controller.write_hints();
                        anyhow::bail!("worker closed the message link");
                    }
                }
            }

            _ = sig_hup.recv() => {
                tracing::info!("SIGHUP received, reloading configuration");
                controller.reload();
            }

            _ = sig_usr1.recv() => {
                tracing::info!("SIGUSR1 received, writing hints file");
                controller.write_hints();
            }

            _ = sig_pipe.recv() => {
                tracing::info!("ignoring SIGPIPE");
            }

            _ = sig_int.recv() => {
                tracing::info!("SIGINT received, shutting down");
                controller.write_hints();
                return Ok(());
            }

            _ = sig_term.recv() => {
                tracing::info!("SIGTERM received, shutting down");
                controller.write_hints();
                return Ok(());
            }

            _ = sig_chld.recv() => {
                anyhow::bail!("worker process exited");
            }

            accepted = async {
                match control {
                    Some(listener) => crate::controlsock::accept_one(listener).await,
                    None => std::future::pending().await,
                }
            } => {
                if let Some((cmd, mut stream)) = accepted.context("handling control connection")? {
                    use crate::controlsock::ControlCommand;
                    match cmd {
                        ControlCommand::Reload => controller.reload(),
                        ControlCommand::Hints => controller.write_hints(),
                        ControlCommand::Log(level) => {
                            if let Some(handle) = log_handle {
                                if let Err(e) = crate::logging::set_level(handle, level) {
                                    tracing::warn!(error = %e, "failed to change log level");
                                }
                            }
                        }
                    }
                    crate::controlsock::reply_ok(&mut stream).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DnssecLevel, TableEntry};
    use crate::pftable::MockKernelTable;
    use std::net::Ipv4Addr;

    fn test_config() -> Config {
        let mut state = RootState {
            min_ttl: 10,
            max_ttl: 3600,
            dnssec_level: DnssecLevel::None,
            ..RootState::default()
        };
        state.tables.insert("web".into(), Table::new("web"));
        state.hosts.insert(
            "a.test".into(),
            Host::new("a.test", BTreeSet::from(["web".to_string()])),
        );
        Config {
            state,
            resolver: crate::config::ResolverConfig {
                resolvers: vec![],
                outbound_ip: None,
                use_dot: false,
                cert_bundle: None,
                dnssec_level: DnssecLevel::None,
                trust_anchor: None,
            },
            hints_file: None,
            unprivileged_user: "_tablesyncd".into(),
            chroot_dir: PathBuf::from("/var/empty"),
            control_socket: None,
        }
    }

    fn new_controller() -> Controller {
        Controller::new(
            PathBuf::from("/nonexistent.toml"),
            test_config(),
            Box::new(MockKernelTable::default()),
        )
    }

    #[test]
    fn diff_addresses_splits_added_and_removed() {
        let old = vec![
            Address::from_v4(Ipv4Addr::new(10, 0, 0, 1)),
            Address::from_v4(Ipv4Addr::new(10, 0, 0, 2)),
        ];
        let new = vec![
            Address::from_v4(Ipv4Addr::new(10, 0, 0, 2)),
            Address::from_v4(Ipv4Addr::new(10, 0, 0, 3)),
        ];
        let (removed, added, new_sorted) = Controller::diff_addresses(&old, new);
        assert_eq!(removed, vec![Address::from_v4(Ipv4Addr::new(10, 0, 0, 1))]);
        assert_eq!(added, vec![Address::from_v4(Ipv4Addr::new(10, 0, 0, 3))]);
        assert_eq!(
            new_sorted,
            vec![
                Address::from_v4(Ipv4Addr::new(10, 0, 0, 2)),
                Address::from_v4(Ipv4Addr::new(10, 0, 0, 3)),
            ]
        );
    }

    #[test]
    fn new_host_gains_two_addresses_s1() {
        let mut c = new_controller();
        let addrs = vec![
            Address::from_v4(Ipv4Addr::new(192, 0, 2, 1)),
            Address::from_v4(Ipv4Addr::new(192, 0, 2, 2)),
        ];
        c.handle_resolve_ok(ResolveOk {
            family: Family::V4,
            hostname: "a.test".into(),
            ttl: 60,
            addrs,
        });

        let table = c.table("web").unwrap();
        assert_eq!(table.entries.len(), 2);
        for entry in table.entries.values() {
            assert_eq!(entry.refcount, 1);
        }
        c.check_invariant().unwrap();
    }

    /// A stable answer resolved more than once must not be treated as
    /// newly added every time: `fs.addresses` has to hold the full
    /// current list, not just the added-since-last-time subset, or the
    /// same address gets `add_ref`'d again on every repeat resolve.
    #[test]
    fn stable_address_resolved_repeatedly_keeps_refcount_at_one() {
        let mut c = new_controller();
        let addr = Address::from_v4(Ipv4Addr::new(192, 0, 2, 7));
        for _ in 0..3 {
            c.handle_resolve_ok(ResolveOk {
                family: Family::V4,
                hostname: "a.test".into(),
                ttl: 60,
                addrs: vec![addr],
            });
        }

        assert_eq!(c.table("web").unwrap().entries[&addr].refcount, 1);
        assert_eq!(c.state().hosts["a.test"].v4.addresses, vec![addr]);
        c.check_invariant().unwrap();
    }

    /// `[A, B] -> [A, C]` must keep `A` in the stored address list (it
    /// never left), drop `B`, and gain `C`, rather than collapsing the
    /// stored list down to just the newly-added `C`.
    #[test]
    fn partial_overlap_update_keeps_unchanged_address() {
        let mut c = new_controller();
        let a = Address::from_v4(Ipv4Addr::new(192, 0, 2, 1));
        let b = Address::from_v4(Ipv4Addr::new(192, 0, 2, 2));
        let new_addr = Address::from_v4(Ipv4Addr::new(192, 0, 2, 3));

        c.handle_resolve_ok(ResolveOk {
            family: Family::V4,
            hostname: "a.test".into(),
            ttl: 60,
            addrs: vec![a, b],
        });
        c.handle_resolve_ok(ResolveOk {
            family: Family::V4,
            hostname: "a.test".into(),
            ttl: 60,
            addrs: vec![a, new_addr],
        });

        assert_eq!(c.state().hosts["a.test"].v4.addresses, vec![a, new_addr]);
        let table = c.table("web").unwrap();
        assert!(!table.entries.contains_key(&b));
        assert_eq!(table.entries[&a].refcount, 1);
        assert_eq!(table.entries[&new_addr].refcount, 1);
        c.check_invariant().unwrap();
    }

    #[test]
    fn shared_address_across_two_hosts_then_one_nxdomains_s2() {
        let mut c = new_controller();
        c.host_mut("a.test")
            .unwrap()
            .tables
            .insert("web".to_string());
        c.state_mut_for_test()
            .hosts
            .insert("b.test".into(), Host::new("b.test", BTreeSet::from(["web".to_string()])));

        let shared = Address::from_v4(Ipv4Addr::new(192, 0, 2, 9));
        c.handle_resolve_ok(ResolveOk {
            family: Family::V4,
            hostname: "a.test".into(),
            ttl: 60,
            addrs: vec![shared],
        });
        c.handle_resolve_ok(ResolveOk {
            family: Family::V4,
            hostname: "b.test".into(),
            ttl: 60,
            addrs: vec![shared],
        });
        assert_eq!(c.table("web").unwrap().entries[&shared].refcount, 2);

        // a.test now NXDOMAINs (empty ResolveOk).
        c.handle_resolve_ok(ResolveOk {
            family: Family::V4,
            hostname: "a.test".into(),
            ttl: 60,
            addrs: vec![],
        });
        assert_eq!(c.table("web").unwrap().entries[&shared].refcount, 1);
        c.check_invariant().unwrap();
    }

    #[test]
    fn static_and_learned_entries_coexist_s3() {
        let mut c = new_controller();
        let static_addr = Address::V4 {
            addr: Ipv4Addr::new(198, 51, 100, 0),
            prefixlen: 24,
        };
        c.state_mut_for_test()
            .tables
            .get_mut("web")
            .unwrap()
            .entries
            .insert(static_addr, TableEntry::new_static(static_addr, false));

        let learned = Address::from_v4(Ipv4Addr::new(192, 0, 2, 9));
        c.handle_resolve_ok(ResolveOk {
            family: Family::V4,
            hostname: "a.test".into(),
            ttl: 60,
            addrs: vec![learned],
        });
        // Host later NXDOMAINs; learned entry must disappear, static must stay.
        c.handle_resolve_ok(ResolveOk {
            family: Family::V4,
            hostname: "a.test".into(),
            ttl: 60,
            addrs: vec![],
        });

        let table = c.table("web").unwrap();
        assert!(!table.entries.contains_key(&learned));
        assert!(table.entries.contains_key(&static_addr));
        assert_eq!(table.entries[&static_addr].refcount, 0);
    }

    #[test]
    fn three_consecutive_failures_back_off_s4() {
        let mut c = new_controller();
        for _ in 0..3 {
            c.handle_resolve_fail(ResolveFail {
                family: Family::V4,
                hostname: "a.test".into(),
            });
        }
        assert_eq!(c.state().hosts["a.test"].v4.tries, 3);
    }

    fn write_temp_reload_config(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "tablesyncd-controller-reload-test-{}-{:?}.toml",
            std::process::id(),
            std::thread::current().id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn reload_shrinks_table_and_clears_kernel_s5() {
        let path = write_temp_reload_config(
            r#"
            [[table]]
            name = "t"
            hosts = ["h.test"]
            "#,
        );

        let cfg = config::load(&path).unwrap();
        let mut c = Controller::new(path.clone(), cfg, Box::new(MockKernelTable::default()));

        let a = Address::from_v4(Ipv4Addr::new(10, 0, 0, 1));
        let b = Address::from_v4(Ipv4Addr::new(10, 0, 0, 2));
        c.handle_resolve_ok(ResolveOk {
            family: Family::V4,
            hostname: "h.test".into(),
            ttl: 60,
            addrs: vec![a, b],
        });
        assert_eq!(c.table("t").unwrap().entries.len(), 2);

        // New config drops h.test from t entirely.
        std::fs::write(
            &path,
            r#"
            [[table]]
            name = "t"
            "#,
        )
        .unwrap();

        c.reload();
        std::fs::remove_file(&path).unwrap();

        assert!(c.table("t").unwrap().entries.is_empty());

        let mock = c.pf_mut().as_mock().unwrap();
        assert!(mock.clear_calls.iter().any(|n| n == "t"));
        for (name, entries) in mock.replace_calls.iter().rev() {
            if name == "t" {
                assert!(entries.is_empty());
                break;
            }
        }
    }

    #[test]
    fn resolve_ok_for_unknown_host_is_dropped_not_panicking() {
        let mut c = new_controller();
        c.handle_resolve_ok(ResolveOk {
            family: Family::V4,
            hostname: "ghost.test".into(),
            ttl: 60,
            addrs: vec![Address::from_v4(Ipv4Addr::new(10, 0, 0, 1))],
        });
        c.check_invariant().unwrap();
    }

    impl Controller {
        fn state_mut_for_test(&mut self) -> &mut RootState {
            &mut self.state
        }
    }
}
