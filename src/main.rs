use anyhow::{Context, Result};
use clap::Parser;
use tokio::runtime::Builder;
use tracing::info;

use tablesyncd::cli::DaemonArgs;
use tablesyncd::{config, controller, logging, pftable, privsep, worker};

fn main() -> Result<()> {
    let args = DaemonArgs::parse();

    let mut cfg = config::load(&args.config_file)
        .with_context(|| format!("parsing {}", args.config_file.display()))?;
    apply_cli_overrides(&mut cfg, &args);

    if args.no_action {
        println!("configuration OK");
        return Ok(());
    }

    // Open any privileged resource before the fork so it is inherited by
    // the controller (the parent) and never touched by the worker.
    let pf: Box<dyn pftable::KernelTableAdmin> = open_kernel_table()?;

    let role = privsep::fork_privsep().context("privilege-separating fork")?;

    match role {
        privsep::Role::Controller { link, worker_pid } => {
            let log_handle = logging::init(args.debug);
            info!(worker_pid = worker_pid.as_raw(), "controller started");
            run_controller(args, cfg, pf, link, log_handle)
        }
        privsep::Role::Worker { link } => run_worker(cfg, link),
    }
}

fn apply_cli_overrides(cfg: &mut config::Config, args: &DaemonArgs) {
    if !args.resolvers.is_empty() {
        cfg.resolver.resolvers = args.resolvers.clone();
    }
    if let Some(ip) = &args.outbound_ip {
        cfg.resolver.outbound_ip = ip.parse().ok();
    }
    if args.use_dot {
        cfg.resolver.use_dot = true;
    }
    if args.cert_bundle.is_some() {
        cfg.resolver.cert_bundle = args.cert_bundle.clone();
    }
    cfg.resolver.dnssec_level = args.dnssec_level.into();
    cfg.state.dnssec_level = args.dnssec_level.into();
    if args.trust_anchor.is_some() {
        cfg.resolver.trust_anchor = args.trust_anchor.clone();
    }
    if let Some(min_ttl) = args.min_ttl {
        cfg.state.min_ttl = min_ttl;
    }
    if let Some(max_ttl) = args.max_ttl {
        cfg.state.max_ttl = max_ttl;
    }
    if args.hints_file.is_some() {
        cfg.hints_file = args.hints_file.clone();
    }
}

#[cfg(target_os = "openbsd")]
fn open_kernel_table() -> Result<Box<dyn pftable::KernelTableAdmin>> {
    let device = pftable::openbsd::PfDevice::open().context("opening /dev/pf")?;
    Ok(Box::new(device))
}

#[cfg(not(target_os = "openbsd"))]
fn open_kernel_table() -> Result<Box<dyn pftable::KernelTableAdmin>> {
    tracing::warn!("not running on OpenBSD; using an in-memory kernel table stand-in");
    Ok(Box::new(pftable::MockKernelTable::default()))
}

fn run_controller(
    args: DaemonArgs,
    cfg: config::Config,
    pf: Box<dyn pftable::KernelTableAdmin>,
    link: std::os::unix::net::UnixStream,
    log_handle: logging::ReloadHandle,
) -> Result<()> {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the controller's single-threaded runtime")?;

    runtime.block_on(async move {
        link.set_nonblocking(true)?;
        let link = tokio::net::UnixStream::from_std(link)?;

        let control_socket_path = cfg.control_socket.clone();
        let mut controller_state = controller::Controller::new(args.config_file, cfg, pf);

        let listener = match &control_socket_path {
            Some(path) => Some(tablesyncd::controlsock::bind(path)?),
            None => None,
        };

        controller::run(&mut controller_state, link, listener.as_ref(), Some(&log_handle)).await
    })
}

fn run_worker(cfg: config::Config, link: std::os::unix::net::UnixStream) -> Result<()> {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the worker's single-threaded runtime")?;

    runtime.block_on(async move {
        let resolver = worker::build_resolver(&cfg.resolver)?;
        worker::warm_up(&resolver).await;

        privsep::drop_privileges(&cfg.unprivileged_user, &cfg.chroot_dir)
            .context("dropping worker privileges")?;
        logging::init(false);

        link.set_nonblocking(true)?;
        let link = tokio::net::UnixStream::from_std(link)?;
        worker::run(resolver, link).await
    })
}
