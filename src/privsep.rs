//! Privilege separation: a `fork()` of the single `tablesyncd`
//! binary into a privileged controller and an unprivileged resolver
//! worker, communicating over a `UnixStream::pair()` created before the
//! fork.
//!
//! The fork happens before any tokio runtime starts — forking a
//! multi-threaded async runtime is unsound, since only the forking thread
//! survives into the child while the runtime's bookkeeping assumes all of
//! its worker threads are still alive. Each side constructs its own
//! `tokio::runtime::Builder::new_current_thread()` runtime after the fork
//! returns, matching the single-threaded cooperative event loop the rest
//! of this crate runs.
//!
//! Filesystem privilege is dropped separately, via [`drop_privileges`],
//! rather than inline in the fork itself: the worker still needs its
//! normal filesystem view to run the one-shot warm-up query that
//! opens the certificate bundle and trust-anchor files, so the caller
//! builds the resolver and runs warm-up first, then calls
//! `drop_privileges` right before entering the main loop.

use std::os::unix::net::UnixStream;

use anyhow::{Context, Result};
use nix::unistd::{chroot, fork, setgid, setgroups, setuid, ForkResult, Gid, Uid, User};

/// Which side of the fork this process ended up on, carrying the message
/// link half it owns.
pub enum Role {
    Controller { link: UnixStream, worker_pid: nix::unistd::Pid },
    Worker { link: UnixStream },
}

/// Forks the process. The parent becomes the controller and keeps its
/// current privilege; the caller is responsible for having already opened
/// any privileged resources (the pf device) before calling this. The
/// child becomes the worker, still fully privileged until it calls
/// [`drop_privileges`].
///
/// # Ordering
/// Must be called before any tokio runtime is built in this process.
pub fn fork_privsep() -> Result<Role> {
    let (parent_end, child_end) =
        UnixStream::pair().context("creating the controller/worker message link")?;

    // SAFETY: called before any tokio runtime exists in this process, so
    // there are no other threads whose state the child could observe torn.
    match unsafe { fork() }.context("fork")? {
        ForkResult::Parent { child, .. } => {
            drop(child_end);
            Ok(Role::Controller {
                link: parent_end,
                worker_pid: child,
            })
        }
        ForkResult::Child => {
            drop(parent_end);
            Ok(Role::Worker { link: child_end })
        }
    }
}

/// Chroots to `chroot_dir` and drops to `user`'s uid/gid, clearing
/// supplementary groups first. Called by the worker right before it
/// starts draining resolve requests.
pub fn drop_privileges(user: &str, chroot_dir: &std::path::Path) -> Result<()> {
    let pwent = User::from_name(user)
        .context("looking up unprivileged user")?
        .with_context(|| format!("no such user {user:?}"))?;

    chroot(chroot_dir).with_context(|| format!("chroot to {}", chroot_dir.display()))?;
    std::env::set_current_dir("/").context("chdir to chroot root")?;

    setgroups(&[]).context("dropping supplementary groups")?;
    setgid(Gid::from_raw(pwent.gid.as_raw())).context("setgid")?;
    setuid(Uid::from_raw(pwent.uid.as_raw())).context("setuid")?;

    Ok(())
}
