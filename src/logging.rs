//! Structured logging setup, built with a reloadable filter so the
//! `log <level>` control verb can change verbosity without a restart.

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::reload;
use tracing_subscriber::prelude::*;

pub type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Initializes the global subscriber and returns a handle the control verb
/// can use to change the filter level later. `debug` selects `debug`
/// as the default directive (before `RUST_LOG` overrides); otherwise
/// `info`.
pub fn init(debug: bool) -> ReloadHandle {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    handle
}

/// Applies the `log <level>` control verb to a running daemon's
/// filter.
pub fn set_level(handle: &ReloadHandle, level: LevelFilter) -> Result<(), reload::Error> {
    handle.modify(|filter| *filter = EnvFilter::new(level.to_string()))
}
