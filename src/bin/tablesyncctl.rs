//! The control CLI: sends one line over the daemon's control socket
//! and prints whatever comes back. The wire format is a
//! newline-terminated command and a single `OK`/`ERR ...` reply line,
//! independent of the controller/worker message framing (see
//! DESIGN.md).

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;

use clap::Parser;
use tablesyncd::cli::{CtlArgs, CtlCommand, CtlLogLevel};

fn command_line(cmd: &CtlCommand) -> String {
    match cmd {
        CtlCommand::Log { level } => format!("log {}\n", log_level_str(*level)),
        CtlCommand::Reload => "reload\n".to_string(),
        CtlCommand::Hints => "hints\n".to_string(),
    }
}

fn log_level_str(level: CtlLogLevel) -> &'static str {
    match level {
        CtlLogLevel::Warn => "warn",
        CtlLogLevel::Notice => "notice",
        CtlLogLevel::Info => "info",
        CtlLogLevel::Debug => "debug",
    }
}

fn main() -> anyhow::Result<()> {
    let args = CtlArgs::parse();

    let mut stream = UnixStream::connect(&args.socket)
        .map_err(|e| anyhow::anyhow!("connecting to {}: {e}", args.socket.display()))?;
    stream.write_all(command_line(&args.command).as_bytes())?;
    stream.flush()?;

    let mut reply = String::new();
    BufReader::new(&stream).read_line(&mut reply)?;
    let reply = reply.trim_end();

    if let Some(msg) = reply.strip_prefix("ERR ") {
        eprintln!("{msg}");
        std::process::exit(1);
    }

    println!("{reply}");
    Ok(())
}
