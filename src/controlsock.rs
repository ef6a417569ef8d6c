//! The control socket: the server side of `tablesyncctl`'s newline
//! protocol, integrated into the
//! controller's single event loop as just another readable source.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Log(tracing_subscriber::filter::LevelFilter),
    Reload,
    Hints,
}

fn parse(line: &str) -> Result<ControlCommand, String> {
    let mut parts = line.trim().split_whitespace();
    match parts.next() {
        Some("reload") => Ok(ControlCommand::Reload),
        Some("hints") => Ok(ControlCommand::Hints),
        Some("log") => {
            let level = parts.next().ok_or("log requires a level argument")?;
            let level = match level {
                "warn" => tracing_subscriber::filter::LevelFilter::WARN,
                "notice" | "info" => tracing_subscriber::filter::LevelFilter::INFO,
                "debug" => tracing_subscriber::filter::LevelFilter::DEBUG,
                other => return Err(format!("unknown log level {other:?}")),
            };
            Ok(ControlCommand::Log(level))
        }
        Some(other) => Err(format!("unknown command {other:?}")),
        None => Err("empty command".into()),
    }
}

/// Binds the control socket, removing any stale socket file left behind
/// by a previous run.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale control socket {}", path.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("binding control socket {}", path.display()))
}

/// Accepts one connection, reads one command line, and returns the parsed
/// command along with the stream to reply on. Malformed input is written
/// back immediately as an `ERR` reply and `Ok(None)` is returned.
pub async fn accept_one(listener: &UnixListener) -> Result<Option<(ControlCommand, UnixStream)>> {
    let (mut stream, _) = listener.accept().await.context("accepting control connection")?;
    let mut line = String::new();
    {
        let mut reader = BufReader::new(&mut stream);
        reader.read_line(&mut line).await.context("reading control command")?;
    }

    match parse(&line) {
        Ok(cmd) => Ok(Some((cmd, stream))),
        Err(e) => {
            let _ = stream.write_all(format!("ERR {e}\n").as_bytes()).await;
            Ok(None)
        }
    }
}

pub async fn reply_ok(stream: &mut UnixStream) {
    let _ = stream.write_all(b"OK\n").await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands() {
        assert_eq!(parse("reload").unwrap(), ControlCommand::Reload);
        assert_eq!(parse("hints\n").unwrap(), ControlCommand::Hints);
        assert_eq!(
            parse("log debug").unwrap(),
            ControlCommand::Log(tracing_subscriber::filter::LevelFilter::DEBUG)
        );
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(parse("frobnicate").is_err());
    }

    #[test]
    fn rejects_log_without_level() {
        assert!(parse("log").is_err());
    }
}
