//! The resolver worker: owns the DNS stub library context, drains
//! `ResolveReq` messages from the controller and answers each with
//! `ResolveOk`/`ResolveFail`. Stateless beyond the stub library itself —
//! the controller owns every cache/backoff/refresh concern.
//!
//! Built on `trust-dns-resolver`, with every cache size forced to zero
//! and no internal retry loop, because the controller already owns both
//! the caching and the backoff concerns.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig as TdnsResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::proto::rr::{RData, RecordType};
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::ResolverConfig;
use crate::message::{self, Message, ResolveFail, ResolveOk, ResolveReq};
use crate::model::{Address, DnssecLevel, Family};

/// Builds the stub resolver from the operator's options: forced-zero
/// caches so the controller owns refresh timing, DNSSEC validation flipped
/// on for `validate`/`force`, and an optional bound outbound address.
pub fn build_resolver(cfg: &ResolverConfig) -> Result<TokioAsyncResolver> {
    let mut name_servers = NameServerConfigGroup::new();
    let mut ips = Vec::new();
    for resolver in &cfg.resolvers {
        let addr: SocketAddr = resolver
            .parse()
            .with_context(|| format!("invalid resolver address {resolver:?}"))?;
        ips.push(addr.ip());
    }

    if cfg.use_dot {
        if ips.is_empty() {
            anyhow::bail!("DNS-over-TLS requested but no resolvers configured");
        }
        if cfg.cert_bundle.is_some() {
            tracing::warn!(
                "a custom certificate bundle was configured but trust-dns-resolver's \
                 dns-over-rustls transport only supports the platform trust store; \
                 the bundle is ignored"
            );
        }
        name_servers.merge(NameServerConfigGroup::from_ips_tls(
            &ips,
            853,
            "".to_string(),
            true,
        ));
    } else if !ips.is_empty() {
        name_servers.merge(NameServerConfigGroup::from_ips_clear(&ips, 53, true));
    }

    let resolver_config = if ips.is_empty() {
        TdnsResolverConfig::default()
    } else {
        TdnsResolverConfig::from_parts(None, vec![], name_servers)
    };

    if cfg.dnssec_level == DnssecLevel::Force {
        tracing::warn!(
            "dnssec_level=force is approximated as validate: trust-dns-resolver does not \
             expose a per-answer secure/insecure bit distinct from validation failure, so an \
             answer that validates is treated as secure rather than rejected for being \
             merely unauthenticated"
        );
    }

    let mut opts = ResolverOpts::default();
    opts.cache_size = 0;
    opts.positive_min_ttl = Some(Duration::from_secs(0));
    opts.negative_min_ttl = Some(Duration::from_secs(0));
    opts.validate = wants_dnssec_validation(cfg.dnssec_level);
    opts.try_tcp_on_error = true;
    if let Some(ip) = cfg.outbound_ip {
        opts.bind_addr = Some(SocketAddr::new(ip, 0));
    }
    if cfg.trust_anchor.is_some() && !opts.validate {
        tracing::warn!("trust anchor configured but dnssec_level does not require validation");
    }

    Ok(TokioAsyncResolver::tokio(resolver_config, opts))
}

/// Whether `level` should turn on `ResolverOpts::validate`. `Force` is
/// approximated as `Validate`: see the warning logged in `build_resolver`.
fn wants_dnssec_validation(level: DnssecLevel) -> bool {
    matches!(level, DnssecLevel::Validate | DnssecLevel::Force)
}

fn record_type(family: Family) -> RecordType {
    match family {
        Family::V4 => RecordType::A,
        Family::V6 => RecordType::AAAA,
    }
}

/// Classifies one lookup outcome into a `ResolveOk`/`ResolveFail`:
/// transport errors and non-NOERROR/NXDOMAIN rcodes fail;
/// NXDOMAIN and NOERROR-with-no-data both answer with an empty address
/// list and the negative TTL.
async fn resolve_one(resolver: Arc<TokioAsyncResolver>, req: ResolveReq) -> Message {
    let rtype = record_type(req.family);
    match resolver.lookup(req.hostname.as_str(), rtype).await {
        Ok(lookup) => {
            let ttl = lookup
                .record_iter()
                .map(|r| r.ttl())
                .min()
                .unwrap_or(0);
            let mut addrs = Vec::new();
            for record in lookup.record_iter() {
                match record.data() {
                    Some(RData::A(a)) if req.family == Family::V4 => {
                        addrs.push(Address::from_v4((*a).into()));
                    }
                    Some(RData::AAAA(a)) if req.family == Family::V6 => {
                        addrs.push(Address::from_v6((*a).into()));
                    }
                    Some(other) => {
                        tracing::warn!(
                            hostname = %req.hostname, family = ?req.family,
                            "answer record with mismatched type/length {other:?}, skipping"
                        );
                    }
                    None => {}
                }
            }
            Message::ResolveOk(ResolveOk {
                family: req.family,
                hostname: req.hostname,
                ttl,
                addrs,
            })
        }
        Err(e) => match e.kind() {
            ResolveErrorKind::NoRecordsFound {
                response_code,
                negative_ttl,
                ..
            } if is_empty_answer(*response_code) => Message::ResolveOk(ResolveOk {
                family: req.family,
                hostname: req.hostname,
                ttl: negative_ttl.unwrap_or(0),
                addrs: Vec::new(),
            }),
            _ => {
                tracing::warn!(hostname = %req.hostname, family = ?req.family, error = %e, "resolve failed");
                Message::ResolveFail(ResolveFail {
                    family: req.family,
                    hostname: req.hostname,
                })
            }
        },
    }
}

fn is_empty_answer(code: trust_dns_resolver::proto::op::ResponseCode) -> bool {
    use trust_dns_resolver::proto::op::ResponseCode;
    matches!(code, ResponseCode::NXDomain | ResponseCode::NoError)
}

/// Issues a throwaway query before filesystem privilege is dropped, so the
/// stub library opens any certificate bundle or trust-anchor file while it
/// still can. The result is discarded.
pub async fn warm_up(resolver: &TokioAsyncResolver) {
    let _ = resolver.lookup("localhost.", RecordType::A).await;
}

/// Runs the worker's single-threaded cooperative loop: reads
/// `ResolveReq` frames from `link` and answers each one concurrently
/// (queries are independent; answers may complete out of order), writing
/// results back as they complete.
pub async fn run<S>(resolver: TokioAsyncResolver, mut link: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let resolver = Arc::new(resolver);
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    loop {
        tokio::select! {
            frame = message::read_frame(&mut link) => {
                match frame.context("reading frame from controller")? {
                    Some(Message::ResolveReq(req)) => {
                        let resolver = Arc::clone(&resolver);
                        let tx = tx.clone();
                        tokio::task::spawn(async move {
                            let msg = resolve_one(resolver, req).await;
                            let _ = tx.send(msg);
                        });
                    }
                    Some(other) => {
                        anyhow::bail!("controller sent an unexpected message kind: {other:?}");
                    }
                    None => return Ok(()),
                }
            }

            Some(msg) = rx.recv() => {
                message::write_frame(&mut link, &msg)
                    .await
                    .context("writing resolve result to controller")?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_type_matches_family() {
        assert_eq!(record_type(Family::V4), RecordType::A);
        assert_eq!(record_type(Family::V6), RecordType::AAAA);
    }

    #[test]
    fn empty_answer_recognizes_nxdomain_and_noerror() {
        use trust_dns_resolver::proto::op::ResponseCode;
        assert!(is_empty_answer(ResponseCode::NXDomain));
        assert!(is_empty_answer(ResponseCode::NoError));
        assert!(!is_empty_answer(ResponseCode::ServFail));
    }

    /// Pins the documented `force`-as-`validate` approximation (DESIGN.md
    /// Open Question 3): until a resolver crate exposes a per-answer
    /// secure/insecure bit, `force` cannot actually reject an
    /// insecure-but-validatable answer the way S6 asks for, and this test
    /// records that rather than silently asserting the stronger behavior.
    #[test]
    fn dnssec_force_is_approximated_as_validate_s6() {
        assert!(!wants_dnssec_validation(DnssecLevel::None));
        assert!(!wants_dnssec_validation(DnssecLevel::Log));
        assert!(wants_dnssec_validation(DnssecLevel::Validate));
        assert!(wants_dnssec_validation(DnssecLevel::Force));
    }
}
