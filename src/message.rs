//! The typed message link between controller and worker.
//!
//! Each frame is a fixed small header (`kind: u16`, `len: u32`) followed by
//! a payload that is read and decoded atomically. The payload layouts below
//! are little-endian and packed to a fixed layout, so they are
//! encoded and decoded by hand with `byteorder` rather than through a
//! generic serde codec — a generic codec would not give us control over the
//! exact byte offsets and the deterministic truncation behavior `ResolveOk`
//! requires.
//!
//! This is a local, trusted channel: any framing violation (truncated
//! header, payload length that doesn't match what a decoder expects, an
//! unknown message kind) is fatal, not recoverable.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::FrameError;
use crate::model::{Address, Family};

/// Maximum payload size for one frame, matching the framed-IPC limit this
/// design assumes: a single message is capped at 16 KiB.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

const HEADER_LEN: usize = 2 + 4;
/// `family(2) + addr(16) + prefixlen(4)`.
const ADDRESS_RECORD_LEN: usize = 2 + 16 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    ResolveReq = 1,
    ResolveOk = 2,
    ResolveFail = 3,
}

impl Kind {
    fn from_u16(v: u16) -> Result<Kind, FrameError> {
        match v {
            1 => Ok(Kind::ResolveReq),
            2 => Ok(Kind::ResolveOk),
            3 => Ok(Kind::ResolveFail),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveReq {
    pub family: Family,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOk {
    pub family: Family,
    pub hostname: String,
    pub ttl: u32,
    pub addrs: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveFail {
    pub family: Family,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ResolveReq(ResolveReq),
    ResolveOk(ResolveOk),
    ResolveFail(ResolveFail),
}

fn write_address_record(buf: &mut Vec<u8>, addr: &Address) {
    let mut raw = [0u8; 16];
    match addr {
        Address::V4 { addr, prefixlen } => {
            raw[..4].copy_from_slice(&addr.octets());
            buf.write_u16::<LittleEndian>(Family::V4.as_u16()).unwrap();
            buf.extend_from_slice(&raw);
            buf.write_i32::<LittleEndian>(*prefixlen as i32).unwrap();
        }
        Address::V6 { addr, prefixlen } => {
            raw.copy_from_slice(&addr.octets());
            buf.write_u16::<LittleEndian>(Family::V6.as_u16()).unwrap();
            buf.extend_from_slice(&raw);
            buf.write_i32::<LittleEndian>(*prefixlen as i32).unwrap();
        }
    }
}

fn read_address_record(cur: &mut Cursor<&[u8]>) -> Result<Address, FrameError> {
    let family = cur
        .read_u16::<LittleEndian>()
        .map_err(|e| FrameError::Malformed(e.to_string()))?;
    let mut raw = [0u8; 16];
    cur.read_exact(&mut raw)
        .map_err(|e| FrameError::Malformed(e.to_string()))?;
    let prefixlen = cur
        .read_i32::<LittleEndian>()
        .map_err(|e| FrameError::Malformed(e.to_string()))?;

    match Family::from_u16(family) {
        Some(Family::V4) => {
            let octets: [u8; 4] = raw[..4].try_into().unwrap();
            Ok(Address::V4 {
                addr: octets.into(),
                prefixlen: prefixlen as u8,
            })
        }
        Some(Family::V6) => Ok(Address::V6 {
            addr: raw.into(),
            prefixlen: prefixlen as u8,
        }),
        None => Err(FrameError::Malformed(format!(
            "address record with unknown family {family}"
        ))),
    }
}

/// The maximum number of addresses a `ResolveOk` for `hostname` can carry in
/// one frame, given the fixed overhead of family/hostname-length/hostname/
/// ttl/count ahead of the address array.
pub fn max_addrs_for_hostname(hostname: &str) -> usize {
    let fixed = 2 + 4 + hostname.len() + 4 + 4;
    MAX_FRAME_PAYLOAD.saturating_sub(fixed) / ADDRESS_RECORD_LEN
}

impl Message {
    fn kind(&self) -> Kind {
        match self {
            Message::ResolveReq(_) => Kind::ResolveReq,
            Message::ResolveOk(_) => Kind::ResolveOk,
            Message::ResolveFail(_) => Kind::ResolveFail,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::ResolveReq(req) => {
                buf.write_u16::<LittleEndian>(req.family.as_u16()).unwrap();
                buf.extend_from_slice(req.hostname.as_bytes());
            }
            Message::ResolveOk(ok) => {
                buf.write_u16::<LittleEndian>(ok.family.as_u16()).unwrap();
                buf.write_i32::<LittleEndian>(ok.hostname.len() as i32)
                    .unwrap();
                buf.extend_from_slice(ok.hostname.as_bytes());
                buf.write_i32::<LittleEndian>(ok.ttl as i32).unwrap();

                let max_addrs = max_addrs_for_hostname(&ok.hostname);
                let (addrs, truncated) = if ok.addrs.len() > max_addrs {
                    tracing::warn!(
                        hostname = %ok.hostname,
                        kept = max_addrs,
                        dropped = ok.addrs.len() - max_addrs,
                        "truncating ResolveOk address list to fit one frame"
                    );
                    (&ok.addrs[..max_addrs], true)
                } else {
                    (&ok.addrs[..], false)
                };
                let _ = truncated;

                buf.write_i32::<LittleEndian>(addrs.len() as i32).unwrap();
                for addr in addrs {
                    write_address_record(&mut buf, addr);
                }
            }
            Message::ResolveFail(fail) => {
                buf.write_u16::<LittleEndian>(fail.family.as_u16()).unwrap();
                buf.write_i32::<LittleEndian>(fail.hostname.len() as i32)
                    .unwrap();
                buf.extend_from_slice(fail.hostname.as_bytes());
            }
        }
        buf
    }

    fn decode(kind: Kind, payload: &[u8]) -> Result<Message, FrameError> {
        let mut cur = Cursor::new(payload);
        match kind {
            Kind::ResolveReq => {
                let family = cur
                    .read_u16::<LittleEndian>()
                    .map_err(|e| FrameError::Malformed(e.to_string()))?;
                let family = Family::from_u16(family)
                    .ok_or_else(|| FrameError::Malformed("unknown family".into()))?;
                let rest = &payload[cur.position() as usize..];
                let hostname = String::from_utf8(rest.to_vec())
                    .map_err(|e| FrameError::Malformed(e.to_string()))?;
                Ok(Message::ResolveReq(ResolveReq { family, hostname }))
            }
            Kind::ResolveOk => {
                let family = cur
                    .read_u16::<LittleEndian>()
                    .map_err(|e| FrameError::Malformed(e.to_string()))?;
                let family = Family::from_u16(family)
                    .ok_or_else(|| FrameError::Malformed("unknown family".into()))?;
                let hostname_len = cur
                    .read_i32::<LittleEndian>()
                    .map_err(|e| FrameError::Malformed(e.to_string()))?;
                if hostname_len < 0 {
                    return Err(FrameError::Malformed("negative hostname length".into()));
                }
                let mut hostname_buf = vec![0u8; hostname_len as usize];
                cur.read_exact(&mut hostname_buf)
                    .map_err(|e| FrameError::Malformed(e.to_string()))?;
                let hostname = String::from_utf8(hostname_buf)
                    .map_err(|e| FrameError::Malformed(e.to_string()))?;

                let ttl = cur
                    .read_i32::<LittleEndian>()
                    .map_err(|e| FrameError::Malformed(e.to_string()))?;
                if ttl < 0 {
                    return Err(FrameError::Malformed("negative ttl".into()));
                }
                let count = cur
                    .read_i32::<LittleEndian>()
                    .map_err(|e| FrameError::Malformed(e.to_string()))?;
                if count < 0 {
                    return Err(FrameError::Malformed("negative address count".into()));
                }

                let remaining = payload.len() - cur.position() as usize;
                if remaining != count as usize * ADDRESS_RECORD_LEN {
                    return Err(FrameError::Malformed(
                        "address count does not match remaining payload length".into(),
                    ));
                }

                let mut addrs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    addrs.push(read_address_record(&mut cur)?);
                }

                Ok(Message::ResolveOk(ResolveOk {
                    family,
                    hostname,
                    ttl: ttl as u32,
                    addrs,
                }))
            }
            Kind::ResolveFail => {
                let family = cur
                    .read_u16::<LittleEndian>()
                    .map_err(|e| FrameError::Malformed(e.to_string()))?;
                let family = Family::from_u16(family)
                    .ok_or_else(|| FrameError::Malformed("unknown family".into()))?;
                let hostname_len = cur
                    .read_i32::<LittleEndian>()
                    .map_err(|e| FrameError::Malformed(e.to_string()))?;
                if hostname_len < 0 {
                    return Err(FrameError::Malformed("negative hostname length".into()));
                }
                let mut hostname_buf = vec![0u8; hostname_len as usize];
                cur.read_exact(&mut hostname_buf)
                    .map_err(|e| FrameError::Malformed(e.to_string()))?;
                let hostname = String::from_utf8(hostname_buf)
                    .map_err(|e| FrameError::Malformed(e.to_string()))?;
                Ok(Message::ResolveFail(ResolveFail { family, hostname }))
            }
        }
    }
}

/// Writes one frame to `w`, applying `ResolveOk`'s deterministic truncation
/// if the address list would otherwise overflow the frame budget.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    msg: &Message,
) -> Result<(), FrameError> {
    let payload = msg.encode_payload();
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }

    let mut header = [0u8; HEADER_LEN];
    (&mut header[..2])
        .write_u16::<LittleEndian>(msg.kind() as u16)
        .unwrap();
    (&mut header[2..])
        .write_u32::<LittleEndian>(payload.len() as u32)
        .unwrap();

    w.write_all(&header).await?;
    w.write_all(&payload).await?;
    Ok(())
}

/// Reads one frame from `r`. Returns `Ok(None)` on a clean EOF between
/// frames (the peer closed the link); any other error is a framing
/// violation and is fatal to the caller.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    r: &mut R,
) -> Result<Option<Message>, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let kind = Kind::from_u16((&header[..2]).read_u16::<LittleEndian>().unwrap())?;
    let len = (&header[2..]).read_u32::<LittleEndian>().unwrap() as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            len,
            max: MAX_FRAME_PAYLOAD,
        });
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;

    Message::decode(kind, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    async fn roundtrip(msg: Message) -> Message {
        let mut buf = Vec::new();
        write_frame(&mut buf, &msg).await.unwrap();
        let mut cur = Cursor::new(buf);
        read_frame(&mut cur).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn resolve_req_roundtrips() {
        let msg = Message::ResolveReq(ResolveReq {
            family: Family::V4,
            hostname: "example.test".into(),
        });
        assert_eq!(roundtrip(msg.clone()).await, msg);
    }

    #[tokio::test]
    async fn resolve_ok_with_mixed_families_roundtrips() {
        let msg = Message::ResolveOk(ResolveOk {
            family: Family::V6,
            hostname: "example.test".into(),
            ttl: 60,
            addrs: vec![
                Address::from_v4(Ipv4Addr::new(10, 0, 0, 1)),
                Address::from_v6(Ipv6Addr::LOCALHOST),
            ],
        });
        assert_eq!(roundtrip(msg.clone()).await, msg);
    }

    #[tokio::test]
    async fn resolve_ok_truncates_addresses_deterministically() {
        let many: Vec<Address> = (0..10_000u32)
            .map(|i| Address::from_v4(Ipv4Addr::from(i.to_be_bytes())))
            .collect();
        let msg = Message::ResolveOk(ResolveOk {
            family: Family::V4,
            hostname: "big.test".into(),
            ttl: 30,
            addrs: many.clone(),
        });

        let decoded = roundtrip(msg).await;
        let Message::ResolveOk(ok) = decoded else {
            panic!("expected ResolveOk");
        };
        assert!(ok.addrs.len() < many.len());
        assert_eq!(ok.addrs, many[..ok.addrs.len()]);
    }

    #[tokio::test]
    async fn malformed_address_count_is_rejected() {
        let mut buf = Vec::new();
        // family=v4, hostname_len=1, hostname="a", ttl=1, count=5 (but no
        // address records follow) — a length mismatch must be rejected.
        buf.write_u16::<LittleEndian>(Family::V4.as_u16()).unwrap();
        buf.write_i32::<LittleEndian>(1).unwrap();
        buf.extend_from_slice(b"a");
        buf.write_i32::<LittleEndian>(1).unwrap();
        buf.write_i32::<LittleEndian>(5).unwrap();

        let mut frame = Vec::new();
        frame.write_u16::<LittleEndian>(Kind::ResolveOk as u16).unwrap();
        frame.write_u32::<LittleEndian>(buf.len() as u32).unwrap();
        frame.extend_from_slice(&buf);

        let mut cur = Cursor::new(frame);
        let err = read_frame(&mut cur).await.unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let mut frame = Vec::new();
        frame.write_u16::<LittleEndian>(99).unwrap();
        frame.write_u32::<LittleEndian>(0).unwrap();
        let mut cur = Cursor::new(frame);
        let err = read_frame(&mut cur).await.unwrap_err();
        assert!(matches!(err, FrameError::UnknownKind(99)));
    }

    #[tokio::test]
    async fn oversized_declared_length_is_rejected_before_reading() {
        let mut frame = Vec::new();
        frame
            .write_u16::<LittleEndian>(Kind::ResolveReq as u16)
            .unwrap();
        frame
            .write_u32::<LittleEndian>((MAX_FRAME_PAYLOAD + 1) as u32)
            .unwrap();
        let mut cur = Cursor::new(frame);
        let err = read_frame(&mut cur).await.unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }
}
