// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Mux substream wire framing (§4.F): every frame is a 16-bit `meta_len`
//! prefix, that many metadata bytes, and — when the metadata's `HasData`
//! flag is set — a 16-bit `payload_len` prefix followed by payload bytes.
//!
//! `FrameMetadata::decode` needs to know whether a `Keep` frame's session
//! is UDP before it knows whether a target block follows the flags byte,
//! but that can only be answered by looking the session up by the ID this
//! very frame carries. Decoding therefore takes a `session_network`
//! lookup instead of a bare `is_udp` flag, so the lookup happens after the
//! session_id is known and before the rest of the metadata is parsed.

use std::collections::VecDeque;

use bitflags::bitflags;

use crate::{
    buffer::{Buffer, MultiBuffer},
    destination::{Address, Destination, Network},
    error::CoreError,
    pipe::{PipeRead, PipeWrite},
};

/// Metadata cannot exceed this many bytes (§4.F limits).
pub const MAX_META_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    New = 1,
    Keep = 2,
    End = 3,
    KeepAlive = 4,
}

impl FrameStatus {
    fn from_u8(v: u8) -> Result<Self, CoreError> {
        match v {
            1 => Ok(FrameStatus::New),
            2 => Ok(FrameStatus::Keep),
            3 => Ok(FrameStatus::End),
            4 => Ok(FrameStatus::KeepAlive),
            other => Err(CoreError::MalformedFrame(format!("unknown status byte {other}"))),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const HAS_DATA = 0b0000_0001;
        const HAS_ERROR = 0b0000_0010;
    }
}

/// One Mux frame's metadata (§4.F table). `target`/`inbound_source`/
/// `inbound_local` carry their own port; `target.network` doubles as the
/// wire's "target network" byte for New/UDP-Keep frames, and is
/// meaningless (always `Network::Unknown`) on the inbound blocks, which
/// the wire format encodes as bare address+port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub session_id: u16,
    pub status: FrameStatus,
    pub flags: FrameFlags,
    pub target: Option<Destination>,
    pub inbound_source: Option<Destination>,
    pub inbound_local: Option<Destination>,
    pub global_id: Option<[u8; 8]>,
}

impl FrameMetadata {
    /// A plain Keep frame carrying a payload, no target block.
    pub fn keep_data(session_id: u16) -> Self {
        Self {
            session_id,
            status: FrameStatus::Keep,
            flags: FrameFlags::HAS_DATA,
            target: None,
            inbound_source: None,
            inbound_local: None,
            global_id: None,
        }
    }

    /// A Keep frame for a `Packet`-typed (UDP) session: carries the
    /// session's target on every frame, since `decode` requires one for
    /// any Keep frame belonging to a UDP session (§4.F).
    pub fn keep_packet(session_id: u16, target: Destination) -> Self {
        Self {
            session_id,
            status: FrameStatus::Keep,
            flags: FrameFlags::HAS_DATA,
            target: Some(target),
            inbound_source: None,
            inbound_local: None,
            global_id: None,
        }
    }

    pub fn end(session_id: u16, had_error: bool) -> Self {
        Self {
            session_id,
            status: FrameStatus::End,
            flags: if had_error { FrameFlags::HAS_ERROR } else { FrameFlags::empty() },
            target: None,
            inbound_source: None,
            inbound_local: None,
            global_id: None,
        }
    }

    pub fn keep_alive() -> Self {
        Self {
            session_id: 0,
            status: FrameStatus::KeepAlive,
            flags: FrameFlags::empty(),
            target: None,
            inbound_source: None,
            inbound_local: None,
            global_id: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.session_id.to_be_bytes());
        out.push(self.status as u8);
        out.push(self.flags.bits());

        if let Some(target) = &self.target {
            let network_byte = match target.network {
                Network::Tcp => 1,
                Network::Udp => 2,
                Network::Unknown => {
                    return Err(CoreError::MalformedFrame("target network must be tcp or udp".into()));
                },
            };
            out.push(network_byte);
            encode_address(&mut out, target);
        }
        if let Some(src) = &self.inbound_source {
            encode_address(&mut out, src);
        }
        if let Some(local) = &self.inbound_local {
            encode_address(&mut out, local);
        }
        if let Some(gid) = &self.global_id {
            out.extend_from_slice(gid);
        }

        if out.len() > MAX_META_LEN {
            return Err(CoreError::MalformedFrame(format!("encoded meta_len {} exceeds {MAX_META_LEN}", out.len())));
        }
        Ok(out)
    }

    /// Decode one frame's metadata bytes. `session_network` is consulted
    /// only for `Keep` frames, to decide whether a per-packet UDP target
    /// block follows; `reverse_mux` gates the inbound source/local blocks
    /// on `New` frames.
    pub fn decode(bytes: &[u8], session_network: impl Fn(u16) -> Option<Network>, reverse_mux: bool) -> Result<Self, CoreError> {
        if bytes.len() > MAX_META_LEN {
            return Err(CoreError::MalformedFrame(format!("meta_len {} exceeds {MAX_META_LEN}", bytes.len())));
        }
        let mut c = Cursor::new(bytes);
        let session_id = c.u16()?;
        let status = FrameStatus::from_u8(c.u8()?)?;
        let flags = FrameFlags::from_bits_truncate(c.u8()?);

        let is_udp_keep = matches!(status, FrameStatus::Keep) && session_network(session_id) == Some(Network::Udp);
        let target_present = matches!(status, FrameStatus::New) || is_udp_keep;

        let mut target = None;
        if target_present {
            let network = match c.u8()? {
                1 => Network::Tcp,
                2 => Network::Udp,
                other => return Err(CoreError::MalformedFrame(format!("unknown target network byte {other}"))),
            };
            let (address, port) = decode_address(&mut c)?;
            target = Some(Destination { network, address, port });
        }

        let mut inbound_source = None;
        let mut inbound_local = None;
        if matches!(status, FrameStatus::New) && reverse_mux {
            let (addr, port) = decode_address(&mut c)?;
            inbound_source = Some(Destination { network: Network::Unknown, address: addr, port });
            let (addr, port) = decode_address(&mut c)?;
            inbound_local = Some(Destination { network: Network::Unknown, address: addr, port });
        }

        let wants_global_id = matches!(status, FrameStatus::New)
            && target.as_ref().map(|t| t.network) == Some(Network::Udp)
            && flags.contains(FrameFlags::HAS_DATA);
        let global_id = if wants_global_id {
            let slice = c.take(8)?;
            let mut gid = [0u8; 8];
            gid.copy_from_slice(slice);
            Some(gid)
        } else {
            None
        };

        Ok(Self { session_id, status, flags, target, inbound_source, inbound_local, global_id })
    }
}

fn encode_address(out: &mut Vec<u8>, dest: &Destination) {
    out.extend_from_slice(&dest.port.to_be_bytes());
    match &dest.address {
        Address::V4(v4) => {
            out.push(1);
            out.extend_from_slice(&v4.octets());
        },
        Address::Domain(d) => {
            out.push(2);
            out.push(d.len() as u8);
            out.extend_from_slice(d.as_bytes());
        },
        Address::V6(v6) => {
            out.push(3);
            out.extend_from_slice(&v6.octets());
        },
    }
}

fn decode_address(c: &mut Cursor<'_>) -> Result<(Address, u16), CoreError> {
    let port = c.u16()?;
    let addr_type = c.u8()?;
    let address = match addr_type {
        1 => {
            let b = c.take(4)?;
            Address::V4(std::net::Ipv4Addr::new(b[0], b[1], b[2], b[3]))
        },
        2 => {
            let len = c.u8()? as usize;
            let b = c.take(len)?;
            let domain = std::str::from_utf8(b)
                .map_err(|_| CoreError::MalformedFrame("domain is not valid utf-8".into()))?
                .to_string();
            Address::Domain(domain)
        },
        3 => {
            let b = c.take(16)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(b);
            Address::V6(std::net::Ipv6Addr::from(octets))
        },
        other => return Err(CoreError::MalformedFrame(format!("unknown addr_type {other}"))),
    };
    Ok((address, port))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CoreError> {
        if self.pos + n > self.buf.len() {
            return Err(CoreError::MalformedFrame("unexpected end of frame metadata".into()));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, CoreError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CoreError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
}

/// A full frame: decoded metadata plus its payload, if `HasData` was set.
#[derive(Debug)]
pub struct SessionFrame {
    pub meta: FrameMetadata,
    pub payload: Option<MultiBuffer>,
}

impl SessionFrame {
    fn encode(&self) -> Result<Vec<u8>, CoreError> {
        let meta_bytes = self.meta.encode()?;
        let mut out = Vec::with_capacity(2 + meta_bytes.len() + 4);
        out.extend_from_slice(&(meta_bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(&meta_bytes);
        if self.meta.flags.contains(FrameFlags::HAS_DATA) {
            let payload = self.payload.as_ref().ok_or_else(|| CoreError::MalformedFrame("HasData set without payload".into()))?;
            let bytes = payload.to_vec();
            if bytes.len() > u16::MAX as usize {
                return Err(CoreError::MalformedFrame(format!("payload_len {} exceeds u16::MAX", bytes.len())));
            }
            out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }
}

/// Decodes frames off an underlying transport `PipeRead`, accumulating
/// bytes across reads until a complete frame is available.
pub struct FrameReader {
    inner: Box<dyn PipeRead>,
    buf: VecDeque<u8>,
}

impl FrameReader {
    pub fn new(inner: impl PipeRead + 'static) -> Self {
        Self { inner: Box::new(inner), buf: VecDeque::new() }
    }

    async fn fill(&mut self, need: usize) -> Result<(), CoreError> {
        while self.buf.len() < need {
            let mb = self.inner.read().await?;
            self.buf.extend(mb.to_vec());
        }
        Ok(())
    }

    pub async fn read_frame(&mut self, session_network: impl Fn(u16) -> Option<Network>, reverse_mux: bool) -> Result<SessionFrame, CoreError> {
        self.fill(2).await?;
        let len_bytes: Vec<u8> = self.buf.drain(..2).collect();
        let meta_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        if meta_len > MAX_META_LEN {
            return Err(CoreError::MalformedFrame(format!("meta_len {meta_len} exceeds {MAX_META_LEN}")));
        }

        self.fill(meta_len).await?;
        let meta_bytes: Vec<u8> = self.buf.drain(..meta_len).collect();
        let meta = FrameMetadata::decode(&meta_bytes, session_network, reverse_mux)?;

        let payload = if meta.flags.contains(FrameFlags::HAS_DATA) {
            self.fill(2).await?;
            let len_bytes: Vec<u8> = self.buf.drain(..2).collect();
            let payload_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
            self.fill(payload_len).await?;
            let payload_bytes: Vec<u8> = self.buf.drain(..payload_len).collect();
            Some(MultiBuffer::from_buffer(Buffer::from_bytes(&payload_bytes)))
        } else {
            None
        };

        Ok(SessionFrame { meta, payload })
    }

    pub fn interrupt(&self) {
        self.inner.interrupt();
    }
}

/// Encodes frames onto an underlying transport `PipeWrite`. Shared (via
/// `Arc`) across every substream of one Mux worker.
pub struct FrameWriter {
    inner: Box<dyn PipeWrite>,
}

impl FrameWriter {
    pub fn new(inner: impl PipeWrite + 'static) -> Self {
        Self { inner: Box::new(inner) }
    }

    pub async fn write_frame(&self, frame: &SessionFrame) -> Result<(), CoreError> {
        let bytes = frame.encode()?;
        self.inner.write(MultiBuffer::from_buffer(Buffer::from_bytes(&bytes))).await
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub fn interrupt(&self) {
        self.inner.interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tcp_frame_round_trips() {
        let meta = FrameMetadata {
            session_id: 7,
            status: FrameStatus::New,
            flags: FrameFlags::HAS_DATA,
            target: Some(Destination::tcp(Address::Domain("example.com".to_string()), 443)),
            inbound_source: None,
            inbound_local: None,
            global_id: None,
        };
        let bytes = meta.encode().expect("encode");
        let decoded = FrameMetadata::decode(&bytes, |_| None, false).expect("decode");
        assert_eq!(decoded, meta);
    }

    #[test]
    fn udp_new_frame_with_global_id_round_trips() {
        let meta = FrameMetadata {
            session_id: 3,
            status: FrameStatus::New,
            flags: FrameFlags::HAS_DATA,
            target: Some(Destination::udp(Address::V4(std::net::Ipv4Addr::new(8, 8, 8, 8)), 53)),
            inbound_source: None,
            inbound_local: None,
            global_id: Some([1, 2, 3, 4, 5, 6, 7, 8]),
        };
        let bytes = meta.encode().expect("encode");
        let decoded = FrameMetadata::decode(&bytes, |_| None, false).expect("decode");
        assert_eq!(decoded, meta);
    }

    #[test]
    fn keep_frame_for_udp_session_carries_target() {
        let meta = FrameMetadata {
            session_id: 9,
            status: FrameStatus::Keep,
            flags: FrameFlags::HAS_DATA,
            target: Some(Destination::udp(Address::V4(std::net::Ipv4Addr::new(1, 1, 1, 1)), 53)),
            inbound_source: None,
            inbound_local: None,
            global_id: None,
        };
        let bytes = meta.encode().expect("encode");
        let decoded = FrameMetadata::decode(&bytes, |id| (id == 9).then_some(Network::Udp), false).expect("decode");
        assert_eq!(decoded, meta);
    }

    #[test]
    fn keep_frame_for_tcp_session_has_no_target() {
        let meta = FrameMetadata::keep_data(5);
        let bytes = meta.encode().expect("encode");
        let decoded = FrameMetadata::decode(&bytes, |id| (id == 5).then_some(Network::Tcp), false).expect("decode");
        assert_eq!(decoded, meta);
    }

    #[test]
    fn meta_len_over_limit_is_rejected() {
        let oversized = vec![0u8; MAX_META_LEN + 1];
        let err = FrameMetadata::decode(&oversized, |_| None, false).unwrap_err();
        assert!(matches!(err, CoreError::MalformedFrame(_)));
    }

    #[test]
    fn unknown_status_byte_is_rejected() {
        let bytes = vec![0, 1, 9, 0];
        let err = FrameMetadata::decode(&bytes, |_| None, false).unwrap_err();
        assert!(matches!(err, CoreError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn frame_writer_reader_round_trip_over_a_pipe() {
        use crate::pipe;

        let (r, w) = pipe::pipe(pipe::PipeOptions::unbounded());
        let writer = FrameWriter::new(w);
        let mut reader = FrameReader::new(r);

        let mut payload = Buffer::new();
        payload.write(b"hello mux").expect("write");
        let frame = SessionFrame { meta: FrameMetadata::keep_data(42), payload: Some(MultiBuffer::from_buffer(payload)) };
        writer.write_frame(&frame).await.expect("write frame");

        let got = reader.read_frame(|id| (id == 42).then_some(Network::Tcp), false).await.expect("read frame");
        assert_eq!(got.meta.session_id, 42);
        assert_eq!(got.payload.expect("payload").to_vec(), b"hello mux");
    }
}
