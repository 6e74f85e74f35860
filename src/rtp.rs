//! RTP media handling: the 12-byte header codec, port allocation, and the
//! per-session UDP endpoint.
//!
//! Only G.711 µ-law (payload type 0, 8 kHz, 20 ms frames) is negotiated, so
//! payloads pass through opaque; no codec work happens here.

use bytes::{BufMut, BytesMut};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// Fixed header length stripped from inbound packets and prepended to
/// outbound ones.
pub const RTP_HEADER_LEN: usize = 12;

/// RTP payload type for PCMU
pub const PAYLOAD_TYPE_PCMU: u8 = 0;

/// Samples per 20 ms frame at 8 kHz
pub const SAMPLES_PER_FRAME: u32 = 160;

#[derive(Error, Debug)]
pub enum RtpError {
    #[error("no RTP port available in range {min}-{max}")]
    Exhausted { min: u16, max: u16 },

    #[error("RTP packet too short: {0} bytes")]
    PacketTooShort(usize),

    #[error("invalid RTP version: {0}")]
    InvalidVersion(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// RTP packet header (RFC 3550)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Serialize to the 12-byte wire form
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN);

        let first_byte = (self.version << 6)
            | ((self.padding as u8) << 5)
            | ((self.extension as u8) << 4)
            | self.csrc_count;
        buf.put_u8(first_byte);

        let second_byte = ((self.marker as u8) << 7) | self.payload_type;
        buf.put_u8(second_byte);

        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        buf
    }

    /// Parse the wire form; returns the header and its total length
    /// including CSRC entries.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), RtpError> {
        if data.len() < RTP_HEADER_LEN {
            return Err(RtpError::PacketTooShort(data.len()));
        }

        let first_byte = data[0];
        let version = first_byte >> 6;
        if version != 2 {
            return Err(RtpError::InvalidVersion(version));
        }

        let second_byte = data[1];
        let header = Self {
            version,
            padding: (first_byte >> 5) & 1 == 1,
            extension: (first_byte >> 4) & 1 == 1,
            csrc_count: first_byte & 0x0F,
            marker: (second_byte >> 7) & 1 == 1,
            payload_type: second_byte & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        };

        let header_len = RTP_HEADER_LEN + header.csrc_count as usize * 4;
        Ok((header, header_len))
    }
}

/// Allocates RTP ports from a configured inclusive range.
///
/// There is no free-list: allocation scans ascending and the first
/// successful bind wins, so the OS refusing a bind is the single source of
/// truth for "in use". The bound socket is the allocation token and
/// dropping it releases the port.
#[derive(Debug, Clone, Copy)]
pub struct PortPool {
    min: u16,
    max: u16,
}

impl PortPool {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    /// Bind the first free port in the range
    pub async fn allocate(&self) -> Result<(UdpSocket, u16), RtpError> {
        for port in self.min..=self.max {
            match UdpSocket::bind(("0.0.0.0", port)).await {
                Ok(socket) => {
                    debug!("allocated RTP port {port}");
                    return Ok((socket, port));
                }
                Err(_) => continue,
            }
        }
        Err(RtpError::Exhausted {
            min: self.min,
            max: self.max,
        })
    }
}

/// Per-session RTP socket. The remote peer address is learned from the
/// first inbound packet; until then outbound audio is dropped.
pub struct RtpEndpoint {
    socket: Arc<UdpSocket>,
    port: u16,
    remote: Mutex<Option<SocketAddr>>,
    ssrc: u32,
    timestamp: AtomicU32,
}

impl RtpEndpoint {
    pub fn new(socket: UdpSocket, port: u16) -> Self {
        Self {
            socket: Arc::new(socket),
            port,
            remote: Mutex::new(None),
            ssrc: rand::thread_rng().gen(),
            timestamp: AtomicU32::new(0),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Record the peer address from the first inbound packet
    pub fn learn_remote(&self, addr: SocketAddr) {
        let mut remote = self.remote.lock().unwrap();
        if remote.is_none() {
            info!("learned remote RTP address: {addr}");
            *remote = Some(addr);
        }
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        *self.remote.lock().unwrap()
    }

    /// Prepend a minimal PCMU header and send to the learned peer. Packets
    /// are dropped while no peer is known. The timestamp advances one frame
    /// per packet.
    pub async fn send_payload(&self, payload: &[u8], sequence: u16) -> Result<(), RtpError> {
        let Some(remote) = self.remote() else {
            debug!("dropping outbound RTP: remote address not yet learned");
            return Ok(());
        };

        let timestamp = self.timestamp.fetch_add(SAMPLES_PER_FRAME, Ordering::Relaxed);
        let header = RtpHeader::new(PAYLOAD_TYPE_PCMU, sequence, timestamp, self.ssrc);

        let mut packet = header.to_bytes();
        packet.extend_from_slice(payload);

        self.socket.send_to(&packet, remote).await?;
        Ok(())
    }
}
