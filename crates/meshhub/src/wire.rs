//! The binary frame codec.
//!
//! One frame on the wire is a fixed 32-byte header followed by an opaque
//! payload, all integers in network byte order:
//!
//! ```text
//! magic[2] version[1] hdr_len[1] type_fmt[1] flags[1] hop_limit[1] route_flags[1]
//! msg_id[4] source[4] target[4] trace_id[4] timestamp[4] payload_len[4]
//! ```
//!
//! `magic` is a frame-sync guard against misaligned reads. `hdr_len` allows
//! future extension: decoders accept `hdr_len >= 32` and skip the bytes in
//! `[32, hdr_len)`. `type_fmt` packs the message major (bits 0..1) and the
//! sub-protocol number (bits 2..7). `hop_limit` is decremented on every
//! forward; `0` on the wire means "unset" and is normalized to
//! [`DEFAULT_HOP_LIMIT`].

use std::fmt;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MAGIC: u16 = 0x4D48; // "MH"
pub const VERSION: u8 = 2;
pub const HEADER_LEN: usize = 32;
pub const DEFAULT_HOP_LIMIT: u8 = 16;

/// Reserved flag bits. Both are advisory: the core carries them across
/// forwards but implements neither.
pub const FLAG_ACK_REQUIRED: u8 = 1 << 0;
pub const FLAG_COMPRESSED: u8 = 1 << 1;

/// The message major, packed into bits 0..1 of `type_fmt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Major(pub u8);

impl Major {
    pub const OK_RESP: Self = Self(0);
    pub const ERR_RESP: Self = Self(1);
    pub const MSG: Self = Self(2);
    pub const CMD: Self = Self(3);
}

/// The v2 frame header.
///
/// `magic`, `version` and `hdr_len` are owned by the codec: the encoder
/// restamps them (along with `payload_len`) no matter what the caller put in
/// the struct, and the decoder records the observed `hdr_len` so extension
/// headers survive a round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub hdr_len: u8,
    pub type_fmt: u8,
    pub flags: u8,
    pub hop_limit: u8,
    pub route_flags: u8,
    pub msg_id: u32,
    pub source: u32,
    pub target: u32,
    pub trace_id: u32,
    pub timestamp: u32,
    pub payload_len: u32,
}

impl Default for TcpHeader {
    fn default() -> Self {
        Self {
            hdr_len: HEADER_LEN as u8,
            type_fmt: 0,
            flags: 0,
            hop_limit: 0,
            route_flags: 0,
            msg_id: 0,
            source: 0,
            target: 0,
            trace_id: 0,
            timestamp: 0,
            payload_len: 0,
        }
    }
}

impl TcpHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// The message major (bits 0..1 of `type_fmt`).
    pub fn major(&self) -> Major {
        Major(self.type_fmt & 0x03)
    }

    /// The sub-protocol number (bits 2..7 of `type_fmt`), range 0..=63.
    pub fn sub_proto(&self) -> u8 {
        (self.type_fmt >> 2) & 0x3F
    }

    pub fn with_major(mut self, major: Major) -> Self {
        self.type_fmt = (self.type_fmt & !0x03) | (major.0 & 0x03);
        self
    }

    pub fn with_sub_proto(mut self, sub: u8) -> Self {
        self.type_fmt = (self.type_fmt & 0x03) | ((sub & 0x3F) << 2);
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_hop_limit(mut self, hop: u8) -> Self {
        self.hop_limit = hop;
        self
    }

    pub fn with_route_flags(mut self, flags: u8) -> Self {
        self.route_flags = flags;
        self
    }

    pub fn with_msg_id(mut self, id: u32) -> Self {
        self.msg_id = id;
        self
    }

    pub fn with_source(mut self, id: u32) -> Self {
        self.source = id;
        self
    }

    pub fn with_target(mut self, id: u32) -> Self {
        self.target = id;
        self
    }

    pub fn with_trace_id(mut self, id: u32) -> Self {
        self.trace_id = id;
        self
    }

    pub fn with_timestamp(mut self, ts: u32) -> Self {
        self.timestamp = ts;
        self
    }

    /// Clones the header for one forwarding hop, decrementing the hop limit.
    ///
    /// A wire value of `0` counts as [`DEFAULT_HOP_LIMIT`]. Returns `None`
    /// when the effective limit is already spent; the frame must be dropped
    /// instead of forwarded.
    pub fn clone_for_forward(&self) -> Option<TcpHeader> {
        let hop = if self.hop_limit == 0 {
            DEFAULT_HOP_LIMIT
        } else {
            self.hop_limit
        };
        if hop <= 1 {
            return None;
        }
        let mut clone = *self;
        clone.hop_limit = hop - 1;
        Some(clone)
    }
}

/// Builds an `OK_RESP` header answering `req`: source/target swapped,
/// `msg_id` and `trace_id` preserved, timestamp and hop limit restamped.
pub fn build_response(req: &TcpHeader, payload_len: u32, sub: u8) -> TcpHeader {
    let mut resp = *req;
    resp.source = req.target;
    resp.target = req.source;
    resp.hop_limit = DEFAULT_HOP_LIMIT;
    resp.timestamp = unix_now();
    resp.payload_len = payload_len;
    resp.with_major(Major::OK_RESP).with_sub_proto(sub)
}

/// Current unix time in whole seconds, truncated to the header's u32.
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

// ---- codec ----

/// An error surfaced while decoding a frame.
#[derive(Debug)]
#[non_exhaustive]
pub enum FrameError {
    /// The first two bytes were not the v2 magic.
    Magic(u16),
    /// Unsupported header version.
    Version(u8),
    /// `hdr_len` smaller than the fixed 32-byte layout.
    HeaderLen(u8),
    /// Transport failure, including short reads at any stage.
    Io(io::Error),
}

impl FrameError {
    /// True when the error is an ordinary peer disconnect rather than a
    /// protocol violation.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Magic(got) => write!(f, "header magic mismatch (got {got:#06x})"),
            FrameError::Version(got) => write!(f, "header version invalid (got {got})"),
            FrameError::HeaderLen(got) => write!(f, "header length invalid (got {got})"),
            FrameError::Io(e) => write!(f, "frame io error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Encodes the 32-byte header, restamping the codec-owned fields.
///
/// This is the zero-copy fast path used by the per-connection writers: the
/// header is built on the stack and can be written ahead of the payload
/// without concatenating the two.
pub fn encode_header(hdr: &TcpHeader, payload_len: usize) -> [u8; HEADER_LEN] {
    let hop = if hdr.hop_limit == 0 {
        DEFAULT_HOP_LIMIT
    } else {
        hdr.hop_limit
    };
    let mut buf = [0u8; HEADER_LEN];
    buf[0..2].copy_from_slice(&MAGIC.to_be_bytes());
    buf[2] = VERSION;
    buf[3] = HEADER_LEN as u8;
    buf[4] = hdr.type_fmt;
    buf[5] = hdr.flags;
    buf[6] = hop;
    buf[7] = hdr.route_flags;
    buf[8..12].copy_from_slice(&hdr.msg_id.to_be_bytes());
    buf[12..16].copy_from_slice(&hdr.source.to_be_bytes());
    buf[16..20].copy_from_slice(&hdr.target.to_be_bytes());
    buf[20..24].copy_from_slice(&hdr.trace_id.to_be_bytes());
    buf[24..28].copy_from_slice(&hdr.timestamp.to_be_bytes());
    buf[28..32].copy_from_slice(&(payload_len as u32).to_be_bytes());
    buf
}

/// Encodes `[header || payload]` into one buffer.
pub fn encode_frame(hdr: &TcpHeader, payload: &[u8]) -> Vec<u8> {
    let head = encode_header(hdr, payload.len());
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&head);
    buf.extend_from_slice(payload);
    buf
}

/// Reads one frame: the 4-byte prefix, the remaining (possibly extended)
/// header, then exactly `payload_len` payload bytes.
///
/// Validation failures surface as [`FrameError::Magic`] /
/// [`FrameError::Version`] / [`FrameError::HeaderLen`] without consuming any
/// payload bytes; a short read at any stage surfaces the underlying
/// [`io::Error`] unchanged.
pub async fn read_frame<R>(r: &mut R) -> Result<(TcpHeader, Bytes), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    r.read_exact(&mut prefix).await?;
    let magic = u16::from_be_bytes([prefix[0], prefix[1]]);
    if magic != MAGIC {
        return Err(FrameError::Magic(magic));
    }
    if prefix[2] != VERSION {
        return Err(FrameError::Version(prefix[2]));
    }
    let hdr_len = prefix[3];
    if (hdr_len as usize) < HEADER_LEN {
        return Err(FrameError::HeaderLen(hdr_len));
    }

    // The rest of the header, extension area included. Extension bytes are
    // read and ignored.
    let mut rest = vec![0u8; hdr_len as usize - 4];
    r.read_exact(&mut rest).await?;

    let hop = rest[2];
    let hdr = TcpHeader {
        hdr_len,
        type_fmt: rest[0],
        flags: rest[1],
        hop_limit: if hop == 0 { DEFAULT_HOP_LIMIT } else { hop },
        route_flags: rest[3],
        msg_id: be32(&rest[4..8]),
        source: be32(&rest[8..12]),
        target: be32(&rest[12..16]),
        trace_id: be32(&rest[16..20]),
        timestamp: be32(&rest[20..24]),
        payload_len: be32(&rest[24..28]),
    };

    if hdr.payload_len == 0 {
        return Ok((hdr, Bytes::new()));
    }
    let mut payload = vec![0u8; hdr.payload_len as usize];
    r.read_exact(&mut payload).await?;
    Ok((hdr, Bytes::from(payload)))
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}
