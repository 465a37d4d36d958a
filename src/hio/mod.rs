//! Transport-agnostic stream abstraction
//!
//! A `HioStream` is one bidirectional stream of a connection: a whole TCP
//! connection, a logical HTTP/2 stream, or one stream of a multi-stream
//! secure transport. Protocol code is written against the `HioStream` trait
//! and a `HioHandler` bound to it, so the same handler runs on every variant.
//!
//! # Architecture
//!
//! - `StreamCore` holds the state shared by all variants (state, flags,
//!   priority, counters, connection info, handler slot)
//! - `HioStream` is the capability trait implemented per transport
//! - `HioHandler` receives lifecycle callbacks through `dispatch()`
//! - `Transport` is the raw byte-oriented boundary used by `ByteStream`

pub mod byte_stream;
pub mod handler;
pub mod quic;
pub mod stream;
pub mod transport;

pub use byte_stream::ByteStream;
pub use handler::{HandlerFactory, HioEvent, HioHandler};
pub use quic::{QuicStream, QuicStreamOps};
pub use stream::{dispatch, HioStream, StreamCore};
pub use transport::{Interest, TcpTransport, Transport};

use std::fmt;
use std::net::SocketAddr;

/// Result type for stream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stream operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Stream not connected")]
    NotConnected,

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Push refused: {0}")]
    PushRefused(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Stream lifecycle state
///
/// Ordered: a stream only moves forward through
/// `Connected -> Closing -> Shutdown`, or jumps to `Reset` when the peer
/// aborts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HioState {
    Disconnected,
    Connected,
    Closing,
    Shutdown,
    Reset,
}

/// Application protocol carried by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HioProtocol {
    Http = 0,
    Spdy2 = 1,
    Spdy3 = 2,
    Spdy31 = 3,
    Http2 = 4,
    Quic = 5,
}

static PROTOCOL_NAMES: [&str; 6] = ["http/1.1", "spdy/2", "spdy/3", "spdy/3.1", "h2", "quic"];

impl HioProtocol {
    /// ALPN-style protocol name
    pub fn name(self) -> &'static str {
        PROTOCOL_NAMES[self as usize]
    }

    /// True for every multiplexed protocol
    pub fn is_multiplexed(self) -> bool {
        !matches!(self, HioProtocol::Http)
    }
}

impl fmt::Display for HioProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Highest scheduling priority
pub const PRIORITY_HIGHEST: u8 = 0;
/// Lowest scheduling priority
pub const PRIORITY_LOWEST: u8 = 7;
pub const PRIORITY_HTML: u8 = 2;
pub const PRIORITY_CSS: u8 = PRIORITY_HTML + 1;
pub const PRIORITY_JS: u8 = PRIORITY_CSS + 1;
pub const PRIORITY_IMAGE: u8 = PRIORITY_JS + 1;
pub const PRIORITY_DOWNLOAD: u8 = PRIORITY_IMAGE + 1;
pub const PRIORITY_PUSH: u8 = PRIORITY_DOWNLOAD + 1;
pub const PRIORITY_LARGEFILE: u8 = PRIORITY_LOWEST;

/// Number of distinct priority levels
pub const PRIORITY_LEVELS: usize = (PRIORITY_LOWEST - PRIORITY_HIGHEST) as usize + 1;

/// Stream flag bitset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HioFlags(u32);

impl HioFlags {
    pub const PEER_SHUTDOWN: u32 = 1 << 0;
    pub const LOCAL_SHUTDOWN: u32 = 1 << 1;
    pub const WANT_READ: u32 = 1 << 2;
    pub const WANT_WRITE: u32 = 1 << 3;
    pub const ABORT: u32 = 1 << 4;
    pub const PEER_RESET: u32 = 1 << 5;
    pub const HANDLER_RELEASE: u32 = 1 << 6;
    pub const FLOWCTRL: u32 = 1 << 8;
    pub const FROM_LOCAL: u32 = 1 << 12;
    pub const PUSH_CAPABLE: u32 = 1 << 13;
    pub const IS_PUSH: u32 = 1 << 15;
    pub const WRITE_BUFFER: u32 = 1 << 16;
    pub const SENDFILE: u32 = 1 << 17;
    pub const PRI_SET: u32 = 1 << 19;

    /// Create empty flags
    pub fn empty() -> Self {
        HioFlags(0)
    }

    /// Raw bits
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Set or clear the given bits
    pub fn set(&mut self, flag: u32, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }

    /// Check if any of the given bits is set
    pub fn is_set(&self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }
}

/// Crypto environment values a secure transport can report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoEnv {
    Version,
    SessionId,
    ClientCert,
    Cipher,
    CipherUseKeySize,
    CipherAlgKeySize,
    TransportProtocolVersion,
}

/// Connection-level information shared by every stream of a connection
#[derive(Debug, Clone, Default)]
pub struct ConnInfo {
    /// Peer address
    pub client_addr: Option<SocketAddr>,
    /// Local address the connection was accepted on
    pub server_addr: Option<SocketAddr>,
    /// Whether the connection is encrypted
    pub secure: bool,
}

impl ConnInfo {
    /// Create connection info from the two socket addresses
    pub fn new(client_addr: SocketAddr, server_addr: SocketAddr) -> Self {
        ConnInfo {
            client_addr: Some(client_addr),
            server_addr: Some(server_addr),
            secure: false,
        }
    }

    /// Remote port, 0 if unknown
    pub fn remote_port(&self) -> u16 {
        self.client_addr.map(|a| a.port()).unwrap_or(0)
    }
}
