//! HTTP/2 connection engine
//!
//! This module multiplexes many logical streams over one transport stream.
//! `H2Connection` is a `HioHandler`: it is bound to the transport-level
//! stream and turns readiness callbacks into frame processing. Every
//! request becomes an `H2Stream`, itself a `HioStream`, with an application
//! handler obtained from a `HandlerFactory`.
//!
//! # Architecture
//!
//! - `frames` / `codec`: wire frame types, frame serialization, HPACK
//! - `settings` / `config`: peer parameters and local tunables
//! - `flow_control`: send and receive windows
//! - `priority` / `output`: scheduling queues and the output buffer
//! - `stream`: per-request state, buffered input and output
//! - `connection`: the frame state machine tying it together
//!
//! The engine does no I/O of its own beyond the `HioStream` it is handed on
//! each callback, so it can be driven by any event loop.
//!
//! # Example
//!
//! ```no_run
//! use hiomux::hio::{ByteStream, ConnInfo, HioProtocol, HioStream, TcpTransport};
//! use hiomux::http::h2::{H2Config, H2Connection};
//! use std::net::TcpListener;
//! use std::sync::Arc;
//!
//! # fn example(factory: Arc<dyn hiomux::hio::HandlerFactory>) -> Result<(), Box<dyn std::error::Error>> {
//! let listener = TcpListener::bind("127.0.0.1:8080")?;
//! let (socket, peer) = listener.accept()?;
//! let info = Arc::new(ConnInfo::new(peer, socket.local_addr()?));
//! let mut stream = ByteStream::new(TcpTransport::new(socket)?, info)
//!     .with_protocol(HioProtocol::Http2);
//! stream.attach(Box::new(H2Connection::new(Arc::new(H2Config::default()), factory)));
//! stream.on_init()?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod output;
pub mod priority;
pub mod settings;
pub mod stream;

pub use codec::{FrameCodec, HeaderCodec, HpackCodec};
pub use config::{H2Config, H2ConfigBuilder};
pub use connection::H2Connection;
pub use error::{Error, ErrorCode, Result};
pub use frames::{FrameFlags, FrameHeader, FrameType, PrioritySpec};
pub use settings::{Settings, SettingsBuilder};
pub use stream::{H2Stream, StreamId, StreamState};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Largest frame size a peer may advertise (2^24 - 1)
pub const MAX_FRAME_SIZE_LIMIT: u32 = 16_777_215;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Largest flow control window (2^31 - 1)
pub const MAX_WINDOW_SIZE: u32 = 0x7FFFFFFF;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

