//! HTTP/2 error types
//!
//! This module defines error types for the HTTP/2 engine, mapping to
//! the error codes defined in RFC 7540 Section 7.

use crate::hio;
use std::fmt;

/// HTTP/2 errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by the underlying stream
    #[error("Stream I/O error: {0}")]
    Hio(#[from] hio::Error),

    /// Protocol error detected (RFC 7540 Section 7 - Error code 0x1)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Internal error (RFC 7540 Section 7 - Error code 0x2)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Flow control error (RFC 7540 Section 7 - Error code 0x3)
    #[error("Flow control error: {0}")]
    FlowControl(String),

    /// Settings timeout (RFC 7540 Section 7 - Error code 0x4)
    #[error("Settings timeout")]
    SettingsTimeout,

    /// Stream closed (RFC 7540 Section 7 - Error code 0x5)
    #[error("Stream closed: {0}")]
    StreamClosed(u32),

    /// Frame size error (RFC 7540 Section 7 - Error code 0x6)
    #[error("Frame size error: {0}")]
    FrameSize(String),

    /// Refused stream (RFC 7540 Section 7 - Error code 0x7)
    #[error("Refused stream: {0}")]
    RefusedStream(u32),

    /// Stream cancelled (RFC 7540 Section 7 - Error code 0x8)
    #[error("Stream cancelled: {0}")]
    Cancel(u32),

    /// Compression error (RFC 7540 Section 7 - Error code 0x9)
    #[error("Compression error: {0}")]
    Compression(String),

    /// Connect error (RFC 7540 Section 7 - Error code 0xa)
    #[error("Connect error: {0}")]
    Connect(String),

    /// Enhance your calm (RFC 7540 Section 7 - Error code 0xb)
    #[error("Enhance your calm: {0}")]
    EnhanceYourCalm(String),

    /// Inadequate security (RFC 7540 Section 7 - Error code 0xc)
    #[error("Inadequate security: {0}")]
    InadequateSecurity(String),

    /// HTTP/1.1 required (RFC 7540 Section 7 - Error code 0xd)
    #[error("HTTP/1.1 required")]
    Http11Required,

    /// Invalid stream ID
    #[error("Invalid stream ID: {0}")]
    InvalidStreamId(u32),

    /// Stream not found
    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    /// Too many streams
    #[error("Too many concurrent streams")]
    TooManyStreams,

    /// Invalid settings value
    #[error("Invalid settings value: {0}")]
    InvalidSettings(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Missing connection preface
    #[error("Missing connection preface")]
    MissingPreface,

    /// Invalid header
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
}

impl Error {
    /// Error code this error is reported with on the wire
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Io(_) | Error::Hio(_) | Error::Internal(_) => ErrorCode::InternalError,
            Error::Protocol(_)
            | Error::InvalidStreamId(_)
            | Error::InvalidSettings(_)
            | Error::MissingPreface
            | Error::InvalidHeader(_) => ErrorCode::ProtocolError,
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::SettingsTimeout => ErrorCode::SettingsTimeout,
            Error::StreamClosed(_) | Error::StreamNotFound(_) => ErrorCode::StreamClosed,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::RefusedStream(_) | Error::TooManyStreams => ErrorCode::RefusedStream,
            Error::Cancel(_) | Error::ConnectionClosed => ErrorCode::Cancel,
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::Connect(_) => ErrorCode::ConnectError,
            Error::EnhanceYourCalm(_) => ErrorCode::EnhanceYourCalm,
            Error::InadequateSecurity(_) => ErrorCode::InadequateSecurity,
            Error::Http11Required => ErrorCode::Http11Required,
        }
    }

    /// True if the error tears down the whole connection rather than a
    /// single stream
    pub fn is_connection_error(&self) -> bool {
        !matches!(
            self,
            Error::StreamClosed(_)
                | Error::RefusedStream(_)
                | Error::Cancel(_)
                | Error::StreamNotFound(_)
                | Error::TooManyStreams
                | Error::InvalidHeader(_)
        )
    }
}

impl From<Error> for hio::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Hio(inner) => inner,
            Error::Io(io) => hio::Error::Io(io),
            Error::ConnectionClosed => hio::Error::ConnectionClosed,
            other => hio::Error::Protocol(other.to_string()),
        }
    }
}

/// HTTP/2 error codes as defined in RFC 7540 Section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError = 0x0,
    /// Protocol error detected
    ProtocolError = 0x1,
    /// Implementation fault
    InternalError = 0x2,
    /// Flow-control limits exceeded
    FlowControlError = 0x3,
    /// Settings not acknowledged
    SettingsTimeout = 0x4,
    /// Frame received for closed stream
    StreamClosed = 0x5,
    /// Frame size incorrect
    FrameSizeError = 0x6,
    /// Stream not processed
    RefusedStream = 0x7,
    /// Stream cancelled
    Cancel = 0x8,
    /// Compression state not updated
    CompressionError = 0x9,
    /// TCP connection error for CONNECT method
    ConnectError = 0xa,
    /// Processing capacity exceeded
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS parameters not acceptable
    InadequateSecurity = 0xc,
    /// Use HTTP/1.1 for the request
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Convert error code to u32
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Create error code from u32
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0x0 => Some(ErrorCode::NoError),
            0x1 => Some(ErrorCode::ProtocolError),
            0x2 => Some(ErrorCode::InternalError),
            0x3 => Some(ErrorCode::FlowControlError),
            0x4 => Some(ErrorCode::SettingsTimeout),
            0x5 => Some(ErrorCode::StreamClosed),
            0x6 => Some(ErrorCode::FrameSizeError),
            0x7 => Some(ErrorCode::RefusedStream),
            0x8 => Some(ErrorCode::Cancel),
            0x9 => Some(ErrorCode::CompressionError),
            0xa => Some(ErrorCode::ConnectError),
            0xb => Some(ErrorCode::EnhanceYourCalm),
            0xc => Some(ErrorCode::InadequateSecurity),
            0xd => Some(ErrorCode::Http11Required),
            _ => None,
        }
    }

    /// Get error name
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;
