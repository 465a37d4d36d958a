//! HTTP support for multiplexed streams
//!
//! - `headers`: request and response header lists shared by every stream
//!   variant
//! - `h2`: the HTTP/2 connection engine, which turns one transport stream
//!   into many `HioStream`s
//!
//! Application handlers never see frames. They read the request through
//! `HioStream::req_headers` and `read`, and answer with
//! `send_resp_headers`, `write` and `close`; the same handler serves an
//! HTTP/2 stream or a stream of any other multiplexed transport.

pub mod h2;
pub mod headers;

pub use headers::{Headers, RespHeaders};
