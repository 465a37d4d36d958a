//! hiomux - multiplexed-stream protocol engine
//!
//! This crate provides a transport-agnostic per-stream abstraction (`hio`)
//! and an HTTP/2 connection engine (`http::h2`) that multiplexes many logical
//! request/response streams over one ordered byte-stream connection.

pub mod hio;
pub mod http;
pub mod net;
