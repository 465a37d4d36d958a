//! HTTP/2 logical streams
//!
//! An `H2Stream` is one request/response exchange inside a connection. It
//! implements `HioStream`, so the application handler talks to it exactly as
//! it would to a socket. Output written by the handler is buffered on the
//! stream; the connection engine serializes it into frames when the
//! priority scheduler gives the stream its turn.

use super::error::ErrorCode;
use super::flow_control::FlowControlWindow;
use crate::hio::stream::StreamCore;
use crate::hio::{ConnInfo, Error, HioFlags, HioProtocol, HioState, HioStream, Result};
use crate::http::headers::{Headers, RespHeaders};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::fs::File;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Stream ID type
pub type StreamId = u32;

/// Stream state as defined in RFC 7540 Section 5.1
///
/// Streams are created open, or half-closed (remote) when the request
/// arrived complete or was promised by us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Open: Both sides can send frames
    Open,
    /// Half-closed (local): We can't send, they can
    HalfClosedLocal,
    /// Half-closed (remote): They can't send, we can
    HalfClosedRemote,
    /// Closed: Stream is closed
    Closed,
}

impl StreamState {
    /// Check if stream can send data
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Check if stream can receive data
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// Output queued by the handler, not yet framed
#[derive(Debug)]
enum Pending {
    Headers {
        fields: Vec<(String, String)>,
        end_stream: bool,
    },
    Data(Bytes),
    File {
        file: Arc<File>,
        offset: u64,
        len: usize,
    },
    /// END_STREAM after everything queued before it
    End,
}

/// Next piece of output handed to the connection for framing
#[derive(Debug)]
pub enum StreamOutput {
    Headers {
        fields: Vec<(String, String)>,
        end_stream: bool,
    },
    Data {
        data: Bytes,
        end_stream: bool,
    },
    File {
        file: Arc<File>,
        offset: u64,
        len: usize,
        end_stream: bool,
    },
}

/// A push requested by the handler, decided by the connection after the
/// callback returns
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub url: String,
    pub host: String,
    pub headers: Headers,
}

/// One logical stream of a connection
pub struct H2Stream {
    core: StreamCore,
    id: StreamId,
    stream_state: StreamState,
    send_window: FlowControlWindow,
    recv_window: FlowControlWindow,
    req_headers: Option<Headers>,
    trailers: Option<Headers>,
    input: BytesMut,
    /// Bytes consumed since the last stream WINDOW_UPDATE
    unacked: u32,
    pending: VecDeque<Pending>,
    /// Body bytes buffered in `pending`
    pending_bytes: usize,
    /// Items ever queued, lets the engine tell whether a callback produced
    /// output
    queued: u64,
    buf_limit: usize,
    headers_queued: bool,
    end_queued: bool,
    reset: Option<ErrorCode>,
    push_requests: Vec<PushRequest>,
    write_wakeup: bool,
}

impl H2Stream {
    /// Create a stream in `state`
    ///
    /// `send_window` is the peer's initial window size, `recv_window` ours.
    pub fn new(
        id: StreamId,
        state: StreamState,
        conn_info: Arc<ConnInfo>,
        send_window: u32,
        recv_window: u32,
        buf_limit: usize,
    ) -> Self {
        let mut stream = H2Stream {
            core: StreamCore::new(conn_info),
            id,
            stream_state: state,
            send_window: FlowControlWindow::with_initial_size(send_window),
            recv_window: FlowControlWindow::with_initial_size(recv_window),
            req_headers: None,
            trailers: None,
            input: BytesMut::new(),
            unacked: 0,
            pending: VecDeque::new(),
            pending_bytes: 0,
            queued: 0,
            buf_limit,
            headers_queued: false,
            end_queued: false,
            reset: None,
            push_requests: Vec::new(),
            write_wakeup: false,
        };
        stream.set_protocol(HioProtocol::Http2);
        stream.set_flag(HioFlags::FLOWCTRL, true);
        stream.set_state(HioState::Connected);
        stream.set_active_time(Instant::now());
        if !state.can_receive() {
            stream.set_flag(HioFlags::PEER_SHUTDOWN, true);
        }
        stream
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream_state
    }

    pub fn set_req_headers(&mut self, headers: Headers) {
        self.req_headers = Some(headers);
    }

    /// Trailing header block received after the request body
    pub fn trailers(&self) -> Option<&Headers> {
        self.trailers.as_ref()
    }

    pub fn set_trailers(&mut self, trailers: Headers) {
        self.trailers = Some(trailers);
    }

    pub fn send_window(&self) -> &FlowControlWindow {
        &self.send_window
    }

    pub fn send_window_mut(&mut self) -> &mut FlowControlWindow {
        &mut self.send_window
    }

    pub fn recv_window(&self) -> &FlowControlWindow {
        &self.recv_window
    }

    /// True once the peer has finished its side
    pub fn is_peer_closed(&self) -> bool {
        !self.stream_state.can_receive()
    }

    /// True once END_STREAM or RST_STREAM has been framed
    pub fn is_local_closed(&self) -> bool {
        !self.stream_state.can_send()
    }

    /// Charge a received DATA payload (padding included) to the stream
    /// window
    pub fn charge_recv(&mut self, len: usize) -> super::Result<()> {
        self.recv_window.receive(len)
    }

    /// Buffer request body bytes
    pub fn recv_data(&mut self, data: &[u8]) {
        self.input.extend_from_slice(data);
        self.set_active_time(Instant::now());
    }

    /// Count bytes that never reach the handler (padding) as consumed
    pub fn ack_unread(&mut self, len: usize) {
        self.unacked = self.unacked.saturating_add(len as u32);
    }

    /// The peer finished its side with END_STREAM
    pub fn recv_end_stream(&mut self) {
        self.stream_state = match self.stream_state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
        self.set_flag(HioFlags::PEER_SHUTDOWN, true);
    }

    /// The peer reset the stream
    pub fn recv_reset(&mut self) {
        self.stream_state = StreamState::Closed;
        self.set_flag(HioFlags::PEER_RESET | HioFlags::PEER_SHUTDOWN, true);
        self.set_state(HioState::Reset);
        self.discard_output();
    }

    /// Increment for a stream WINDOW_UPDATE, if one is due
    pub fn take_window_update(&mut self) -> Option<u32> {
        if self.is_peer_closed() {
            return None;
        }
        let increment = self.recv_window.update_due(self.unacked)?;
        // recv window only ever shrinks by what the peer sent
        self.recv_window.increase(increment).ok()?;
        self.unacked = 0;
        Some(increment)
    }

    /// Abort the stream locally with `code`
    pub fn reset(&mut self, code: ErrorCode) {
        if self.reset.is_none() {
            debug!(stream_id = self.id, %code, "stream reset");
        }
        self.reset = Some(code);
        self.stream_state = StreamState::Closed;
        self.set_state(HioState::Reset);
        self.discard_output();
    }

    /// Error code of a local reset not yet sent
    pub fn pending_reset(&self) -> Option<ErrorCode> {
        self.reset
    }

    /// True when the stream can be dropped from the stream table
    pub fn is_finished(&self) -> bool {
        if self.reset.is_some() || self.stream_state.is_closed() {
            return self.pending.is_empty();
        }
        // response complete and nobody left to read the rest of the request
        self.is_local_closed() && !self.has_handler()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Body bytes buffered for sending
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn queued_items(&self) -> u64 {
        self.queued
    }

    /// True when the next queued item is DATA that needs window credit
    pub fn next_is_data(&self) -> bool {
        matches!(self.pending.front(), Some(Pending::Data(_) | Pending::File { .. }))
    }

    /// True if the handler asked to be told about room to write
    pub fn take_write_wakeup(&mut self) -> bool {
        std::mem::take(&mut self.write_wakeup)
    }

    pub fn take_push_requests(&mut self) -> Vec<PushRequest> {
        std::mem::take(&mut self.push_requests)
    }

    /// Hand the next piece of output to the framer
    ///
    /// `allowed` bounds how many body bytes may go out now. Headers are not
    /// flow controlled. END_STREAM rides on the last DATA frame when the end
    /// marker directly follows it.
    pub fn take_output(&mut self, allowed: usize) -> Option<StreamOutput> {
        let item = self.pending.pop_front()?;
        match item {
            Pending::Headers { fields, end_stream } => {
                if end_stream {
                    self.local_end();
                }
                Some(StreamOutput::Headers { fields, end_stream })
            }
            Pending::End => {
                self.local_end();
                Some(StreamOutput::Data {
                    data: Bytes::new(),
                    end_stream: true,
                })
            }
            Pending::Data(mut data) => {
                if allowed == 0 {
                    self.pending.push_front(Pending::Data(data));
                    return None;
                }
                let chunk = if data.len() > allowed {
                    let chunk = data.split_to(allowed);
                    self.pending.push_front(Pending::Data(data));
                    chunk
                } else {
                    data
                };
                self.pending_bytes -= chunk.len();
                let end_stream = self.take_end_marker();
                Some(StreamOutput::Data {
                    data: chunk,
                    end_stream,
                })
            }
            Pending::File { file, offset, len } => {
                if allowed == 0 {
                    self.pending.push_front(Pending::File { file, offset, len });
                    return None;
                }
                let n = len.min(allowed);
                if n < len {
                    self.pending.push_front(Pending::File {
                        file: file.clone(),
                        offset: offset + n as u64,
                        len: len - n,
                    });
                }
                self.pending_bytes -= n;
                let end_stream = self.take_end_marker();
                Some(StreamOutput::File {
                    file,
                    offset,
                    len: n,
                    end_stream,
                })
            }
        }
    }

    fn take_end_marker(&mut self) -> bool {
        if matches!(self.pending.front(), Some(Pending::End)) {
            self.pending.pop_front();
            self.local_end();
            true
        } else {
            false
        }
    }

    fn local_end(&mut self) {
        self.stream_state = match self.stream_state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
        self.set_flag(HioFlags::LOCAL_SHUTDOWN, true);
    }

    fn enqueue(&mut self, item: Pending) {
        self.pending.push_back(item);
        self.queued += 1;
    }

    fn discard_output(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
        self.push_requests.clear();
    }

    fn check_writable(&self) -> Result<()> {
        if self.reset.is_some() || self.end_queued || self.state() >= HioState::Shutdown {
            return Err(Error::ConnectionClosed);
        }
        if !self.headers_queued {
            return Err(Error::Protocol("response body before response headers".to_string()));
        }
        Ok(())
    }

    fn room(&self) -> usize {
        self.buf_limit.saturating_sub(self.pending_bytes)
    }
}

impl HioStream for H2Stream {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StreamCore {
        &mut self.core
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.input.is_empty() {
            if self.is_peer_closed() || self.reset.is_some() {
                return Err(Error::ConnectionClosed);
            }
            return Ok(0);
        }
        let n = buf.len().min(self.input.len());
        buf[..n].copy_from_slice(&self.input[..n]);
        self.input.advance(n);
        self.ack_unread(n);
        self.add_bytes_recv(n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check_writable()?;
        let n = buf.len().min(self.room());
        if n == 0 {
            return Ok(0);
        }
        self.enqueue(Pending::Data(Bytes::copy_from_slice(&buf[..n])));
        self.pending_bytes += n;
        self.add_bytes_sent(n);
        self.set_active_time(Instant::now());
        Ok(n)
    }

    fn sendfile(&mut self, file: &Arc<File>, offset: u64, len: usize) -> Result<usize> {
        self.check_writable()?;
        let n = len.min(self.room());
        if n == 0 {
            return Ok(0);
        }
        self.enqueue(Pending::File {
            file: file.clone(),
            offset,
            len: n,
        });
        self.pending_bytes += n;
        self.add_bytes_sent(n);
        self.set_active_time(Instant::now());
        Ok(n)
    }

    /// The first call queues the response head; a later call queues
    /// trailers and ends the stream
    fn send_resp_headers(&mut self, headers: &RespHeaders, no_body: bool) -> Result<()> {
        if self.reset.is_some() || self.end_queued {
            return Err(Error::ConnectionClosed);
        }
        let (fields, end_stream) = if self.headers_queued {
            let trailers = headers
                .headers()
                .iter()
                .map(|(n, v)| (n.to_ascii_lowercase(), v.to_string()))
                .collect();
            (trailers, true)
        } else {
            (headers.field_list(), no_body)
        };
        self.headers_queued = true;
        if end_stream {
            self.end_queued = true;
            self.set_state(HioState::Shutdown);
        }
        self.enqueue(Pending::Headers { fields, end_stream });
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.state() >= HioState::Shutdown {
            return Ok(());
        }
        debug!(stream_id = self.id, "stream shutdown");
        self.set_state(HioState::Shutdown);
        if self.reset.is_some() || self.end_queued {
            return Ok(());
        }
        if !self.headers_queued {
            // nothing was ever answered
            self.reset(ErrorCode::Cancel);
            return Ok(());
        }
        self.end_queued = true;
        self.enqueue(Pending::End);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.is_aborted() && !self.is_local_closed() {
            self.reset(ErrorCode::Cancel);
        } else {
            self.shutdown()?;
        }
        self.release_handler();
        Ok(())
    }

    fn suspend_read(&mut self) {}

    fn continue_read(&mut self) {}

    fn suspend_write(&mut self) {}

    fn continue_write(&mut self) {
        self.write_wakeup = true;
    }

    fn push(&mut self, url: &str, host: &str, headers: &Headers) -> Result<()> {
        if !self.is_flag(HioFlags::PUSH_CAPABLE) {
            return Err(Error::PushRefused("stream is not push capable".to_string()));
        }
        self.push_requests.push(PushRequest {
            url: url.to_string(),
            host: host.to_string(),
            headers: headers.clone(),
        });
        Ok(())
    }

    fn req_headers(&self) -> Option<&Headers> {
        self.req_headers.as_ref()
    }
}
