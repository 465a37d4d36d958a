//! HTTP/2 connection engine
//!
//! `H2Connection` is the handler bound to a transport-level stream. Each
//! readable event appends transport bytes to the input buffer and parses as
//! many whole frames as are buffered; a partial frame waits for the next
//! event. Frames are applied in arrival order, and every callback ends with
//! one pump of the output path: the priority scheduler moves buffered
//! stream output into frames, and the output buffer is flushed to the
//! transport as a unit.
//!
//! Errors follow two severities. Stream errors reset one logical stream
//! with RST_STREAM and the connection carries on. Connection errors send
//! GOAWAY with the matching code (none for a missing preface or a failed
//! transport), release every stream and close the transport.

use super::codec::{FrameCodec, HeaderCodec, HpackCodec, FRAME_HEADER_SIZE};
use super::config::H2Config;
use super::error::{Error, ErrorCode, Result};
use super::flow_control::FlowControlWindow;
use super::frames::*;
use super::output::OutputBuffer;
use super::priority::PriorityQueues;
use super::settings::Settings;
use super::stream::{H2Stream, PushRequest, StreamOutput, StreamState};
use super::{CONNECTION_PREFACE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, MAX_STREAM_ID};
use crate::hio::{
    self, dispatch, ConnInfo, HandlerFactory, HioEvent, HioFlags, HioHandler, HioProtocol, HioStream,
    PRIORITY_PUSH,
};
use crate::http::headers::Headers;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Bytes read from the transport per call
const READ_CHUNK: usize = 16384;

/// Opaque payload of keepalive PINGs
const KEEPALIVE_PING: [u8; 8] = *b"hiomuxka";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingPreface,
    Established,
    Closed,
}

#[derive(Debug, Default, Clone, Copy)]
struct ConnFlags {
    goaway_sent: bool,
    goaway_recv: bool,
    settings_acked: bool,
    pause_read: bool,
    /// a write-buffer transport crossed the threshold; produce nothing
    /// until the output buffer is empty again
    drain_to_zero: bool,
}

/// Parameters advertised by the peer
#[derive(Debug, Clone, Copy)]
struct PeerSettings {
    max_frame_size: u32,
    initial_window_size: u32,
    enable_push: bool,
    max_concurrent_streams: Option<u32>,
}

impl Default for PeerSettings {
    fn default() -> Self {
        PeerSettings {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            enable_push: true,
            max_concurrent_streams: None,
        }
    }
}

/// Header block collected across HEADERS and CONTINUATION
#[derive(Debug)]
struct PendingBlock {
    stream_id: u32,
    end_stream: bool,
    priority: Option<PrioritySpec>,
    buf: Vec<u8>,
}

/// Server side HTTP/2 connection
pub struct H2Connection {
    config: Arc<H2Config>,
    factory: Arc<dyn HandlerFactory>,
    hpack: HpackCodec,
    conn_info: Arc<ConnInfo>,
    phase: Phase,
    flags: ConnFlags,
    peer: PeerSettings,
    inbuf: BytesMut,
    block: Option<PendingBlock>,
    streams: HashMap<u32, H2Stream>,
    /// Last peer stream handed to a handler, reported in GOAWAY
    last_peer_stream_id: u32,
    /// Highest stream id the peer has opened, refused ones included
    highest_peer_stream_id: u32,
    next_push_id: u32,
    push_count: u32,
    send_window: FlowControlWindow,
    recv_window: FlowControlWindow,
    /// Connection-level bytes received since the last WINDOW_UPDATE
    recv_unacked: u32,
    queues: PriorityQueues,
    out: OutputBuffer,
    /// Recently reset stream ids, oldest first
    tombstones: VecDeque<u32>,
    last_frame: Instant,
    last_ping: Instant,
}

impl H2Connection {
    pub fn new(config: Arc<H2Config>, factory: Arc<dyn HandlerFactory>) -> Self {
        let now = Instant::now();
        let hpack = HpackCodec::with_table_size(config.header_table_size as usize);
        let recv_window = FlowControlWindow::with_initial_size(config.initial_conn_window);
        H2Connection {
            config,
            factory,
            hpack,
            conn_info: Arc::new(ConnInfo::default()),
            phase: Phase::AwaitingPreface,
            flags: ConnFlags::default(),
            peer: PeerSettings::default(),
            inbuf: BytesMut::with_capacity(READ_CHUNK),
            block: None,
            streams: HashMap::new(),
            last_peer_stream_id: 0,
            highest_peer_stream_id: 0,
            next_push_id: 2,
            push_count: 0,
            send_window: FlowControlWindow::new(),
            recv_window,
            recv_unacked: 0,
            queues: PriorityQueues::new(),
            out: OutputBuffer::new(),
            tombstones: VecDeque::new(),
            last_frame: now,
            last_ping: now,
        }
    }

    /// Number of live logical streams
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream(&self, id: u32) -> Option<&H2Stream> {
        self.streams.get(&id)
    }

    /// Highest stream id opened by the peer
    pub fn last_peer_stream_id(&self) -> u32 {
        self.last_peer_stream_id
    }

    /// Connection send window
    pub fn send_window(&self) -> i64 {
        self.send_window.size()
    }

    /// Connection receive window
    pub fn recv_window(&self) -> i64 {
        self.recv_window.size()
    }

    /// Push streams currently open
    pub fn push_count(&self) -> u32 {
        self.push_count
    }

    /// Serialized bytes not yet accepted by the transport
    pub fn pending_output(&self) -> usize {
        self.out.len()
    }

    pub fn is_goaway_sent(&self) -> bool {
        self.flags.goaway_sent
    }

    pub fn is_goaway_received(&self) -> bool {
        self.flags.goaway_recv
    }

    /// True once the peer acknowledged our SETTINGS
    pub fn is_settings_acked(&self) -> bool {
        self.flags.settings_acked
    }

    pub fn is_read_paused(&self) -> bool {
        self.flags.pause_read
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Time left at `now` before the connection counts as idle, for event
    /// loops that size their timer to it
    pub fn idle_deadline(&self, now: Instant) -> Duration {
        self.config
            .idle_timeout
            .saturating_sub(now.saturating_duration_since(self.last_frame))
    }

    /// Start a graceful shutdown
    ///
    /// GOAWAY(NO_ERROR) names the last stream the peer opened; newer
    /// streams are refused, open ones run to completion and the transport
    /// is closed once none remain.
    pub fn begin_shutdown(&mut self, stream: &mut dyn HioStream) -> hio::Result<()> {
        if self.phase == Phase::Closed || self.flags.goaway_sent {
            return Ok(());
        }
        debug!(last_stream_id = self.last_peer_stream_id, "graceful shutdown");
        self.send_goaway(ErrorCode::NoError, "");
        let ret = self.pump(stream);
        self.settle(stream, ret)
    }

    /// Take over a connection upgraded from HTTP/1.1 (h2c)
    ///
    /// The upgrading request becomes stream 1, half-closed (remote), bound
    /// to `handler`. `leftover` holds bytes read past the upgrade request,
    /// normally the start of the client preface.
    pub fn h2c_upgrade(
        &mut self,
        stream: &mut dyn HioStream,
        handler: Box<dyn HioHandler>,
        req_headers: Headers,
        leftover: &[u8],
    ) -> hio::Result<()> {
        self.conn_info = stream.conn_info().clone();
        self.send_preamble();
        stream.want_read(true);

        let mut upgraded = self.new_stream(1, StreamState::HalfClosedRemote);
        upgraded.set_priority(PrioritySpec::default_level() as i32);
        upgraded.set_req_headers(req_headers);
        self.last_peer_stream_id = 1;
        self.highest_peer_stream_id = 1;
        self.inbuf.extend_from_slice(leftover);
        debug!("connection upgraded from HTTP/1.1");

        let ret = self
            .start_stream(upgraded, Some(handler))
            .and_then(|()| self.process_input());
        let ret = ret.and_then(|()| self.pump(stream));
        self.settle(stream, ret)
    }

    fn new_stream(&self, id: u32, state: StreamState) -> H2Stream {
        let mut stream = H2Stream::new(
            id,
            state,
            self.conn_info.clone(),
            self.peer.initial_window_size,
            self.config.initial_stream_window,
            self.config.out_buf_threshold,
        );
        if id % 2 == 1 && self.push_enabled() {
            stream.set_flag(HioFlags::PUSH_CAPABLE, true);
        }
        stream
    }

    fn push_enabled(&self) -> bool {
        self.config.enable_push && self.peer.enable_push
    }

    fn send_preamble(&mut self) {
        let settings = self.config.local_settings();
        self.out
            .push_bytes(FrameCodec::encode_settings_frame(&SettingsFrame::new(settings)));
        let extra = self
            .config
            .initial_conn_window
            .saturating_sub(DEFAULT_INITIAL_WINDOW_SIZE);
        if extra > 0 {
            self.send_window_update(0, extra);
        }
        trace!(conn_window = self.config.initial_conn_window, "SETTINGS queued");
    }

    fn settle(&mut self, stream: &mut dyn HioStream, ret: Result<()>) -> hio::Result<()> {
        if let Err(err) = ret {
            self.abort(stream, err);
        }
        Ok(())
    }

    /// Connection error: GOAWAY where feasible, release everything, close
    fn abort(&mut self, stream: &mut dyn HioStream, err: Error) {
        warn!(
            error = %err,
            code = %err.code(),
            last_stream_id = self.last_peer_stream_id,
            "connection error"
        );
        let transport_failed = matches!(err, Error::Io(_) | Error::Hio(_));
        if !transport_failed && !matches!(err, Error::MissingPreface) {
            self.send_goaway(err.code(), &err.to_string());
        }
        self.release_all();
        self.phase = Phase::Closed;
        if !transport_failed {
            if let Err(e) = self.out.flush(stream) {
                debug!(error = %e, "flush failed while aborting");
            }
        }
        self.out.clear();
        if let Err(e) = stream.close() {
            debug!(error = %e, "close failed while aborting");
        }
    }

    /// Read and process input until the socket is dry
    ///
    /// Returns true when reading stopped early because output backed up.
    fn read_input(&mut self, stream: &mut dyn HioStream) -> Result<bool> {
        let mut buf = [0u8; READ_CHUNK];
        while self.phase != Phase::Closed && !self.flags.pause_read {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.inbuf.extend_from_slice(&buf[..n]);
                    self.process_input()?;
                    // replies to PING and SETTINGS pile up while reading
                    if self.out.len() >= self.config.out_buf_threshold {
                        trace!(pending = self.out.len(), "output over threshold, reading stopped");
                        return Ok(true);
                    }
                }
                Err(hio::Error::ConnectionClosed) => {
                    debug!("peer closed the connection");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    /// Parse every whole frame in the input buffer
    fn process_input(&mut self) -> Result<()> {
        if self.phase == Phase::AwaitingPreface {
            let n = self.inbuf.len().min(CONNECTION_PREFACE.len());
            if self.inbuf[..n] != CONNECTION_PREFACE[..n] {
                return Err(Error::MissingPreface);
            }
            if n < CONNECTION_PREFACE.len() {
                return Ok(());
            }
            self.inbuf.advance(CONNECTION_PREFACE.len());
            self.phase = Phase::Established;
            debug!("client preface received");
        }

        while self.phase == Phase::Established && self.inbuf.len() >= FRAME_HEADER_SIZE {
            let mut raw = [0u8; FRAME_HEADER_SIZE];
            raw.copy_from_slice(&self.inbuf[..FRAME_HEADER_SIZE]);
            let header = FrameCodec::decode_header(&raw);
            if header.length > self.config.max_frame_size as usize {
                return Err(Error::FrameSize(format!(
                    "frame of {} bytes exceeds {}",
                    header.length, self.config.max_frame_size
                )));
            }
            if self.inbuf.len() < FRAME_HEADER_SIZE + header.length {
                break;
            }
            self.inbuf.advance(FRAME_HEADER_SIZE);
            let payload = self.inbuf.split_to(header.length).freeze();
            self.last_frame = Instant::now();
            self.handle_frame(header, payload)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, header: FrameHeader, payload: Bytes) -> Result<()> {
        let frame_type = header.frame_type();
        trace!(
            frame_type = ?frame_type,
            stream_id = header.stream_id,
            len = header.length,
            flags = header.flags.as_u8(),
            "frame received"
        );

        if let Some(block) = &self.block {
            if frame_type != Some(FrameType::Continuation) || header.stream_id != block.stream_id {
                return Err(Error::Protocol(format!(
                    "frame type 0x{:x} on stream {} inside the header block of stream {}",
                    header.raw_type, header.stream_id, block.stream_id
                )));
            }
        }

        let Some(frame_type) = frame_type else {
            trace!(raw_type = header.raw_type, "skipping unknown frame type");
            return Ok(());
        };
        match frame_type {
            FrameType::Data => self.on_data(&header, payload),
            FrameType::Headers => self.on_headers(&header, &payload),
            FrameType::Priority => self.on_priority(&header, &payload),
            FrameType::RstStream => self.on_rst_stream(&header, &payload),
            FrameType::Settings => self.on_settings(&header, &payload),
            FrameType::PushPromise => Err(Error::Protocol("PUSH_PROMISE sent by client".to_string())),
            FrameType::Ping => self.on_ping(&header, &payload),
            FrameType::Goaway => self.on_goaway(&header, &payload),
            FrameType::WindowUpdate => self.on_window_update(&header, &payload),
            FrameType::Continuation => self.on_continuation(&header, &payload),
        }
    }

    fn on_headers(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        let id = header.stream_id;
        if id == 0 || id % 2 == 0 {
            return Err(Error::InvalidStreamId(id));
        }
        let mut body = strip_padding(header.flags, payload)?;
        let mut priority = None;
        if header.flags.is_priority() {
            let spec = PrioritySpec::parse(body)
                .ok_or_else(|| Error::FrameSize("HEADERS too short for priority".to_string()))?;
            priority = Some(spec);
            body = &body[PrioritySpec::SIZE..];
        }

        let block = PendingBlock {
            stream_id: id,
            end_stream: header.flags.is_end_stream(),
            priority,
            buf: body.to_vec(),
        };
        self.check_block_size(block.buf.len())?;
        if header.flags.is_end_headers() {
            self.finish_header_block(block)
        } else {
            self.block = Some(block);
            Ok(())
        }
    }

    fn on_continuation(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        let Some(mut block) = self.block.take() else {
            return Err(Error::Protocol(format!(
                "CONTINUATION on stream {} without a header block",
                header.stream_id
            )));
        };
        block.buf.extend_from_slice(payload);
        self.check_block_size(block.buf.len())?;
        if header.flags.is_end_headers() {
            self.finish_header_block(block)
        } else {
            self.block = Some(block);
            Ok(())
        }
    }

    fn check_block_size(&self, len: usize) -> Result<()> {
        if len > self.config.max_header_block_size {
            return Err(Error::EnhanceYourCalm(format!(
                "header block of {} bytes exceeds {}",
                len, self.config.max_header_block_size
            )));
        }
        Ok(())
    }

    /// Decode a complete header block and act on it
    ///
    /// The block is decoded even when the stream is then refused, so the
    /// shared decoder state stays in step with the peer's encoder.
    fn finish_header_block(&mut self, block: PendingBlock) -> Result<()> {
        let headers = Headers::from_raw(self.hpack.decode(&block.buf)?);
        let id = block.stream_id;
        trace!(stream_id = id, count = headers.len(), "header block decoded");

        if let Some(stream) = self.streams.get_mut(&id) {
            if stream.is_peer_closed() {
                stream.reset(ErrorCode::StreamClosed);
            } else if !block.end_stream {
                // only trailers may follow the request head
                stream.reset(ErrorCode::ProtocolError);
            } else {
                stream.set_trailers(headers);
                stream.recv_end_stream();
                if stream.is_want_read() {
                    self.deliver(id, HioEvent::Read);
                }
            }
            return self.after_stream_event(id);
        }

        if id <= self.highest_peer_stream_id {
            debug!(stream_id = id, "HEADERS on a closed stream");
            self.send_rst(id, ErrorCode::StreamClosed);
            return Ok(());
        }
        self.highest_peer_stream_id = id;
        if self.flags.goaway_sent {
            debug!(stream_id = id, "refusing stream opened after GOAWAY");
            self.send_rst(id, ErrorCode::RefusedStream);
            return Ok(());
        }
        self.last_peer_stream_id = id;
        if self.peer_stream_count() >= self.config.max_concurrent_streams as usize {
            debug!(stream_id = id, "concurrent stream limit reached");
            self.send_rst(id, ErrorCode::RefusedStream);
            return Ok(());
        }

        let state = if block.end_stream {
            StreamState::HalfClosedRemote
        } else {
            StreamState::Open
        };
        let mut stream = self.new_stream(id, state);
        let level = block
            .priority
            .map_or_else(PrioritySpec::default_level, |spec| spec.level());
        stream.set_priority(level as i32);
        stream.set_flag(HioFlags::PRI_SET, block.priority.is_some());
        debug!(
            stream_id = id,
            method = headers.method().unwrap_or("-"),
            path = headers.path().unwrap_or("-"),
            priority = level,
            "stream opened"
        );
        stream.set_req_headers(headers);
        let handler = self.factory.create(HioProtocol::Http);
        self.start_stream(stream, handler)
    }

    /// Insert a new stream and deliver its first callbacks
    fn start_stream(&mut self, mut stream: H2Stream, handler: Option<Box<dyn HioHandler>>) -> Result<()> {
        let id = stream.id();
        match handler {
            Some(handler) => stream.attach(handler),
            None => {
                warn!(stream_id = id, "no handler for stream");
                stream.reset(ErrorCode::RefusedStream);
            }
        }
        self.streams.insert(id, stream);
        self.deliver(id, HioEvent::InitConnected);
        if self.streams.get(&id).is_some_and(|s| s.is_want_read()) {
            self.deliver(id, HioEvent::Read);
        }
        self.after_stream_event(id)
    }

    fn on_data(&mut self, header: &FrameHeader, payload: Bytes) -> Result<()> {
        let id = header.stream_id;
        if id == 0 {
            return Err(Error::Protocol("DATA on stream 0".to_string()));
        }

        // the whole payload counts, padding included, whatever the stream
        let len = payload.len();
        self.recv_window.receive(len)?;
        self.recv_unacked = self.recv_unacked.saturating_add(len as u32);
        if let Some(increment) = self.recv_window.update_due(self.recv_unacked) {
            self.recv_window.increase(increment)?;
            self.recv_unacked = 0;
            self.send_window_update(0, increment);
        }

        let data = strip_padding(header.flags, &payload)?;
        let padding = len - data.len();

        if !self.streams.contains_key(&id) {
            if self.tombstones.contains(&id) {
                trace!(stream_id = id, len, "dropping DATA on reset stream");
            } else if id > self.highest_peer_stream_id {
                return Err(Error::Protocol(format!("DATA on idle stream {}", id)));
            } else {
                self.send_rst(id, ErrorCode::StreamClosed);
            }
            return Ok(());
        }
        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(());
        };

        if stream.is_peer_closed() {
            stream.reset(ErrorCode::StreamClosed);
            return self.after_stream_event(id);
        }
        if let Err(e) = stream.charge_recv(len) {
            debug!(stream_id = id, error = %e, "stream flow control violated");
            stream.reset(ErrorCode::FlowControlError);
            return self.after_stream_event(id);
        }
        stream.recv_data(data);
        stream.ack_unread(padding);
        if header.flags.is_end_stream() {
            stream.recv_end_stream();
        }
        if stream.is_want_read() {
            self.deliver(id, HioEvent::Read);
        }
        self.after_stream_event(id)
    }

    fn on_priority(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        let id = header.stream_id;
        if id == 0 {
            return Err(Error::Protocol("PRIORITY on stream 0".to_string()));
        }
        let spec = match PrioritySpec::parse(payload) {
            Some(spec) if payload.len() == PrioritySpec::SIZE => spec,
            _ => {
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.reset(ErrorCode::FrameSizeError);
                }
                return self.after_stream_event(id);
            }
        };
        if let Some(stream) = self.streams.get_mut(&id) {
            let level = spec.level();
            stream.set_priority(level as i32);
            stream.set_flag(HioFlags::PRI_SET, true);
            if self.queues.remove(id) {
                self.queues.push(id, level);
            }
            trace!(stream_id = id, priority = level, "stream reprioritized");
        }
        Ok(())
    }

    fn on_rst_stream(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        let id = header.stream_id;
        if id == 0 {
            return Err(Error::Protocol("RST_STREAM on stream 0".to_string()));
        }
        if payload.len() != 4 {
            return Err(Error::FrameSize(format!("RST_STREAM of {} bytes", payload.len())));
        }
        let code = (&payload[..]).get_u32();
        let Some(mut stream) = self.streams.remove(&id) else {
            trace!(stream_id = id, "RST_STREAM for unknown stream ignored");
            return Ok(());
        };
        debug!(
            stream_id = id,
            code = ErrorCode::from_u32(code).map_or("UNKNOWN", |c| c.name()),
            "stream reset by peer"
        );
        stream.recv_reset();
        self.queues.remove(id);
        self.tombstone(id);
        self.close_stream(&mut stream);
        Ok(())
    }

    fn on_settings(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        if header.stream_id != 0 {
            return Err(Error::Protocol("SETTINGS on a stream".to_string()));
        }
        if header.flags.is_ack() {
            if !payload.is_empty() {
                return Err(Error::FrameSize("SETTINGS ack with payload".to_string()));
            }
            self.flags.settings_acked = true;
            trace!("SETTINGS acknowledged");
            return Ok(());
        }
        let settings = Settings::parse(payload)?;
        self.apply_settings(&settings)?;
        self.out
            .push_bytes(FrameCodec::encode_settings_frame(&SettingsFrame::ack()));
        Ok(())
    }

    fn apply_settings(&mut self, settings: &Settings) -> Result<()> {
        if let Some(size) = settings.initial_window_size {
            let delta = size as i64 - self.peer.initial_window_size as i64;
            for stream in self.streams.values_mut() {
                stream.send_window_mut().update_initial_size(size)?;
            }
            self.peer.initial_window_size = size;
            debug!(size, delta, "peer initial window size changed");
            if delta > 0 {
                self.requeue_pending();
            }
        }
        if let Some(size) = settings.max_frame_size {
            self.peer.max_frame_size = size;
        }
        if let Some(enable) = settings.enable_push {
            self.peer.enable_push = enable;
        }
        if let Some(max) = settings.max_concurrent_streams {
            self.peer.max_concurrent_streams = Some(max);
        }
        Ok(())
    }

    fn on_ping(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        if header.stream_id != 0 {
            return Err(Error::Protocol("PING on a stream".to_string()));
        }
        let data: [u8; 8] = payload
            .try_into()
            .map_err(|_| Error::FrameSize(format!("PING of {} bytes", payload.len())))?;
        if header.flags.is_ack() {
            trace!("PING acknowledged");
            return Ok(());
        }
        self.out
            .push_bytes(FrameCodec::encode_ping_frame(&PingFrame::ack(data)));
        Ok(())
    }

    fn on_goaway(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        if header.stream_id != 0 {
            return Err(Error::Protocol("GOAWAY on a stream".to_string()));
        }
        if payload.len() < 8 {
            return Err(Error::FrameSize(format!("GOAWAY of {} bytes", payload.len())));
        }
        let mut buf = payload;
        let last_stream_id = buf.get_u32() & MAX_STREAM_ID;
        let code = buf.get_u32();
        debug!(
            last_stream_id,
            code = ErrorCode::from_u32(code).map_or("UNKNOWN", |c| c.name()),
            "GOAWAY received"
        );
        self.flags.goaway_recv = true;

        // pushes the peer will never process
        let mut doomed: Vec<u32> = self
            .streams
            .keys()
            .copied()
            .filter(|&id| id % 2 == 0 && id > last_stream_id)
            .collect();
        doomed.sort_unstable();
        for id in doomed {
            if let Some(mut stream) = self.streams.remove(&id) {
                self.queues.remove(id);
                self.close_stream(&mut stream);
            }
        }
        Ok(())
    }

    fn on_window_update(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        if payload.len() != 4 {
            return Err(Error::FrameSize(format!("WINDOW_UPDATE of {} bytes", payload.len())));
        }
        let increment = (&payload[..]).get_u32() & MAX_STREAM_ID;
        let id = header.stream_id;
        if increment == 0 {
            trace!(stream_id = id, "zero WINDOW_UPDATE ignored");
            return Ok(());
        }

        if id == 0 {
            self.send_window.increase(increment)?;
            self.requeue_pending();
            return Ok(());
        }
        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(());
        };
        if let Err(e) = stream.send_window_mut().increase(increment) {
            debug!(stream_id = id, error = %e, "stream window overflow");
            stream.reset(ErrorCode::FlowControlError);
            return self.after_stream_event(id);
        }
        if stream.has_pending_output() && !self.queues.contains(id) {
            self.queues.push(id, stream.priority());
        }
        Ok(())
    }

    /// Deliver `event` to the handler of stream `id`
    ///
    /// A failing handler costs its stream only.
    fn deliver(&mut self, id: u32, event: HioEvent) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        if let Err(e) = dispatch(stream, event) {
            debug!(stream_id = id, ?event, error = %e, "handler failed, resetting stream");
            stream.reset(ErrorCode::InternalError);
        }
    }

    /// Follow up on whatever a handler callback asked for
    fn after_stream_event(&mut self, id: u32) -> Result<()> {
        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(());
        };
        let requests = stream.take_push_requests();
        let update = stream.take_window_update();
        let queue_at = stream.has_pending_output().then(|| stream.priority());

        for request in requests {
            self.promise(id, request)?;
        }
        if let Some(increment) = update {
            self.send_window_update(id, increment);
        }
        if let Some(priority) = queue_at {
            if !self.queues.contains(id) {
                self.queues.push(id, priority);
            }
        }
        self.reap(id);
        Ok(())
    }

    fn push_refusal(&self, parent_id: u32) -> Option<&'static str> {
        let max_pushes = self
            .peer
            .max_concurrent_streams
            .map_or(self.config.max_push_streams, |max| max.min(self.config.max_push_streams));
        if !self.push_enabled() {
            Some("push disabled")
        } else if self.flags.goaway_sent || self.flags.goaway_recv {
            Some("connection is going away")
        } else if self.push_count >= max_pushes {
            Some("too many push streams")
        } else if self.next_push_id > MAX_STREAM_ID {
            Some("push stream ids exhausted")
        } else {
            match self.streams.get(&parent_id) {
                Some(parent) if parent.is_flag(HioFlags::PUSH_CAPABLE) && !parent.is_local_closed() => None,
                _ => Some("stream cannot push"),
            }
        }
    }

    /// Promise and open a push stream on behalf of stream `parent_id`
    ///
    /// A refused push only clears PUSH_CAPABLE on the parent.
    fn promise(&mut self, parent_id: u32, request: PushRequest) -> Result<()> {
        if let Some(reason) = self.push_refusal(parent_id) {
            info!(stream_id = parent_id, url = %request.url, reason, "push refused");
            if let Some(parent) = self.streams.get_mut(&parent_id) {
                parent.set_flag(HioFlags::PUSH_CAPABLE, false);
            }
            return Ok(());
        }

        let promised_id = self.next_push_id;
        self.next_push_id += 2;
        let scheme = if self.conn_info.secure { "https" } else { "http" };
        let mut fields = vec![
            (":method".to_string(), "GET".to_string()),
            (":scheme".to_string(), scheme.to_string()),
            (":authority".to_string(), request.host.clone()),
            (":path".to_string(), request.url.clone()),
        ];
        fields.extend(
            request
                .headers
                .iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value.to_string())),
        );
        let block = self.hpack.encode(&fields)?;
        self.write_header_block(parent_id, Some(promised_id), Bytes::from(block), false);
        debug!(stream_id = parent_id, promised_id, url = %request.url, "push promised");

        let mut pushed = self.new_stream(promised_id, StreamState::HalfClosedRemote);
        pushed.set_flag(HioFlags::IS_PUSH | HioFlags::FROM_LOCAL, true);
        pushed.set_priority(PRIORITY_PUSH as i32);
        pushed.set_req_headers(fields.into_iter().collect());
        self.push_count += 1;
        let handler = self.factory.create(HioProtocol::Http);
        self.start_stream(pushed, handler)
    }

    /// Drop stream `id` if it has nothing left to do
    fn reap(&mut self, id: u32) {
        if !self.streams.get(&id).is_some_and(H2Stream::is_finished) {
            return;
        }
        let Some(mut stream) = self.streams.remove(&id) else {
            return;
        };
        self.queues.remove(id);
        if let Some(code) = stream.pending_reset() {
            self.send_rst(id, code);
        } else if !stream.is_peer_closed() {
            // response complete, the rest of the request is not wanted
            self.send_rst(id, ErrorCode::NoError);
        }
        self.close_stream(&mut stream);
    }

    fn close_stream(&mut self, stream: &mut H2Stream) {
        if stream.has_handler() {
            if let Err(e) = dispatch(stream, HioEvent::Close) {
                debug!(stream_id = stream.id(), error = %e, "close callback failed");
            }
        }
        stream.release_handler();
        if stream.is_flag(HioFlags::IS_PUSH) {
            self.push_count = self.push_count.saturating_sub(1);
        }
        debug!(
            stream_id = stream.id(),
            sent = stream.bytes_sent(),
            recv = stream.bytes_recv(),
            "stream closed"
        );
    }

    /// Forcibly release every stream
    fn release_all(&mut self) {
        self.queues.clear();
        let mut ids: Vec<u32> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(mut stream) = self.streams.remove(&id) {
                self.close_stream(&mut stream);
            }
        }
    }

    /// Remember a reset stream so late frames on it are dropped quietly
    fn tombstone(&mut self, id: u32) {
        if self.config.reset_tombstones == 0 || self.tombstones.contains(&id) {
            return;
        }
        if self.tombstones.len() >= self.config.reset_tombstones {
            self.tombstones.pop_front();
        }
        self.tombstones.push_back(id);
    }

    fn peer_stream_count(&self) -> usize {
        self.streams.keys().filter(|&&id| id % 2 == 1).count()
    }

    /// Queue every stream holding output that is not queued yet
    fn requeue_pending(&mut self) {
        let mut ready: Vec<(u32, u8)> = self
            .streams
            .iter()
            .filter(|(_, s)| s.has_pending_output())
            .map(|(&id, s)| (id, s.priority()))
            .collect();
        ready.sort_unstable();
        for (id, priority) in ready {
            if !self.queues.contains(id) {
                self.queues.push(id, priority);
            }
        }
    }

    fn send_rst(&mut self, id: u32, code: ErrorCode) {
        debug!(stream_id = id, %code, "sending RST_STREAM");
        self.out
            .push_bytes(FrameCodec::encode_rst_stream_frame(&RstStreamFrame::new(id, code)));
        self.tombstone(id);
    }

    fn send_window_update(&mut self, id: u32, increment: u32) {
        trace!(stream_id = id, increment, "sending WINDOW_UPDATE");
        self.out.push_bytes(FrameCodec::encode_window_update_frame(
            &WindowUpdateFrame::new(id, increment),
        ));
    }

    fn send_goaway(&mut self, code: ErrorCode, reason: &str) {
        debug!(last_stream_id = self.last_peer_stream_id, %code, "sending GOAWAY");
        let frame = GoawayFrame::new(
            self.last_peer_stream_id,
            code,
            Bytes::copy_from_slice(reason.as_bytes()),
        );
        self.out.push_bytes(FrameCodec::encode_goaway_frame(&frame));
        self.flags.goaway_sent = true;
    }

    /// Serialize a header block as HEADERS (or PUSH_PROMISE) plus as many
    /// CONTINUATION frames as the peer's frame size requires
    fn write_header_block(&mut self, stream_id: u32, promised: Option<u32>, mut block: Bytes, end_stream: bool) {
        let max = self.peer.max_frame_size as usize;
        let first_max = if promised.is_some() { max - 4 } else { max };
        let first = block.split_to(first_max.min(block.len()));
        let end_headers = block.is_empty();
        let frame = match promised {
            Some(promised_stream_id) => FrameCodec::encode_push_promise_frame(&PushPromiseFrame {
                stream_id,
                promised_stream_id,
                header_block: first,
                end_headers,
            }),
            None => FrameCodec::encode_headers_frame(&HeadersFrame::new(stream_id, first, end_stream, end_headers)),
        };
        self.out.push_bytes(frame);

        while !block.is_empty() {
            let chunk = block.split_to(max.min(block.len()));
            let end_headers = block.is_empty();
            self.out.push_bytes(FrameCodec::encode_continuation_frame(&ContinuationFrame::new(
                stream_id,
                chunk,
                end_headers,
            )));
        }
    }

    fn is_out_buf_full(&self, write_buffer: bool) -> bool {
        self.out.len() >= self.config.out_buf_threshold || (write_buffer && self.flags.drain_to_zero)
    }

    /// Move stream output into frames in priority order
    ///
    /// Returns whether anything was produced.
    fn schedule(&mut self, write_buffer: bool) -> Result<bool> {
        let mut produced = false;
        let mut finished = Vec::new();

        while !self.is_out_buf_full(write_buffer) {
            let Some((id, level)) = self.queues.pop() else {
                break;
            };
            let conn_available = self.send_window.available();
            let max_frame = self.peer.max_frame_size as usize;
            let Some(stream) = self.streams.get_mut(&id) else {
                continue;
            };

            let mut allowed = 0;
            if stream.next_is_data() {
                allowed = stream.send_window().available().min(conn_available).min(max_frame);
                if allowed == 0 {
                    if conn_available == 0 {
                        self.queues.push_front(id, level);
                        break;
                    }
                    // back in line on the next WINDOW_UPDATE
                    trace!(stream_id = id, "stream window exhausted");
                    continue;
                }
            }
            let Some(output) = stream.take_output(allowed) else {
                continue;
            };
            match &output {
                StreamOutput::Data { data, .. } => {
                    stream.send_window_mut().consume(data.len());
                }
                StreamOutput::File { len, .. } => {
                    stream.send_window_mut().consume(*len);
                }
                StreamOutput::Headers { .. } => {}
            }
            let more = stream.has_pending_output();
            let priority = stream.priority();
            let done = stream.is_finished();

            self.emit(id, output)?;
            produced = true;
            if more {
                self.queues.push(id, priority);
            } else if done {
                finished.push(id);
            }
        }

        for id in finished {
            self.reap(id);
        }
        if write_buffer && self.out.len() >= self.config.out_buf_threshold {
            self.flags.drain_to_zero = true;
        }
        Ok(produced)
    }

    fn emit(&mut self, stream_id: u32, output: StreamOutput) -> Result<()> {
        match output {
            StreamOutput::Headers { fields, end_stream } => {
                let block = self.hpack.encode(&fields)?;
                self.write_header_block(stream_id, None, Bytes::from(block), end_stream);
            }
            StreamOutput::Data { data, end_stream } => {
                self.send_window.consume(data.len());
                self.out.push_bytes(FrameCodec::encode_data_frame(&DataFrame::new(
                    stream_id, data, end_stream,
                )));
            }
            StreamOutput::File {
                file,
                offset,
                len,
                end_stream,
            } => {
                self.send_window.consume(len);
                let mut flags = FrameFlags::empty();
                if end_stream {
                    flags.set(FrameFlags::END_STREAM);
                }
                let header = FrameCodec::encode_header(FrameType::Data, flags, stream_id, len);
                self.out.push_slice(&header);
                self.out.push_file(file, offset, len);
            }
        }
        Ok(())
    }

    /// Give `on_write` to streams waiting for room
    ///
    /// Returns whether any of them queued new output.
    fn wake_writers(&mut self) -> Result<bool> {
        let limit = self.config.out_buf_threshold;
        let mut ids: Vec<u32> = self
            .streams
            .iter_mut()
            .filter_map(|(&id, stream)| {
                let asked = stream.take_write_wakeup();
                let waiting = asked || stream.is_want_write();
                (waiting && stream.has_handler() && stream.pending_bytes() < limit).then_some(id)
            })
            .collect();
        ids.sort_unstable();

        let mut queued = false;
        for id in ids {
            let before = self.streams.get(&id).map_or(0, H2Stream::queued_items);
            self.deliver(id, HioEvent::Write);
            let after = self.streams.get(&id).map_or(0, H2Stream::queued_items);
            queued |= after > before;
            self.after_stream_event(id)?;
        }
        Ok(queued)
    }

    /// Produce and flush output until the transport or the windows stop it,
    /// then settle interest, read pause and drain-close
    fn pump(&mut self, stream: &mut dyn HioStream) -> Result<()> {
        if self.phase == Phase::Closed {
            return Ok(());
        }
        let write_buffer = stream.is_write_buffer();
        loop {
            let produced = self.schedule(write_buffer)?;
            if !self.out.flush(stream)? {
                break;
            }
            self.flags.drain_to_zero = false;
            let woke = self.wake_writers()?;
            if !produced && !woke {
                break;
            }
        }

        stream.want_write(!self.out.is_empty());
        self.update_read_pause(stream);

        if self.is_drained() {
            debug!(last_stream_id = self.last_peer_stream_id, "connection drained, closing");
            self.phase = Phase::Closed;
            stream.close()?;
        }
        Ok(())
    }

    fn update_read_pause(&mut self, stream: &mut dyn HioStream) {
        let over = self.out.len() >= self.config.out_buf_threshold;
        if over && !self.flags.pause_read {
            debug!(pending = self.out.len(), "output over threshold, pausing read");
            self.flags.pause_read = true;
            stream.want_read(false);
        } else if !over && self.flags.pause_read {
            trace!("output drained, resuming read");
            self.flags.pause_read = false;
            stream.want_read(true);
        }
    }

    fn is_drained(&self) -> bool {
        (self.flags.goaway_sent || self.flags.goaway_recv)
            && self.streams.is_empty()
            && self.block.is_none()
            && self.out.is_empty()
    }

    fn tick(&mut self, stream: &mut dyn HioStream, now: Instant) -> Result<()> {
        let idle = now.saturating_duration_since(self.last_frame);
        if self.streams.is_empty() && idle >= self.config.idle_timeout {
            debug!(idle_ms = idle.as_millis() as u64, "idle connection, closing");
            self.send_goaway(ErrorCode::NoError, "idle timeout");
            return self.pump(stream);
        }
        if let Some(interval) = self.config.ping_interval {
            if now.saturating_duration_since(self.last_ping) >= interval {
                self.last_ping = now;
                self.out
                    .push_bytes(FrameCodec::encode_ping_frame(&PingFrame::new(KEEPALIVE_PING)));
            }
        }

        let mut ids: Vec<u32> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.deliver(id, HioEvent::Timer);
            self.after_stream_event(id)?;
        }
        self.pump(stream)
    }

    fn handle_readable(&mut self, stream: &mut dyn HioStream) -> Result<()> {
        loop {
            let backlogged = self.read_input(stream)?;
            self.pump(stream)?;
            if !backlogged || self.flags.pause_read || self.phase == Phase::Closed {
                return Ok(());
            }
        }
    }
}

impl HioHandler for H2Connection {
    fn on_init_connected(&mut self, stream: &mut dyn HioStream) -> hio::Result<()> {
        self.conn_info = stream.conn_info().clone();
        debug!(client = ?self.conn_info.client_addr, "HTTP/2 connection started");
        self.send_preamble();
        stream.want_read(true);
        let ret = self.pump(stream);
        self.settle(stream, ret)
    }

    fn on_read(&mut self, stream: &mut dyn HioStream) -> hio::Result<()> {
        if self.phase == Phase::Closed || self.flags.pause_read {
            return Ok(());
        }
        let ret = self.handle_readable(stream);
        self.settle(stream, ret)
    }

    fn on_write(&mut self, stream: &mut dyn HioStream) -> hio::Result<()> {
        if self.phase == Phase::Closed {
            return Ok(());
        }
        let ret = self.pump(stream);
        self.settle(stream, ret)
    }

    fn on_close(&mut self, _stream: &mut dyn HioStream) -> hio::Result<()> {
        debug!(streams = self.streams.len(), "connection closed");
        self.release_all();
        self.out.clear();
        self.phase = Phase::Closed;
        Ok(())
    }

    fn on_timer(&mut self, stream: &mut dyn HioStream) -> hio::Result<()> {
        if self.phase == Phase::Closed {
            return Ok(());
        }
        let ret = self.tick(stream, Instant::now());
        self.settle(stream, ret)
    }
}

/// Payload of a frame without its padding
fn strip_padding(flags: FrameFlags, payload: &[u8]) -> Result<&[u8]> {
    if !flags.is_padded() {
        return Ok(payload);
    }
    let Some((&pad, rest)) = payload.split_first() else {
        return Err(Error::Protocol("padded frame without pad length".to_string()));
    };
    let pad = pad as usize;
    if pad > rest.len() {
        return Err(Error::Protocol(format!(
            "padding of {} bytes exceeds payload of {}",
            pad,
            rest.len()
        )));
    }
    Ok(&rest[..rest.len() - pad])
}
