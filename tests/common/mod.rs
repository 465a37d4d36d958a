//! Shared fixtures for the engine integration tests
//!
//! The engine is driven directly: a `ByteStream` over an in-memory
//! transport plays the TCP connection, the tests play the HTTP/2 client by
//! feeding raw frames and parsing what comes back.

#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use hiomux::hio::{
    self, ByteStream, ConnInfo, HandlerFactory, HioHandler, HioProtocol, HioStream, Interest,
    Transport,
};
use hiomux::http::h2::codec::FRAME_HEADER_SIZE;
use hiomux::http::h2::frames::*;
use hiomux::http::h2::{
    ErrorCode, FrameCodec, FrameType, H2Config, H2Connection, Settings, CONNECTION_PREFACE,
};
use hiomux::http::{Headers, RespHeaders};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::sync::{Arc, Mutex};

/// Events recorded by test handlers
pub type Journal = Arc<Mutex<Vec<String>>>;

/// Route engine logs to the test output; filter with `RUST_LOG`
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

/// In-memory transport: reads pop queued chunks, writes append to `output`
#[derive(Default)]
pub struct MockTransport {
    pub input: VecDeque<Vec<u8>>,
    pub output: Vec<u8>,
    /// Bytes accepted before writes would block, unlimited if `None`
    pub write_budget: Option<usize>,
    pub interest: Interest,
    pub shut: bool,
    pub eof: bool,
    /// Report writes as buffered internally, like a TLS layer
    pub write_buffer: bool,
}

impl Transport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(mut chunk) = self.input.pop_front() else {
            return if self.eof {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.input.push_front(chunk.split_off(n));
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.write_budget {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(budget) => budget.min(buf.len()),
            None => buf.len(),
        };
        if let Some(budget) = self.write_budget.as_mut() {
            *budget -= n;
        }
        self.output.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.shut = true;
        Ok(())
    }

    fn interest(&self) -> Interest {
        self.interest
    }

    fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }

    fn is_write_buffer(&self) -> bool {
        self.write_buffer
    }
}

/// Client side of the connection: frame builders plus HPACK state
pub struct Client {
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
}

impl Client {
    pub fn new() -> Self {
        Client {
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
        }
    }

    /// Client preface followed by an empty SETTINGS frame
    pub fn preface() -> Vec<u8> {
        let mut buf = CONNECTION_PREFACE.to_vec();
        buf.extend_from_slice(&Self::settings(Settings::new()));
        buf
    }

    pub fn settings(settings: Settings) -> Bytes {
        FrameCodec::encode_settings_frame(&SettingsFrame::new(settings))
    }

    pub fn settings_ack() -> Bytes {
        FrameCodec::encode_settings_frame(&SettingsFrame::ack())
    }

    pub fn block(&mut self, fields: &[(&str, &str)]) -> Vec<u8> {
        self.encoder
            .encode(fields.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())))
    }

    /// GET request head for `path`
    pub fn get(&mut self, id: u32, path: &str, end_stream: bool) -> Bytes {
        let block = self.block(&request_fields("GET", path));
        Self::headers(id, block, end_stream)
    }

    /// HEADERS frame carrying a whole block
    pub fn headers(id: u32, block: Vec<u8>, end_stream: bool) -> Bytes {
        FrameCodec::encode_headers_frame(&HeadersFrame::new(id, Bytes::from(block), end_stream, true))
    }

    pub fn headers_with_priority(id: u32, block: Vec<u8>, weight: u8) -> Bytes {
        let frame = HeadersFrame::new(id, Bytes::from(block), true, true)
            .with_priority(PrioritySpec::new(0, false, weight));
        FrameCodec::encode_headers_frame(&frame)
    }

    pub fn data(id: u32, data: &[u8], end_stream: bool) -> Bytes {
        FrameCodec::encode_data_frame(&DataFrame::new(id, Bytes::copy_from_slice(data), end_stream))
    }

    pub fn window_update(id: u32, increment: u32) -> Bytes {
        FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(id, increment))
    }

    pub fn rst_stream(id: u32, code: ErrorCode) -> Bytes {
        FrameCodec::encode_rst_stream_frame(&RstStreamFrame::new(id, code))
    }

    pub fn ping(data: [u8; 8]) -> Bytes {
        FrameCodec::encode_ping_frame(&PingFrame::new(data))
    }

    pub fn priority(id: u32, weight: u8) -> Bytes {
        FrameCodec::encode_priority_frame(&PriorityFrame {
            stream_id: id,
            priority: PrioritySpec::new(0, false, weight),
        })
    }

    pub fn goaway(last_stream_id: u32, code: ErrorCode) -> Bytes {
        FrameCodec::encode_goaway_frame(&GoawayFrame::new(last_stream_id, code, Bytes::new()))
    }

    /// Raw frame of any type, for malformed input
    pub fn raw(frame_type: u8, flags: u8, id: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_uint(payload.len() as u64, 3);
        buf.put_u8(frame_type);
        buf.put_u8(flags);
        buf.put_u32(id);
        buf.put_slice(payload);
        buf.freeze()
    }

    fn decode(&mut self, block: &[u8]) -> Vec<(String, String)> {
        self.decoder
            .decode(block)
            .expect("server header block decodes")
            .into_iter()
            .map(|(n, v)| {
                (
                    String::from_utf8_lossy(&n).into_owned(),
                    String::from_utf8_lossy(&v).into_owned(),
                )
            })
            .collect()
    }
}

pub fn request_fields<'a>(method: &'a str, path: &'a str) -> Vec<(&'a str, &'a str)> {
    vec![
        (":method", method),
        (":scheme", "http"),
        (":authority", "localhost"),
        (":path", path),
    ]
}

/// One frame sent by the engine
#[derive(Debug, Clone)]
pub struct Received {
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
    /// Decoded header list of HEADERS / PUSH_PROMISE, CONTINUATIONs folded in
    pub headers: Vec<(String, String)>,
}

impl Received {
    pub fn is(&self, frame_type: FrameType) -> bool {
        self.frame_type == frame_type
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.has_flag(FrameFlags::END_STREAM)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn word(&self, at: usize) -> u32 {
        u32::from_be_bytes([
            self.payload[at],
            self.payload[at + 1],
            self.payload[at + 2],
            self.payload[at + 3],
        ])
    }

    /// Error code of RST_STREAM or GOAWAY
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self.frame_type {
            FrameType::RstStream => ErrorCode::from_u32(self.word(0)),
            FrameType::Goaway => ErrorCode::from_u32(self.word(4)),
            _ => None,
        }
    }

    pub fn goaway_last_stream_id(&self) -> u32 {
        self.word(0) & 0x7FFF_FFFF
    }

    pub fn window_increment(&self) -> u32 {
        self.word(0) & 0x7FFF_FFFF
    }

    pub fn promised_stream_id(&self) -> u32 {
        self.word(0) & 0x7FFF_FFFF
    }
}

/// Engine plus transport plus client, wired together
pub struct Harness {
    pub conn: H2Connection,
    pub io: ByteStream<MockTransport>,
    pub client: Client,
    pub journal: Journal,
    parsed: usize,
    /// index of a HEADERS / PUSH_PROMISE still collecting CONTINUATIONs
    open_block: Option<(usize, Vec<u8>)>,
}

impl Harness {
    /// Engine serving `Responder` handlers
    pub fn new(config: H2Config) -> Self {
        let journal = journal();
        let factory = responder_factory(&journal);
        Self::with_factory(config, factory, journal)
    }

    pub fn with_factory(config: H2Config, factory: Arc<dyn HandlerFactory>, journal: Journal) -> Self {
        Self::over(MockTransport::default(), config, factory, journal)
    }

    /// Engine serving `Responder` handlers over `transport`
    pub fn with_transport(transport: MockTransport, config: H2Config) -> Self {
        let journal = journal();
        let factory = responder_factory(&journal);
        Self::over(transport, config, factory, journal)
    }

    fn over(
        transport: MockTransport,
        config: H2Config,
        factory: Arc<dyn HandlerFactory>,
        journal: Journal,
    ) -> Self {
        init_logging();
        let io = ByteStream::new(transport, Arc::new(ConnInfo::default()))
            .with_protocol(HioProtocol::Http2);
        Harness {
            conn: H2Connection::new(Arc::new(config), factory),
            io,
            client: Client::new(),
            journal,
            parsed: 0,
            open_block: None,
        }
    }

    /// Deliver the connected event
    pub fn start(&mut self) -> Vec<Received> {
        self.conn.on_init_connected(&mut self.io).unwrap();
        self.frames()
    }

    /// Start and complete the preface and SETTINGS exchange
    pub fn established(config: H2Config) -> Self {
        let mut harness = Self::new(config);
        harness.start();
        harness.send(&Client::preface());
        harness.send(&Client::settings_ack());
        harness.frames();
        harness
    }

    /// Feed `bytes` as one transport read
    pub fn send(&mut self, bytes: &[u8]) -> Vec<Received> {
        self.io.transport_mut().input.push_back(bytes.to_vec());
        self.conn.on_read(&mut self.io).unwrap();
        self.frames()
    }

    /// Feed `bytes` in pieces of `size`, one read event per piece
    pub fn send_in_pieces(&mut self, bytes: &[u8], size: usize) -> Vec<Received> {
        let mut frames = Vec::new();
        for piece in bytes.chunks(size) {
            frames.extend(self.send(piece));
        }
        frames
    }

    /// Signal writability
    pub fn writable(&mut self) -> Vec<Received> {
        self.conn.on_write(&mut self.io).unwrap();
        self.frames()
    }

    pub fn timer(&mut self) -> Vec<Received> {
        self.conn.on_timer(&mut self.io).unwrap();
        self.frames()
    }

    pub fn is_transport_shut(&self) -> bool {
        self.io.transport().shut
    }

    /// Frames written since the previous call
    pub fn frames(&mut self) -> Vec<Received> {
        let mut frames = Vec::new();
        loop {
            let wire = &self.io.transport().output[self.parsed..];
            if wire.len() < FRAME_HEADER_SIZE {
                break;
            }
            let mut raw = [0u8; FRAME_HEADER_SIZE];
            raw.copy_from_slice(&wire[..FRAME_HEADER_SIZE]);
            let header = FrameCodec::decode_header(&raw);
            if wire.len() < FRAME_HEADER_SIZE + header.length {
                break;
            }
            let payload =
                Bytes::copy_from_slice(&wire[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + header.length]);
            self.parsed += FRAME_HEADER_SIZE + header.length;

            let frame_type = header.frame_type().expect("engine sends known frame types");
            frames.push(Received {
                frame_type,
                flags: header.flags.as_u8(),
                stream_id: header.stream_id,
                payload: payload.clone(),
                headers: Vec::new(),
            });
            let end_headers = header.flags.is_end_headers();
            let fragment = match frame_type {
                FrameType::Headers => Some(payload.to_vec()),
                FrameType::PushPromise => Some(payload[4..].to_vec()),
                FrameType::Continuation => {
                    let (at, mut block) = self.open_block.take().expect("CONTINUATION follows a block");
                    block.extend_from_slice(&payload);
                    self.open_block = Some((at, block));
                    None
                }
                _ => None,
            };
            if let Some(fragment) = fragment {
                self.open_block = Some((frames.len() - 1, fragment));
            }
            if end_headers {
                if let Some((at, block)) = self.open_block.take() {
                    frames[at].headers = self.client.decode(&block);
                }
            }
        }
        frames
    }
}

/// Read one frame from a blocking socket
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Received> {
    let mut raw = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut raw)?;
    let header = FrameCodec::decode_header(&raw);
    let mut payload = vec![0u8; header.length];
    reader.read_exact(&mut payload)?;
    let frame_type = header.frame_type().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, format!("frame type 0x{:x}", header.raw_type))
    })?;
    Ok(Received {
        frame_type,
        flags: header.flags.as_u8(),
        stream_id: header.stream_id,
        payload: Bytes::from(payload),
        headers: Vec::new(),
    })
}

/// Response body served for `path`
///
/// `/bytes/N` answers N patterned bytes, `/empty` answers headers only,
/// anything else answers `hello`.
pub fn body_for(path: &str) -> Vec<u8> {
    if let Some(n) = path.strip_prefix("/bytes/") {
        let n: usize = n.parse().expect("numeric size");
        return pattern(n);
    }
    if path == "/empty" {
        return Vec::new();
    }
    b"hello".to_vec()
}

pub fn pattern(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i % 251) as u8).collect()
}

/// Request/response handler used by most tests
///
/// Reads the request body to the end, then answers. `/early` answers
/// straight away and closes at end of request; `/push*` pushes
/// `/style.css` first; `/fail` errors out of its first callback.
pub struct Responder {
    journal: Journal,
    path: String,
    body: Vec<u8>,
    sent: usize,
    received: usize,
    responded: bool,
}

impl Responder {
    pub fn new(journal: &Journal) -> Self {
        Responder {
            journal: journal.clone(),
            path: String::new(),
            body: Vec::new(),
            sent: 0,
            received: 0,
            responded: false,
        }
    }

    fn log(&self, what: String) {
        self.journal.lock().unwrap().push(what);
    }

    fn respond(&mut self, stream: &mut dyn HioStream) -> hio::Result<()> {
        if !self.responded {
            self.responded = true;
            if self.path.starts_with("/push") {
                let pushed = stream.push("/style.css", "localhost", &Headers::new());
                if pushed.is_err() {
                    self.log(format!("push refused {}", self.path));
                }
            }
            self.body = body_for(&self.path);
            let resp = RespHeaders::new(200)
                .header("content-length", self.body.len().to_string())
                .header("x-path", self.path.clone());
            stream.send_resp_headers(&resp, self.body.is_empty())?;
        }
        self.write_body(stream)
    }

    fn write_body(&mut self, stream: &mut dyn HioStream) -> hio::Result<()> {
        while self.sent < self.body.len() {
            let n = stream.write(&self.body[self.sent..])?;
            if n == 0 {
                stream.want_write(true);
                return Ok(());
            }
            self.sent += n;
        }
        stream.want_write(false);
        if self.path != "/early" || stream.is_peer_shutdown() {
            stream.close()?;
        }
        Ok(())
    }
}

impl HioHandler for Responder {
    fn on_init_connected(&mut self, stream: &mut dyn HioStream) -> hio::Result<()> {
        let req = stream.req_headers().cloned().unwrap_or_default();
        self.path = req.path().unwrap_or("/").to_string();
        let fields: Vec<String> = req.iter().map(|(n, v)| format!("{}={}", n, v)).collect();
        self.log(format!("init {} [{}]", self.path, fields.join(",")));

        if self.path == "/fail" {
            return Err(hio::Error::Handler("refusing".to_string()));
        }
        if self.path == "/early" || stream.is_peer_shutdown() {
            self.respond(stream)?;
        }
        if !stream.is_peer_shutdown() {
            stream.want_read(true);
        }
        Ok(())
    }

    fn on_read(&mut self, stream: &mut dyn HioStream) -> hio::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => self.received += n,
                Err(hio::Error::ConnectionClosed) => {
                    self.log(format!("body {} {}", self.path, self.received));
                    stream.want_read(false);
                    return self.respond(stream);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn on_write(&mut self, stream: &mut dyn HioStream) -> hio::Result<()> {
        self.write_body(stream)
    }

    fn on_close(&mut self, _stream: &mut dyn HioStream) -> hio::Result<()> {
        self.log(format!("close {}", self.path));
        Ok(())
    }
}

pub fn responder_factory(journal: &Journal) -> Arc<dyn HandlerFactory> {
    let journal = journal.clone();
    Arc::new(move |_: HioProtocol| -> Option<Box<dyn HioHandler>> {
        Some(Box::new(Responder::new(&journal)))
    })
}

/// Answers every request with the contents of a file, sent zero-copy
pub struct FileResponder {
    file: Arc<File>,
    len: usize,
    sent: usize,
}

impl FileResponder {
    pub fn new(file: Arc<File>, len: usize) -> Self {
        FileResponder { file, len, sent: 0 }
    }

    fn send(&mut self, stream: &mut dyn HioStream) -> hio::Result<()> {
        while self.sent < self.len {
            let n = stream.sendfile(&self.file, self.sent as u64, self.len - self.sent)?;
            if n == 0 {
                stream.want_write(true);
                return Ok(());
            }
            self.sent += n;
        }
        stream.close()
    }
}

impl HioHandler for FileResponder {
    fn on_init_connected(&mut self, stream: &mut dyn HioStream) -> hio::Result<()> {
        let resp = RespHeaders::new(200).header("content-length", self.len.to_string());
        stream.send_resp_headers(&resp, false)?;
        self.send(stream)
    }

    fn on_read(&mut self, _stream: &mut dyn HioStream) -> hio::Result<()> {
        Ok(())
    }

    fn on_write(&mut self, stream: &mut dyn HioStream) -> hio::Result<()> {
        self.send(stream)
    }

    fn on_close(&mut self, _stream: &mut dyn HioStream) -> hio::Result<()> {
        Ok(())
    }
}

/// Body bytes per stream, in arrival order
pub fn data_of(frames: &[Received], stream_id: u32) -> Vec<u8> {
    frames
        .iter()
        .filter(|f| f.is(FrameType::Data) && f.stream_id == stream_id)
        .flat_map(|f| f.payload.iter().copied())
        .collect()
}

pub fn find(frames: &[Received], frame_type: FrameType) -> Option<&Received> {
    frames.iter().find(|f| f.is(frame_type))
}
