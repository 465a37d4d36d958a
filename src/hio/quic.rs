//! Stream backed by a multi-stream secure transport
//!
//! The transport library owns framing, loss recovery and crypto; it hands
//! out per-stream handles implementing `QuicStreamOps`. `QuicStream` turns
//! those library calls into the `HioStream` contract so the HTTP handler
//! runs unchanged on top of it.

use super::handler::{HandlerFactory, HioEvent};
use super::stream::{dispatch, on_peer_close, HioStream, StreamCore};
use super::{ConnInfo, CryptoEnv, Error, HioFlags, HioProtocol, HioState, Result, PRIORITY_HTML};
use crate::http::headers::{Headers, RespHeaders};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Largest chunk moved per `sendfile` call
const SENDFILE_CHUNK: usize = 16384;

/// Per-stream operations provided by the secure transport library
pub trait QuicStreamOps {
    /// Library stream id
    fn id(&self) -> u64;

    /// True if the stream was opened by a server push
    fn is_pushed(&self) -> bool;

    /// `Ok(0)` is end of stream, `WouldBlock` means no data yet
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;

    fn want_read(&mut self, on: bool);

    fn want_write(&mut self, on: bool);

    fn send_headers(&mut self, fields: &[(String, String)], no_body: bool) -> io::Result<()>;

    /// The decoded request header set, once the library has one
    fn take_request_headers(&mut self) -> Option<Headers>;

    /// Open a pushed stream promising `url`
    fn push_stream(&mut self, url: &str, host: &str, headers: &Headers) -> io::Result<()>;

    fn crypto_env(&self, _id: CryptoEnv) -> Option<String> {
        None
    }
}

/// `HioStream` over one stream of a multi-stream transport
pub struct QuicStream<Q: QuicStreamOps> {
    core: StreamCore,
    ops: Option<Q>,
    factory: Arc<dyn HandlerFactory>,
    req_headers: Option<Headers>,
}

impl<Q: QuicStreamOps> QuicStream<Q> {
    /// Bind a library stream handle
    pub fn new(ops: Q, factory: Arc<dyn HandlerFactory>, conn_info: Arc<ConnInfo>) -> Self {
        let mut stream = QuicStream {
            core: StreamCore::new(conn_info),
            ops: None,
            factory,
            req_headers: None,
        };
        stream.init(ops);
        stream
    }

    fn init(&mut self, ops: Q) {
        self.set_active_time(Instant::now());
        self.set_protocol(HioProtocol::Quic);

        let mut flag = HioFlags::FLOWCTRL;
        // cleared again by push() if the library refuses
        if !ops.is_pushed() {
            flag |= HioFlags::PUSH_CAPABLE;
        }
        self.set_flag(flag, true);
        self.set_state(HioState::Connected);
        self.set_priority(PRIORITY_HTML as i32);

        debug!(
            stream_id = ops.id(),
            priority = self.priority(),
            flags = self.flags().bits(),
            "quic stream init"
        );
        self.ops = Some(ops);
    }

    /// Library stream id, if still bound
    pub fn stream_id(&self) -> Option<u64> {
        self.ops.as_ref().map(|o| o.id())
    }

    pub fn ops(&self) -> Option<&Q> {
        self.ops.as_ref()
    }

    pub fn ops_mut(&mut self) -> Option<&mut Q> {
        self.ops.as_mut()
    }

    fn process_request_headers(&mut self, headers: Headers) -> Result<()> {
        let handler = self
            .factory
            .create(HioProtocol::Http)
            .ok_or_else(|| Error::Handler("no handler for http".to_string()))?;

        self.attach(handler);
        self.req_headers = Some(headers);
        dispatch(self, HioEvent::InitConnected)?;

        if self.is_want_read() {
            dispatch(self, HioEvent::Read)?;
        }
        Ok(())
    }

    /// The library reports the stream readable
    pub fn on_read(&mut self) -> Result<()> {
        debug!(stream_id = ?self.stream_id(), "quic stream readable");
        if self.has_handler() {
            dispatch(self, HioEvent::Read)?;
        } else if self.state() == HioState::Connected {
            let headers = self.ops.as_mut().and_then(|o| o.take_request_headers());
            match headers {
                Some(headers) => {
                    self.set_active_time(Instant::now());
                    if let Err(e) = self.process_request_headers(headers) {
                        debug!(error = %e, "request setup failed, shutting down");
                        return self.shutdown();
                    }
                }
                None => {
                    debug!("no request header set, shutting down");
                    return self.shutdown();
                }
            }
        }

        if self.state() == HioState::Closing {
            on_peer_close(self)?;
        }
        Ok(())
    }

    /// The library reports the stream writable
    pub fn on_write(&mut self) -> Result<()> {
        if self.state() != HioState::Connected {
            return self.close();
        }
        if self.has_handler() {
            dispatch(self, HioEvent::Write)?;
        }
        if self.state() == HioState::Closing {
            on_peer_close(self)?;
        }
        Ok(())
    }

    /// The library has closed the stream; the handle is gone afterwards
    pub fn on_close(&mut self) -> Result<()> {
        debug!(stream_id = ?self.stream_id(), "quic stream closed");
        let ret = if self.has_handler() {
            dispatch(self, HioEvent::Close)
        } else {
            Ok(())
        };
        self.release_handler();
        self.ops = None;
        ret
    }

    pub fn on_timer(&mut self) -> Result<()> {
        if self.state() == HioState::Connected && self.has_handler() {
            return dispatch(self, HioEvent::Timer);
        }
        Ok(())
    }

    fn check_read(&mut self, ret: io::Result<usize>) -> Result<usize> {
        match ret {
            Ok(0) => {
                if self.state() != HioState::Shutdown {
                    debug!("end of stream detected, closing");
                    self.set_state(HioState::Closing);
                }
                Err(Error::ConnectionClosed)
            }
            Ok(n) => {
                self.add_bytes_recv(n);
                self.set_active_time(Instant::now());
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                self.tobe_closed();
                debug!(error = %e, "read error");
                Err(Error::Io(e))
            }
        }
    }

    fn check_write(&mut self, ret: io::Result<usize>) -> Result<usize> {
        match ret {
            Ok(n) => {
                if n > 0 {
                    self.add_bytes_sent(n);
                    self.set_active_time(Instant::now());
                }
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                self.tobe_closed();
                debug!(error = %e, "close stream, write error");
                Err(Error::Io(e))
            }
        }
    }
}

impl<Q: QuicStreamOps> HioStream for QuicStream<Q> {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StreamCore {
        &mut self.core
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let ret = match self.ops.as_mut() {
            Some(ops) => ops.read(buf),
            None => return Err(Error::NotConnected),
        };
        self.check_read(ret)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let ret = match self.ops.as_mut() {
            Some(ops) => ops.write(buf),
            None => return Err(Error::NotConnected),
        };
        self.check_write(ret)
    }

    fn sendfile(&mut self, file: &Arc<File>, offset: u64, len: usize) -> Result<usize> {
        let mut chunk = vec![0u8; len.min(SENDFILE_CHUNK)];
        let n = file.read_at(&mut chunk, offset)?;
        if n == 0 {
            return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        self.write(&chunk[..n])
    }

    fn send_resp_headers(&mut self, headers: &RespHeaders, no_body: bool) -> Result<()> {
        let fields = headers.field_list();
        match self.ops.as_mut() {
            Some(ops) => ops.send_headers(&fields, no_body).map_err(Error::Io),
            None => Err(Error::NotConnected),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self.ops.as_mut() {
            Some(ops) => ops.flush().map_err(Error::Io),
            None => Err(Error::NotConnected),
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        debug!(stream_id = ?self.stream_id(), "quic stream shutdown");
        if self.state() >= HioState::Shutdown {
            return Ok(());
        }
        self.set_state(HioState::Shutdown);
        self.set_flag(HioFlags::LOCAL_SHUTDOWN, true);
        if self.ops.is_none() {
            return Ok(());
        }
        self.set_active_time(Instant::now());
        match self.ops.as_mut() {
            Some(ops) => ops.close().map_err(Error::Io),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<()> {
        debug!(stream_id = ?self.stream_id(), "quic stream close");
        self.set_state(HioState::Shutdown);
        match self.ops.as_mut() {
            Some(ops) => ops.close().map_err(Error::Io),
            None => Ok(()),
        }
    }

    fn suspend_read(&mut self) {
        if let Some(ops) = self.ops.as_mut() {
            ops.want_read(false);
        }
    }

    fn continue_read(&mut self) {
        if let Some(ops) = self.ops.as_mut() {
            ops.want_read(true);
        }
    }

    fn suspend_write(&mut self) {
        if let Some(ops) = self.ops.as_mut() {
            ops.want_write(false);
        }
    }

    fn continue_write(&mut self) {
        if let Some(ops) = self.ops.as_mut() {
            ops.want_write(true);
        }
    }

    fn switch_write_to_read(&mut self) {}

    fn push(&mut self, url: &str, host: &str, headers: &Headers) -> Result<()> {
        if !self.is_flag(HioFlags::PUSH_CAPABLE) {
            return Err(Error::PushRefused("stream is not push capable".to_string()));
        }
        let ret = match self.ops.as_mut() {
            Some(ops) => ops.push_stream(url, host, headers),
            None => return Err(Error::NotConnected),
        };
        match ret {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(error = %e, url, "push refused, clearing push capability");
                self.set_flag(HioFlags::PUSH_CAPABLE, false);
                Err(Error::PushRefused(e.to_string()))
            }
        }
    }

    fn req_headers(&self) -> Option<&Headers> {
        self.req_headers.as_ref()
    }

    fn crypto_env(&self, id: CryptoEnv) -> Option<String> {
        self.ops.as_ref().and_then(|o| o.crypto_env(id))
    }
}
