//! Byte-stream backed stream
//!
//! `ByteStream` puts one `Transport` (a TCP socket, or anything that moves
//! ordered bytes) behind the `HioStream` contract. The event loop calls
//! `on_readable`/`on_writable`/`on_timer` when the transport signals; those
//! are forwarded to the bound handler.

use super::handler::HioEvent;
use super::stream::{dispatch, on_peer_close, HioStream, StreamCore};
use super::transport::Transport;
use super::{ConnInfo, Error, HioFlags, HioProtocol, HioState, Result};
use crate::http::headers::RespHeaders;
use bytes::{Buf, BytesMut};
use std::fs::File;
use std::io::{self, IoSlice};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Stream over a single byte-oriented transport
pub struct ByteStream<T: Transport> {
    core: StreamCore,
    transport: T,
    /// Bytes accepted by `buffered_write` but not yet on the wire
    pending: BytesMut,
}

impl<T: Transport> ByteStream<T> {
    /// Wrap an established transport
    pub fn new(transport: T, conn_info: Arc<ConnInfo>) -> Self {
        let mut stream = ByteStream {
            core: StreamCore::new(conn_info),
            transport,
            pending: BytesMut::new(),
        };
        let sendfile = stream.transport.supports_sendfile();
        let write_buffer = stream.transport.is_write_buffer();
        stream.set_flag(HioFlags::SENDFILE, sendfile);
        stream.set_flag(HioFlags::WRITE_BUFFER, write_buffer);
        stream.set_state(HioState::Connected);
        stream
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Bytes queued by `buffered_write` still waiting for the transport
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queue `data` behind any pending bytes; always accepts everything
    pub fn buffered_write(&mut self, data: &[u8]) -> Result<usize> {
        self.pending.extend_from_slice(data);
        self.flush_pending()?;
        Ok(data.len())
    }

    /// Deliver the connected event to the handler
    pub fn on_init(&mut self) -> Result<()> {
        self.set_active_time(Instant::now());
        dispatch(self, HioEvent::InitConnected)
    }

    /// The transport has become readable
    pub fn on_readable(&mut self) -> Result<()> {
        let ret = dispatch(self, HioEvent::Read);
        if self.state() == HioState::Closing {
            on_peer_close(self)?;
        }
        ret
    }

    /// The transport has become writable
    pub fn on_writable(&mut self) -> Result<()> {
        self.flush_pending()?;
        if self.state() != HioState::Connected {
            return self.close();
        }
        let ret = dispatch(self, HioEvent::Write);
        if self.state() == HioState::Closing {
            on_peer_close(self)?;
        }
        ret
    }

    /// Periodic timer tick
    pub fn on_timer(&mut self) -> Result<()> {
        if self.state() == HioState::Connected && self.has_handler() {
            return dispatch(self, HioEvent::Timer);
        }
        Ok(())
    }

    /// The transport reported a hangup or error
    pub fn on_hangup(&mut self) -> Result<()> {
        self.set_flag(HioFlags::PEER_RESET, true);
        on_peer_close(self)
    }

    fn flush_pending(&mut self) -> Result<bool> {
        while !self.pending.is_empty() {
            match self.transport.write(&self.pending) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.pending.advance(n);
                    self.add_bytes_sent(n);
                }
                Err(e) if is_retry(&e) => return Ok(false),
                Err(e) => {
                    self.tobe_closed();
                    return Err(Error::Io(e));
                }
            }
        }
        Ok(true)
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
            Err(e) if is_retry(&e) => Ok(0),
            Err(e) => {
                self.tobe_closed();
                debug!(error = %e, "write error, closing stream");
                Err(Error::Io(e))
            }
        }
    }
}

fn is_retry(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

impl<T: Transport> HioStream for ByteStream<T> {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StreamCore {
        &mut self.core
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.transport.read(buf) {
            Ok(0) if !buf.is_empty() => {
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
            Err(e) if is_retry(&e) => Ok(0),
            Err(e) => {
                self.tobe_closed();
                debug!(error = %e, "read error");
                Err(Error::Io(e))
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.flush_pending()? {
            return Ok(0);
        }
        let ret = self.transport.write(buf);
        self.check_write(ret)
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        if !self.flush_pending()? {
            return Ok(0);
        }
        let ret = self.transport.write_vectored(bufs);
        self.check_write(ret)
    }

    fn sendfile(&mut self, file: &Arc<File>, offset: u64, len: usize) -> Result<usize> {
        if !self.flush_pending()? {
            return Ok(0);
        }
        let ret = self.transport.sendfile(file, offset, len);
        self.check_write(ret)
    }

    fn send_resp_headers(&mut self, headers: &RespHeaders, _no_body: bool) -> Result<()> {
        self.buffered_write(&headers.to_http1_head())?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.flush_pending()? {
            self.transport.flush().map_err(Error::Io)?;
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.state() >= HioState::Shutdown {
            return Ok(());
        }
        // best effort: a peer that stopped reading must not block shutdown
        let _ = self.flush_pending();
        self.set_state(HioState::Shutdown);
        self.set_flag(HioFlags::LOCAL_SHUTDOWN, true);
        self.transport.shutdown().map_err(Error::Io)
    }

    fn close(&mut self) -> Result<()> {
        debug!(sent = self.bytes_sent(), recv = self.bytes_recv(), "closing byte stream");
        self.shutdown()?;
        self.want_read(false);
        self.want_write(false);
        self.release_handler();
        self.transport.close().map_err(Error::Io)
    }

    fn suspend_read(&mut self) {
        let mut interest = self.transport.interest();
        interest.read = false;
        self.transport.set_interest(interest);
    }

    fn continue_read(&mut self) {
        let mut interest = self.transport.interest();
        interest.read = true;
        self.transport.set_interest(interest);
    }

    fn suspend_write(&mut self) {
        let mut interest = self.transport.interest();
        interest.write = false;
        self.transport.set_interest(interest);
    }

    fn continue_write(&mut self) {
        let mut interest = self.transport.interest();
        interest.write = true;
        self.transport.set_interest(interest);
    }
}

impl<T: Transport> ByteStream<T> {
    /// Tag the stream with the protocol its handler speaks
    pub fn with_protocol(mut self, protocol: HioProtocol) -> Self {
        self.set_protocol(protocol);
        self
    }
}
