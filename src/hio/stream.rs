//! Stream state shared by every transport variant

use super::handler::{HioEvent, HioHandler};
use super::{ConnInfo, CryptoEnv, Error, HioFlags, HioProtocol, HioState, Result};
use super::{PRIORITY_HIGHEST, PRIORITY_LOWEST};
use crate::http::headers::{Headers, RespHeaders};
use std::fmt;
use std::fs::File;
use std::io::{IoSlice, IoSliceMut};
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// State common to all stream variants
pub struct StreamCore {
    handler: Option<Box<dyn HioHandler>>,
    in_dispatch: bool,
    conn_info: Arc<ConnInfo>,
    bytes_recv: u64,
    bytes_sent: u64,
    state: HioState,
    protocol: HioProtocol,
    priority: u8,
    flags: HioFlags,
    last_active: Instant,
}

impl StreamCore {
    /// Create a disconnected core
    pub fn new(conn_info: Arc<ConnInfo>) -> Self {
        StreamCore {
            handler: None,
            in_dispatch: false,
            conn_info,
            bytes_recv: 0,
            bytes_sent: 0,
            state: HioState::Disconnected,
            protocol: HioProtocol::Http,
            priority: PRIORITY_LOWEST,
            flags: HioFlags::empty(),
            last_active: Instant::now(),
        }
    }

    /// Reinitialize for reuse, dropping any handler without callbacks
    pub fn reset(&mut self, now: Instant) {
        if let Some(mut handler) = self.handler.take() {
            handler.recycle();
        }
        self.in_dispatch = false;
        self.bytes_recv = 0;
        self.bytes_sent = 0;
        self.state = HioState::Disconnected;
        self.protocol = HioProtocol::Http;
        self.priority = PRIORITY_LOWEST;
        self.flags = HioFlags::empty();
        self.last_active = now;
    }
}

impl fmt::Debug for StreamCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCore")
            .field("state", &self.state)
            .field("protocol", &self.protocol)
            .field("priority", &self.priority)
            .field("flags", &format_args!("{:#x}", self.flags.bits()))
            .field("has_handler", &(self.handler.is_some() || self.in_dispatch))
            .field("bytes_recv", &self.bytes_recv)
            .field("bytes_sent", &self.bytes_sent)
            .finish()
    }
}

/// A bidirectional stream with a bound handler
///
/// I/O methods follow one convention: `Ok(0)` means "would block, retry
/// when signalled", `Ok(n)` is the number of bytes processed and `Err` is
/// fatal for this stream.
pub trait HioStream {
    fn core(&self) -> &StreamCore;
    fn core_mut(&mut self) -> &mut StreamCore;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn readv(&mut self, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        match bufs.iter_mut().find(|b| !b.is_empty()) {
            Some(buf) => self.read(buf),
            None => Ok(0),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        let mut total = 0;
        for buf in bufs {
            let n = self.write(buf)?;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    /// Send `len` bytes of `file` starting at `offset`
    fn sendfile(&mut self, file: &Arc<File>, offset: u64, len: usize) -> Result<usize>;

    fn send_resp_headers(&mut self, headers: &RespHeaders, no_body: bool) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Finish the local direction; idempotent once SHUTDOWN is reached
    fn shutdown(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn suspend_read(&mut self);
    fn continue_read(&mut self);
    fn suspend_write(&mut self);
    fn continue_write(&mut self);

    fn switch_write_to_read(&mut self) {
        self.want_write(false);
        self.want_read(true);
    }

    /// Ask the peer to accept a pushed response for `url`
    fn push(&mut self, _url: &str, _host: &str, _headers: &Headers) -> Result<()> {
        Err(Error::Unsupported("push"))
    }

    /// Decoded request headers, for streams that carry a request
    fn req_headers(&self) -> Option<&Headers> {
        None
    }

    fn crypto_env(&self, _id: CryptoEnv) -> Option<String> {
        None
    }

    fn state(&self) -> HioState {
        self.core().state
    }

    /// Advance the lifecycle state; attempts to move backwards are ignored
    fn set_state(&mut self, state: HioState) {
        let core = self.core_mut();
        if state > core.state {
            core.state = state;
        } else if state < core.state {
            trace!(from = ?core.state, to = ?state, "ignoring backward state change");
        }
    }

    fn is_closing(&self) -> bool {
        self.core().state != HioState::Connected
    }

    /// Mark the stream closing unless it is already shut down
    fn tobe_closed(&mut self) {
        if self.core().state < HioState::Shutdown {
            self.set_state(HioState::Closing);
        }
    }

    fn protocol(&self) -> HioProtocol {
        self.core().protocol
    }

    fn set_protocol(&mut self, protocol: HioProtocol) {
        self.core_mut().protocol = protocol;
    }

    fn priority(&self) -> u8 {
        self.core().priority
    }

    /// Set the priority, clamped to `[PRIORITY_HIGHEST, PRIORITY_LOWEST]`
    fn set_priority(&mut self, priority: i32) {
        let clamped = priority.clamp(PRIORITY_HIGHEST as i32, PRIORITY_LOWEST as i32);
        self.core_mut().priority = clamped as u8;
    }

    fn raise_priority(&mut self, by: i32) {
        let current = self.priority() as i32;
        self.set_priority(current - by);
    }

    fn lower_priority(&mut self, by: i32) {
        let current = self.priority() as i32;
        self.set_priority(current + by);
    }

    fn flags(&self) -> HioFlags {
        self.core().flags
    }

    fn set_flag(&mut self, flag: u32, on: bool) {
        self.core_mut().flags.set(flag, on);
    }

    fn is_flag(&self, flag: u32) -> bool {
        self.core().flags.is_set(flag)
    }

    /// Toggle read interest; a no-op if already in the requested state
    fn want_read(&mut self, want: bool) {
        if self.is_flag(HioFlags::WANT_READ) == want {
            return;
        }
        self.set_flag(HioFlags::WANT_READ, want);
        if want {
            self.continue_read();
        } else {
            self.suspend_read();
        }
    }

    /// Toggle write interest; a no-op if already in the requested state
    fn want_write(&mut self, want: bool) {
        if self.is_flag(HioFlags::WANT_WRITE) == want {
            return;
        }
        self.set_flag(HioFlags::WANT_WRITE, want);
        if want {
            self.continue_write();
        } else {
            self.suspend_write();
        }
    }

    fn is_want_read(&self) -> bool {
        self.is_flag(HioFlags::WANT_READ)
    }

    fn is_want_write(&self) -> bool {
        self.is_flag(HioFlags::WANT_WRITE)
    }

    fn is_aborted(&self) -> bool {
        self.is_flag(HioFlags::ABORT)
    }

    fn set_aborted(&mut self) {
        self.set_flag(HioFlags::ABORT, true);
    }

    fn is_peer_shutdown(&self) -> bool {
        self.is_flag(HioFlags::PEER_SHUTDOWN)
    }

    fn is_write_buffer(&self) -> bool {
        self.is_flag(HioFlags::WRITE_BUFFER)
    }

    fn is_sendfile_avail(&self) -> bool {
        self.is_flag(HioFlags::SENDFILE)
    }

    fn bytes_recv(&self) -> u64 {
        self.core().bytes_recv
    }

    fn bytes_sent(&self) -> u64 {
        self.core().bytes_sent
    }

    fn bytes_total(&self) -> u64 {
        self.core().bytes_recv + self.core().bytes_sent
    }

    fn add_bytes_recv(&mut self, n: usize) {
        self.core_mut().bytes_recv += n as u64;
    }

    fn add_bytes_sent(&mut self, n: usize) {
        self.core_mut().bytes_sent += n as u64;
    }

    fn reset_bytes_count(&mut self) {
        let core = self.core_mut();
        core.bytes_recv = 0;
        core.bytes_sent = 0;
    }

    fn active_time(&self) -> Instant {
        self.core().last_active
    }

    fn set_active_time(&mut self, now: Instant) {
        self.core_mut().last_active = now;
    }

    fn conn_info(&self) -> &Arc<ConnInfo> {
        &self.core().conn_info
    }

    fn has_handler(&self) -> bool {
        self.core().handler.is_some() || self.core().in_dispatch
    }

    /// Bind `handler` to this stream, recycling any previous handler
    ///
    /// Called from inside a callback this replaces the running handler once
    /// the callback returns.
    fn attach(&mut self, handler: Box<dyn HioHandler>) {
        let core = self.core_mut();
        core.flags.set(HioFlags::HANDLER_RELEASE, false);
        if let Some(mut old) = core.handler.replace(handler) {
            old.recycle();
        }
    }

    /// Unbind and return the handler
    ///
    /// Returns `None` while the handler is running; it is released when its
    /// callback returns instead.
    fn detach(&mut self) -> Option<Box<dyn HioHandler>> {
        let core = self.core_mut();
        if core.in_dispatch {
            core.flags.set(HioFlags::HANDLER_RELEASE, true);
            return None;
        }
        core.handler.take()
    }

    /// Unbind the handler and recycle it
    fn release_handler(&mut self) {
        if let Some(mut handler) = self.detach() {
            handler.recycle();
        }
    }
}

/// Deliver `event` to the handler bound to `stream`
///
/// The handler is lent the stream for the duration of the call. A release or
/// replacement requested during the callback is applied afterwards.
pub fn dispatch(stream: &mut dyn HioStream, event: HioEvent) -> Result<()> {
    let Some(mut handler) = stream.core_mut().handler.take() else {
        return Ok(());
    };
    stream.core_mut().in_dispatch = true;

    let ret = match event {
        HioEvent::InitConnected => handler.on_init_connected(stream),
        HioEvent::Read => handler.on_read(stream),
        HioEvent::Write => handler.on_write(stream),
        HioEvent::Close => handler.on_close(stream),
        HioEvent::Timer => handler.on_timer(stream),
    };

    let core = stream.core_mut();
    core.in_dispatch = false;
    if core.handler.is_some() {
        // replaced during the callback
        handler.recycle();
    } else if core.flags.is_set(HioFlags::HANDLER_RELEASE) {
        core.flags.set(HioFlags::HANDLER_RELEASE, false);
        handler.recycle();
    } else {
        core.handler = Some(handler);
    }
    ret
}

/// The peer closed the stream: notify the handler, then close
pub fn on_peer_close(stream: &mut dyn HioStream) -> Result<()> {
    stream.set_flag(HioFlags::PEER_SHUTDOWN, true);
    if stream.has_handler() {
        dispatch(stream, HioEvent::Close)?;
    }
    stream.close()
}
