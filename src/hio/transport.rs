//! Raw byte-stream transport boundary
//!
//! A `Transport` is a non-blocking byte pipe plus a readiness subscription.
//! `TcpTransport` is the plain socket implementation; readiness is checked
//! with `poll(2)` the way an event loop would.

use std::fs::File;
use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::time::Duration;

/// Largest chunk copied per call when sendfile(2) is not available
const COPY_CHUNK: usize = 16384;

/// Read/write interest of a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

/// Readiness reported by `TcpTransport::poll`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

/// Byte-oriented transport operations
///
/// `read`/`write` follow `std::io` conventions: `Ok(0)` from `read` is end of
/// stream and `ErrorKind::WouldBlock` means "try later".
pub trait Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match bufs.iter().find(|b| !b.is_empty()) {
            Some(buf) => self.write(buf),
            None => Ok(0),
        }
    }

    /// Send a file segment, zero-copy where the platform allows it
    fn sendfile(&mut self, file: &File, offset: u64, len: usize) -> io::Result<usize> {
        copy_file_segment(self, file, offset, len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Shut down the write direction
    fn shutdown(&mut self) -> io::Result<()>;

    /// Tear down the transport
    fn close(&mut self) -> io::Result<()> {
        self.shutdown()
    }

    fn interest(&self) -> Interest;

    fn set_interest(&mut self, interest: Interest);

    fn supports_sendfile(&self) -> bool {
        false
    }

    /// True when the transport buffers writes internally (e.g. a TLS layer)
    fn is_write_buffer(&self) -> bool {
        false
    }
}

/// Send a file segment by positional read followed by a write
pub fn copy_file_segment<T: Transport + ?Sized>(
    transport: &mut T,
    file: &File,
    offset: u64,
    len: usize,
) -> io::Result<usize> {
    let mut chunk = vec![0u8; len.min(COPY_CHUNK)];
    let n = file.read_at(&mut chunk, offset)?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "file shorter than requested segment",
        ));
    }
    transport.write(&chunk[..n])
}

/// Plain TCP transport
pub struct TcpTransport {
    stream: TcpStream,
    interest: Interest,
}

impl TcpTransport {
    /// Wrap a connected socket, switching it to non-blocking mode
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(TcpTransport {
            stream,
            interest: Interest::default(),
        })
    }

    /// Get a reference to the underlying stream
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Wait until the socket is ready for the current interest
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<Readiness> {
        use libc::{poll, pollfd, POLLERR, POLLHUP, POLLIN, POLLOUT};

        let mut events = 0;
        if self.interest.read {
            events |= POLLIN;
        }
        if self.interest.write {
            events |= POLLOUT;
        }

        let mut pfd = pollfd {
            fd: self.stream.as_raw_fd(),
            events,
            revents: 0,
        };

        let timeout_ms = timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1); // -1 = infinite

        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Readiness {
            readable: pfd.revents & POLLIN != 0,
            writable: pfd.revents & POLLOUT != 0,
            hangup: pfd.revents & (POLLHUP | POLLERR) != 0,
        })
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream.write_vectored(bufs)
    }

    #[cfg(target_os = "linux")]
    fn sendfile(&mut self, file: &File, offset: u64, len: usize) -> io::Result<usize> {
        let mut off = offset as libc::off_t;
        let ret = unsafe {
            libc::sendfile(
                self.stream.as_raw_fd(),
                file.as_raw_fd(),
                &mut off as *mut libc::off_t,
                len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if ret == 0 && len > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shorter than requested segment",
            ));
        }
        Ok(ret as usize)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Write) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn interest(&self) -> Interest {
        self.interest
    }

    fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }

    fn supports_sendfile(&self) -> bool {
        cfg!(target_os = "linux")
    }
}
