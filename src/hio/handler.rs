//! Stream handlers
//!
//! A handler is the protocol logic bound to one stream. The stream owns the
//! bound handler and lends the stream back to it on every callback, so a
//! handler never keeps a pointer to its stream.

use super::stream::HioStream;
use super::{HioProtocol, Result};

/// Lifecycle event delivered to a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HioEvent {
    InitConnected,
    Read,
    Write,
    Close,
    Timer,
}

/// Per-stream protocol handler
pub trait HioHandler {
    /// The stream has reached the application protocol
    fn on_init_connected(&mut self, stream: &mut dyn HioStream) -> Result<()>;

    /// The stream has data to read
    fn on_read(&mut self, stream: &mut dyn HioStream) -> Result<()>;

    /// The stream can accept more output
    fn on_write(&mut self, stream: &mut dyn HioStream) -> Result<()>;

    /// The stream is going away; no further callbacks follow
    fn on_close(&mut self, stream: &mut dyn HioStream) -> Result<()>;

    /// Periodic timer tick
    fn on_timer(&mut self, _stream: &mut dyn HioStream) -> Result<()> {
        Ok(())
    }

    /// Called once the handler is no longer bound to any stream
    fn recycle(&mut self) {}
}

/// Produces a fresh handler for a stream speaking `protocol`
///
/// Factories are shared read-only between connections.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, protocol: HioProtocol) -> Option<Box<dyn HioHandler>>;
}

impl<F> HandlerFactory for F
where
    F: Fn(HioProtocol) -> Option<Box<dyn HioHandler>> + Send + Sync,
{
    fn create(&self, protocol: HioProtocol) -> Option<Box<dyn HioHandler>> {
        self(protocol)
    }
}
