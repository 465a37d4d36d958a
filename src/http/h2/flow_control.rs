//! HTTP/2 flow control
//!
//! This module implements flow control windows as defined in RFC 7540
//! Section 5.2. The engine keeps one send window and one receive window per
//! stream, and one of each for the connection.

use super::error::{Error, Result};
use super::{DEFAULT_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE};

/// Flow control window
///
/// A send window may go negative when the peer shrinks the initial window
/// size with SETTINGS; a receive window never does.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    initial_size: u32,
    current_size: i64,
}

impl FlowControlWindow {
    /// Create a new flow control window with default size
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
        }
    }

    pub fn size(&self) -> i64 {
        self.current_size
    }

    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Credit available for sending, 0 when exhausted or negative
    pub fn available(&self) -> usize {
        self.current_size.max(0) as usize
    }

    /// Consume window capacity for sending data
    ///
    /// Returns the amount that can be sent (may be less than requested)
    pub fn consume(&mut self, amount: usize) -> usize {
        if amount == 0 || self.current_size <= 0 {
            return 0;
        }

        let to_send = std::cmp::min(amount as i64, self.current_size) as usize;
        self.current_size -= to_send as i64;
        to_send
    }

    /// Increase window size (WINDOW_UPDATE)
    ///
    /// A zero increment leaves the window untouched. Returns the new size.
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        let new_size = self.current_size + increment as i64;

        // RFC 7540 Section 6.9.1
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "Window size {} exceeds maximum (2^31-1)",
                new_size
            )));
        }

        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Charge received bytes against the window
    ///
    /// Fails without touching the window if the peer sent more than it was
    /// allowed to.
    pub fn receive(&mut self, amount: usize) -> Result<()> {
        if amount as i64 > self.current_size {
            return Err(Error::FlowControl(format!(
                "Received {} bytes with only {} bytes of window",
                amount, self.current_size
            )));
        }
        self.current_size -= amount as i64;
        Ok(())
    }

    /// Update initial window size from SETTINGS
    ///
    /// The current window moves by the difference between the new and the
    /// previous initial size.
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let diff = new_initial_size as i64 - self.initial_size as i64;
        let new_current = self.current_size + diff;

        if new_current > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "New window size {} exceeds maximum (2^31-1)",
                new_current
            )));
        }

        self.initial_size = new_initial_size;
        self.current_size = new_current;
        Ok(())
    }

    /// Increment to announce once `unacked` consumed bytes reach half of
    /// the initial window
    pub fn update_due(&self, unacked: u32) -> Option<u32> {
        if unacked > 0 && unacked >= self.initial_size / 2 {
            Some(unacked)
        } else {
            None
        }
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}
