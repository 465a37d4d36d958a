//! Engine configuration
//!
//! `H2Config` holds the tunables of one connection engine. It is built once
//! and shared read-only between connections.

use super::error::{Error, Result};
use super::settings::{Settings, SettingsBuilder};
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use super::{MAX_FRAME_SIZE_LIMIT, MAX_WINDOW_SIZE};
use std::time::Duration;

/// Connection engine tunables
#[derive(Debug, Clone)]
pub struct H2Config {
    /// Streams the peer may have open at once (advertised)
    pub max_concurrent_streams: u32,
    /// Receive window of each stream (advertised)
    pub initial_stream_window: u32,
    /// Receive window of the connection
    pub initial_conn_window: u32,
    /// Largest frame payload we accept (advertised)
    pub max_frame_size: u32,
    /// HPACK decoder table size (advertised)
    pub header_table_size: u32,
    /// Largest header block accepted across HEADERS and CONTINUATION
    pub max_header_block_size: usize,
    /// Buffered output at which the connection stops producing frames
    pub out_buf_threshold: usize,
    /// Push streams open at once
    pub max_push_streams: u32,
    pub enable_push: bool,
    /// Idle time after which a connection with no streams is closed
    pub idle_timeout: Duration,
    /// Keepalive PING interval, none by default
    pub ping_interval: Option<Duration>,
    /// Number of recently reset stream ids remembered
    pub reset_tombstones: usize,
}

impl Default for H2Config {
    fn default() -> Self {
        H2Config {
            max_concurrent_streams: 100,
            initial_stream_window: DEFAULT_INITIAL_WINDOW_SIZE,
            initial_conn_window: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            max_header_block_size: 64 * 1024,
            out_buf_threshold: 32768,
            max_push_streams: 100,
            enable_push: true,
            idle_timeout: Duration::from_secs(120),
            ping_interval: None,
            reset_tombstones: 64,
        }
    }
}

impl H2Config {
    pub fn builder() -> H2ConfigBuilder {
        H2ConfigBuilder::new()
    }

    /// SETTINGS sent when the connection starts
    pub fn local_settings(&self) -> Settings {
        let mut builder = SettingsBuilder::new()
            .max_concurrent_streams(self.max_concurrent_streams)
            .initial_window_size(self.initial_stream_window)
            .max_frame_size(self.max_frame_size);
        if self.header_table_size != DEFAULT_HEADER_TABLE_SIZE {
            builder = builder.header_table_size(self.header_table_size);
        }
        if !self.enable_push {
            builder = builder.enable_push(false);
        }
        // values were range checked by H2ConfigBuilder::build
        builder.build().unwrap_or_default()
    }

    fn validate(&self) -> Result<()> {
        if self.initial_stream_window > MAX_WINDOW_SIZE || self.initial_conn_window > MAX_WINDOW_SIZE {
            return Err(Error::InvalidSettings("window size exceeds 2^31-1".to_string()));
        }
        if self.initial_conn_window < DEFAULT_INITIAL_WINDOW_SIZE {
            return Err(Error::InvalidSettings(
                "connection window cannot be below 65535".to_string(),
            ));
        }
        if !(DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE_LIMIT).contains(&self.max_frame_size) {
            return Err(Error::InvalidSettings(format!(
                "max frame size {} outside 16384-16777215",
                self.max_frame_size
            )));
        }
        if self.out_buf_threshold == 0 {
            return Err(Error::InvalidSettings("output threshold must be positive".to_string()));
        }
        if self.max_header_block_size == 0 {
            return Err(Error::InvalidSettings("header block limit must be positive".to_string()));
        }
        Ok(())
    }
}

/// Builder for `H2Config`
#[derive(Debug, Default)]
pub struct H2ConfigBuilder {
    config: H2Config,
}

impl H2ConfigBuilder {
    pub fn new() -> Self {
        H2ConfigBuilder {
            config: H2Config::default(),
        }
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.max_concurrent_streams = max;
        self
    }

    pub fn initial_stream_window(mut self, size: u32) -> Self {
        self.config.initial_stream_window = size;
        self
    }

    pub fn initial_conn_window(mut self, size: u32) -> Self {
        self.config.initial_conn_window = size;
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.config.header_table_size = size;
        self
    }

    pub fn max_header_block_size(mut self, size: usize) -> Self {
        self.config.max_header_block_size = size;
        self
    }

    pub fn out_buf_threshold(mut self, size: usize) -> Self {
        self.config.out_buf_threshold = size;
        self
    }

    pub fn max_push_streams(mut self, max: u32) -> Self {
        self.config.max_push_streams = max;
        self
    }

    pub fn enable_push(mut self, enable: bool) -> Self {
        self.config.enable_push = enable;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = Some(interval);
        self
    }

    pub fn reset_tombstones(mut self, count: usize) -> Self {
        self.config.reset_tombstones = count;
        self
    }

    pub fn build(self) -> Result<H2Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
