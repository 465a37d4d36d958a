//! HTTP/2 frame and header block encoding
//!
//! `FrameCodec` serializes outgoing frames and decodes frame headers.
//! `HeaderCodec` is the seam to the header compression codec; `HpackCodec`
//! implements it with the `hpack` crate. Both codec directions keep state
//! for the lifetime of a connection.

use super::error::{Error, Result};
use super::frames::*;
use super::settings::SettingsParameter;
use bytes::{BufMut, Bytes, BytesMut};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Frame serialization helpers
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame header
    pub fn encode_header(frame_type: FrameType, flags: FrameFlags, stream_id: u32, length: usize) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        header[3] = frame_type.as_u8();
        header[4] = flags.as_u8();

        // Stream ID (31 bits, big-endian, reserved bit is 0)
        let stream_id = stream_id & 0x7FFFFFFF;
        header[5..9].copy_from_slice(&stream_id.to_be_bytes());

        header
    }

    /// Decode a frame header; the reserved stream id bit is ignored
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
        let length = ((bytes[0] as usize) << 16)
            | ((bytes[1] as usize) << 8)
            | (bytes[2] as usize);

        let stream_id = u32::from_be_bytes([bytes[5] & 0x7F, bytes[6], bytes[7], bytes[8]]);

        FrameHeader {
            length,
            raw_type: bytes[3],
            flags: FrameFlags::from_u8(bytes[4]),
            stream_id,
        }
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut buf = BytesMut::new();

        // Calculate payload size
        let mut payload_len = frame.data.len();
        let mut flags = FrameFlags::empty();

        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }

        // Add padding if requested
        let padding_len = if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize; // 1 byte for length + padding
            pad_len
        } else {
            0
        };

        // Write frame header
        let header = Self::encode_header(FrameType::Data, flags, frame.stream_id, payload_len);
        buf.put_slice(&header);

        // Write padding length if padded
        if frame.padding.is_some() {
            buf.put_u8(padding_len);
        }

        // Write data
        buf.put_slice(&frame.data);

        // Write padding
        if padding_len > 0 {
            buf.put_bytes(0, padding_len as usize);
        }

        buf.freeze()
    }

    /// Encode a HEADERS frame
    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let mut payload_len = frame.header_block.len();
        let mut flags = FrameFlags::empty();

        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        // Add priority if present
        let has_priority = frame.priority.is_some();
        if has_priority {
            flags.set(FrameFlags::PRIORITY);
            payload_len += 5; // Priority is 5 bytes
        }

        // Add padding if requested
        let padding_len = if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
            pad_len
        } else {
            0
        };

        // Write frame header
        let header = Self::encode_header(FrameType::Headers, flags, frame.stream_id, payload_len);
        buf.put_slice(&header);

        // Write padding length if padded
        if frame.padding.is_some() {
            buf.put_u8(padding_len);
        }

        // Write priority if present
        if let Some(priority) = &frame.priority {
            let mut dep = priority.stream_dependency;
            if priority.exclusive {
                dep |= 0x80000000; // Set exclusive bit
            }
            buf.put_u32(dep);
            buf.put_u8(priority.weight);
        }

        // Write header block
        buf.put_slice(&frame.header_block);

        // Write padding
        if padding_len > 0 {
            buf.put_bytes(0, padding_len as usize);
        }

        buf.freeze()
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        // Each setting is 6 bytes (2 byte ID + 4 byte value)
        let mut settings_data = BytesMut::new();

        if !frame.ack {
            let settings = &frame.settings;

            if let Some(val) = settings.header_table_size {
                settings_data.put_u16(SettingsParameter::HeaderTableSize.as_u16());
                settings_data.put_u32(val);
            }
            if let Some(val) = settings.enable_push {
                settings_data.put_u16(SettingsParameter::EnablePush.as_u16());
                settings_data.put_u32(if val { 1 } else { 0 });
            }
            if let Some(val) = settings.max_concurrent_streams {
                settings_data.put_u16(SettingsParameter::MaxConcurrentStreams.as_u16());
                settings_data.put_u32(val);
            }
            if let Some(val) = settings.initial_window_size {
                settings_data.put_u16(SettingsParameter::InitialWindowSize.as_u16());
                settings_data.put_u32(val);
            }
            if let Some(val) = settings.max_frame_size {
                settings_data.put_u16(SettingsParameter::MaxFrameSize.as_u16());
                settings_data.put_u32(val);
            }
            if let Some(val) = settings.max_header_list_size {
                settings_data.put_u16(SettingsParameter::MaxHeaderListSize.as_u16());
                settings_data.put_u32(val);
            }
        }

        // Write frame header (stream ID must be 0 for SETTINGS)
        let header = Self::encode_header(FrameType::Settings, flags, 0, settings_data.len());
        buf.put_slice(&header);
        buf.put_slice(&settings_data);

        buf.freeze()
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        // Write frame header (stream ID must be 0 for PING, payload is always 8 bytes)
        let header = Self::encode_header(FrameType::Ping, flags, 0, 8);
        buf.put_slice(&header);
        buf.put_slice(&frame.data);

        buf.freeze()
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let payload_len = 8 + frame.debug_data.len(); // 4 bytes stream ID + 4 bytes error code + debug data

        // Write frame header (stream ID must be 0 for GOAWAY)
        let header = Self::encode_header(FrameType::Goaway, FrameFlags::empty(), 0, payload_len);
        buf.put_slice(&header);

        // Write last stream ID
        buf.put_u32(frame.last_stream_id & 0x7FFFFFFF);

        // Write error code
        buf.put_u32(frame.error_code.as_u32());

        // Write debug data
        buf.put_slice(&frame.debug_data);

        buf.freeze()
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let mut buf = BytesMut::new();

        // Write frame header (payload is always 4 bytes)
        let header = Self::encode_header(FrameType::WindowUpdate, FrameFlags::empty(), frame.stream_id, 4);
        buf.put_slice(&header);

        // Write window size increment (reserved bit must be 0)
        buf.put_u32(frame.size_increment & 0x7FFFFFFF);

        buf.freeze()
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let mut buf = BytesMut::new();

        // Write frame header (payload is always 4 bytes)
        let header = Self::encode_header(FrameType::RstStream, FrameFlags::empty(), frame.stream_id, 4);
        buf.put_slice(&header);

        // Write error code
        buf.put_u32(frame.error_code.as_u32());

        buf.freeze()
    }

    /// Encode a PRIORITY frame
    pub fn encode_priority_frame(frame: &PriorityFrame) -> Bytes {
        let mut buf = BytesMut::new();

        // Write frame header (payload is always 5 bytes)
        let header = Self::encode_header(FrameType::Priority, FrameFlags::empty(), frame.stream_id, 5);
        buf.put_slice(&header);

        // Write priority
        let mut dep = frame.priority.stream_dependency;
        if frame.priority.exclusive {
            dep |= 0x80000000;
        }
        buf.put_u32(dep);
        buf.put_u8(frame.priority.weight);

        buf.freeze()
    }

    /// Encode a CONTINUATION frame
    pub fn encode_continuation_frame(frame: &ContinuationFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.header_block.len());

        let mut flags = FrameFlags::empty();
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        let header = Self::encode_header(FrameType::Continuation, flags, frame.stream_id, frame.header_block.len());
        buf.put_slice(&header);
        buf.put_slice(&frame.header_block);

        buf.freeze()
    }

    /// Encode a PUSH_PROMISE frame
    pub fn encode_push_promise_frame(frame: &PushPromiseFrame) -> Bytes {
        let payload_len = 4 + frame.header_block.len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);

        let mut flags = FrameFlags::empty();
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        let header = Self::encode_header(FrameType::PushPromise, flags, frame.stream_id, payload_len);
        buf.put_slice(&header);
        buf.put_u32(frame.promised_stream_id & 0x7FFFFFFF);
        buf.put_slice(&frame.header_block);

        buf.freeze()
    }

}

/// Header compression codec driven by the engine
///
/// `decode` failure is fatal for the connection: the shared decoding state
/// can no longer be trusted.
pub trait HeaderCodec {
    fn encode(&mut self, headers: &[(String, String)]) -> Result<Vec<u8>>;

    fn decode(&mut self, block: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// HPACK (RFC 7541) header codec
pub struct HpackCodec {
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
}

impl HpackCodec {
    pub fn new() -> Self {
        HpackCodec {
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
        }
    }

    /// Codec whose decoder dynamic table is bounded by the
    /// HEADER_TABLE_SIZE we advertise
    pub fn with_table_size(table_size: usize) -> Self {
        let mut codec = Self::new();
        codec.decoder.set_max_table_size(table_size);
        codec
    }
}

impl Default for HpackCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderCodec for HpackCodec {
    fn encode(&mut self, headers: &[(String, String)]) -> Result<Vec<u8>> {
        let mut block = Vec::new();
        let header_tuples: Vec<(&[u8], &[u8])> = headers
            .iter()
            .map(|(name, value)| (name.as_bytes(), value.as_bytes()))
            .collect();
        self.encoder
            .encode_into(header_tuples, &mut block)
            .map_err(|e| Error::Internal(format!("HPACK encode error: {}", e)))?;
        Ok(block)
    }

    fn decode(&mut self, block: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.decoder
            .decode(block)
            .map_err(|e| Error::Compression(format!("HPACK decode error: {:?}", e)))
    }
}
