//! HTTP/2 connection engine integration tests
//!
//! Each test plays the client against an `H2Connection` bound to an
//! in-memory transport and checks the frames that come back.

mod common;

use bytes::Bytes;
use common::*;
use hiomux::hio::{HandlerFactory, HioHandler, HioProtocol};
use hiomux::http::h2::frames::{ContinuationFrame, DataFrame, FrameFlags, HeadersFrame};
use hiomux::http::h2::{ErrorCode, FrameCodec, FrameType, H2Config, SettingsBuilder};
use hiomux::http::Headers;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

fn config() -> H2Config {
    H2Config::default()
}

/// Frames grouped by stream, header blocks compared decoded
fn per_stream(frames: &[Received]) -> BTreeMap<u32, Vec<(FrameType, u8, Vec<(String, String)>, Bytes)>> {
    let mut map: BTreeMap<u32, Vec<_>> = BTreeMap::new();
    for f in frames {
        map.entry(f.stream_id).or_default().push((
            f.frame_type,
            f.flags,
            f.headers.clone(),
            f.payload.clone(),
        ));
    }
    map
}

#[test]
fn test_settings_exchange() {
    let mut h = Harness::new(H2Config::builder().initial_conn_window(1 << 20).build().unwrap());

    let frames = h.start();
    assert_eq!(frames.len(), 2);
    assert!(frames[0].is(FrameType::Settings));
    assert!(!frames[0].has_flag(FrameFlags::ACK));
    assert!(frames[1].is(FrameType::WindowUpdate));
    assert_eq!(frames[1].stream_id, 0);
    assert_eq!(frames[1].window_increment(), (1 << 20) - 65535);

    let frames = h.send(&Client::preface());
    assert_eq!(frames.len(), 1);
    assert!(frames[0].is(FrameType::Settings));
    assert!(frames[0].has_flag(FrameFlags::ACK));
    assert!(!h.conn.is_settings_acked());

    h.send(&Client::settings_ack());
    assert!(h.conn.is_settings_acked());
    assert!(h.io.transport().interest.read);
}

#[test]
fn test_simple_get() {
    let mut h = Harness::established(config());
    let req = h.client.get(1, "/", true);
    let frames = h.send(&req);

    assert_eq!(frames.len(), 2);
    assert!(frames[0].is(FrameType::Headers));
    assert_eq!(frames[0].stream_id, 1);
    assert_eq!(frames[0].header(":status"), Some("200"));
    assert_eq!(frames[0].header("content-length"), Some("5"));
    assert!(frames[0].has_flag(FrameFlags::END_HEADERS));
    assert!(!frames[0].is_end_stream());

    assert!(frames[1].is(FrameType::Data));
    assert_eq!(&frames[1].payload[..], b"hello");
    assert!(frames[1].is_end_stream());

    assert_eq!(h.conn.stream_count(), 0);
    assert_eq!(h.conn.last_peer_stream_id(), 1);
    assert_eq!(
        entries(&h.journal),
        vec!["init / [:method=GET,:scheme=http,:authority=localhost,:path=/]"]
    );
}

#[test]
fn test_headers_only_response() {
    let mut h = Harness::established(config());
    let req = h.client.get(1, "/empty", true);
    let frames = h.send(&req);

    assert_eq!(frames.len(), 1);
    assert!(frames[0].is(FrameType::Headers));
    assert!(frames[0].is_end_stream());
    assert_eq!(frames[0].header("content-length"), Some("0"));
    assert_eq!(h.conn.stream_count(), 0);
}

#[test]
fn test_request_body_then_response() {
    let mut h = Harness::established(config());
    let req = h.client.get(1, "/upload", false);
    assert!(h.send(&req).is_empty());
    assert_eq!(h.conn.stream_count(), 1);

    assert!(h.send(&Client::data(1, b"abc", false)).is_empty());
    let frames = h.send(&Client::data(1, b"defg", true));

    assert_eq!(data_of(&frames, 1), b"hello");
    assert!(entries(&h.journal).contains(&"body /upload 7".to_string()));
    assert_eq!(h.conn.stream_count(), 0);
}

#[test]
fn test_request_trailers() {
    let mut h = Harness::established(config());
    let req = h.client.get(1, "/upload", false);
    h.send(&req);
    h.send(&Client::data(1, b"abc", false));
    let block = h.client.block(&[("x-checksum", "900150983cd24fb0")]);
    let frames = h.send(&Client::headers(1, block, true));

    assert!(find(&frames, FrameType::RstStream).is_none());
    assert_eq!(data_of(&frames, 1), b"hello");
    assert!(entries(&h.journal).contains(&"body /upload 3".to_string()));
}

#[test]
fn test_fragmentation_invariance() {
    let mut client = Client::new();
    let mut wire = Client::preface();
    wire.extend_from_slice(&client.get(1, "/", true));
    wire.extend_from_slice(&client.get(3, "/bytes/300", true));
    let post = client.block(&request_fields("POST", "/upload"));
    wire.extend_from_slice(&Client::headers(5, post, false));
    wire.extend_from_slice(&Client::data(5, b"request body", true));
    wire.extend_from_slice(&Client::ping(*b"pingpong"));

    let mut whole = Harness::new(config());
    whole.start();
    let expected = whole.send(&wire);

    for size in [1, 7, 13, 100] {
        let mut pieces = Harness::new(config());
        pieces.start();
        let got = pieces.send_in_pieces(&wire, size);
        assert_eq!(per_stream(&got), per_stream(&expected), "pieces of {}", size);
        assert_eq!(entries(&pieces.journal), entries(&whole.journal), "pieces of {}", size);
    }
    assert_eq!(data_of(&expected, 3), pattern(300));
}

#[test]
fn test_continuation_equals_single_block() {
    let extra: Vec<(String, String)> = (0..40)
        .map(|i| (format!("x-header-{}", i), format!("value-{}-{}", i, "v".repeat(20))))
        .collect();
    let mut fields = request_fields("GET", "/");
    fields.extend(extra.iter().map(|(n, v)| (n.as_str(), v.as_str())));
    let block = Client::new().block(&fields);
    assert!(block.len() > 400);

    let mut single = Harness::established(config());
    let expected = single.send(&Client::headers(1, block.clone(), true));

    let mut split = Harness::established(config());
    let quarter = block.len() / 4;
    let mut wire = FrameCodec::encode_headers_frame(&HeadersFrame::new(
        1,
        Bytes::copy_from_slice(&block[..quarter]),
        true,
        false,
    ))
    .to_vec();
    let rest: Vec<&[u8]> = block[quarter..].chunks(quarter).collect();
    for (i, chunk) in rest.iter().enumerate() {
        let last = i + 1 == rest.len();
        wire.extend_from_slice(&FrameCodec::encode_continuation_frame(&ContinuationFrame::new(
            1,
            Bytes::copy_from_slice(chunk),
            last,
        )));
    }
    let got = split.send(&wire);

    assert_eq!(entries(&split.journal), entries(&single.journal));
    assert_eq!(per_stream(&got), per_stream(&expected));
    assert!(entries(&split.journal)[0].contains("x-header-39=value-39-"));
}

#[test]
fn test_interleaved_header_block_is_connection_error() {
    let mut h = Harness::established(config());
    let block = h.client.block(&request_fields("GET", "/"));
    let open = FrameCodec::encode_headers_frame(&HeadersFrame::new(1, Bytes::from(block), true, false));
    h.send(&open);
    let frames = h.send(&Client::ping(*b"12345678"));

    assert_eq!(frames.len(), 1);
    assert!(frames[0].is(FrameType::Goaway));
    assert_eq!(frames[0].error_code(), Some(ErrorCode::ProtocolError));
    assert!(h.conn.is_closed());
    assert!(h.is_transport_shut());
    assert!(entries(&h.journal).is_empty());
}

#[test]
fn test_continuation_on_other_stream_is_connection_error() {
    let mut h = Harness::established(config());
    let block = h.client.block(&request_fields("GET", "/"));
    let (head, tail) = block.split_at(block.len() / 2);
    let mut wire = FrameCodec::encode_headers_frame(&HeadersFrame::new(
        1,
        Bytes::copy_from_slice(head),
        true,
        false,
    ))
    .to_vec();
    wire.extend_from_slice(&FrameCodec::encode_continuation_frame(&ContinuationFrame::new(
        3,
        Bytes::copy_from_slice(tail),
        true,
    )));
    let frames = h.send(&wire);

    let goaway = find(&frames, FrameType::Goaway).expect("GOAWAY sent");
    assert_eq!(goaway.error_code(), Some(ErrorCode::ProtocolError));
    assert!(h.conn.is_closed());
}

#[test]
fn test_priority_orders_responses() {
    let mut h = Harness::established(config());
    let mut wire = Vec::new();
    for (id, weight) in [(1, 15), (3, 255), (5, 159), (7, 255)] {
        let block = h.client.block(&request_fields("GET", "/"));
        wire.extend_from_slice(&Client::headers_with_priority(id, block, weight));
    }
    let frames = h.send(&wire);

    let order: Vec<u32> = frames
        .iter()
        .filter(|f| f.is(FrameType::Headers))
        .map(|f| f.stream_id)
        .collect();
    assert_eq!(order, vec![3, 7, 5, 1]);
    for id in [1, 3, 5, 7] {
        assert_eq!(data_of(&frames, id), b"hello");
    }
}

#[test]
fn test_priority_frame_moves_queued_stream() {
    let mut h = Harness::established(config());
    let mut wire = Vec::new();
    for id in [1, 3, 5] {
        wire.extend_from_slice(&h.client.get(id, "/", true));
    }
    wire.extend_from_slice(&Client::priority(5, 255));
    let frames = h.send(&wire);

    let order: Vec<u32> = frames
        .iter()
        .filter(|f| f.is(FrameType::Headers))
        .map(|f| f.stream_id)
        .collect();
    assert_eq!(order, vec![5, 1, 3]);
}

#[test]
fn test_graceful_shutdown_refuses_new_streams() {
    let mut h = Harness::established(config());
    let req = h.client.get(1, "/upload", false);
    h.send(&req);

    h.conn.begin_shutdown(&mut h.io).unwrap();
    let frames = h.frames();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].is(FrameType::Goaway));
    assert_eq!(frames[0].goaway_last_stream_id(), 1);
    assert_eq!(frames[0].error_code(), Some(ErrorCode::NoError));
    assert!(h.conn.is_goaway_sent());
    assert!(!h.conn.is_closed());

    let req = h.client.get(3, "/", true);
    let frames = h.send(&req);
    assert_eq!(frames.len(), 1);
    assert!(frames[0].is(FrameType::RstStream));
    assert_eq!(frames[0].stream_id, 3);
    assert_eq!(frames[0].error_code(), Some(ErrorCode::RefusedStream));
    assert_eq!(h.conn.stream_count(), 1);

    // the open stream still completes, then the connection goes away
    let frames = h.send(&Client::data(1, b"abc", true));
    assert_eq!(data_of(&frames, 1), b"hello");
    assert!(h.conn.is_closed());
    assert!(h.is_transport_shut());
}

#[test]
fn test_data_on_stream_refused_after_goaway_is_dropped() {
    let mut h = Harness::established(config());
    let req = h.client.get(1, "/upload", false);
    h.send(&req);
    h.conn.begin_shutdown(&mut h.io).unwrap();
    h.frames();

    let req = h.client.get(3, "/upload", false);
    let frames = h.send(&req);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].error_code(), Some(ErrorCode::RefusedStream));
    assert_eq!(h.conn.last_peer_stream_id(), 1);

    // body the client sent before it saw the reset
    assert!(h.send(&Client::data(3, b"abc", false)).is_empty());
    assert!(h.send(&Client::data(3, b"def", true)).is_empty());
    assert!(!h.conn.is_closed());

    let frames = h.send(&Client::data(1, b"abc", true));
    assert_eq!(data_of(&frames, 1), b"hello");
    assert!(find(&frames, FrameType::Goaway).is_none());
    assert!(h.conn.is_closed());
}

#[test]
fn test_peer_goaway_drains_connection() {
    let mut h = Harness::established(config());
    let req = h.client.get(1, "/upload", false);
    h.send(&req);

    assert!(h.send(&Client::goaway(0, ErrorCode::NoError)).is_empty());
    assert!(h.conn.is_goaway_received());
    assert_eq!(h.conn.stream_count(), 1);

    let frames = h.send(&Client::data(1, b"", true));
    assert_eq!(data_of(&frames, 1), b"hello");
    assert!(h.conn.is_closed());
}

#[test]
fn test_rst_stream_for_unknown_stream_is_ignored() {
    let mut h = Harness::established(config());
    let req = h.client.get(1, "/", true);
    h.send(&req);

    assert!(h.send(&Client::rst_stream(1, ErrorCode::Cancel)).is_empty());
    assert!(h.send(&Client::rst_stream(99, ErrorCode::Cancel)).is_empty());
    assert!(!h.conn.is_closed());

    let req = h.client.get(3, "/", true);
    let frames = h.send(&req);
    assert_eq!(data_of(&frames, 3), b"hello");
}

#[test]
fn test_peer_reset_closes_stream() {
    let mut h = Harness::established(config());
    let req = h.client.get(1, "/bytes/100000", true);
    let frames = h.send(&req);
    assert_eq!(data_of(&frames, 1).len(), 65535);
    assert_eq!(h.conn.stream_count(), 1);

    assert!(h.send(&Client::rst_stream(1, ErrorCode::Cancel)).is_empty());
    assert_eq!(h.conn.stream_count(), 0);
    assert!(entries(&h.journal).contains(&"close /bytes/100000".to_string()));

    // late frames for the reset stream are dropped quietly
    assert!(h.send(&Client::window_update(1, 1000)).is_empty());
    assert!(h.send(&Client::data(1, b"late", true)).is_empty());
    assert!(!h.conn.is_closed());
}

#[test]
fn test_zero_window_update_is_ignored() {
    let mut h = Harness::established(config());
    let req = h.client.get(1, "/early", false);
    h.send(&req);
    let before = h.conn.stream(1).unwrap().send_window().size();

    assert!(h.send(&Client::window_update(0, 0)).is_empty());
    assert!(h.send(&Client::window_update(1, 0)).is_empty());
    assert_eq!(h.conn.send_window(), 65535 - 5);
    assert_eq!(h.conn.stream(1).unwrap().send_window().size(), before);
    assert!(!h.conn.is_closed());
}

#[test]
fn test_connection_window_overflow_is_connection_error() {
    let mut h = Harness::established(config());
    let frames = h.send(&Client::window_update(0, 0x7fff_ffff));
    let goaway = find(&frames, FrameType::Goaway).expect("GOAWAY sent");
    assert_eq!(goaway.error_code(), Some(ErrorCode::FlowControlError));
    assert!(h.conn.is_closed());
}

#[test]
fn test_initial_window_change_adjusts_open_streams() {
    let mut h = Harness::established(config());
    let req = h.client.get(1, "/early", false);
    let frames = h.send(&req);
    assert_eq!(data_of(&frames, 1), b"hello");
    let req = h.client.get(3, "/upload", false);
    h.send(&req);
    assert_eq!(h.conn.stream(1).unwrap().send_window().size(), 65535 - 5);

    let settings = SettingsBuilder::new().initial_window_size(100_000).build().unwrap();
    let frames = h.send(&Client::settings(settings));
    assert!(frames[0].has_flag(FrameFlags::ACK));
    assert_eq!(h.conn.stream(1).unwrap().send_window().size(), 100_000 - 5);
    assert_eq!(h.conn.stream(3).unwrap().send_window().size(), 100_000);

    let settings = SettingsBuilder::new().initial_window_size(0).build().unwrap();
    h.send(&Client::settings(settings));
    assert_eq!(h.conn.stream(1).unwrap().send_window().size(), -5);
    assert_eq!(h.conn.stream(3).unwrap().send_window().size(), 0);
    // the connection window is not affected by SETTINGS
    assert_eq!(h.conn.send_window(), 65535 - 5);

    // END_STREAM needs no window credit
    let frames = h.send(&Client::data(1, b"", true));
    let last = frames.last().expect("END_STREAM sent");
    assert!(last.is(FrameType::Data));
    assert!(last.is_end_stream());
    assert!(last.payload.is_empty());
}

#[test]
fn test_flow_control_pauses_and_resumes_output() {
    let mut h = Harness::established(config());
    let req = h.client.get(1, "/bytes/100000", true);
    let mut frames = h.send(&req);
    assert_eq!(data_of(&frames, 1).len(), 65535);
    assert_eq!(h.conn.send_window(), 0);
    assert!(frames.iter().all(|f| !f.is_end_stream()));

    // connection credit alone is not enough
    assert!(h.send(&Client::window_update(0, 40_000)).is_empty());

    frames.extend(h.send(&Client::window_update(1, 40_000)));
    assert_eq!(data_of(&frames, 1), pattern(100_000));
    assert!(frames.last().unwrap().is_end_stream());
    assert!(frames
        .iter()
        .filter(|f| f.is(FrameType::Data))
        .all(|f| f.payload.len() <= 16384));
    assert_eq!(h.conn.send_window(), 65535 + 40_000 - 100_000);
    assert_eq!(h.conn.stream_count(), 0);
}

#[test]
fn test_stream_flow_control_violation_resets_stream() {
    let mut h = Harness::established(H2Config::builder().initial_stream_window(16).build().unwrap());
    let req = h.client.get(1, "/upload", false);
    h.send(&req);

    let frames = h.send(&Client::data(1, &[0u8; 17], false));
    assert_eq!(frames.len(), 1);
    assert!(frames[0].is(FrameType::RstStream));
    assert_eq!(frames[0].error_code(), Some(ErrorCode::FlowControlError));
    assert_eq!(h.conn.stream_count(), 0);
    assert!(entries(&h.journal).contains(&"close /upload".to_string()));
    assert!(!h.conn.is_closed());

    assert!(h.send(&Client::data(1, b"x", true)).is_empty());
}

#[test]
fn test_receive_window_is_replenished() {
    let mut h = Harness::established(config());
    let req = h.client.get(1, "/upload", false);
    h.send(&req);

    let chunk = vec![7u8; 16384];
    let mut updates = Vec::new();
    for _ in 0..3 {
        updates.extend(h.send(&Client::data(1, &chunk, false)));
    }
    let conn_update = updates
        .iter()
        .find(|f| f.is(FrameType::WindowUpdate) && f.stream_id == 0)
        .expect("connection WINDOW_UPDATE");
    assert!(conn_update.window_increment() >= 32767);
    assert!(updates
        .iter()
        .any(|f| f.is(FrameType::WindowUpdate) && f.stream_id == 1));
    assert!(!h.conn.is_closed());
}

#[test]
fn test_padded_frames() {
    let mut h = Harness::established(config());
    let block = h.client.block(&request_fields("POST", "/upload"));
    let headers = HeadersFrame::new(1, Bytes::from(block), false, true).with_padding(8);
    assert!(h.send(&FrameCodec::encode_headers_frame(&headers)).is_empty());
    assert_eq!(h.conn.stream_count(), 1);

    let data = DataFrame::new(1, Bytes::from(vec![1u8; 40]), true).with_padding(20);
    let frames = h.send(&FrameCodec::encode_data_frame(&data));
    assert_eq!(data_of(&frames, 1), b"hello");
    assert!(entries(&h.journal).contains(&"body /upload 40".to_string()));
}

#[test]
fn test_padding_counts_against_stream_window() {
    let mut h = Harness::established(H2Config::builder().initial_stream_window(100).build().unwrap());
    let req = h.client.get(1, "/upload", false);
    h.send(&req);

    // 40 body bytes fit, the pad length byte and 60 padding bytes do not
    let data = DataFrame::new(1, Bytes::from(vec![1u8; 40]), false).with_padding(60);
    let frames = h.send(&FrameCodec::encode_data_frame(&data));
    assert_eq!(frames.len(), 1);
    assert!(frames[0].is(FrameType::RstStream));
    assert_eq!(frames[0].error_code(), Some(ErrorCode::FlowControlError));
    assert!(!h.conn.is_closed());
}

#[test]
fn test_server_push() {
    let mut h = Harness::established(config());
    let req = h.client.get(1, "/push", true);
    let frames = h.send(&req);

    assert!(frames[0].is(FrameType::PushPromise));
    assert_eq!(frames[0].stream_id, 1);
    assert_eq!(frames[0].promised_stream_id(), 2);
    assert_eq!(frames[0].header(":method"), Some("GET"));
    assert_eq!(frames[0].header(":scheme"), Some("http"));
    assert_eq!(frames[0].header(":authority"), Some("localhost"));
    assert_eq!(frames[0].header(":path"), Some("/style.css"));

    let pushed = frames
        .iter()
        .find(|f| f.is(FrameType::Headers) && f.stream_id == 2)
        .expect("pushed response");
    assert_eq!(pushed.header("x-path"), Some("/style.css"));
    assert_eq!(data_of(&frames, 1), b"hello");
    assert_eq!(data_of(&frames, 2), b"hello");
    assert_eq!(h.conn.push_count(), 0);
    assert_eq!(h.conn.stream_count(), 0);
}

#[test]
fn test_push_refused_when_peer_disables_it() {
    let mut h = Harness::established(config());
    let settings = SettingsBuilder::new().enable_push(false).build().unwrap();
    h.send(&Client::settings(settings));

    let req = h.client.get(1, "/push", true);
    let frames = h.send(&req);
    assert!(find(&frames, FrameType::PushPromise).is_none());
    assert_eq!(data_of(&frames, 1), b"hello");
    assert!(entries(&h.journal).contains(&"push refused /push".to_string()));
}

#[test]
fn test_push_limit_refuses_extra_promises() {
    let mut h = Harness::established(H2Config::builder().max_push_streams(1).build().unwrap());
    // a zero stream window holds pushed responses open
    let settings = SettingsBuilder::new().initial_window_size(0).build().unwrap();
    h.send(&Client::settings(settings));

    let req = h.client.get(1, "/push", true);
    let frames = h.send(&req);
    let promise = find(&frames, FrameType::PushPromise).expect("PUSH_PROMISE");
    assert_eq!(promise.promised_stream_id(), 2);
    assert_eq!(h.conn.push_count(), 1);

    let req = h.client.get(3, "/push-more", true);
    let frames = h.send(&req);
    assert!(find(&frames, FrameType::PushPromise).is_none());
    assert_eq!(h.conn.push_count(), 1);

    // once the pushed response completes the slot is free again
    let frames = h.send(&Client::window_update(2, 100));
    assert_eq!(data_of(&frames, 2), b"hello");
    assert_eq!(h.conn.push_count(), 0);

    let req = h.client.get(5, "/push-again", true);
    let frames = h.send(&req);
    let promise = find(&frames, FrameType::PushPromise).expect("PUSH_PROMISE");
    assert_eq!(promise.stream_id, 5);
    assert_eq!(promise.promised_stream_id(), 4);
}

#[test]
fn test_ping_is_echoed() {
    let mut h = Harness::established(config());
    let frames = h.send(&Client::ping(*b"abcdefgh"));
    assert_eq!(frames.len(), 1);
    assert!(frames[0].is(FrameType::Ping));
    assert!(frames[0].has_flag(FrameFlags::ACK));
    assert_eq!(&frames[0].payload[..], b"abcdefgh");
}

#[test]
fn test_unknown_frame_type_is_skipped() {
    let mut h = Harness::established(config());
    assert!(h.send(&Client::raw(0xfa, 0, 0, b"extension")).is_empty());
    let req = h.client.get(1, "/", true);
    let frames = h.send(&req);
    assert_eq!(data_of(&frames, 1), b"hello");
}

#[test]
fn test_undecodable_header_block_is_compression_error() {
    let mut h = Harness::established(config());
    // indexed field 63 points past the static table into an empty dynamic table
    let frames = h.send(&Client::headers(1, vec![0xbf], true));
    let goaway = find(&frames, FrameType::Goaway).expect("GOAWAY sent");
    assert_eq!(goaway.error_code(), Some(ErrorCode::CompressionError));
    assert!(h.conn.is_closed());
    assert!(entries(&h.journal).is_empty());
}

#[test]
fn test_bad_preface_closes_without_goaway() {
    let mut h = Harness::new(config());
    h.start();
    let frames = h.send(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(frames.is_empty());
    assert!(h.conn.is_closed());
    assert!(h.is_transport_shut());
}

#[test]
fn test_oversized_frame_is_connection_error() {
    let mut h = Harness::established(config());
    let frames = h.send(&Client::raw(0x0, 0, 1, &vec![0u8; 16385]));
    let goaway = find(&frames, FrameType::Goaway).expect("GOAWAY sent");
    assert_eq!(goaway.error_code(), Some(ErrorCode::FrameSizeError));
    assert!(h.conn.is_closed());
}

#[test]
fn test_oversized_header_block_is_refused() {
    let mut h = Harness::established(H2Config::builder().max_header_block_size(64).build().unwrap());
    let long = "a".repeat(200);
    let mut fields = request_fields("GET", "/");
    fields.push(("x-long", long.as_str()));
    let block = h.client.block(&fields);
    let frames = h.send(&Client::headers(1, block, true));

    let goaway = find(&frames, FrameType::Goaway).expect("GOAWAY sent");
    assert_eq!(goaway.error_code(), Some(ErrorCode::EnhanceYourCalm));
    assert!(h.conn.is_closed());
}

#[test]
fn test_data_on_idle_stream_is_connection_error() {
    let mut h = Harness::established(config());
    let frames = h.send(&Client::data(9, b"x", false));
    let goaway = find(&frames, FrameType::Goaway).expect("GOAWAY sent");
    assert_eq!(goaway.error_code(), Some(ErrorCode::ProtocolError));
}

#[test]
fn test_headers_on_even_stream_is_connection_error() {
    let mut h = Harness::established(config());
    let req = h.client.get(2, "/", true);
    let frames = h.send(&req);
    let goaway = find(&frames, FrameType::Goaway).expect("GOAWAY sent");
    assert_eq!(goaway.error_code(), Some(ErrorCode::ProtocolError));
}

#[test]
fn test_reused_stream_id_is_refused() {
    let mut h = Harness::established(config());
    let req = h.client.get(3, "/", true);
    h.send(&req);
    let req = h.client.get(1, "/", true);
    let frames = h.send(&req);

    assert_eq!(frames.len(), 1);
    assert!(frames[0].is(FrameType::RstStream));
    assert_eq!(frames[0].error_code(), Some(ErrorCode::StreamClosed));
    assert!(!h.conn.is_closed());
}

#[test]
fn test_concurrency_limit_refuses_stream() {
    let mut h = Harness::established(H2Config::builder().max_concurrent_streams(1).build().unwrap());
    let req = h.client.get(1, "/upload", false);
    h.send(&req);

    let req = h.client.get(3, "/", true);
    let frames = h.send(&req);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].error_code(), Some(ErrorCode::RefusedStream));

    h.send(&Client::data(1, b"", true));
    let req = h.client.get(5, "/", true);
    let frames = h.send(&req);
    assert_eq!(data_of(&frames, 5), b"hello");
}

#[test]
fn test_refused_stream_is_reset_once() {
    let mut h = Harness::established(H2Config::builder().max_concurrent_streams(1).build().unwrap());
    let req = h.client.get(1, "/upload", false);
    h.send(&req);

    let req = h.client.get(3, "/upload", false);
    let mut frames = h.send(&req);
    for _ in 0..5 {
        frames.extend(h.send(&Client::data(3, b"x", false)));
    }

    let resets: Vec<&Received> = frames.iter().filter(|f| f.is(FrameType::RstStream)).collect();
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].stream_id, 3);
    assert_eq!(resets[0].error_code(), Some(ErrorCode::RefusedStream));
    assert!(!h.conn.is_closed());
    assert_eq!(h.conn.stream_count(), 1);
}

#[test]
fn test_failing_handler_resets_only_its_stream() {
    let mut h = Harness::established(config());
    let req = h.client.get(1, "/fail", true);
    let frames = h.send(&req);

    assert_eq!(frames.len(), 1);
    assert!(frames[0].is(FrameType::RstStream));
    assert_eq!(frames[0].error_code(), Some(ErrorCode::InternalError));
    assert!(entries(&h.journal).contains(&"close /fail".to_string()));

    let req = h.client.get(3, "/", true);
    let frames = h.send(&req);
    assert_eq!(data_of(&frames, 3), b"hello");
}

#[test]
fn test_missing_handler_refuses_stream() {
    let factory: Arc<dyn HandlerFactory> =
        Arc::new(|_: HioProtocol| -> Option<Box<dyn HioHandler>> { None });
    let mut h = Harness::with_factory(config(), factory, journal());
    h.start();
    h.send(&Client::preface());
    let req = h.client.get(1, "/", true);
    let frames = h.send(&req);

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].error_code(), Some(ErrorCode::RefusedStream));
    assert_eq!(h.conn.stream_count(), 0);
}

#[test]
fn test_blocked_transport_pauses_reading() {
    let mut h = Harness::established(config());
    h.io.transport_mut().write_budget = Some(0);
    let req = h.client.get(1, "/bytes/40000", true);
    assert!(h.send(&req).is_empty());

    assert!(h.conn.pending_output() >= 32768);
    assert!(h.conn.is_read_paused());
    assert!(!h.io.transport().interest.read);
    assert!(h.io.transport().interest.write);

    h.io.transport_mut().write_budget = None;
    let frames = h.writable();
    assert_eq!(data_of(&frames, 1), pattern(40_000));
    assert!(!h.conn.is_read_paused());
    assert!(h.io.transport().interest.read);
    assert!(!h.io.transport().interest.write);
    assert_eq!(h.conn.pending_output(), 0);
}

#[test]
fn test_ping_burst_stops_reading_at_threshold() {
    let mut h = Harness::established(H2Config::builder().out_buf_threshold(1024).build().unwrap());
    h.io.transport_mut().write_budget = Some(0);
    for i in 0..200u8 {
        h.io.transport_mut().input.push_back(Client::ping([i; 8]).to_vec());
    }
    h.conn.on_read(&mut h.io).unwrap();

    // each 17 byte PING ACK is queued until the threshold is crossed
    assert_eq!(h.conn.pending_output(), 61 * 17);
    assert!(h.conn.is_read_paused());
    assert_eq!(h.io.transport().input.len(), 200 - 61);

    h.io.transport_mut().write_budget = None;
    let mut frames = h.writable();
    assert!(!h.conn.is_read_paused());
    h.conn.on_read(&mut h.io).unwrap();
    frames.extend(h.frames());

    let acks: Vec<u8> = frames
        .iter()
        .filter(|f| f.is(FrameType::Ping) && f.has_flag(FrameFlags::ACK))
        .map(|f| f.payload[0])
        .collect();
    assert_eq!(acks, (0..200u8).collect::<Vec<_>>());
    assert!(h.io.transport().input.is_empty());
}

#[test]
fn test_write_buffer_transport_drains_to_zero() {
    fn partial_then_retry(write_buffer: bool) -> (usize, usize) {
        let transport = MockTransport {
            write_buffer,
            ..MockTransport::default()
        };
        let mut h = Harness::with_transport(transport, config());
        h.start();
        h.send(&Client::preface());
        h.send(&Client::settings_ack());
        h.frames();

        // two streams so body bytes stay queued behind a full buffer
        h.io.transport_mut().write_budget = Some(0);
        let mut reqs = h.client.get(1, "/bytes/60000", true).to_vec();
        reqs.extend_from_slice(&h.client.get(3, "/bytes/60000", true));
        h.send(&reqs);
        assert!(h.conn.pending_output() >= 32768);

        h.io.transport_mut().write_budget = Some(20_000);
        h.writable();
        let after_partial = h.conn.pending_output();
        h.writable();
        let after_retry = h.conn.pending_output();

        h.io.transport_mut().write_budget = None;
        h.writable();
        assert_eq!(h.conn.pending_output(), 0);
        (after_partial, after_retry)
    }

    // a buffering transport gets nothing new until the backlog is gone
    let (partial, retry) = partial_then_retry(true);
    assert!(partial < 32768);
    assert_eq!(retry, partial);

    // a plain transport is refilled up to the threshold
    let (partial, retry) = partial_then_retry(false);
    assert!(partial < 32768);
    assert!(retry >= 32768);
}

#[test]
fn test_file_body_is_sent_from_file() {
    let body = pattern(20_000);
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&body).unwrap();
    let file = Arc::new(file);

    let factory: Arc<dyn HandlerFactory> = Arc::new(move |_: HioProtocol| -> Option<Box<dyn HioHandler>> {
        Some(Box::new(FileResponder::new(file.clone(), 20_000)))
    });
    let mut h = Harness::with_factory(config(), factory, journal());
    h.start();
    h.send(&Client::preface());
    let req = h.client.get(1, "/file", true);
    let frames = h.send(&req);

    assert_eq!(frames[0].header("content-length"), Some("20000"));
    assert_eq!(data_of(&frames, 1), body);
    assert!(frames.last().unwrap().is_end_stream());
}

#[test]
fn test_truncated_file_body_fails_the_connection() {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&pattern(1000)).unwrap();
    let file = Arc::new(file);

    let factory: Arc<dyn HandlerFactory> = Arc::new(move |_: HioProtocol| -> Option<Box<dyn HioHandler>> {
        Some(Box::new(FileResponder::new(file.clone(), 5000)))
    });
    let mut h = Harness::with_factory(config(), factory, journal());
    h.start();
    h.send(&Client::preface());
    let req = h.client.get(1, "/file", true);
    let frames = h.send(&req);

    // the DATA frame promised 5000 bytes, the file ran out after 1000
    assert_eq!(frames.len(), 1);
    assert!(frames[0].is(FrameType::Headers));
    assert!(h.conn.is_closed());
    assert_eq!(h.conn.stream_count(), 0);
}

#[test]
fn test_idle_connection_times_out() {
    let mut h = Harness::established(H2Config::builder().idle_timeout(Duration::ZERO).build().unwrap());
    let frames = h.timer();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].is(FrameType::Goaway));
    assert_eq!(frames[0].error_code(), Some(ErrorCode::NoError));
    assert!(h.conn.is_closed());
    assert!(h.is_transport_shut());
}

#[test]
fn test_keepalive_ping() {
    let mut h = Harness::established(H2Config::builder().ping_interval(Duration::ZERO).build().unwrap());
    let frames = h.timer();
    let ping = find(&frames, FrameType::Ping).expect("keepalive PING");
    assert!(!ping.has_flag(FrameFlags::ACK));
    assert_eq!(&ping.payload[..], b"hiomuxka");
    assert!(!h.conn.is_closed());
}

#[test]
fn test_h2c_upgrade() {
    let mut h = Harness::new(config());
    let handler = Box::new(Responder::new(&h.journal));
    let req: Headers = request_fields("GET", "/").into_iter().collect();
    h.conn
        .h2c_upgrade(&mut h.io, handler, req, &Client::preface())
        .unwrap();
    let frames = h.frames();

    assert!(frames[0].is(FrameType::Settings));
    assert!(!frames[0].has_flag(FrameFlags::ACK));
    assert!(frames[1].is(FrameType::Settings));
    assert!(frames[1].has_flag(FrameFlags::ACK));
    assert!(frames[2].is(FrameType::Headers));
    assert_eq!(frames[2].stream_id, 1);
    assert_eq!(data_of(&frames, 1), b"hello");
    assert_eq!(h.conn.last_peer_stream_id(), 1);

    let req = h.client.get(3, "/", true);
    let frames = h.send(&req);
    assert_eq!(data_of(&frames, 3), b"hello");
}
