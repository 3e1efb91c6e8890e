//! Unit tests for stage output line framing.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use research_checkpoint::supervisor::line_codec::{StageLineCodec, MAX_LINE_BYTES};

fn decode_all(codec: &mut StageLineCodec, input: &[u8]) -> Vec<String> {
    let mut buf = BytesMut::from(input);
    let mut lines = Vec::new();
    while let Some(line) = codec.decode(&mut buf).expect("decode") {
        lines.push(line);
    }
    while let Some(line) = codec.decode_eof(&mut buf).expect("decode_eof") {
        lines.push(line);
    }
    lines
}

#[test]
fn default_limit_is_one_mebibyte() {
    assert_eq!(StageLineCodec::new().max_length(), MAX_LINE_BYTES);
}

#[test]
fn splits_lines_and_strips_carriage_returns() {
    let mut codec = StageLineCodec::new();
    let lines = decode_all(&mut codec, b"epoch 1\r\nepoch 2\n\ntrailing");
    assert_eq!(lines, vec!["epoch 1", "epoch 2", "", "trailing"]);
}

#[test]
fn invalid_utf8_is_replaced_not_rejected() {
    let mut codec = StageLineCodec::new();
    let lines = decode_all(&mut codec, b"loss \xff\xfe 0.3\nnext\n");
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("loss "));
    assert!(lines[0].contains('\u{FFFD}'));
    assert_eq!(lines[1], "next");
}

#[test]
fn over_long_line_is_skipped_and_reading_continues() {
    let mut codec = StageLineCodec::with_max_length(8);
    let lines = decode_all(&mut codec, b"short\nthis line is far too long\nafter\n");
    assert_eq!(lines, vec!["short", "after"]);
}

#[test]
fn line_at_exact_limit_is_kept() {
    let mut codec = StageLineCodec::with_max_length(5);
    let lines = decode_all(&mut codec, b"12345\n123456\nok\n");
    assert_eq!(lines, vec!["12345", "ok"]);
}

#[test]
fn over_long_line_split_across_reads_is_skipped() {
    let mut codec = StageLineCodec::with_max_length(4);
    let mut buf = BytesMut::from(&b"abcdefgh"[..]);
    assert!(codec.decode(&mut buf).expect("decode").is_none());

    buf.extend_from_slice(b"ijkl\nkept\n");
    assert_eq!(codec.decode(&mut buf).expect("decode").as_deref(), Some("kept"));
    assert!(codec.decode(&mut buf).expect("decode").is_none());
}

#[test]
fn partial_line_waits_for_terminator() {
    let mut codec = StageLineCodec::new();
    let mut buf = BytesMut::from(&b"[STAGE:beg"[..]);
    assert!(codec.decode(&mut buf).expect("decode").is_none());

    buf.extend_from_slice(b"in:id=S01]\n");
    assert_eq!(
        codec.decode(&mut buf).expect("decode").as_deref(),
        Some("[STAGE:begin:id=S01]")
    );
}

#[test]
fn unterminated_over_long_tail_is_dropped_at_eof() {
    let mut codec = StageLineCodec::with_max_length(4);
    let lines = decode_all(&mut codec, b"ok\nnever-ending");
    assert_eq!(lines, vec!["ok"]);
}
