//! Property-based tests for the line framer.
//!
//! However the byte stream is split into reads, the framer must yield the
//! same lines in the same order.

use proptest::prelude::*;
use slirc_link::{Charset, LineCodec, LineFramer};

// =============================================================================
// STRATEGIES
// =============================================================================

/// Line content without terminators, mixing ASCII and multibyte text.
fn line_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[^\r\n]{0,80}").expect("valid regex")
}

/// A line terminator as servers actually send them.
fn terminator_strategy() -> impl Strategy<Value = &'static [u8]> {
    prop_oneof![Just(&b"\r\n"[..]), Just(&b"\n"[..])]
}

fn stream_strategy() -> impl Strategy<Value = (Vec<String>, Vec<u8>)> {
    prop::collection::vec((line_strategy(), terminator_strategy()), 0..20).prop_map(|lines| {
        let mut bytes = Vec::new();
        for (line, terminator) in &lines {
            bytes.extend_from_slice(line.as_bytes());
            bytes.extend_from_slice(terminator);
        }
        (lines.into_iter().map(|(line, _)| line).collect(), bytes)
    })
}

/// Split `bytes` at the given cut points.
fn chunks(bytes: &[u8], mut cuts: Vec<usize>) -> Vec<&[u8]> {
    cuts.iter_mut().for_each(|cut| *cut %= bytes.len() + 1);
    cuts.sort_unstable();
    cuts.dedup();

    let mut out = Vec::new();
    let mut start = 0;
    for cut in cuts {
        out.push(&bytes[start..cut]);
        start = cut;
    }
    out.push(&bytes[start..]);
    out
}

// =============================================================================
// PROPERTIES
// =============================================================================

proptest! {
    #[test]
    fn chunking_does_not_change_lines(
        (expected, bytes) in stream_strategy(),
        cuts in prop::collection::vec(any::<usize>(), 0..16),
    ) {
        let mut framer = LineFramer::new();
        let mut lines = Vec::new();
        for chunk in chunks(&bytes, cuts) {
            lines.extend(framer.feed(chunk));
        }

        prop_assert_eq!(lines, expected);
        prop_assert!(framer.is_empty());
    }

    #[test]
    fn partial_tail_is_held_back(
        line in line_strategy(),
        tail in "[^\r\n]{1,40}",
    ) {
        let mut framer = LineFramer::new();
        let mut bytes = line.clone().into_bytes();
        bytes.extend_from_slice(b"\r\n");
        bytes.extend_from_slice(tail.as_bytes());

        prop_assert_eq!(framer.feed(&bytes), vec![line]);
        prop_assert_eq!(framer.pending(), tail.len());
    }

    #[test]
    fn arbitrary_bytes_never_panic(
        data in prop::collection::vec(any::<u8>(), 0..512),
        split in any::<usize>(),
    ) {
        let split = split % (data.len() + 1);
        let mut framer = LineFramer::with_codec(LineCodec::with_charsets([Charset::Utf8]));
        let mut lines = framer.feed(&data[..split]);
        lines.extend(framer.feed(&data[split..]));

        let newlines = data.iter().filter(|b| **b == b'\n').count();
        prop_assert!(lines.len() <= newlines);
        prop_assert!(lines.iter().all(|line| !line.contains('\n')));
    }

    #[test]
    fn latin1_fallback_accepts_everything(
        data in prop::collection::vec(any::<u8>().prop_filter("no LF", |b| *b != b'\n'), 0..200),
    ) {
        let mut framer = LineFramer::new();
        let mut bytes = data.clone();
        bytes.push(b'\n');
        prop_assert_eq!(framer.feed(&bytes).len(), 1);
    }

    #[test]
    fn cp1252_unassigned_bytes_decode_as_latin1(
        data in prop::collection::vec(0x20u8..0x7f, 0..80),
        unassigned in prop::sample::select(vec![0x81u8, 0x8d, 0x8f, 0x90, 0x9d]),
        at in any::<usize>(),
    ) {
        let mut bytes = data.clone();
        bytes.insert(at % (data.len() + 1), unassigned);
        let expected: String = bytes.iter().map(|&b| char::from(b)).collect();

        let mut framer = LineFramer::new();
        bytes.extend_from_slice(b"\r\n");
        prop_assert_eq!(framer.feed(&bytes), vec![expected]);
    }
}
