//! Fuzz target for the line framer
//!
//! Feeds arbitrary bytes, split at a fuzzer-chosen point, and checks that
//! the framer never panics and never yields a line with a terminator in it.

#![no_main]

use libfuzzer_sys::fuzz_target;
use slirc_link::LineFramer;

fuzz_target!(|data: &[u8]| {
    let Some((&split, data)) = data.split_first() else {
        return;
    };
    let split = usize::from(split).min(data.len());

    let mut framer = LineFramer::new();
    let mut lines = framer.feed(&data[..split]);
    lines.extend(framer.feed(&data[split..]));

    for line in &lines {
        assert!(!line.contains('\n'));
    }
});
