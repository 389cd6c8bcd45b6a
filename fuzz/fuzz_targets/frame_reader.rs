//! Fuzz target for reading frames off a byte stream
//!
//! The reader must never consume past the frame it returns, and must
//! enforce its size limit whatever the input.

#![no_main]

use arbitrary::Arbitrary;
use filemove_core::FrameFormat;
use filemove_core::frame;
use libfuzzer_sys::fuzz_target;
use tokio::io::{AsyncReadExt, BufReader};

#[derive(Debug, Arbitrary)]
struct Input {
    length_prefixed: bool,
    limit: u16,
    buffer: u8,
    wire: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let format = if input.length_prefixed {
        FrameFormat::LengthPrefixed
    } else {
        FrameFormat::Delimited
    };
    let limit = usize::from(input.limit);
    let Ok(runtime) = tokio::runtime::Builder::new_current_thread().build() else {
        return;
    };

    runtime.block_on(async {
        let mut reader = BufReader::with_capacity(usize::from(input.buffer).max(1), input.wire.as_slice());
        if frame::read_fields(&mut reader, format, limit).await.is_ok() {
            let mut rest = Vec::new();
            let _ = reader.read_to_end(&mut rest).await;

            let consumed = input.wire.len() - rest.len();
            assert!(consumed <= limit);
            assert_eq!(&input.wire[consumed..], rest.as_slice());
            if format == FrameFormat::Delimited {
                assert_eq!(input.wire[consumed - 1], b'\n');
            }
        }
    });
});
