//! Fuzz target for frame parsing
//!
//! Tests that the frame decoders handle arbitrary input without panicking.

#![no_main]

use filemove_core::frame::{self, DownloadReply};
use filemove_core::{Frame, FrameFormat, Response};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for fields in [frame::decode_line(data), frame::decode_body(data)]
        .into_iter()
        .flatten()
    {
        if let Ok(decoded) = Frame::decode(&fields) {
            // Re-encoding a decoded frame must decode to the same frame
            assert_eq!(Frame::decode(&decoded.to_fields()).ok(), Some(decoded.clone()));
            let _ = match decoded {
                Frame::Upload(meta) => meta.validate(),
                Frame::Download(request) => request.validate(),
            };
        }

        for format in [FrameFormat::Delimited, FrameFormat::LengthPrefixed] {
            let _ = Response::from_fields(&fields, format);
            let _ = DownloadReply::from_fields(&fields, format);
        }
    }
});
