#![no_main]

use framelink::core::reassembler::{FrameLimits, Reassembler};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // First byte picks the chunk size so boundaries vary between runs
    let Some((&chunk, stream)) = data.split_first() else {
        return;
    };
    let mut reassembler = Reassembler::new(FrameLimits {
        initial_buffer_size: 16,
        max_frame_size: 64 * 1024,
        max_buffer_size: 128 * 1024,
    });
    for piece in stream.chunks(usize::from(chunk).max(1)) {
        if reassembler.feed(piece).is_err() {
            break;
        }
    }
});
