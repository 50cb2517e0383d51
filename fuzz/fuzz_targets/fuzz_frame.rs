#![no_main]

use libfuzzer_sys::fuzz_target;
use framelink::Frame;

fuzz_target!(|data: &[u8]| {
    // Fuzz single-frame decoding: must reject or accept, never panic
    let _ = Frame::from_bytes(data);
});
