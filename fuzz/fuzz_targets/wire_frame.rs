#![no_main]

use cinderd::wire::parse_message_bytes;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = parse_message_bytes(data);
});
