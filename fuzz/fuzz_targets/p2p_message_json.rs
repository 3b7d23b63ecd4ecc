#![no_main]

use cinderd::wire::{decode_message, RawFrame};
use libfuzzer_sys::fuzz_target;

const COMMANDS: [&str; 10] = [
    "version", "verack", "getaddr", "addr", "inv", "block", "tx", "getblocks", "ping", "pong",
];

fuzz_target!(|data: &[u8]| {
    let Some((selector, payload)) = data.split_first() else {
        return;
    };
    let frame = RawFrame {
        command: COMMANDS[*selector as usize % COMMANDS.len()].to_string(),
        payload: payload.to_vec(),
    };
    let _ = decode_message(&frame);
});
