#![no_main]

use cinder_consensus::{block_hash, meets_target, Block};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(block) = serde_json::from_slice::<Block>(data) {
        let hash = block_hash(&block);
        let _ = meets_target(&hash, "0000");
        for tx in &block.transactions {
            let _ = tx.validate();
        }
    }
});
