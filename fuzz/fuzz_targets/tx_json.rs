#![no_main]

use cinder_ledger::Transaction;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(tx) = Transaction::from_json_bytes(data) {
        let _ = tx.txid();
        let _ = tx.to_json_bytes();
    }
});
