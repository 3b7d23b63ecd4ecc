#![no_main]

use cinder_ledger::BalanceTable;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(table) = serde_json::from_slice::<BalanceTable>(data) {
        for amount in table.entries().values() {
            assert!(amount.is_finite() && *amount > 0.0);
        }
        let _ = table.total_supply();
    }
});
