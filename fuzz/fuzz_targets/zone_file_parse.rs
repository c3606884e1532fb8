#![no_main]
use libfuzzer_sys::fuzz_target;

use dns_types::zones::types::Zone;

fuzz_target!(|data: &str| {
    // parsing must never panic, whatever the file contents
    let _ = Zone::deserialise(data);
});
