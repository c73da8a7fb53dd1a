#![no_main]

use libfuzzer_sys::fuzz_target;
use xfrmguard_core::config::XfrmGuardConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(content) = std::str::from_utf8(data) {
        if let Ok(config) = XfrmGuardConfig::parse(content) {
            let _ = config.validate();
        }
    }
});
