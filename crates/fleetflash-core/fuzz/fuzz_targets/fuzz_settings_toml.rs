//! Fuzz test for settings file parsing

#![no_main]

use fleetflash_core::Settings;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let _ = Settings::from_toml_str(data);

    for section in ["[paths]", "[build]", "[checksum]", "[flash]"] {
        let _ = Settings::from_toml_str(&format!("{section}\n{data}"));
    }
});
