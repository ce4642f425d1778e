//! Fuzz test for checksum sidecar parsing

#![no_main]

use fleetflash_core::{ChecksumAlgorithm, ChecksumRecord};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let hints = [None, Some(ChecksumAlgorithm::Md5), Some(ChecksumAlgorithm::Sha256)];

    for hint in hints {
        if let Ok(record) = ChecksumRecord::parse(data, hint) {
            assert_eq!(record.expected_hex.len(), record.algorithm.hex_length());
            assert!(record.expected_hex.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(!record.file_name.is_empty());
            if let Some(algorithm) = hint {
                assert_eq!(record.algorithm, algorithm);
            }
        }
    }
});
