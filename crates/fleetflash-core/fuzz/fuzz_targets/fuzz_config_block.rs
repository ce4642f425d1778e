//! Fuzz test for decoding configuration blocks read back from images

#![no_main]

use fleetflash_core::{ConfigBlock, CONFIG_BLOCK_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(block) = ConfigBlock::decode(data) else {
        return;
    };

    // Addresses and mode survive another trip through a slot
    if let Ok(slot) = block.encode() {
        assert_eq!(slot.len(), CONFIG_BLOCK_SIZE);
        let again = ConfigBlock::decode(&slot).expect("re-encoded block decodes");
        assert_eq!(again.ip, block.ip);
        assert_eq!(again.gateway, block.gateway);
        assert_eq!(again.mode, block.mode);
        assert_eq!(again.manager, block.manager);
    }
});
