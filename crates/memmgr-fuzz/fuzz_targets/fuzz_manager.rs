#![no_main]
use std::ptr::NonNull;

use libfuzzer_sys::fuzz_target;
use memmgr_core::{ManagerConfig, MemoryManager, PrewarmPolicy};

struct Live {
    ptr: NonNull<u8>,
    size: usize,
    fill: u8,
}

fn size_for(selector: u8, raw: u16) -> usize {
    let raw = raw as usize;
    match selector % 8 {
        0..=3 => raw % 257,
        4..=6 => 257 + raw * 5,
        _ => 327_000 + raw * 2,
    }
}

fn check(live: &Live) {
    let bytes = unsafe { std::slice::from_raw_parts(live.ptr.as_ptr(), live.size) };
    assert!(bytes.iter().all(|&b| b == live.fill), "block of {} bytes corrupted", live.size);
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let mut manager = MemoryManager::new(ManagerConfig {
        slab_page_bytes: 1024,
        prewarm: PrewarmPolicy::Minimal,
        ..ManagerConfig::default()
    });
    manager.init();
    let mut live: Vec<Live> = Vec::new();

    for chunk in data.chunks_exact(4) {
        let op = chunk[0] % 4;
        let raw = u16::from_le_bytes([chunk[1], chunk[2]]);

        match op {
            0 | 1 => {
                let size = size_for(chunk[3], raw);
                let Some(ptr) = manager.allocate_at(size, None) else {
                    assert_eq!(size, 0);
                    continue;
                };
                assert!(unsafe { manager.usable_size(Some(ptr)) } >= size);
                let block = Live { ptr, size, fill: chunk[3] };
                unsafe { std::ptr::write_bytes(ptr.as_ptr(), block.fill, size) };
                live.push(block);
            }
            2 => {
                if live.is_empty() {
                    continue;
                }
                let block = live.swap_remove(raw as usize % live.len());
                check(&block);
                unsafe { manager.free_at(Some(block.ptr), None) };
            }
            _ => {
                live.iter().for_each(check);
            }
        }
    }

    for block in &live {
        check(block);
    }
    manager.shutdown();
    assert_eq!(manager.stats().pages.outstanding(), 0);
});
