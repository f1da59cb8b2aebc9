#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut covered = 0usize;
    for scanned in edgesync::queue::FrameScanner::new(data) {
        if let edgesync::queue::Scanned::Corrupt { offset, len, .. } = scanned {
            covered = covered.max(offset + len);
            assert!(covered <= data.len());
        }
    }
});
