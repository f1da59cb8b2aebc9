#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(view) = edgesync_core::SnapshotView::parse(data) {
        let _ = view.records();
    }
});
