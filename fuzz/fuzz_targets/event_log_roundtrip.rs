#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let path = td.path().join("events.jsonl");
    if fs::write(&path, data).is_ok() {
        let _ = docbuild_events::EventLog::read_from_file(&path);
    }
});
