#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let path = docbuild_state::state_path(td.path(), "docserv");
    if fs::write(path, data).is_ok() {
        let _ = docbuild_state::load_state(td.path(), "docserv", |_| {});
    }
});
