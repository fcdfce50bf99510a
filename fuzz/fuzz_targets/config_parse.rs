#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let path = td.path().join("docbuild.toml");
    if fs::write(&path, data).is_ok() {
        let _ = docbuild_config::load_config(&path);
    }
});
