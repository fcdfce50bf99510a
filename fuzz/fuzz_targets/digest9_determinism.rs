#![no_main]

use libfuzzer_sys::fuzz_target;

// digest9 must be a pure function of its inputs: same parts in, same
// nine-hex-digit id out, regardless of how many times it's called.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else { return };
    let parts: Vec<&str> = text.split('\u{0}').collect();

    let first = docbuild_types::digest9(&parts);
    let second = docbuild_types::digest9(&parts);
    assert_eq!(first, second);
    assert_eq!(first.len(), 9);
    assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
});
