#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(xml) = std::str::from_utf8(data) else { return };
    if let Ok(config) = docbuild::stitched::StitchedConfig::from_xml(xml) {
        let _ = config.docset_exists("demo", "1.0");
        let _ = config.maintainers("demo");
        let _ = config.lifecycle("demo", "1.0");
        let _ = config.navigation_mode("demo", "1.0");
        let _ = config.branch("demo", "1.0", "en-us");
        let _ = config.subdir("demo", "1.0", "en-us");
        let _ = config.remote("demo", "1.0");
        let _ = config.docset_container_image("demo", "1.0");
        let _ = config.deliverables("demo", "1.0", "en-us");
    }
});
