#![no_main]
use gridshare::config::Config;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    // Parsing and validation must reject bad input without panicking
    if let Ok(config) = serde_yaml::from_str::<Config>(text)
        && config.validate().is_ok()
    {
        let _ = gridshare::AllocationEngine::new(&config);
    }
});
