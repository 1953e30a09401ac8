#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Fuzz TOML parsing of RigConfig: parse and validation errors are fine,
    // panics are not.
    let parsed = toml::from_str::<autopatch_config::RigConfig>(data);
    if let Ok(cfg) = parsed {
        let _ = cfg.validate();
        let _ = cfg.pressure_limit();
    }
});
