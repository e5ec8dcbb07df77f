#![no_main]

use exprpipe::parse_rule;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(rule) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(duration) = parse_rule(rule) {
        assert!(duration.num_nanoseconds().is_some_and(|ns| ns > 0));
    }
});
