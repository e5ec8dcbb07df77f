#![no_main]

use exprpipe::Labels;
use libfuzzer_sys::fuzz_target;

// Fingerprints must be stable under pair reordering and insensitive to
// where the key/value boundary falls only through the 0xFF separator.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let pairs: Vec<(&str, &str)> = text
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .collect();

    let forward = Labels::from_pairs(pairs.iter().copied());
    // Duplicate keys make insertion order observable, so only compare
    // reorderings when every key is unique.
    if forward.len() == pairs.len() {
        let reversed = Labels::from_pairs(pairs.iter().rev().copied());
        assert_eq!(forward.fingerprint(), reversed.fingerprint());
    }

    let keys: Vec<String> = forward.iter().map(|(k, _)| k.to_owned()).collect();
    if let Some(subset) = forward.fingerprint_of(&keys) {
        assert_eq!(subset, forward.fingerprint());
    }
});
