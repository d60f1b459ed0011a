#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let h = freqbound::hash::murmur3_x86_32(data, 42);
    assert_eq!(h, freqbound::hash::murmur3_x86_32(data, 42));
    assert_eq!(
        freqbound::hash::murmur3_x86_32(data, 0),
        freqbound::hash::murmur3_x86_32(data, 0)
    );
});
