#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(mut a) = freqbound::CmsLog8::with_seed(256, 4, 1) else {
        return;
    };
    let Ok(mut b) = freqbound::CmsLog8::with_seed(256, 4, 2) else {
        return;
    };
    for (i, chunk) in data.chunks(4).enumerate() {
        let target = if i % 2 == 0 { &mut a } else { &mut b };
        let _ = target.increment(chunk);
        assert!(target.get(chunk) >= 1);
    }
    let total = a.total() + b.total();
    a.merge(&b).unwrap();
    assert_eq!(a.total(), total);
});
