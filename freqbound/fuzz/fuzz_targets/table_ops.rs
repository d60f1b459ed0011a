#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(mut table) = freqbound::BoundedCounter::with_buckets(64) else {
        return;
    };
    for chunk in data.chunks(8) {
        let (op, key) = chunk.split_first().unwrap();
        match op % 4 {
            0 => {
                let _ = table.increment(key);
            }
            1 => {
                let _ = table.set(key, (*op as i64) * 3);
            }
            2 => {
                let _ = table.remove(key);
            }
            _ => {
                let _ = table.prune((*op & 7) as i64);
            }
        }
    }
    assert_eq!(table.iter().count() as u64, table.len());
    assert!(table.keys().all(|key| table.get(key) > 0));
});
