//! End-to-end scenarios for the ordered dictionary: basic operations and
//! range iteration across a close/reopen cycle, sentinel-bound edge cases,
//! oversized payloads, and a churned workload checked against a sorted
//! in-memory model.

use std::collections::BTreeMap;

use bytedict::{OrderedDict, SearchBound};
use rand::prelude::*;
use tempfile::tempdir;

fn collect_forward(dict: &OrderedDict, min: SearchBound, max: SearchBound) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut iter = dict.range_forward(min, max).unwrap();
    let mut records = Vec::new();
    while !iter.is_at_end() {
        records.push(iter.read_record().unwrap());
        iter.advance().unwrap();
    }
    records
}

fn collect_backward(dict: &OrderedDict, min: SearchBound, max: SearchBound) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut iter = dict.range_backward(min, max).unwrap();
    let mut records = Vec::new();
    while !iter.is_at_end() {
        records.push(iter.read_record().unwrap());
        iter.advance().unwrap();
    }
    records
}

#[test]
fn basic_lifecycle_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ordered.db");

    {
        let mut dict = OrderedDict::open(&path, true).unwrap();
        dict.add(b"foo", b"bar", false).unwrap();
        dict.add(b"hello", b"w0rd", false).unwrap();
        let (replaced, existed) = dict.update(b"hello", b"world", true).unwrap();
        assert!(existed);
        assert_eq!(replaced.unwrap(), b"w0rd");
        dict.close().unwrap();
    }

    let dict = OrderedDict::open(&path, false).unwrap();

    let all = collect_forward(&dict, SearchBound::Min, SearchBound::Max);
    assert_eq!(
        all,
        vec![
            (b"foo".to_vec(), b"bar".to_vec()),
            (b"hello".to_vec(), b"world".to_vec()),
        ]
    );

    let from_foo = collect_backward(&dict, SearchBound::Key(b"foo"), SearchBound::Max);
    assert_eq!(
        from_foo,
        vec![
            (b"hello".to_vec(), b"world".to_vec()),
            (b"foo".to_vec(), b"bar".to_vec()),
        ]
    );

    let iter = dict.range_forward(SearchBound::Min, SearchBound::Min).unwrap();
    assert_eq!(iter.read_key().unwrap(), b"foo");

    let iter = dict.range_backward(SearchBound::Max, SearchBound::Max).unwrap();
    assert_eq!(iter.read_key().unwrap(), b"hello");

    dict.close().unwrap();
}

#[test]
fn sentinel_ranges_at_the_edges() {
    let dir = tempdir().unwrap();
    let mut dict = OrderedDict::open(dir.path().join("ordered.db"), true).unwrap();

    for key in [b"bravo".as_slice(), b"delta", b"echo"] {
        dict.add(key, b"v", false).unwrap();
    }

    // Crossed sentinels select nothing.
    let iter = dict.range_forward(SearchBound::Max, SearchBound::Min).unwrap();
    assert!(iter.is_at_end());

    // The smallest real key paired with the lower sentinel selects exactly
    // that record.
    let records = collect_forward(&dict, SearchBound::Key(b"bravo"), SearchBound::Min);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, b"bravo");

    // A real lower bound above every key selects nothing.
    let iter = dict
        .range_forward(SearchBound::Key(b"zulu"), SearchBound::Max)
        .unwrap();
    assert!(iter.is_at_end());

    // A real upper bound below every key selects nothing.
    let iter = dict
        .range_forward(SearchBound::Min, SearchBound::Key(b"alpha"))
        .unwrap();
    assert!(iter.is_at_end());

    dict.close().unwrap();
}

#[test]
fn forward_and_backward_ranges_are_mirrors() {
    let dir = tempdir().unwrap();
    let mut dict = OrderedDict::open(dir.path().join("ordered.db"), true).unwrap();

    for i in 0..2000 {
        let key = format!("key-{:05}", i);
        dict.add(key.as_bytes(), key.as_bytes(), false).unwrap();
    }

    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..20 {
        let a = rng.gen_range(0..2000);
        let b = rng.gen_range(0..2000);
        let (lo, hi) = (a.min(b), a.max(b));
        let min_key = format!("key-{:05}", lo);
        let max_key = format!("key-{:05}", hi);

        let forward = collect_forward(
            &dict,
            SearchBound::Key(min_key.as_bytes()),
            SearchBound::Key(max_key.as_bytes()),
        );
        let mut backward = collect_backward(
            &dict,
            SearchBound::Key(min_key.as_bytes()),
            SearchBound::Key(max_key.as_bytes()),
        );
        backward.reverse();

        assert_eq!(forward.len(), hi - lo + 1);
        assert_eq!(forward, backward);
    }

    dict.close().unwrap();
}

#[test]
fn churned_workload_stays_sorted_and_persists() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ordered.db");
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0xB7EE);

    {
        let mut dict = OrderedDict::open(&path, true).unwrap();

        // Interleave inserts with random deletions and re-insertions so
        // leaves split, borrow and merge along the way.
        let mut ever_inserted: Vec<Vec<u8>> = Vec::new();
        for i in 0..60_000u64 {
            let key = format!("key-{:010}", i.wrapping_mul(0x9E3779B97F4A7C15) % 1_000_000)
                .into_bytes();
            let value = vec![b'v'; 1 + (i % 120) as usize];
            let (_, inserted) = dict.add(&key, &value, false).unwrap();
            assert_eq!(inserted, !model.contains_key(&key));
            if inserted {
                model.insert(key.clone(), value);
                ever_inserted.push(key);
            }

            if i % 2 == 1 {
                let victim = ever_inserted[rng.gen_range(0..ever_inserted.len())].clone();
                let (_, existed) = dict.delete(&victim, false).unwrap();
                assert_eq!(existed, model.contains_key(&victim));
                model.remove(&victim);
            }
        }

        let stats = dict.stats();
        assert_eq!(stats.record_count, model.len());
        assert!(stats.height >= 3);

        dict.close().unwrap();
    }

    let dict = OrderedDict::open(&path, false).unwrap();

    let scanned = collect_forward(&dict, SearchBound::Min, SearchBound::Max);
    let expected: Vec<(Vec<u8>, Vec<u8>)> =
        model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(scanned, expected);

    dict.close().unwrap();
}

#[test]
fn oversized_records_reclaim_their_overflow() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ordered.db");

    let mut dict = OrderedDict::open(&path, true).unwrap();
    let baseline = dict.stats().space.used_size;

    let key = vec![b'K'; 4096];
    let value = vec![b'V'; 4096];
    dict.add(&key, &value, false).unwrap();

    let (found, present) = dict.has(&key, true).unwrap();
    assert!(present);
    assert_eq!(found.unwrap(), value);

    let (removed, existed) = dict.delete(&key, true).unwrap();
    assert!(existed);
    assert_eq!(removed.unwrap(), value);
    assert_eq!(dict.stats().space.used_size, baseline);
    assert_eq!(dict.stats().payload_size, 0);

    dict.close().unwrap();
}

#[test]
fn oversized_records_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ordered.db");

    let key = vec![b'K'; 500];
    let value = vec![b'V'; 5000];
    {
        let mut dict = OrderedDict::open(&path, true).unwrap();
        dict.add(&key, &value, false).unwrap();
        dict.add(b"small", b"v", false).unwrap();
        dict.close().unwrap();
    }

    let dict = OrderedDict::open(&path, false).unwrap();
    assert_eq!(dict.has(&key, true).unwrap().0.unwrap(), value);
    let records = collect_forward(&dict, SearchBound::Min, SearchBound::Max);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].0, key);
    assert_eq!(records[1].0, b"small");
    dict.close().unwrap();
}

#[test]
fn update_then_range_sees_the_new_value() {
    let dir = tempdir().unwrap();
    let mut dict = OrderedDict::open(dir.path().join("ordered.db"), true).unwrap();

    for i in 0..100 {
        let key = format!("key-{:03}", i);
        dict.add(key.as_bytes(), b"old", false).unwrap();
    }
    for i in (0..100).step_by(3) {
        let key = format!("key-{:03}", i);
        dict.update(key.as_bytes(), b"new", false).unwrap();
    }

    for (key, value) in collect_forward(&dict, SearchBound::Min, SearchBound::Max) {
        let index: usize = String::from_utf8(key[4..].to_vec()).unwrap().parse().unwrap();
        let expected: &[u8] = if index % 3 == 0 { b"new" } else { b"old" };
        assert_eq!(value, expected);
    }

    dict.close().unwrap();
}

#[test]
fn deleting_everything_returns_to_a_single_leaf() {
    let dir = tempdir().unwrap();
    let mut dict = OrderedDict::open(dir.path().join("ordered.db"), true).unwrap();

    let mut keys: Vec<String> = (0..5000).map(|i| format!("key-{:06}", i)).collect();
    for key in &keys {
        dict.add(key.as_bytes(), key.as_bytes(), false).unwrap();
    }

    keys.shuffle(&mut StdRng::seed_from_u64(99));
    for key in &keys {
        let (_, existed) = dict.delete(key.as_bytes(), false).unwrap();
        assert!(existed, "missing {}", key);
    }

    let stats = dict.stats();
    assert_eq!(stats.record_count, 0);
    assert_eq!(stats.height, 1);
    assert_eq!(stats.leaf_count, 1);
    assert_eq!(stats.non_leaf_count, 0);
    assert_eq!(stats.payload_size, 0);

    dict.close().unwrap();
}
