use crate::*;
use rand::prelude::*;
use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Bound,
};

pub(crate) fn get_rng() -> impl Rng + Clone {
    let seed: u64 = std::env::var("SEED")
        .map_or_else(|_| rand::rng().random(), |seed_str| seed_str.parse().unwrap());
    println!("SEED {}", seed);
    SmallRng::seed_from_u64(seed)
}

type Model = BTreeMap<Vec<u8>, BTreeSet<RowId>>;

/// Keys of a few kinds, each led by its kind so that no key is a prefix of another
fn rand_key(rng: &mut impl Rng) -> ArtKey {
    let kind = rng.random_range(0..4u32);
    let mut key = ArtKey::from(kind);
    let rest = match kind {
        0 => ArtKey::from(rng.random_range(0..5000u32)),
        1 => ArtKey::from(rng.random::<i64>()),
        2 => {
            // long shared prefixes
            let len = rng.random_range(0..64);
            let mut bytes = vec![b'x'; len];
            if let Some(last) = bytes.last_mut() {
                *last = rng.random_range(0..4);
            }
            ArtKey::from(&bytes[..])
        }
        _ => {
            let len = rng.random_range(0..12);
            let bytes = (0..len)
                .map(|_| *[0u8, 1, b'a', b'b', 255].choose(rng).unwrap())
                .collect::<Vec<_>>();
            let mut composite = ArtKey::from(rng.random_range(0..3u32));
            composite.append(&ArtKey::from(&bytes[..]));
            composite
        }
    };
    key.append(&rest);
    key
}

fn model_range(model: &Model, bounds: (Bound<Vec<u8>>, Bound<Vec<u8>>)) -> Vec<(Vec<u8>, RowId)> {
    model
        .range::<Vec<u8>, _>(bounds)
        .flat_map(|(k, rows)| rows.iter().map(|&r| (k.clone(), r)))
        .collect()
}

fn check_model(art: &Art, model: &Model) {
    art.verify().unwrap();
    let expected = model
        .iter()
        .flat_map(|(k, rows)| rows.iter().map(|&r| (k.clone(), r)))
        .collect::<Vec<_>>();
    assert_eq!(art.iter().collect::<Vec<_>>(), expected);
    assert_eq!(art.len(), expected.len());
}

fn small_options() -> ArtOptions {
    let mut opts = ArtOptions::default();
    opts.buffer_size = 2048;
    opts
}

#[test]
fn test_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}

    assert_send_sync::<Art>();
    assert_send_sync::<ArtIndex>();
}

#[test]
fn randomized_round_trip() {
    let _ = env_logger::try_init();
    let mut rng = get_rng();
    for prefix_count in [15, 4, 1] {
        let mut opts = small_options();
        opts.prefix_count = prefix_count;
        let mut art = Art::with_options(opts).unwrap();
        let mut model = Model::new();
        for i in 0..5_000 {
            let key = rand_key(&mut rng);
            let row = match rng.random_range(0..3) {
                0 => rng.random_range(0..10),
                1 => rng.random_range(0..1_000_000),
                _ => rng.random(),
            };
            if rng.random_bool(0.7) {
                let expected = model.entry(key.to_vec()).or_default().insert(row);
                assert_eq!(art.insert(&key, row).unwrap(), expected);
            } else {
                let expected = model.get_mut(key.as_bytes()).is_some_and(|r| r.remove(&row));
                model.retain(|_, r| !r.is_empty());
                assert_eq!(art.delete(&key, row).unwrap(), expected);
            }
            assert_eq!(
                art.get(&key),
                model
                    .get(key.as_bytes())
                    .map(|r| r.iter().copied().collect::<Vec<_>>())
                    .unwrap_or_default()
            );
            if i % 500 == 0 {
                check_model(&art, &model);
            }
        }
        check_model(&art, &model);

        let mut entries = model
            .iter()
            .flat_map(|(k, rows)| rows.iter().map(|&r| (k.clone(), r)))
            .collect::<Vec<_>>();
        entries.shuffle(&mut rng);
        for (key, row) in entries {
            assert!(art.delete(&key, row).unwrap());
            assert!(!art.contains(&key, row));
        }
        assert!(art.is_empty());
        art.verify().unwrap();
        assert_eq!(art.pool().live_counts(), [0; 10]);
    }
}

#[test]
fn ascending_iteration_and_ranges() {
    let mut rng = get_rng();
    let mut art = Art::with_options(small_options()).unwrap();
    let mut model = Model::new();
    for _ in 0..3_000 {
        let key = rand_key(&mut rng);
        let row = rng.random_range(0..100);
        art.insert(&key, row).unwrap();
        model.entry(key.to_vec()).or_default().insert(row);
    }
    let keys = model.keys().cloned().collect::<Vec<_>>();
    for _ in 0..200 {
        let mut a = keys.choose(&mut rng).unwrap().clone();
        let mut b = keys.choose(&mut rng).unwrap().clone();
        if a > b {
            std::mem::swap(&mut a, &mut b);
        }
        // bounds that aren't keys themselves
        if rng.random_bool(0.3) {
            a.truncate(rng.random_range(0..=a.len()));
        }
        let expected = model_range(&model, (Bound::Included(a.clone()), Bound::Included(b.clone())));
        assert_eq!(art.range(a.clone()..=b.clone()).collect::<Vec<_>>(), expected);

        let expected = model_range(&model, (Bound::Included(a.clone()), Bound::Excluded(b.clone())));
        assert_eq!(art.range(a.clone()..b.clone()).collect::<Vec<_>>(), expected);

        let bounds = (Bound::Excluded(a.clone()), Bound::Included(b.clone()));
        let expected = model_range(&model, bounds.clone());
        assert_eq!(art.range(bounds).collect::<Vec<_>>(), expected);

        let bounds = (Bound::Excluded(a), Bound::Unbounded);
        let expected = model_range(&model, bounds.clone());
        assert_eq!(art.range(bounds).collect::<Vec<_>>(), expected);
    }
}

#[test]
fn tiering_follows_occupancy() {
    let mut art = Art::new();
    let key = |b: u8| [b'k', b, 0];
    for b in 1..=255u8 {
        art.insert(&key(b), b as RowId).unwrap();
        art.verify().unwrap();
    }
    assert!(art.to_string_dump().unwrap().starts_with("Prefix: |107-| Node256: ["));
    for b in (2..=255u8).rev() {
        art.delete(&key(b), b as RowId).unwrap();
        let dump = art.to_string_dump().unwrap();
        let expected = match b - 1 {
            1 => "Prefix: |107-1-0-| Inlined Leaf",
            2..=4 => "Prefix: |107-| Node4",
            5..=16 => "Prefix: |107-| Node16",
            17..=48 => "Prefix: |107-| Node48",
            _ => "Prefix: |107-| Node256",
        };
        assert!(dump.starts_with(expected), "{b} {dump}");
    }
    art.verify().unwrap();
}

#[test]
fn long_keys() {
    let _ = env_logger::try_init();
    let mut art = Art::new();
    let mut keys = (0..4u8)
        .map(|i| {
            let mut key = vec![b'k'; 250_000];
            key.extend_from_slice(&[i, 0]);
            key
        })
        .collect::<Vec<_>>();
    let mut early = vec![b'j'];
    early.resize(250_002, 7);
    keys.push(early);

    for (i, key) in keys.iter().enumerate() {
        assert!(art.insert(key, i as RowId).unwrap());
        assert!(art.insert(key, 100 + i as RowId).unwrap());
    }
    art.verify().unwrap();
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(art.get(key), vec![i as RowId, 100 + i as RowId]);
    }
    let mut sorted = keys.clone();
    sorted.sort();
    assert!(art.iter().map(|(k, _)| k).step_by(2).eq(sorted));

    // the early key frees a whole chain, the others collapse the node they shared
    for key in keys.drain(1..) {
        for row_id in art.get(&key) {
            assert!(art.delete(&key, row_id).unwrap());
        }
    }
    art.verify().unwrap();
    let dump = art.to_string_dump().unwrap();
    assert!(!art.vacuum().unwrap().is_empty());
    assert_eq!(art.to_string_dump().unwrap(), dump);
    art.verify().unwrap();

    assert_eq!(art.get(&keys[0]), vec![0, 100]);
    assert!(art.delete(&keys[0], 0).unwrap());
    assert!(art.delete(&keys[0], 100).unwrap());
    assert!(art.is_empty());
    art.verify().unwrap();
    assert_eq!(art.pool().live_counts(), [0; 10]);
}

#[test]
fn vacuum_is_idempotent() {
    let _ = env_logger::try_init();
    let mut rng = get_rng();
    let mut art = Art::with_options(small_options()).unwrap();
    let mut model = Model::new();
    for _ in 0..10_000 {
        let key = rand_key(&mut rng);
        let row = rng.random_range(0..20);
        art.insert(&key, row).unwrap();
        model.entry(key.to_vec()).or_default().insert(row);
    }
    let keys = model.keys().cloned().collect::<Vec<_>>();
    for key in keys {
        if rng.random_bool(0.8) {
            for row in model.remove(&key).unwrap() {
                art.delete(&key, row).unwrap();
            }
        }
    }
    let dump = art.to_string_dump().unwrap();
    let before = art.memory_usage();
    let vacuumed = art.vacuum().unwrap();
    assert!(!vacuumed.is_empty());
    assert!(art.memory_usage() < before);
    assert_eq!(art.to_string_dump().unwrap(), dump);
    check_model(&art, &model);

    let memory = art.memory_usage();
    assert!(art.vacuum().unwrap().is_empty());
    assert_eq!(art.memory_usage(), memory);
    assert_eq!(art.to_string_dump().unwrap(), dump);

    // the tree keeps working on the compacted allocators
    for (i, key) in model.keys().take(100).enumerate() {
        art.insert(key, 1000 + i as RowId).unwrap();
    }
    art.verify().unwrap();
}

#[test]
fn out_of_memory_leaves_tree_untouched() {
    let mut rng = get_rng();
    let mut opts = small_options();
    opts.max_buffers_per_allocator = Some(3);
    let mut art = Art::with_options(opts).unwrap();
    let mut model = Model::new();
    let mut failures = 0;
    for _ in 0..20_000 {
        let key = rand_key(&mut rng);
        let row = rng.random_range(0..8);
        let dump = art.to_string_dump().unwrap();
        match art.insert(&key, row) {
            Ok(inserted) => {
                assert_eq!(inserted, model.entry(key.to_vec()).or_default().insert(row));
            }
            Err(e) => {
                assert!(e.is_out_of_memory(), "{e}");
                assert_eq!(art.to_string_dump().unwrap(), dump);
                failures += 1;
            }
        }
    }
    assert!(failures > 0);
    check_model(&art, &model);

    // deletes keep working on a full tree
    for (key, rows) in std::mem::take(&mut model) {
        for row in rows {
            let dump = art.to_string_dump().unwrap();
            match art.delete(&key, row) {
                Ok(deleted) => assert!(deleted),
                Err(e) => {
                    assert!(e.is_out_of_memory(), "{e}");
                    assert_eq!(art.to_string_dump().unwrap(), dump);
                    model.entry(key.clone()).or_default().insert(row);
                }
            }
        }
    }
    check_model(&art, &model);
}

#[test]
fn deprecated_transform_round_trip() {
    let mut rng = get_rng();
    let mut art = Art::with_options(small_options()).unwrap();
    let mut model = Model::new();
    for _ in 0..2_000 {
        let key = ArtKey::from(rng.random_range(0..300u32));
        let row = rng.random_range(0..50);
        art.insert(&key, row).unwrap();
        model.entry(key.to_vec()).or_default().insert(row);
    }
    art.transform_to_deprecated().unwrap();
    let counts = art.pool().live_counts();
    for idx in [
        AllocatorIdx::PrefixInlined,
        AllocatorIdx::Node7Leaf,
        AllocatorIdx::Node15Leaf,
        AllocatorIdx::Node256Leaf,
    ] {
        assert_eq!(counts[idx.index()], 0);
    }
    assert!(counts[AllocatorIdx::LeafDeprecated.index()] > 0);
    check_model(&art, &model);

    // mutations migrate the leaves they reach
    let keys = model.keys().take(20).cloned().collect::<Vec<_>>();
    for key in &keys {
        let row = *model[key].iter().next().unwrap();
        assert!(art.delete(key, row).unwrap());
        model.get_mut(key).unwrap().remove(&row);
        assert!(art.insert(key, 10_000).unwrap());
        model.get_mut(key).unwrap().insert(10_000);
    }
    check_model(&art, &model);

    art.vacuum().unwrap();
    check_model(&art, &model);

    art.transform_from_deprecated().unwrap();
    assert_eq!(art.pool().live(AllocatorIdx::LeafDeprecated), 0);
    check_model(&art, &model);
}

#[test]
fn packed_root_round_trip() {
    let mut art = Art::new();
    for i in 0..100u32 {
        art.insert(&ArtKey::from(i), i as RowId).unwrap();
    }
    let packed = art.root().pack().unwrap();
    assert_eq!(packed.unpack().unwrap(), art.root());
    assert_eq!(art.root().ntype(), Some(NType::Prefix));
}

#[test]
fn options_serde() {
    let mut opts = ArtOptions::default();
    opts.prefix_count = 8;
    let json = serde_json::to_string(&opts).unwrap();
    let back: ArtOptions = serde_json::from_str(&json).unwrap();
    assert_eq!(back, opts);
    opts.prefix_count = 16;
    assert!(matches!(Art::with_options(opts), Err(Error::Validation(_))));
    let stats = Art::new().allocator_stats();
    assert!(serde_json::to_string(&stats).unwrap().contains("\"Node48\""));
}
