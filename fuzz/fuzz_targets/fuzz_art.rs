#![no_main]
use arbitrary::Arbitrary;
use artidx::{Art, ArtKey, ArtOptions, Error, RowId};
use libfuzzer_sys::fuzz_target;
use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Bound,
    rc::Rc,
};

#[macro_use]
extern crate log;

#[derive(Debug, Clone, Default)]
struct Failure(Option<Rc<str>>);

impl<'a> Arbitrary<'a> for Failure {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        if cfg!(not(feature = "failpoints")) {
            return Ok(Failure::default());
        }
        let a = u.arbitrary::<u8>()?;
        let b = u.arbitrary::<u8>()?;
        let config = format!("{0}*off->{1}*return({0}-{1})->off", a % 10, b % 5);
        Ok(Failure(Some(config.into())))
    }

    fn size_hint(depth: usize) -> (usize, Option<usize>) {
        <u16 as Arbitrary>::size_hint(depth)
    }
}

impl Failure {
    fn call<T>(&self, fun: impl FnOnce() -> T) -> T {
        if cfg!(not(feature = "failpoints")) {
            return fun();
        }
        if let Some(config) = &self.0 {
            trace!("Setting up failpoint {}", config);
            fail::cfg("artidx::allocate", config).unwrap();
            let result = fun();
            fail::cfg("artidx::allocate", "off").unwrap();
            result
        } else {
            fun()
        }
    }
}

/// Keys from a tiny alphabet, so they share long prefixes
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Key(Vec<u8>);

impl<'a> Arbitrary<'a> for Key {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let len = u.int_in_range(0..=40)?;
        let mut key = Vec::with_capacity(len);
        for _ in 0..len {
            key.push(*u.choose(&[0u8, 1, b'a', b'b', 255])?);
        }
        Ok(Key(ArtKey::from_bytes(&key).as_bytes().to_vec()))
    }
}

#[derive(Debug, Arbitrary)]
enum Op {
    Insert(Key, u16, Failure),
    Delete(Key, u16, Failure),
    Get(Key),
    Range(Option<Key>, Option<Key>),
    Vacuum(Failure),
    ToDeprecated,
    FromDeprecated(Failure),
}

#[derive(Debug, Arbitrary)]
struct Input {
    prefix_count: u8,
    small_buffers: bool,
    ops: Vec<Op>,
}

type Model = BTreeMap<Vec<u8>, BTreeSet<RowId>>;

fn check_oom<T>(result: Result<T, Error>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) if e.is_out_of_memory() => None,
        Err(e) => panic!("{e}"),
    }
}

fuzz_target!(|input: Input| {
    let _ = env_logger::try_init();
    let mut opts = ArtOptions::default();
    opts.prefix_count = input.prefix_count % 15 + 1;
    if input.small_buffers {
        opts.buffer_size = 512;
    }
    let mut art = Art::with_options(opts).unwrap();
    let mut model = Model::new();
    for op in input.ops {
        debug!("{op:?}");
        match op {
            Op::Insert(key, row, failure) => {
                let row = row as RowId;
                if let Some(inserted) = check_oom(failure.call(|| art.insert(&key.0, row))) {
                    assert_eq!(inserted, model.entry(key.0).or_default().insert(row));
                }
            }
            Op::Delete(key, row, failure) => {
                let row = row as RowId;
                if let Some(deleted) = check_oom(failure.call(|| art.delete(&key.0, row))) {
                    let in_model = model.get_mut(&key.0).is_some_and(|rows| rows.remove(&row));
                    model.retain(|_, rows| !rows.is_empty());
                    assert_eq!(deleted, in_model);
                }
            }
            Op::Get(key) => {
                let expected = model
                    .get(&key.0)
                    .map(|rows| rows.iter().copied().collect::<Vec<_>>())
                    .unwrap_or_default();
                assert_eq!(art.get(&key.0), expected);
            }
            Op::Range(start, end) => {
                let start = start.map_or(Bound::Unbounded, |k| Bound::Included(k.0));
                let end = end.map_or(Bound::Unbounded, |k| Bound::Excluded(k.0));
                if matches!((&start, &end), (Bound::Included(s), Bound::Excluded(e)) if s > e) {
                    continue;
                }
                let expected = model
                    .range::<Vec<u8>, _>((start.clone(), end.clone()))
                    .flat_map(|(k, rows)| rows.iter().map(|&r| (k.clone(), r)))
                    .collect::<Vec<_>>();
                assert_eq!(art.range((start, end)).collect::<Vec<_>>(), expected);
            }
            Op::Vacuum(failure) => {
                check_oom(failure.call(|| art.vacuum()));
            }
            Op::ToDeprecated => {
                check_oom(art.transform_to_deprecated());
            }
            Op::FromDeprecated(failure) => {
                check_oom(failure.call(|| art.transform_from_deprecated()));
            }
        }
        art.verify().unwrap();
        assert_eq!(art.len(), model.values().map(|r| r.len()).sum::<usize>());
    }
    assert!(art.iter().map(|(k, _)| k).eq(model
        .iter()
        .flat_map(|(k, rows)| std::iter::repeat(k.clone()).take(rows.len()))));
});
