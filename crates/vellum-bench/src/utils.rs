//! Benchmark utilities and helpers.

use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vellum_common::types::{ColKey, ColumnAttrs, ColumnType, Mixed, ObjKey, TableKey};
use vellum_replication::TransactLogEncoder;

/// Generates random string data for benchmarks.
pub fn random_string(rng: &mut StdRng, len: usize) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generates `count` random integers from a fixed seed.
pub fn random_ints(count: usize) -> Vec<i64> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count).map(|_| rng.gen_range(-1_000_000..1_000_000)).collect()
}

/// Generates `count` random strings of `len` characters.
pub fn random_strings(count: usize, len: usize) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count).map(|_| random_string(&mut rng, len)).collect()
}

/// Column used by [`object_changeset`].
pub fn name_column() -> ColKey {
    ColKey::new(0, ColumnType::String, ColumnAttrs::NONE, 1)
}

/// A changeset that creates `objects` objects in one table and gives
/// each a random string.
pub fn object_changeset(objects: usize) -> Bytes {
    let mut rng = StdRng::seed_from_u64(7);
    let table = TableKey::new(0);
    let col = name_column();
    let mut enc = TransactLogEncoder::new();
    enc.insert_group_level_table(table, "items");
    enc.select_table(table);
    enc.insert_column(col, "name", TableKey::NULL);
    for k in 0..objects {
        let key = ObjKey::new(k as i64);
        enc.create_object(key);
        enc.modify_object(col, key, &Mixed::from(random_string(&mut rng, 16)));
    }
    enc.finish()
}
