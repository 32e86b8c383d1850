use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quickle::value::{HashableValue, Shared, SharedFrozen};
use quickle::{Decoder, Encoder, Value};
use std::collections::BTreeMap;

fn flat_list(n: usize) -> Value {
    Value::List(Shared::new((0..n as i64).map(Value::I64).collect()))
}

fn nested_dict(n: usize) -> Value {
    let mut map = BTreeMap::new();
    for i in 0..n as i64 {
        map.insert(
            HashableValue::String(SharedFrozen::new(format!("key-{i}"))),
            Value::List(Shared::new(vec![Value::I64(i), Value::F64(i as f64 / 2.0)])),
        );
    }
    Value::Dict(Shared::new(map))
}

fn shared_strings(n: usize) -> Value {
    let shared = Value::String(SharedFrozen::new("a repeated string".to_owned()));
    Value::List(Shared::new(vec![shared; n]))
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for size in [16, 256, 4096] {
        group.bench_with_input(BenchmarkId::new("flat_list", size), &size, |b, &size| {
            let value = flat_list(size);
            b.iter(|| Encoder::new().encode(black_box(&value)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("nested_dict", size), &size, |b, &size| {
            let value = nested_dict(size);
            b.iter(|| Encoder::new().encode(black_box(&value)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("shared_strings", size), &size, |b, &size| {
            let value = shared_strings(size);
            b.iter(|| Encoder::new().encode(black_box(&value)).unwrap());
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for size in [16, 256, 4096] {
        let flat = Encoder::new().encode(&flat_list(size)).unwrap();
        group.bench_with_input(BenchmarkId::new("flat_list", size), &flat.data, |b, data| {
            b.iter(|| Decoder::new().decode(black_box(data)).unwrap());
        });
        let dict = Encoder::new().encode(&nested_dict(size)).unwrap();
        group.bench_with_input(BenchmarkId::new("nested_dict", size), &dict.data, |b, data| {
            b.iter(|| Decoder::new().decode(black_box(data)).unwrap());
        });
    }
    group.finish();
}

fn bench_memoize_overhead(c: &mut Criterion) {
    let value = shared_strings(1024);
    let mut group = c.benchmark_group("memoize");
    group.bench_function("enabled", |b| {
        let encoder = Encoder::new().memoize(true);
        b.iter(|| encoder.encode(black_box(&value)).unwrap());
    });
    group.bench_function("disabled", |b| {
        let encoder = Encoder::new().memoize(false);
        b.iter(|| encoder.encode(black_box(&value)).unwrap());
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_memoize_overhead);
criterion_main!(benches);
