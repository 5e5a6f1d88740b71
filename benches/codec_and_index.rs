use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use structdb::codec::{decode_uvarint, encode_uvarint_vec, Reader};
use structdb::index::{add_entry, query_exact};
use structdb::kv::mem::MemKv;
use structdb::kv::KvDatabase;
use structdb::objid::ObjId;

fn bench_uvarint_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("uvarint_round_trip");
    for &v in &[240u64, 2287, 67_823, u64::MAX] {
        group.bench_with_input(BenchmarkId::from_parameter(v), &v, |b, &v| {
            b.iter(|| {
                let bytes = encode_uvarint_vec(black_box(v));
                let mut r = Reader::new(&bytes);
                black_box(decode_uvarint(&mut r).unwrap())
            });
        });
    }
    group.finish();
}

fn bench_index_query_exact(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_query_exact");
    for &n in &[1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let db = MemKv::new();
            let mut txn = db.begin();
            for i in 0..n as u64 {
                let id = ObjId::new(1, i + 1).unwrap();
                add_entry(&mut txn, 10, &encode_uvarint_vec(i), id).unwrap();
            }
            let target = encode_uvarint_vec(n as u64 / 2);
            b.iter(|| black_box(query_exact(&txn, 10, &target).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_uvarint_round_trip, bench_index_query_exact);
criterion_main!(benches);
