use criterion::*;
use drivacy::share::ecmpc::{reconstruct, share};
use drivacy::share::pair_point;
use rand::*;

fn bench_share(c: &mut Criterion) {
    let mut rng = thread_rng();
    let point = pair_point(1, 2);

    let mut group = c.benchmark_group("ECMPC share");
    for parties in [2usize, 3, 5, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(parties), &parties, |b, &parties| {
            b.iter(|| share(&point, parties, &mut rng).unwrap())
        });
    }
    group.finish();
}

fn bench_reconstruct(c: &mut Criterion) {
    let mut rng = thread_rng();
    let point = pair_point(1, 2);

    let mut group = c.benchmark_group("ECMPC reconstruct");
    for parties in [2usize, 3, 5, 8] {
        let shares = share(&point, parties, &mut rng).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(parties), &shares, |b, shares| {
            b.iter(|| reconstruct(shares).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_share, bench_reconstruct);
criterion_main!(benches);
