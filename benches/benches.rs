use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::{rngs::StdRng, Rng as _, SeedableRng as _};
use snp_codes::{assign_codes, DistanceMatrix, MatrixLayout, SampleKey, Thresholds};

/// A seeded random symmetric matrix with distances in `0..50`, populated on
/// both triangles so either layout would work.
fn random_instance(n: usize, seed: u64) -> (Vec<SampleKey>, DistanceMatrix) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut rows = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..i {
            let dist = rng.gen_range(0.0..50.0);
            rows[i][j] = dist;
            rows[j][i] = dist;
        }
    }
    let samples = (0..n)
        .map(|row| SampleKey::new(format!("s{row}"), row))
        .collect();
    (samples, DistanceMatrix::new(rows, MatrixLayout::LowerLeft))
}

pub fn code_assignment(c: &mut Criterion) {
    let thresholds = Thresholds::new([25.0, 10.0, 5.0]).expect("The schedule should be valid.");
    for n in [32, 96] {
        let (samples, matrix) = random_instance(n, 0xC0DE5);
        c.bench_function(&format!("{n} samples, thresholds 25/10/5"), |b| {
            b.iter(|| {
                assign_codes(
                    black_box(&samples),
                    black_box(&matrix),
                    black_box(&thresholds),
                )
            });
        });
    }
}

criterion_group!(
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = code_assignment
);
criterion_main!(benches);
