use atomgrid::bvh::bounding_box::reduce_bounding_box;
use atomgrid::compute::{RayonBackend, SerialBackend};
use atomgrid::{Atom, BufferRing, BvhBuilder, Options, RadiusTable};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use glam::Vec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn scene(count: usize, spread: f32) -> Vec<Atom> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..count)
        .map(|_| {
            Atom::new(
                Vec3::new(
                    rng.random_range(-spread..spread),
                    rng.random_range(-spread..spread),
                    rng.random_range(-spread..spread),
                ),
                rng.random_range(6..=8),
            )
        })
        .collect()
}

fn reduction_benchmark(c: &mut Criterion) {
    let atoms = scene(200_000, 10.0);
    let radii = RadiusTable::covalent();
    let options = Options::default();
    let backend = RayonBackend::new(0).unwrap();
    c.bench_function("reduce_bounding_box_200k", |b| {
        b.iter(|| {
            black_box(
                reduce_bounding_box(&backend, black_box(&atoms), &radii, &options)
                    .unwrap(),
            )
        })
    });
}

fn frame_build_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_build");
    group.sample_size(20);

    for count in [1_000, 10_000, 100_000] {
        // Keep density roughly constant as the scene grows.
        let spread = (count as f32).cbrt() * 0.12;
        let atoms = scene(count, spread);

        let builder =
            BvhBuilder::new(Options::default(), RadiusTable::covalent()).unwrap();
        let ring = BufferRing::new(2);
        let mut frame = 0;
        group.bench_function(format!("rayon_{count}_atoms"), |b| {
            b.iter(|| {
                frame += 1;
                black_box(builder.build_frame(frame, &atoms, &ring).unwrap())
            })
        });

        let serial = BvhBuilder::with_backend(
            Options::default(),
            RadiusTable::covalent(),
            SerialBackend,
        )
        .unwrap();
        group.bench_function(format!("serial_{count}_atoms"), |b| {
            b.iter(|| {
                frame += 1;
                black_box(serial.build_frame(frame, &atoms, &ring).unwrap())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, reduction_benchmark, frame_build_benchmark);
criterion_main!(benches);
