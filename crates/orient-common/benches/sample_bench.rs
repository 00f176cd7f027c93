use criterion::{black_box, criterion_group, criterion_main, Criterion};
use orient_common::sample::{decode, OrientationDecoder};

const FULL_FRAME: &str = r#"{"ts_unix_ms":1700000000000,"q":[0.9238795,0.0,0.3826834,0.0],"fov_deg":42.5,"lat":42.6977,"lon":23.3219,"alt_m":600}"#;
const MINIMAL_FRAME: &str = r#"{"q":[1,0,0,0]}"#;

fn bench_decode_full(c: &mut Criterion) {
    c.bench_function("decode_full_frame", |b| {
        b.iter(|| black_box(decode(black_box(FULL_FRAME), 1_700_000_000_120).unwrap()));
    });
}

fn bench_decode_minimal(c: &mut Criterion) {
    c.bench_function("decode_minimal_frame", |b| {
        b.iter(|| black_box(decode(black_box(MINIMAL_FRAME), 0).unwrap()));
    });
}

fn bench_decode_reject(c: &mut Criterion) {
    c.bench_function("decode_zero_quaternion", |b| {
        b.iter(|| black_box(decode(black_box(r#"{"q":[0,0,0,0]}"#), 0).is_err()));
    });
}

fn bench_decoder_stream_60hz(c: &mut Criterion) {
    let frames: Vec<String> = (0..60)
        .map(|i| {
            let angle = f64::from(i) * 0.05;
            format!(
                r#"{{"ts_unix_ms":{},"q":[{},0.0,{},0.0],"fov_deg":40}}"#,
                1_700_000_000_000_i64 + i64::from(i) * 16,
                (angle / 2.0).cos(),
                (angle / 2.0).sin()
            )
        })
        .collect();

    c.bench_function("decoder_one_second_at_60hz", |b| {
        b.iter(|| {
            let mut decoder = OrientationDecoder::new();
            for (i, frame) in frames.iter().enumerate() {
                decoder.accept(frame, 1_700_000_000_000 + i as i64 * 16 + 5);
            }
            black_box(decoder.current().copied())
        });
    });
}

criterion_group!(
    benches,
    bench_decode_full,
    bench_decode_minimal,
    bench_decode_reject,
    bench_decoder_stream_60hz,
);
criterion_main!(benches);
