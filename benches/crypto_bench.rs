//! Cryptographic operation benchmarks.
//!
//! Measures the per-connection cipher contexts on typical relay chunk
//! sizes, plus the one-off key derivation work done per connection.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use ssrelay::crypto::{evp_bytes_to_key, Hkdf};
use ssrelay::{CipherKind, Cryptor};

const CHUNK: usize = 16 * 1024;

fn bench_stream_encrypt(c: &mut Criterion) {
    let plaintext = vec![0u8; CHUNK];
    let mut group = c.benchmark_group("stream_encrypt");
    group.throughput(Throughput::Bytes(CHUNK as u64));

    for kind in CipherKind::ALL {
        let cryptor = Cryptor::with_kind(kind, "benchmark").unwrap();
        let mut session = cryptor.new_encrypt_session();
        group.bench_with_input(BenchmarkId::from_parameter(kind), &plaintext, |b, data| {
            b.iter(|| black_box(session.encrypt(data).unwrap()))
        });
    }

    group.finish();
}

fn bench_stream_decrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_decrypt");
    group.throughput(Throughput::Bytes(CHUNK as u64));

    for kind in CipherKind::ALL {
        let cryptor = Cryptor::with_kind(kind, "benchmark").unwrap();
        let plaintext = vec![0u8; CHUNK];

        group.bench_function(BenchmarkId::from_parameter(kind), |b| {
            b.iter_batched(
                || {
                    let mut enc = cryptor.new_encrypt_session();
                    (cryptor.new_decrypt_session(), enc.encrypt(&plaintext).unwrap())
                },
                |(mut dec, ciphertext)| black_box(dec.decrypt(&ciphertext).unwrap()),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_packet_encrypt(c: &mut Criterion) {
    let cryptor = Cryptor::new("aes-256-gcm", "benchmark").unwrap();
    let payload = vec![0u8; 1200];

    let mut group = c.benchmark_group("packet_encrypt");
    group.throughput(Throughput::Bytes(1200));
    group.bench_function("aes-256-gcm_1200_bytes", |b| {
        b.iter(|| black_box(cryptor.encrypt_packet(&payload).unwrap()))
    });
    group.finish();
}

fn bench_key_derivation(c: &mut Criterion) {
    c.bench_function("evp_bytes_to_key_32", |b| {
        b.iter(|| black_box(evp_bytes_to_key(b"benchmark", 32)))
    });

    let master = evp_bytes_to_key(b"benchmark", 32);
    let salt = [0x42u8; 32];
    c.bench_function("hkdf_sha1_subkey_32", |b| {
        b.iter(|| {
            let hkdf = Hkdf::new(Some(&salt), &master);
            black_box(hkdf.expand(b"ss-subkey", 32).unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_stream_encrypt,
    bench_stream_decrypt,
    bench_packet_encrypt,
    bench_key_derivation,
);

criterion_main!(benches);
