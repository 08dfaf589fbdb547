use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stek_core::OsEntropy;
use stek_tls::{decode, encode};
use ticket_bench::{bench_record, CIPHERS, STATE_LEN};

fn bench_tickets(c: &mut Criterion) {
    let state = vec![0x5au8; STATE_LEN];
    for cipher in CIPHERS {
        let key = bench_record(cipher);
        c.bench_function(&format!("encode/{}", cipher.label()), |b| {
            b.iter(|| {
                let ticket = encode(black_box(&state), &key, &OsEntropy).expect("encode");
                black_box(ticket.len());
            })
        });

        let ticket = encode(&state, &key, &OsEntropy).expect("encode");
        c.bench_function(&format!("decode/{}", cipher.label()), |b| {
            b.iter(|| {
                let (state, _) = decode(black_box(ticket.as_bytes()), |_| Some(Arc::clone(&key)))
                    .expect("decode");
                black_box(state.len());
            })
        });
    }
}

criterion_group!(benches, bench_tickets);
criterion_main!(benches);
