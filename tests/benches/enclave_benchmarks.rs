//! # Enclave Network Benchmarks
//!
//! | Operation | Sizes | Target |
//! |-----------|-------|--------|
//! | Blocklist derivation, all pairs blocked | 10-200 services | < 10ms at 200 |
//! | Blocklist derivation, random partitions | 10-200 services | < 5ms at 200 |
//! | Enforcement fan-out (in-memory sidecars) | 10-200 services | < 50ms at 200 |

use criterion::{criterion_group, criterion_main, Criterion};
use enclave_tests::benchmarks::{blocklist, enforcement};

fn bench_blocklists(c: &mut Criterion) {
    blocklist::register_benchmarks(c);
}

fn bench_enforcement(c: &mut Criterion) {
    enforcement::register_benchmarks(c);
}

criterion_group!(benches, bench_blocklists, bench_enforcement);
criterion_main!(benches);
