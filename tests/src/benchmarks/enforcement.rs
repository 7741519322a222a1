//! # Enforcement Fan-out Benchmarks
//!
//! Pushes one full set of blocklists to in-memory sidecars through the
//! bounded-concurrency enforcer.

use super::blocklist::{isolated_topology, ENCLAVE_SIZES};
use criterion::{black_box, BenchmarkId, Criterion, Throughput};
use enclave_network::{
    compute_blocklists, InMemorySidecar, NetworkingSidecar, OperationContext, SidecarEnforcer,
    SidecarHandles,
};
use std::sync::Arc;
use std::time::Duration;

pub fn bench_apply_blocklists(c: &mut Criterion) {
    let mut group = c.benchmark_group("enclave/enforcement/apply");
    group.measurement_time(Duration::from_secs(5));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(_) => return,
    };

    for size in ENCLAVE_SIZES {
        let (topology, ips) = isolated_topology(size);
        let Ok(blocklists) = compute_blocklists(&topology, &ips) else {
            continue;
        };
        let sidecars: SidecarHandles = ips
            .keys()
            .map(|id| {
                let sidecar: Arc<dyn NetworkingSidecar> = Arc::new(InMemorySidecar::new());
                (id.clone(), sidecar)
            })
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let enforcer = SidecarEnforcer::new(8, Duration::from_secs(1));
                runtime.block_on(async {
                    black_box(
                        enforcer
                            .apply_blocklists(&blocklists, &sidecars, &OperationContext::new())
                            .await,
                    )
                })
            })
        });
    }

    group.finish();
}

pub fn register_benchmarks(c: &mut Criterion) {
    bench_apply_blocklists(c);
}
