//! # Blocklist Derivation Benchmarks
//!
//! Conditions:
//! - 10 to 200 services
//! - Every service in its own partition, all pairs blocked (worst case)
//! - Random placement over 4 partitions with random overrides (typical)
//! - One service moved, then everything recomputed

use criterion::{black_box, BenchmarkId, Criterion, Throughput};
use enclave_network::{
    compute_blocklists, PartitionConnection, PartitionId, PartitionTopology, ServiceId,
};
use rand::Rng;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Enclave sizes exercised by every group.
pub const ENCLAVE_SIZES: [usize; 4] = [10, 50, 100, 200];

fn addresses(services: usize) -> HashMap<ServiceId, Ipv4Addr> {
    (0..services)
        .map(|i| {
            let host = (i + 2) as u32;
            (
                ServiceId::new(format!("svc-{}", i)),
                Ipv4Addr::from(u32::from(Ipv4Addr::new(10, 0, 0, 0)) + host),
            )
        })
        .collect()
}

/// Every service alone in a partition, default connection blocked.
pub fn isolated_topology(services: usize) -> (PartitionTopology, HashMap<ServiceId, Ipv4Addr>) {
    let ips = addresses(services);
    let mut topology =
        PartitionTopology::new(PartitionId::new("default"), PartitionConnection::BLOCKED);
    for (i, service) in ips.keys().enumerate() {
        let partition = PartitionId::new(format!("p{}", i));
        topology.create_partition(partition.clone()).ok();
        topology.add_service(service.clone(), &partition).ok();
    }
    (topology, ips)
}

/// Services spread randomly over four partitions with random overrides.
pub fn random_topology(services: usize) -> (PartitionTopology, HashMap<ServiceId, Ipv4Addr>) {
    let mut rng = rand::thread_rng();
    let ips = addresses(services);
    let partitions: Vec<PartitionId> = (0..4).map(|i| PartitionId::new(format!("p{}", i))).collect();

    let mut topology =
        PartitionTopology::new(PartitionId::new("default"), PartitionConnection::CONNECTED);
    for partition in &partitions {
        topology.create_partition(partition.clone()).ok();
    }
    for service in ips.keys() {
        let partition = &partitions[rng.gen_range(0..partitions.len())];
        topology.add_service(service.clone(), partition).ok();
    }
    for a in 0..partitions.len() {
        for b in (a + 1)..partitions.len() {
            let connection = PartitionConnection::blocked(rng.gen_bool(0.5));
            topology
                .set_partition_connection(&partitions[a], &partitions[b], connection)
                .ok();
        }
    }
    (topology, ips)
}

pub fn bench_compute_isolated(c: &mut Criterion) {
    let mut group = c.benchmark_group("enclave/blocklist/isolated");
    group.measurement_time(Duration::from_secs(5));

    for size in ENCLAVE_SIZES {
        let (topology, ips) = isolated_topology(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(compute_blocklists(&topology, &ips)))
        });
    }

    group.finish();
}

pub fn bench_compute_random(c: &mut Criterion) {
    let mut group = c.benchmark_group("enclave/blocklist/random");
    group.measurement_time(Duration::from_secs(5));

    for size in ENCLAVE_SIZES {
        let (topology, ips) = random_topology(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(compute_blocklists(&topology, &ips)))
        });
    }

    group.finish();
}

pub fn bench_move_and_recompute(c: &mut Criterion) {
    let mut group = c.benchmark_group("enclave/blocklist/move_and_recompute");
    group.measurement_time(Duration::from_secs(5));

    for size in ENCLAVE_SIZES {
        let (topology, ips) = random_topology(size);
        let service = ServiceId::new("svc-0");
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter_batched(
                || topology.clone(),
                |mut topology| {
                    topology.move_service(&service, &PartitionId::new("p3")).ok();
                    black_box(compute_blocklists(&topology, &ips))
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

pub fn register_benchmarks(c: &mut Criterion) {
    bench_compute_isolated(c);
    bench_compute_random(c);
    bench_move_and_recompute(c);
}
