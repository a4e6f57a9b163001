//! Criterion benchmarks for the topology compiler
//!
//! Compile runs once per launch and recompile once per relaunch, over
//! configs that grow with the number of clusters and nodes under test.

use std::fmt::Write;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use meshbed::topology::NodeId;
use meshbed::{compile, recompile, Config, Topology};

// =============================================================================
// Test Fixtures
// =============================================================================

/// `clusters` clusters of one server, `clients` client agents and one
/// dataplane each, peered in a chain over a shared wan network
fn config_yaml(clusters: usize, clients: usize) -> String {
    let mut yaml = String::from("networks:\n");
    for c in 0..clusters {
        let _ = writeln!(yaml, "  - name: dc{c}");
    }
    yaml.push_str("  - name: wan\n    type: wan\nclusters:\n");

    for c in 0..clusters {
        let _ = writeln!(yaml, "  - name: dc{c}\n    nodes:");
        let _ = writeln!(
            yaml,
            "      - kind: server\n        name: dc{c}-server1\n        addresses: [{{ network: dc{c} }}, {{ network: wan }}]"
        );
        for n in 0..clients {
            let _ = writeln!(
                yaml,
                "      - kind: client\n        name: dc{c}-client{n}\n        services:\n          - id: {{ name: svc{n} }}\n            image: example/pingpong:latest\n            port: 8080\n            envoy_admin_port: 19000"
            );
        }
        let _ = writeln!(
            yaml,
            "      - kind: dataplane\n        name: dc{c}-dp1\n        services:\n          - id: {{ name: pong }}\n            image: example/pingpong:latest\n            port: 8080\n            envoy_admin_port: 19000"
        );
    }

    if clusters > 1 {
        yaml.push_str("peerings:\n");
        for c in 1..clusters {
            let _ = writeln!(
                yaml,
                "  - dialing: {{ name: dc{} }}\n    accepting: {{ name: dc{c} }}",
                c - 1
            );
        }
    }
    yaml
}

fn config(clusters: usize, clients: usize) -> Config {
    Config::from_yaml_str(&config_yaml(clusters, clients)).unwrap()
}

/// Compiled with subnets and IPs filled in, as after the networks step
fn launched(config: &Config) -> Topology {
    let mut topology = compile(config).unwrap();
    let names: Vec<String> = topology.networks.keys().cloned().collect();
    for (i, name) in names.iter().enumerate() {
        topology
            .digest_subnet(name, &format!("10.{}.0.0/20", i + 1))
            .unwrap();
    }
    topology.assign_ips().unwrap();
    topology
}

// =============================================================================
// Benchmarks: Compile
// =============================================================================

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");

    for clusters in [1usize, 4, 16] {
        let cfg = config(clusters, 8);
        group.throughput(Throughput::Elements(clusters as u64));
        group.bench_with_input(BenchmarkId::new("clusters", clusters), &cfg, |b, cfg| {
            b.iter(|| black_box(compile(black_box(cfg)).unwrap()));
        });
    }

    for clients in [4usize, 32, 128] {
        let cfg = config(2, clients);
        group.bench_with_input(BenchmarkId::new("clients_per_cluster", clients), &cfg, |b, cfg| {
            b.iter(|| black_box(compile(black_box(cfg)).unwrap()));
        });
    }

    group.finish();
}

// =============================================================================
// Benchmarks: Recompile
// =============================================================================

fn bench_recompile(c: &mut Criterion) {
    let mut group = c.benchmark_group("recompile");

    for clusters in [1usize, 4, 16] {
        let cfg = config(clusters, 8);
        let previous = launched(&cfg);

        group.bench_with_input(BenchmarkId::new("unchanged", clusters), &cfg, |b, cfg| {
            b.iter(|| black_box(recompile(black_box(cfg), &previous).unwrap()));
        });

        let mut edited = cfg.clone();
        edited
            .disable_node("dc0", &NodeId::new("dc0-client0", ""))
            .unwrap();
        group.bench_with_input(BenchmarkId::new("disable_node", clusters), &edited, |b, cfg| {
            b.iter(|| black_box(recompile(black_box(cfg), &previous).unwrap()));
        });
    }

    group.finish();
}

// =============================================================================
// Criterion Groups
// =============================================================================

criterion_group!(benches, bench_compile, bench_recompile);

criterion_main!(benches);
