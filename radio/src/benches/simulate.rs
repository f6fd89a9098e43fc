use criterion::{criterion_group, Criterion};
use qosim_radio::{
    config::{Config, Grid, Terminal},
    priority::Policy,
    profile::ApplicationProfile,
    simulation,
    trace::Discard,
};
use std::hint::black_box;

fn scenario(policy: Policy, terminals: usize) -> Config {
    Config {
        seed: 0,
        duration_ms: 1_000,
        engine: Default::default(),
        grid: Grid {
            capacity: 50,
            round_interval_ms: 1,
        },
        channel: Default::default(),
        priority_policy: policy,
        access_control: Default::default(),
        preemption: Default::default(),
        qos_monitor: Default::default(),
        transmission: Default::default(),
        terminals: (0..terminals)
            .map(|terminal| Terminal {
                cqi: (terminal % 15 + 1) as u8,
                bearers: vec![ApplicationProfile::constant(9, 500.0, 2.0)],
            })
            .collect(),
    }
}

/// Benchmark a full second of simulated time per policy.
fn bench_simulate(c: &mut Criterion) {
    for policy in [
        Policy::RoundRobin,
        Policy::ProportionalFair,
        Policy::StrictPriority,
        Policy::DeadlineAware,
    ] {
        for terminals in [10, 50] {
            let config = scenario(policy, terminals);
            c.bench_function(
                &format!("{}/policy={} terminals={}", module_path!(), policy, terminals),
                |b| b.iter(|| black_box(simulation::run(&config, Discard).unwrap().summary)),
            );
        }
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_simulate
}
