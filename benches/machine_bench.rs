//! Lifecycle machine benchmarks
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use prifi_proxy::event::{Event, EventKind};
use prifi_proxy::grant::GrantOutcome;
use prifi_proxy::orchestrator::Machine;
use prifi_proxy::probe::ReachabilityResult;
use prifi_proxy::ClientConfig;
use std::collections::HashMap;

fn bench_lifecycle(c: &mut Criterion) {
    let config = ClientConfig::new("10.0.0.1", 9000, 9001);

    let mut group = c.benchmark_group("lifecycle");
    group.throughput(Throughput::Elements(1));

    // Full start and user stop on one machine
    group.bench_function("start_stop_cycle", |b| {
        let mut machine = Machine::new();
        b.iter(|| {
            machine.start(|| Some(config.clone())).unwrap();
            let id = machine.last_attempt();
            machine.on_event(&Event::new(
                Some(id),
                EventKind::GrantResolved(GrantOutcome::Granted),
            ));
            machine.on_event(&Event::new(
                Some(id),
                EventKind::ProbeCompleted(ReachabilityResult::Both),
            ));
            machine.on_event(&Event::new(Some(id), EventKind::StartSucceeded));
            machine.stop().unwrap();
            black_box(machine.on_event(&Event::new(None, EventKind::CoreStopped)))
        })
    });

    // Cancelled during the grant request, then a stale grant arrives
    group.bench_function("cancelled_attempt", |b| {
        let mut machine = Machine::new();
        b.iter(|| {
            machine.start(|| Some(config.clone())).unwrap();
            let id = machine.last_attempt();
            machine.stop().unwrap();
            black_box(machine.on_event(&Event::new(
                Some(id),
                EventKind::GrantResolved(GrantOutcome::Granted),
            )))
        })
    });

    group.finish();
}

fn bench_reachability(c: &mut Criterion) {
    let config = ClientConfig::new("10.0.0.1", 9000, 9001);
    let ports: HashMap<u16, bool> = HashMap::from([(9000, true), (9001, false)]);

    c.bench_function("reachability_from_ports", |b| {
        b.iter(|| black_box(ReachabilityResult::from_ports(&config, black_box(&ports))))
    });
}

criterion_group!(benches, bench_lifecycle, bench_reachability);
criterion_main!(benches);
