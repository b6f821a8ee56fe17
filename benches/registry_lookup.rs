//! Registry registration and capability-lookup benchmarks.

use conductor::agent::{Agent, Echo};
use conductor::capability::{Capability, CapabilityKind};
use conductor::config::RuntimeConfig;
use conductor::notifier::WorkflowNotifier;
use conductor::recovery::RecoveryStrategyEngine;
use conductor::registry::AgentRegistry;
use conductor::types::AgentId;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn new_registry() -> AgentRegistry {
    AgentRegistry::new(
        WorkflowNotifier::start(),
        Arc::new(RecoveryStrategyEngine::new()),
        RuntimeConfig::test(),
    )
}

fn bench_register_agent(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("register_agent", |b| {
        b.to_async(&rt).iter(|| async {
            let registry = new_registry();
            let agent = Arc::new(Agent::new(
                AgentId::try_new("bench-agent".to_string()).unwrap(),
                "worker",
                Echo,
            ));
            let result = registry
                .register_agent(agent, vec![Capability::new(CapabilityKind::MessageProcessing)])
                .await;
            black_box(result)
        });
    });
}

fn bench_capability_lookup(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("capability_lookup");
    for agent_count in [10, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("get_agents_by_capability", agent_count),
            &agent_count,
            |b, &agent_count| {
                b.to_async(&rt).iter_batched(
                    || {
                        rt.block_on(async {
                            let registry = new_registry();
                            for i in 0..agent_count {
                                let id = AgentId::try_new(format!("agent-{i}")).unwrap();
                                let agent = Arc::new(Agent::new(id, "worker", Echo));
                                let kind = if i % 5 == 0 {
                                    CapabilityKind::Monitoring
                                } else {
                                    CapabilityKind::MessageProcessing
                                };
                                registry.register_agent(agent, vec![Capability::new(kind)]).await.unwrap();
                            }
                            registry
                        })
                    },
                    |registry| async move {
                        let agents = registry.get_agents_by_capability(&CapabilityKind::MessageProcessing).await;
                        black_box(agents)
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }
    group.finish();
}

fn bench_unregister_agent(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("unregister_agent", |b| {
        b.to_async(&rt).iter_batched(
            || {
                rt.block_on(async {
                    let registry = new_registry();
                    let id = AgentId::try_new("bench-agent".to_string()).unwrap();
                    let agent = Arc::new(Agent::new(id.clone(), "worker", Echo));
                    registry
                        .register_agent(agent, vec![Capability::new(CapabilityKind::MessageProcessing)])
                        .await
                        .unwrap();
                    (registry, id)
                })
            },
            |(registry, id)| async move {
                registry.unregister_agent(&id).await;
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_register_agent, bench_capability_lookup, bench_unregister_agent);
criterion_main!(benches);
