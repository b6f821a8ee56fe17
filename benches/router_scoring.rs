//! Capability scoring and best-agent selection benchmarks.

use conductor::agent::{Agent, Echo};
use conductor::capability::{Capability, CapabilityKind};
use conductor::config::RuntimeConfig;
use conductor::notifier::WorkflowNotifier;
use conductor::recovery::RecoveryStrategyEngine;
use conductor::registry::AgentRegistry;
use conductor::router::CapabilityRouter;
use conductor::types::{AgentId, CapabilityVersion};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;

async fn router_with_agents(agent_count: usize) -> CapabilityRouter {
    let registry = Arc::new(AgentRegistry::new(
        WorkflowNotifier::start(),
        Arc::new(RecoveryStrategyEngine::new()),
        RuntimeConfig::test(),
    ));
    for i in 0..agent_count {
        let id = AgentId::try_new(format!("agent-{i}")).unwrap();
        let agent = Arc::new(Agent::new(id, "worker", Echo));
        let version = CapabilityVersion::try_new(format!("{}.0", 1 + i % 3)).unwrap();
        registry
            .register_agent(
                agent,
                vec![Capability::at_version(CapabilityKind::MessageProcessing, version)],
            )
            .await
            .unwrap();
    }
    CapabilityRouter::new(registry, RuntimeConfig::test())
}

fn bench_score_agents_for_capability(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("score_agents_for_capability");
    for agent_count in [10, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("uncached", agent_count),
            &agent_count,
            |b, &agent_count| {
                b.to_async(&rt).iter_batched(
                    || rt.block_on(router_with_agents(agent_count)),
                    |router| async move {
                        // A preference set disables the cache, so every
                        // iteration measures the full scoring pass rather
                        // than a cache hit.
                        let prefs = conductor::router::RoutingPreferences::default();
                        let matches = router
                            .score_agents_for_capability(&CapabilityKind::MessageProcessing, None, Some(&prefs))
                            .await;
                        black_box(matches)
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }
    group.finish();
}

fn bench_find_best_agent_cached(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("find_best_agent_cached", |b| {
        b.to_async(&rt).iter_batched(
            || rt.block_on(router_with_agents(100)),
            |router| async move {
                let winner = router
                    .find_best_agent(&CapabilityKind::MessageProcessing, Some(">=2.0"), None, None)
                    .await;
                black_box(winner)
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_score_agents_for_capability, bench_find_best_agent_cached);
criterion_main!(benches);
