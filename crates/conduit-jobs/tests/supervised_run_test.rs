//! Runs driven by live worker pools, the completion monitor and the
//! scheduler, as the binary wires them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::Receiver;
use uuid::Uuid;

use conduit_db::Stores;
use conduit_jobs::{
    CompletionConfig, EventEnvelope, FixtureSource, HashingEmbedder, MapperRegistry,
    OverallStatus, Pipeline, PipelineConfig, PipelinePlan, PoolSizes, ServerEvent,
    SourceRegistry, Stage, Tenant, Tier, WorkerConfig,
};

fn pipeline(pools: PoolSizes) -> Pipeline {
    let mut sources = SourceRegistry::new();
    sources.register(
        PipelinePlan::github(),
        Arc::new(FixtureSource::github_sample().with_latency(Duration::from_millis(2))),
    );
    let fast = Duration::from_millis(50);
    let mut config = PipelineConfig::default()
        .with_worker(WorkerConfig::default().with_poll_interval(20))
        .with_pools(pools)
        .with_completion(
            CompletionConfig::default()
                .with_backoff(vec![fast; 4])
                .with_grace(fast),
        )
        .with_scheduler_tick(Duration::from_secs(3600));
    // Every sub-status transition is an event; keep the test subscriber from lagging.
    config.event_capacity = 1 << 16;
    Pipeline::new(
        Stores::in_memory(),
        sources,
        MapperRegistry::new(),
        Arc::new(HashingEmbedder::default()),
        config,
    )
}

async fn wait_for<F>(events: &mut Receiver<EventEnvelope>, mut want: F, count: usize)
where
    F: FnMut(&ServerEvent) -> bool,
{
    let mut seen = 0;
    tokio::time::timeout(Duration::from_secs(20), async {
        while seen < count {
            match events.recv().await {
                Ok(envelope) if want(&envelope.payload) => seen += 1,
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for events");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pooled_run_finishes_and_resets() {
    let pipeline = pipeline(PoolSizes::uniform(3));
    let mut events = pipeline.events.subscribe();
    let handle = pipeline.start().await.unwrap();

    let tenant = Tenant::new(Uuid::new_v4(), Tier::Premium);
    let job = pipeline
        .scheduler
        .create_job(&tenant, Uuid::new_v4(), "github", None)
        .await
        .unwrap();
    pipeline.scheduler.start_job(job.id).await.unwrap();

    let job_id = job.id;
    wait_for(
        &mut events,
        |e| matches!(e, ServerEvent::JobReset { job_id: id, .. } if *id == job_id),
        1,
    )
    .await;

    let job = pipeline.tracker.load(job.id).await.unwrap();
    assert_eq!(job.status.overall, OverallStatus::Ready);
    assert!(job.status.steps.values().all(|s| s.is_idle()));
    assert!(job.last_run_finished_at.is_some());
    assert_eq!(pipeline.stores.entities.count(Some("pull_requests")).await.unwrap(), 4);

    handle.shutdown().await;
    assert!(pipeline.supervisor.statuses().await.iter().all(|s| !s.running));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_count_is_independent_of_tenant_count() {
    let pipeline = pipeline(PoolSizes::uniform(2));
    let mut events = pipeline.events.subscribe();
    let handle = pipeline.start().await.unwrap();

    let tenants = 25;
    for _ in 0..tenants {
        let tenant = Tenant::new(Uuid::new_v4(), Tier::Free);
        let job = pipeline
            .scheduler
            .create_job(&tenant, Uuid::new_v4(), "github", None)
            .await
            .unwrap();
        pipeline.scheduler.start_job(job.id).await.unwrap();
    }

    let statuses = pipeline.supervisor.statuses().await;
    assert_eq!(statuses.len(), 12);
    assert_eq!(statuses.iter().map(|s| s.configured).sum::<usize>(), 24);

    wait_for(&mut events, |e| matches!(e, ServerEvent::JobFinalized { .. }), tenants).await;
    assert_eq!(pipeline.supervisor.statuses().await.len(), 12);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restarted_pool_keeps_consuming() {
    let pipeline = pipeline(PoolSizes::uniform(1));
    let mut events = pipeline.events.subscribe();
    let handle = pipeline.start().await.unwrap();

    pipeline
        .supervisor
        .restart(Tier::Basic, Stage::Transform)
        .await
        .unwrap();
    let status = pipeline.supervisor.status(Tier::Basic, Stage::Transform).await;
    assert!(status.running);
    assert_eq!(status.configured, 1);

    let tenant = Tenant::new(Uuid::new_v4(), Tier::Basic);
    let job = pipeline
        .scheduler
        .create_job(&tenant, Uuid::new_v4(), "github", None)
        .await
        .unwrap();
    pipeline.scheduler.start_job(job.id).await.unwrap();
    wait_for(&mut events, |e| matches!(e, ServerEvent::JobFinalized { .. }), 1).await;

    handle.shutdown().await;
}
