//! Worker pool supervisor.
//!
//! One pool per (tier, stage), each a fixed number of independent consumer
//! slots racing on the pool's shared queue. The supervisor owns the pool
//! registry; nothing else starts or stops consumers.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conduit_core::defaults::{
    HANDLER_TIMEOUT_SECS, POOL_SIZE_BASIC, POOL_SIZE_ENTERPRISE, POOL_SIZE_FREE,
    POOL_SIZE_PREMIUM, WORKER_MAX_DELIVERIES, WORKER_MAX_RESTARTS, WORKER_POLL_INTERVAL_MS,
};
use conduit_core::{
    Delivery, Error, EventBus, PoolKey, PoolStatus, QueueId, Result, ServerEvent, Stage, Tier,
};

use crate::handler::{HandlerResult, MessageContext, StageHandler};
use crate::router::QueueRouter;

/// Configuration shared by every worker slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Safety-net poll interval while a queue is idle, in milliseconds.
    pub poll_interval_ms: u64,
    /// Respawns allowed per slot before it is disabled.
    pub max_restarts: u32,
    /// Deliveries of one message before it is abandoned.
    pub max_deliveries: u32,
    /// Upper bound on a single handler invocation.
    pub handler_timeout: Duration,
    /// Whether `start_all` launches anything.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: WORKER_POLL_INTERVAL_MS,
            max_restarts: WORKER_MAX_RESTARTS,
            max_deliveries: WORKER_MAX_DELIVERIES,
            handler_timeout: Duration::from_secs(HANDLER_TIMEOUT_SECS),
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `WORKER_ENABLED` | `true` | Start pools at boot |
    /// | `WORKER_POLL_INTERVAL_MS` | `1000` | Idle-queue poll interval |
    /// | `WORKER_MAX_RESTARTS` | `3` | Respawn budget per slot |
    /// | `WORKER_MAX_DELIVERIES` | `5` | Redelivery budget per message |
    /// | `HANDLER_TIMEOUT_SECS` | `300` | Per-message handler timeout |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let enabled = std::env::var("WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);
        let poll_interval_ms = std::env::var("WORKER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.poll_interval_ms);
        let max_restarts = std::env::var("WORKER_MAX_RESTARTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.max_restarts);
        let max_deliveries = std::env::var("WORKER_MAX_DELIVERIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.max_deliveries)
            .max(1);
        let handler_timeout = std::env::var("HANDLER_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.handler_timeout);

        Self {
            poll_interval_ms,
            max_restarts,
            max_deliveries,
            handler_timeout,
            enabled,
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Workers per stage for each tier. Independent of tenant count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizes {
    pub free: usize,
    pub basic: usize,
    pub premium: usize,
    pub enterprise: usize,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            free: POOL_SIZE_FREE,
            basic: POOL_SIZE_BASIC,
            premium: POOL_SIZE_PREMIUM,
            enterprise: POOL_SIZE_ENTERPRISE,
        }
    }
}

impl PoolSizes {
    /// Reads `POOL_SIZE_FREE`, `POOL_SIZE_BASIC`, `POOL_SIZE_PREMIUM` and
    /// `POOL_SIZE_ENTERPRISE`.
    pub fn from_env() -> Self {
        let read = |var: &str, default: usize| {
            std::env::var(var)
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(default)
        };
        let defaults = Self::default();
        Self {
            free: read("POOL_SIZE_FREE", defaults.free),
            basic: read("POOL_SIZE_BASIC", defaults.basic),
            premium: read("POOL_SIZE_PREMIUM", defaults.premium),
            enterprise: read("POOL_SIZE_ENTERPRISE", defaults.enterprise),
        }
    }

    /// The same size for every tier.
    pub fn uniform(size: usize) -> Self {
        Self {
            free: size,
            basic: size,
            premium: size,
            enterprise: size,
        }
    }

    pub fn get(&self, tier: Tier) -> usize {
        match tier {
            Tier::Free => self.free,
            Tier::Basic => self.basic,
            Tier::Premium => self.premium,
            Tier::Enterprise => self.enterprise,
        }
    }

    pub fn with_size(mut self, tier: Tier, size: usize) -> Self {
        match tier {
            Tier::Free => self.free = size,
            Tier::Basic => self.basic = size,
            Tier::Premium => self.premium = size,
            Tier::Enterprise => self.enterprise = size,
        }
        self
    }
}

#[derive(Default)]
struct SlotState {
    alive: AtomicBool,
    restarts: AtomicU32,
    disabled: AtomicBool,
}

struct PoolHandle {
    cancel: CancellationToken,
    slots: Vec<Arc<SlotState>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Everything one slot needs.
#[derive(Clone)]
struct SlotContext {
    key: PoolKey,
    queue: QueueId,
    router: QueueRouter,
    handler: Arc<dyn StageHandler>,
    events: Arc<EventBus>,
    config: WorkerConfig,
    cancel: CancellationToken,
}

pub struct WorkerPoolSupervisor {
    router: QueueRouter,
    handlers: HashMap<Stage, Arc<dyn StageHandler>>,
    events: Arc<EventBus>,
    config: WorkerConfig,
    sizes: PoolSizes,
    pools: Mutex<HashMap<PoolKey, PoolHandle>>,
}

impl WorkerPoolSupervisor {
    pub fn new(
        router: QueueRouter,
        events: Arc<EventBus>,
        config: WorkerConfig,
        sizes: PoolSizes,
    ) -> Self {
        Self {
            router,
            handlers: HashMap::new(),
            events,
            config,
            sizes,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Register the handler for its stage. Replaces any existing one.
    pub fn with_handler(mut self, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.insert(handler.stage(), handler);
        self
    }

    pub fn sizes(&self) -> PoolSizes {
        self.sizes
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Launch `count` slots on the (tier, stage) queue. Returns false when the
    /// pool is already running.
    pub async fn start(&self, tier: Tier, stage: Stage, count: usize) -> Result<bool> {
        let handler = self
            .handlers
            .get(&stage)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no handler registered for stage {}", stage)))?;
        let key = PoolKey::new(tier, stage);

        let mut pools = self.pools.lock().await;
        if pools.contains_key(&key) {
            debug!(subsystem = "jobs", component = "supervisor", pool = %key, "Pool already running");
            return Ok(false);
        }

        let cancel = CancellationToken::new();
        let ctx = SlotContext {
            key,
            queue: key.queue(),
            router: self.router.clone(),
            handler,
            events: self.events.clone(),
            config: self.config.clone(),
            cancel: cancel.clone(),
        };
        let slots: Vec<Arc<SlotState>> = (0..count).map(|_| Arc::new(SlotState::default())).collect();
        let tasks = slots
            .iter()
            .enumerate()
            .map(|(slot, state)| tokio::spawn(supervise_slot(ctx.clone(), slot, state.clone())))
            .collect();
        pools.insert(
            key,
            PoolHandle {
                cancel,
                slots,
                tasks,
            },
        );
        drop(pools);

        info!(
            subsystem = "jobs",
            component = "supervisor",
            tier = %tier,
            stage = %stage,
            pool_size = count,
            "Pool started"
        );
        self.events.emit(ServerEvent::PoolStarted {
            tier,
            stage,
            workers: count,
        });
        Ok(true)
    }

    /// Start every (tier, stage) pool at its configured size. Returns the
    /// number of pools started.
    pub async fn start_all(&self) -> Result<usize> {
        if !self.config.enabled {
            info!(subsystem = "jobs", component = "supervisor", "Workers disabled, not starting pools");
            return Ok(0);
        }
        let mut started = 0;
        for tier in Tier::ALL {
            for stage in Stage::ALL {
                if self.start(tier, stage, self.sizes.get(tier)).await? {
                    started += 1;
                }
            }
        }
        Ok(started)
    }

    /// Drain and stop a pool: slots finish and acknowledge their in-flight
    /// message, then exit. Returns false when the pool was not running.
    pub async fn stop(&self, tier: Tier, stage: Stage) -> bool {
        let key = PoolKey::new(tier, stage);
        let Some(handle) = self.pools.lock().await.remove(&key) else {
            debug!(subsystem = "jobs", component = "supervisor", pool = %key, "Pool already stopped");
            return false;
        };

        handle.cancel.cancel();
        for result in futures::future::join_all(handle.tasks).await {
            if let Err(e) = result {
                warn!(subsystem = "jobs", component = "supervisor", pool = %key, error = %e, "Slot task ended abnormally");
            }
        }

        info!(
            subsystem = "jobs",
            component = "supervisor",
            tier = %tier,
            stage = %stage,
            "Pool stopped"
        );
        self.events.emit(ServerEvent::PoolStopped { tier, stage });
        true
    }

    /// Stop then start at the pool's configured size.
    pub async fn restart(&self, tier: Tier, stage: Stage) -> Result<()> {
        self.stop(tier, stage).await;
        self.start(tier, stage, self.sizes.get(tier)).await?;
        Ok(())
    }

    pub async fn status(&self, tier: Tier, stage: Stage) -> PoolStatus {
        let key = PoolKey::new(tier, stage);
        let pools = self.pools.lock().await;
        match pools.get(&key) {
            Some(handle) => PoolStatus {
                tier,
                stage,
                configured: handle.slots.len(),
                live: handle
                    .slots
                    .iter()
                    .filter(|s| s.alive.load(Ordering::SeqCst))
                    .count(),
                disabled: handle
                    .slots
                    .iter()
                    .filter(|s| s.disabled.load(Ordering::SeqCst))
                    .count(),
                restarts: handle
                    .slots
                    .iter()
                    .map(|s| s.restarts.load(Ordering::SeqCst))
                    .sum(),
                running: true,
            },
            None => PoolStatus {
                tier,
                stage,
                configured: self.sizes.get(tier),
                live: 0,
                disabled: 0,
                restarts: 0,
                running: false,
            },
        }
    }

    pub async fn statuses(&self) -> Vec<PoolStatus> {
        let mut out = Vec::with_capacity(Tier::ALL.len() * Stage::ALL.len());
        for tier in Tier::ALL {
            for stage in Stage::ALL {
                out.push(self.status(tier, stage).await);
            }
        }
        out
    }

    /// Stop every running pool.
    pub async fn shutdown(&self) {
        let keys: Vec<PoolKey> = self.pools.lock().await.keys().copied().collect();
        for key in keys {
            self.stop(key.tier, key.stage).await;
        }
    }
}

/// Run one slot, respawning its consumer after a panic until the restart
/// budget is spent.
async fn supervise_slot(ctx: SlotContext, slot: usize, state: Arc<SlotState>) {
    loop {
        state.alive.store(true, Ordering::SeqCst);
        let result = tokio::spawn(consume_loop(ctx.clone(), slot)).await;
        state.alive.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => return,
            Err(e) if e.is_panic() => {
                let restarts = state.restarts.fetch_add(1, Ordering::SeqCst) + 1;
                if restarts > ctx.config.max_restarts {
                    state.disabled.store(true, Ordering::SeqCst);
                    error!(
                        subsystem = "jobs",
                        component = "supervisor",
                        pool = %ctx.key,
                        slot,
                        restarts,
                        "Worker slot exceeded restart budget; disabled"
                    );
                    ctx.events.emit(ServerEvent::WorkerSlotDisabled {
                        tier: ctx.key.tier,
                        stage: ctx.key.stage,
                        slot,
                    });
                    return;
                }
                warn!(
                    subsystem = "jobs",
                    component = "supervisor",
                    pool = %ctx.key,
                    slot,
                    restarts,
                    "Worker slot crashed; respawning"
                );
                ctx.events.emit(ServerEvent::WorkerRespawned {
                    tier: ctx.key.tier,
                    stage: ctx.key.stage,
                    slot,
                    restarts,
                });
                if ctx.cancel.is_cancelled() {
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

async fn consume_loop(ctx: SlotContext, slot: usize) {
    debug!(subsystem = "jobs", component = "worker", queue = %ctx.queue, slot, "Worker slot started");
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        match ctx.router.consume(ctx.queue).await {
            Ok(Some(delivery)) => process_delivery(&ctx, slot, delivery).await,
            Ok(None) => {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = ctx.router.wait(ctx.queue, ctx.config.poll_interval()) => {}
                }
            }
            Err(e) => {
                warn!(subsystem = "jobs", component = "worker", queue = %ctx.queue, slot, error = %e, "Consume failed");
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = tokio::time::sleep(ctx.config.poll_interval()) => {}
                }
            }
        }
    }
    debug!(subsystem = "jobs", component = "worker", queue = %ctx.queue, slot, "Worker slot stopped");
}

/// Handle one delivery and settle it. A handler panic requeues the delivery
/// and then propagates so the slot supervisor sees the crash.
async fn process_delivery(ctx: &SlotContext, slot: usize, delivery: Delivery) {
    let message = MessageContext::new(delivery, slot);
    let attempts = message.attempts();
    let max = ctx.config.max_deliveries;

    if attempts > max {
        let reason = format!("abandoned after {} deliveries", attempts - 1);
        error!(subsystem = "jobs", component = "worker", queue = %ctx.queue, slot, attempt = attempts, "Delivery budget exhausted");
        ctx.handler.abandon(&message, &reason).await;
        settle_ack(ctx, &message).await;
        return;
    }

    let outcome = AssertUnwindSafe(tokio::time::timeout(
        ctx.config.handler_timeout,
        ctx.handler.handle(&message),
    ))
    .catch_unwind()
    .await;

    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => HandlerResult::Retry(format!(
            "handler timed out after {}s",
            ctx.config.handler_timeout.as_secs()
        )),
        Err(panic) => {
            if let Err(e) = ctx.router.nack(&message.delivery, true).await {
                error!(subsystem = "jobs", component = "worker", queue = %ctx.queue, error = %e, "Failed to requeue after panic");
            }
            std::panic::resume_unwind(panic);
        }
    };

    match result {
        HandlerResult::Ack => settle_ack(ctx, &message).await,
        HandlerResult::Failed(reason) => {
            warn!(subsystem = "jobs", component = "worker", queue = %ctx.queue, slot, error = %reason, "Message failed permanently");
            settle_ack(ctx, &message).await;
        }
        HandlerResult::Retry(reason) if attempts >= max => {
            error!(subsystem = "jobs", component = "worker", queue = %ctx.queue, slot, attempt = attempts, error = %reason, "Retry budget exhausted; abandoning message");
            ctx.handler.abandon(&message, &reason).await;
            settle_ack(ctx, &message).await;
        }
        HandlerResult::Retry(reason) => {
            warn!(subsystem = "jobs", component = "worker", queue = %ctx.queue, slot, attempt = attempts, error = %reason, "Message will be redelivered");
            if let Err(e) = ctx.router.nack(&message.delivery, true).await {
                error!(subsystem = "jobs", component = "worker", queue = %ctx.queue, error = %e, "Failed to requeue message");
            }
        }
    }
}

async fn settle_ack(ctx: &SlotContext, message: &MessageContext) {
    if let Err(e) = ctx.router.ack(&message.delivery).await {
        error!(subsystem = "jobs", component = "worker", queue = %ctx.queue, error = %e, "Failed to ack message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoOpHandler;
    use async_trait::async_trait;
    use conduit_core::{Envelope, MessageFlags, PipelineMessage};
    use conduit_db::InMemoryQueueBroker;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    fn message() -> Envelope {
        Envelope::Transform(PipelineMessage {
            job_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            tier: Tier::Free,
            step: "s".into(),
            record_type: "repositories".into(),
            raw_data_id: None,
            nested_type: None,
            entity_ref: None,
            flags: MessageFlags::NONE,
        })
    }

    fn supervisor(handler: Arc<dyn StageHandler>, config: WorkerConfig) -> (WorkerPoolSupervisor, QueueRouter) {
        let router = QueueRouter::new(Arc::new(InMemoryQueueBroker::new()));
        let sup = WorkerPoolSupervisor::new(
            router.clone(),
            Arc::new(EventBus::new(256)),
            config.with_poll_interval(10),
            PoolSizes::uniform(2),
        )
        .with_handler(handler);
        (sup, router)
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let (sup, _) = supervisor(Arc::new(NoOpHandler::new(Stage::Transform)), WorkerConfig::default());

        assert!(sup.start(Tier::Free, Stage::Transform, 2).await.unwrap());
        assert!(!sup.start(Tier::Free, Stage::Transform, 2).await.unwrap());
        let status = sup.status(Tier::Free, Stage::Transform).await;
        assert!(status.running);
        assert_eq!(status.configured, 2);

        assert!(sup.stop(Tier::Free, Stage::Transform).await);
        assert!(!sup.stop(Tier::Free, Stage::Transform).await);
        assert!(!sup.status(Tier::Free, Stage::Transform).await.running);
    }

    #[tokio::test]
    async fn test_start_without_handler_is_config_error() {
        let (sup, _) = supervisor(Arc::new(NoOpHandler::new(Stage::Transform)), WorkerConfig::default());
        let err = sup.start(Tier::Free, Stage::Embedding, 1).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_pool_consumes_and_acks() {
        let handler = Arc::new(NoOpHandler::new(Stage::Transform));
        let (sup, router) = supervisor(handler.clone(), WorkerConfig::default());
        sup.start(Tier::Free, Stage::Transform, 2).await.unwrap();

        for _ in 0..5 {
            router.publish(Tier::Free, message()).await.unwrap();
        }
        let h = handler.clone();
        wait_until(move || h.handled() == 5).await;
        sup.shutdown().await;

        let depth = router.depth(QueueId::route(Tier::Free, Stage::Transform)).await.unwrap();
        assert_eq!((depth.ready, depth.in_flight), (0, 0));
    }

    struct RetryHandler {
        calls: AtomicUsize,
        abandoned: AtomicUsize,
    }

    #[async_trait]
    impl StageHandler for RetryHandler {
        fn stage(&self) -> Stage {
            Stage::Transform
        }

        async fn handle(&self, _ctx: &MessageContext) -> HandlerResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            HandlerResult::Retry("not yet".into())
        }

        async fn abandon(&self, _ctx: &MessageContext, _reason: &str) {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_retry_budget_abandons_message() {
        let handler = Arc::new(RetryHandler {
            calls: AtomicUsize::new(0),
            abandoned: AtomicUsize::new(0),
        });
        let (sup, router) = supervisor(handler.clone(), WorkerConfig::default().with_max_deliveries(3));
        sup.start(Tier::Free, Stage::Transform, 1).await.unwrap();
        router.publish(Tier::Free, message()).await.unwrap();

        let h = handler.clone();
        wait_until(move || h.abandoned.load(Ordering::SeqCst) == 1).await;
        sup.shutdown().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    struct PanicHandler;

    #[async_trait]
    impl StageHandler for PanicHandler {
        fn stage(&self) -> Stage {
            Stage::Transform
        }

        async fn handle(&self, _ctx: &MessageContext) -> HandlerResult {
            panic!("handler bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_slot_is_respawned_then_disabled() {
        let (sup, router) = supervisor(
            Arc::new(PanicHandler),
            WorkerConfig::default().with_max_restarts(2).with_max_deliveries(100),
        );
        let mut events = sup.events.subscribe();
        sup.start(Tier::Free, Stage::Transform, 1).await.unwrap();
        router.publish(Tier::Free, message()).await.unwrap();

        let mut respawned = 0;
        loop {
            let env = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            match env.payload {
                ServerEvent::WorkerRespawned { .. } => respawned += 1,
                ServerEvent::WorkerSlotDisabled { slot, .. } => {
                    assert_eq!(slot, 0);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(respawned, 2);

        let status = sup.status(Tier::Free, Stage::Transform).await;
        assert_eq!(status.disabled, 1);
        assert_eq!(status.live, 0);
        assert_eq!(status.restarts, 3);
        // The message survived every crash.
        let depth = router.depth(QueueId::route(Tier::Free, Stage::Transform)).await.unwrap();
        assert_eq!(depth.ready, 1);
        sup.shutdown().await;
    }

    #[test]
    fn test_pool_sizes_per_tier() {
        let sizes = PoolSizes::default().with_size(Tier::Premium, 7);
        assert_eq!(sizes.get(Tier::Free), 1);
        assert_eq!(sizes.get(Tier::Basic), 3);
        assert_eq!(sizes.get(Tier::Premium), 7);
        assert_eq!(sizes.get(Tier::Enterprise), 10);
    }
}
