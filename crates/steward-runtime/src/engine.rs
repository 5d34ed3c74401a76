use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use steward_autonomy::{ApprovalGate, PredicateRegistry};
use steward_broker::{CapabilityBackend, CapabilityBroker, HealthMonitor, LocalBackend};
use steward_config::StewardConfig;
use steward_core::{
    ApprovalRequest, ApprovalStatus, AuditEvent, Decision, EntityType, EventBus, HealthStatus,
    NewTask, PlanState, Result, StepState, StewardError, Task, TaskId, TaskStatus,
};
use steward_router::Classifier;
use steward_store::{Auditor, InMemoryStore, SqliteStore, Store};

use crate::executor::PlanExecutor;
use crate::reaper::{Reaper, SweepReport};
use crate::worker::{Processed, Worker};

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Tasks per status, from the audit read model.
    pub tasks: BTreeMap<String, usize>,
    pub backends: BTreeMap<String, HealthStatus>,
    pub pending_approvals: usize,
    pub deferred_calls: usize,
}

pub struct EngineBuilder {
    config: StewardConfig,
    store: Arc<dyn Store>,
    backends: Vec<Arc<dyn CapabilityBackend>>,
    predicates: PredicateRegistry,
    bus: EventBus,
}

impl EngineBuilder {
    pub fn backend(mut self, backend: Arc<dyn CapabilityBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Register a named validation predicate for `ValidationRule::Predicate`.
    pub fn predicate<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> bool + Send + Sync + 'static,
    {
        self.predicates.register(name, f);
        self
    }

    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn build(self) -> Engine {
        let auditor = Auditor::new(Arc::clone(&self.store), self.bus);

        let mut broker = CapabilityBroker::new(
            &self.config.broker,
            Arc::clone(&self.store),
            auditor.clone(),
        );
        broker.add_backend(Arc::new(LocalBackend));
        for backend in self.backends {
            broker.add_backend(backend);
        }
        let broker = Arc::new(broker);

        let classifier = Arc::new(Classifier::new(&self.config.classifier, auditor.clone()));
        let gate = Arc::new(ApprovalGate::new(
            &self.config.approval,
            Arc::clone(&self.store),
            auditor.clone(),
        ));
        let executor = Arc::new(PlanExecutor::new(
            &self.config,
            Arc::clone(&self.store),
            auditor.clone(),
            Arc::clone(&broker),
            self.predicates,
        ));

        Engine {
            config: self.config,
            store: self.store,
            auditor,
            classifier,
            gate,
            broker,
            executor,
        }
    }
}

/// The orchestration engine: ingestion, operator commands, and the
/// background workers that drain the task store.
pub struct Engine {
    config: StewardConfig,
    store: Arc<dyn Store>,
    auditor: Auditor,
    classifier: Arc<Classifier>,
    gate: Arc<ApprovalGate>,
    broker: Arc<CapabilityBroker>,
    executor: Arc<PlanExecutor>,
}

impl Engine {
    pub fn builder(config: StewardConfig, store: Arc<dyn Store>) -> EngineBuilder {
        EngineBuilder {
            config,
            store,
            backends: Vec::new(),
            predicates: PredicateRegistry::new(),
            bus: EventBus::default(),
        }
    }

    /// Open the store named by `store.backend` and build an engine over it.
    pub fn open(config: StewardConfig) -> Result<Self> {
        Ok(Self::builder(config.clone(), open_store(&config)?).build())
    }

    pub fn config(&self) -> &StewardConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn auditor(&self) -> &Auditor {
        &self.auditor
    }

    pub fn broker(&self) -> &Arc<CapabilityBroker> {
        &self.broker
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    // ── Ingestion ──────────────────────────────────────────────

    /// Validate, persist, and route a new task. The result is `needs_action`.
    pub fn ingest(&self, new_task: NewTask) -> Result<Task> {
        let task = new_task.into_task()?;
        self.store.insert_task(&task)?;
        self.auditor.record(
            AuditEvent::new(
                EntityType::Task,
                task.id.to_string(),
                None,
                TaskStatus::New.to_string(),
            )
            .with_details(json!({
                "title": task.title,
                "priority": task.priority,
                "source": task.source,
            })),
        );

        let routed = self.classifier.classify(&task);
        let task = self.store.update_task(task.id, &mut |t| {
            t.skill = Some(routed.skill.clone());
            t.confidence = Some(routed.confidence);
            t.transition(TaskStatus::NeedsAction, None)?;
            Ok(())
        })?;
        self.auditor.record(
            AuditEvent::task(task.id, TaskStatus::New, TaskStatus::NeedsAction).with_reason(
                format!("routed to {} ({} confidence)", routed.skill, routed.confidence),
            ),
        );
        info!(
            task_id = %task.id,
            skill = %routed.skill,
            priority = %task.priority,
            "task ingested"
        );
        Ok(task)
    }

    // ── Operator commands ──────────────────────────────────────

    pub fn decide(&self, decision: &Decision) -> Result<ApprovalRequest> {
        self.gate.apply_decision(decision)
    }

    /// Cancel a task. An executing task stops at its next step boundary;
    /// any other live task fails immediately.
    pub fn cancel(&self, task_id: TaskId, reason: Option<&str>) -> Result<Task> {
        let reason = reason
            .map(|r| format!("cancelled: {r}"))
            .unwrap_or_else(|| "cancelled".to_string());
        let mut from = TaskStatus::New;
        let mut deferred_to_worker = false;
        let task = self.store.update_task(task_id, &mut |t| {
            from = t.status;
            deferred_to_worker = false;
            if t.status.is_terminal() {
                return Err(StewardError::InvalidTransition {
                    from: t.status,
                    to: TaskStatus::Failed,
                });
            }
            if t.status == TaskStatus::Executing {
                t.cancel_requested = true;
                deferred_to_worker = true;
                return Ok(());
            }
            t.transition(TaskStatus::Failed, Some(reason.clone()))?;
            Ok(())
        })?;

        if deferred_to_worker {
            info!(task_id = %task_id, "cancellation requested, stopping at next step boundary");
            self.auditor.record(
                AuditEvent::task(task_id, TaskStatus::Executing, TaskStatus::Executing)
                    .with_reason("cancel requested"),
            );
            return Ok(task);
        }

        info!(task_id = %task_id, from = %from, "task cancelled");
        self.auditor
            .record(AuditEvent::task(task_id, from, TaskStatus::Failed).with_reason(reason));
        if from == TaskStatus::InApproval
            && let Some(approval_id) = task.approval_id
        {
            match self
                .gate
                .apply_decision(&Decision::reject(approval_id, "system", "task cancelled"))
            {
                Ok(_) | Err(StewardError::ApprovalAlreadyDecided(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(task)
    }

    /// Send a blocked task back to the queue with its blocked steps reset.
    pub fn resume(&self, task_id: TaskId) -> Result<Task> {
        let current = self.task(task_id)?;
        if current.status != TaskStatus::Blocked {
            return Err(StewardError::InvalidTransition {
                from: current.status,
                to: TaskStatus::NeedsAction,
            });
        }

        if let Some(mut state) = self.store.load_plan(task_id)? {
            let mut reset = Vec::new();
            for record in state
                .steps
                .iter_mut()
                .filter(|r| r.state == StepState::Blocked)
            {
                record.state = StepState::Pending;
                record.attempt_count = 0;
                record.using_alternate = false;
                record.last_error = None;
                record.next_attempt_at = None;
                reset.push(record.id.clone());
            }
            state.updated_at = Utc::now();
            self.store.save_plan(&state)?;
            for step in reset {
                self.auditor.record(
                    AuditEvent::step(task_id, &step, StepState::Blocked, StepState::Pending)
                        .with_reason("operator resume"),
                );
            }
        }

        let task = self.store.update_task(task_id, &mut |t| {
            t.transition(TaskStatus::NeedsAction, None)?;
            t.lease = None;
            Ok(())
        })?;
        info!(task_id = %task_id, "blocked task resumed");
        self.auditor.record(
            AuditEvent::task(task_id, TaskStatus::Blocked, TaskStatus::NeedsAction)
                .with_reason("operator resume"),
        );
        Ok(task)
    }

    // ── Queries ────────────────────────────────────────────────

    pub fn task(&self, task_id: TaskId) -> Result<Task> {
        self.store
            .get_task(task_id)?
            .ok_or(StewardError::TaskNotFound(task_id))
    }

    pub fn tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        self.store.list_tasks(status)
    }

    pub fn plan(&self, task_id: TaskId) -> Result<Option<PlanState>> {
        self.store.load_plan(task_id)
    }

    pub fn approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRequest>> {
        self.store.list_approvals(status)
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        self.store.recent_events(limit)
    }

    pub fn task_events(&self, task_id: TaskId) -> Result<Vec<AuditEvent>> {
        self.store.task_events(task_id)
    }

    pub fn status(&self) -> Result<StatusSnapshot> {
        let board = self.auditor.board()?;
        Ok(StatusSnapshot {
            tasks: board.counts(),
            backends: self.broker.health_snapshot(),
            pending_approvals: self
                .store
                .list_approvals(Some(ApprovalStatus::Pending))?
                .len(),
            deferred_calls: self.store.deferred_count()?,
        })
    }

    // ── Running ────────────────────────────────────────────────

    pub fn worker(&self, id: impl Into<String>) -> Worker {
        Worker::new(
            id,
            Arc::clone(&self.store),
            Arc::clone(&self.gate),
            Arc::clone(&self.executor),
            Duration::seconds(self.config.engine.lease_ttl_secs.max(1) as i64),
            std::time::Duration::from_millis(self.config.engine.poll_interval_ms.max(1)),
        )
    }

    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            Arc::clone(&self.store),
            self.auditor.clone(),
            Arc::clone(&self.gate),
            std::time::Duration::from_secs(self.config.engine.reaper_interval_secs.max(1)),
        )
    }

    /// One reaper pass at the current time.
    pub fn sweep(&self) -> Result<SweepReport> {
        self.reaper().sweep(Utc::now())
    }

    /// Process tasks on the calling task until none is claimable.
    pub async fn drain(&self, worker_id: &str) -> Result<Vec<Processed>> {
        let worker = self.worker(worker_id);
        let never = CancellationToken::new();
        let mut processed = Vec::new();
        while let Some(p) = worker.process_next(&never).await? {
            processed.push(p);
        }
        Ok(processed)
    }

    /// Start workers, the reaper, the health monitor, and the decision
    /// consumer, and run until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut tasks = JoinSet::new();

        match self.gate.take_receiver() {
            Some(rx) => {
                let gate = Arc::clone(&self.gate);
                let token = shutdown.clone();
                tasks.spawn(async move { gate.run_decisions(rx, token).await });
            }
            None => warn!("decision channel already consumed; decisions only via decide()"),
        }

        tasks.spawn(self.reaper().run(shutdown.clone()));
        let monitor = HealthMonitor::new(
            Arc::clone(&self.broker),
            std::time::Duration::from_secs(self.config.broker.probe_interval_secs.max(1)),
        );
        tasks.spawn(monitor.run(shutdown.clone()));

        let run_id = Uuid::new_v4().simple().to_string();
        let workers = self.config.engine.workers.max(1);
        for n in 0..workers {
            let worker = self.worker(format!("w{}-{n}", &run_id[..8]));
            tasks.spawn(worker.run(shutdown.clone()));
        }
        info!(workers, "engine running");

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "engine task ended abnormally");
            }
        }
        info!("engine stopped");
        Ok(())
    }
}

pub fn open_store(config: &StewardConfig) -> Result<Arc<dyn Store>> {
    match config.store.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        "sqlite" => Ok(Arc::new(SqliteStore::open(&config.store.resolved_path())?)),
        other => Err(StewardError::Config(format!("unknown store backend '{other}'"))),
    }
}
