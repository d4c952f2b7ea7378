// Test Helpers Module - shared fixtures for unit and integration tests
//
// Provides a scripted in-process distributor and a harness that wires the
// in-memory store, a manual clock, the registry, the mutation engine and the
// service together.

use crate::config::DmConfig;
use crate::distributor::{
    Distributor, DistributorError, DistributorResult, Notification, RunOutcome,
};
use crate::error::{DmError, DmResult};
use crate::models::{
    Attempt, AttemptId, Execution, ExecutionAuth, ExecutionResult, Quest, QuestDesc,
    RetryPolicy, Timeouts,
};
use crate::mutation::{EnsureAttempt, FinishExecution, MergeQuest, Mutation, MutationEngine};
use crate::orchestration::{DmService, Identity};
use crate::registry::DistributorRegistry;
use crate::store::{fetch, GraphStore, MemoryGraphStore};
use crate::utils::{Clock, ManualClock};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

/// Configuration name the harness registers its distributor under
pub const TEST_DISTRIBUTOR: &str = "test";
pub const WRITER_GROUP: &str = "dm-writers";
pub const READER_GROUP: &str = "dm-readers";

/// One recorded call to [`Distributor::run`]
#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub desc: QuestDesc,
    pub auth: ExecutionAuth,
    pub previous: Option<Value>,
}

/// A distributor whose answers are queued up by the test.
///
/// `run` succeeds with token `tok-N` unless an outcome was queued. Parameters
/// containing a `"reject"` key fail validation.
#[derive(Debug, Default)]
pub struct ScriptedDistributor {
    runs: Mutex<Vec<RecordedRun>>,
    run_outcomes: Mutex<VecDeque<DistributorResult<RunOutcome>>>,
    statuses: Mutex<HashMap<String, ExecutionResult>>,
    status_error: Mutex<Option<DistributorError>>,
    notification_result: Mutex<Option<ExecutionResult>>,
    cancels: Mutex<Vec<String>>,
}

impl ScriptedDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_run_outcome(&self, outcome: DistributorResult<RunOutcome>) {
        self.run_outcomes.lock().push_back(outcome);
    }

    pub fn set_status(&self, token: impl Into<String>, result: ExecutionResult) {
        self.statuses.lock().insert(token.into(), result);
    }

    pub fn fail_status_polls(&self, error: Option<DistributorError>) {
        *self.status_error.lock() = error;
    }

    pub fn set_notification_result(&self, result: Option<ExecutionResult>) {
        *self.notification_result.lock() = result;
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.lock().clone()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.cancels.lock().clone()
    }
}

#[async_trait]
impl Distributor for ScriptedDistributor {
    async fn run(
        &self,
        desc: &QuestDesc,
        auth: &ExecutionAuth,
        previous: Option<&Value>,
    ) -> DistributorResult<RunOutcome> {
        let mut runs = self.runs.lock();
        runs.push(RecordedRun {
            desc: desc.clone(),
            auth: auth.clone(),
            previous: previous.cloned(),
        });
        let n = runs.len();
        drop(runs);

        self.run_outcomes.lock().pop_front().unwrap_or_else(|| {
            Ok(RunOutcome {
                token: format!("tok-{n}"),
                pollback_secs: None,
            })
        })
    }

    async fn cancel(&self, _desc: &QuestDesc, token: &str) -> DistributorResult<()> {
        self.cancels.lock().push(token.to_string());
        Ok(())
    }

    async fn get_status(
        &self,
        _desc: &QuestDesc,
        token: &str,
    ) -> DistributorResult<Option<ExecutionResult>> {
        if let Some(error) = self.status_error.lock().clone() {
            return Err(error);
        }
        Ok(self.statuses.lock().get(token).cloned())
    }

    async fn handle_notification(
        &self,
        _desc: &QuestDesc,
        _notification: &Notification,
    ) -> DistributorResult<Option<ExecutionResult>> {
        Ok(self.notification_result.lock().clone())
    }

    fn validate(&self, params: &Value) -> DistributorResult<()> {
        if params.get("reject").is_some() {
            return Err(DistributorError::Permanent(
                "parameters rejected by distributor".to_string(),
            ));
        }
        Ok(())
    }
}

/// In-memory DM wired for deterministic tests
#[derive(Debug)]
pub struct TestHarness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryGraphStore>,
    pub distributor: Arc<ScriptedDistributor>,
    pub registry: Arc<DistributorRegistry>,
    pub config: Arc<DmConfig>,
    pub service: DmService,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(DmConfig::default())
    }

    pub fn with_config(mut config: DmConfig) -> Self {
        config.acl.writer_groups.insert(WRITER_GROUP.to_string());
        config.acl.reader_groups.insert(READER_GROUP.to_string());
        let config = Arc::new(config);

        let clock = Arc::new(ManualClock::deterministic());
        let store = Arc::new(MemoryGraphStore::new());
        let distributor = Arc::new(ScriptedDistributor::new());
        let registry = Arc::new(DistributorRegistry::new(config.distributors.clone()));
        registry.register_instance(TEST_DISTRIBUTOR, "1", distributor.clone());

        let service = DmService::from_config(
            config.clone(),
            store.clone(),
            registry.clone(),
            clock.clone(),
        );
        Self {
            clock,
            store,
            distributor,
            registry,
            config,
            service,
        }
    }

    pub fn engine(&self) -> &Arc<MutationEngine> {
        self.service.engine()
    }

    pub fn writer() -> Identity {
        Identity::new("writer", [WRITER_GROUP])
    }

    pub fn reader() -> Identity {
        Identity::new("reader", [READER_GROUP])
    }

    /// A descriptor for the harness distributor
    pub fn desc(params: Value) -> QuestDesc {
        QuestDesc::new(TEST_DISTRIBUTOR, params)
    }

    pub fn desc_with_retries(params: Value, failed: u32) -> QuestDesc {
        let mut desc = Self::desc(params);
        desc.meta.retry = RetryPolicy {
            failed,
            ..RetryPolicy::default()
        };
        desc
    }

    pub fn desc_with_timeouts(params: Value, timeouts: Timeouts) -> QuestDesc {
        let mut desc = Self::desc(params);
        desc.meta.timeouts = timeouts;
        desc
    }

    pub async fn run_until_idle(&self) -> DmResult<usize> {
        self.engine().run_until_idle().await
    }

    /// Move the clock forward and deliver whatever became ready.
    pub async fn advance(&self, by: chrono::Duration) -> DmResult<usize> {
        self.clock.advance(by);
        self.run_until_idle().await
    }

    /// Journal a quest with one attempt and run until the first execution is
    /// scheduled.
    pub async fn start(&self, desc: QuestDesc) -> DmResult<AttemptId> {
        let quest = Quest::new(desc, self.clock.now())?;
        let attempt = quest.id.attempt(1);
        self.engine()
            .journal(vec![MergeQuest {
                quest,
                attempts: BTreeSet::from([1]),
            }
            .into()])
            .await?;
        self.run_until_idle().await?;
        Ok(attempt)
    }

    pub async fn ensure_attempt(&self, attempt: &AttemptId) -> DmResult<()> {
        self.engine()
            .journal(vec![EnsureAttempt {
                attempt: attempt.clone(),
            }
            .into()])
            .await
    }

    pub async fn attempt(&self, id: &AttemptId) -> DmResult<Attempt> {
        fetch::<Attempt>(self.store.as_ref(), &Attempt::key_for(id))
            .await?
            .ok_or_else(|| DmError::NotFound(format!("attempt {id}")))
    }

    pub async fn execution(&self, attempt: &AttemptId, n: u32) -> DmResult<Execution> {
        let id = attempt.execution(n);
        fetch::<Execution>(self.store.as_ref(), &Execution::key_for(&id))
            .await?
            .ok_or_else(|| DmError::NotFound(format!("execution {id}")))
    }

    pub async fn current_execution(&self, attempt: &AttemptId) -> DmResult<Execution> {
        let current = self.attempt(attempt).await?.cur_execution;
        self.execution(attempt, current).await
    }

    /// Scheduling credentials of the attempt's current execution
    pub async fn scheduling_auth(&self, attempt: &AttemptId) -> DmResult<ExecutionAuth> {
        self.current_execution(attempt)
            .await?
            .auth()
            .ok_or_else(|| DmError::internal(format!("current execution of {attempt} has no token")))
    }

    /// Activate the current execution; returns the running credentials.
    pub async fn activate(&self, attempt: &AttemptId) -> DmResult<ExecutionAuth> {
        let auth = self.scheduling_auth(attempt).await?;
        let token = format!("running-{}", auth.id);
        self.service.activate_execution(auth.clone(), token.clone()).await?;
        Ok(ExecutionAuth { id: auth.id, token })
    }

    /// Report `data` from the running execution, then let the distributor
    /// confirm a normal finish.
    pub async fn complete(&self, auth: &ExecutionAuth, data: Value) -> DmResult<()> {
        self.service.finish_attempt(auth.clone(), data).await?;
        self.finish(auth, ExecutionResult::default()).await
    }

    /// Deliver a distributor verdict for an execution.
    pub async fn finish(&self, auth: &ExecutionAuth, result: ExecutionResult) -> DmResult<()> {
        self.engine()
            .run_mutation(&Mutation::from(FinishExecution {
                execution: auth.id.clone(),
                result,
            }))
            .await?;
        self.run_until_idle().await?;
        Ok(())
    }

    /// Activate and complete the current execution in one step.
    pub async fn run_to_success(&self, attempt: &AttemptId) -> DmResult<()> {
        let auth = self.activate(attempt).await?;
        self.complete(&auth, json!({"ok": attempt.to_string()})).await
    }

    pub async fn pending_journal(&self) -> DmResult<usize> {
        Ok(self.store.pending().await?.len())
    }
}
