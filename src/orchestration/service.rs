//! # DM Service
//!
//! The client-facing operations of the orchestrator. Transport layers (RPC,
//! HTTP) authenticate callers into an [`Identity`] and delegate here.
//!
//! ## Key Features
//!
//! - **Execution calls** (`activate_execution`, `finish_attempt`) run their
//!   mutation synchronously so callers see permission errors immediately
//! - **Distributor callbacks** (`handle_notification`) fold outcomes back into
//!   the graph through a journaled `FinishExecution`
//! - **Graph calls** (`ensure_graph_data`, `walk_graph`) are ACL checked unless
//!   made on behalf of a running execution

use super::acl::{Access, AclChecker, Identity};
use super::graph_walk::{walk_graph, GraphData, IncludeOptions, WalkLimits};
use super::templates::{StaticTemplates, TemplateRenderer};
use crate::config::DmConfig;
use crate::distributor::Notification;
use crate::error::{DmError, DmResult};
use crate::models::{
    AbnormalStatus, Attempt, Execution, ExecutionAuth, ExecutionId, ExecutionResult, QuestId,
};
use crate::mutation::{
    ActivateExecution, FinishAttempt, FinishExecution, HandlerContext, Mutation, MutationEngine,
};
use crate::registry::DistributorRegistry;
use crate::state_machine::{AttemptState, ExecutionState};
use crate::store::{fetch, GraphStore};
use crate::utils::Clock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct DmService {
    engine: Arc<MutationEngine>,
    templates: Arc<dyn TemplateRenderer>,
    acl: AclChecker,
}

impl DmService {
    pub fn new(
        engine: Arc<MutationEngine>,
        templates: Arc<dyn TemplateRenderer>,
        acl: AclChecker,
    ) -> Self {
        Self {
            engine,
            templates,
            acl,
        }
    }

    /// Wire a service, its engine and the config-defined templates and ACLs.
    pub fn from_config(
        config: Arc<DmConfig>,
        store: Arc<dyn GraphStore>,
        registry: Arc<DistributorRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let templates = Arc::new(StaticTemplates::new(config.templates.clone()));
        let acl = AclChecker::from_config(&config.acl);
        let ctx = Arc::new(HandlerContext {
            clock,
            registry,
            store,
            config,
        });
        Self::new(Arc::new(MutationEngine::new(ctx)), templates, acl)
    }

    pub fn engine(&self) -> &Arc<MutationEngine> {
        &self.engine
    }

    pub(crate) fn ctx(&self) -> &HandlerContext {
        self.engine.context()
    }

    pub(crate) fn templates(&self) -> &dyn TemplateRenderer {
        self.templates.as_ref()
    }

    pub(crate) fn acl(&self) -> &AclChecker {
        &self.acl
    }

    /// Check that `auth` names the RUNNING current execution of its attempt.
    ///
    /// Reads outside any transaction; handlers re-check under the group lock.
    pub(crate) async fn verify_execution(&self, auth: &ExecutionAuth) -> DmResult<Execution> {
        let store = self.ctx().store.as_ref();
        let denied = || DmError::PermissionDenied(format!("execution {} is not running", auth.id));

        let attempt = fetch::<Attempt>(store, &Attempt::key_for(&auth.id.attempt))
            .await?
            .ok_or_else(denied)?;
        if attempt.state != AttemptState::Executing || attempt.cur_execution != auth.id.id {
            return Err(denied());
        }
        let execution = fetch::<Execution>(store, &Execution::key_for(&auth.id))
            .await?
            .ok_or_else(denied)?;
        if execution.state != ExecutionState::Running || !execution.token_matches(&auth.token) {
            return Err(denied());
        }
        Ok(execution)
    }

    /// Exchange the scheduling token for the execution's own token.
    pub async fn activate_execution(
        &self,
        auth: ExecutionAuth,
        new_token: impl Into<String>,
    ) -> DmResult<()> {
        let mutation = Mutation::from(ActivateExecution {
            auth,
            new_token: new_token.into(),
        });
        self.engine.run_mutation(&mutation).await.map(|_| ())
    }

    /// Report the running execution's result; the execution moves to STOPPING.
    pub async fn finish_attempt(
        &self,
        auth: ExecutionAuth,
        result: serde_json::Value,
    ) -> DmResult<()> {
        let mutation = Mutation::from(FinishAttempt { auth, result });
        self.engine.run_mutation(&mutation).await.map(|_| ())
    }

    /// Let the execution's distributor interpret a push notification. Returns
    /// whether it carried a terminal outcome, which is journaled.
    #[instrument(skip(self, notification), fields(execution = %notification.execution))]
    pub async fn handle_notification(&self, notification: &Notification) -> DmResult<bool> {
        let ctx = self.ctx();
        let Some(execution) =
            fetch::<Execution>(ctx.store.as_ref(), &Execution::key_for(&notification.execution))
                .await?
        else {
            return Err(DmError::NotFound(format!(
                "execution {}",
                notification.execution
            )));
        };
        if execution.state.is_terminal() {
            debug!("notification for finished execution; ignoring");
            return Ok(false);
        }

        let quest = ctx.load_quest(&notification.execution.attempt.quest).await?;
        let (distributor, _) = ctx
            .registry
            .make_distributor(&execution.distributor_config_name)?;
        let Some(result) = distributor
            .handle_notification(&quest.desc, notification)
            .await?
        else {
            return Ok(false);
        };

        info!(abnormal = result.is_abnormal(), "notification carried a final result");
        self.engine
            .journal(vec![FinishExecution {
                execution: notification.execution.clone(),
                result,
            }
            .into()])
            .await?;
        Ok(true)
    }

    /// Ask the distributor to stop an execution and finish it as CANCELLED.
    /// Returns false if the execution had already finished.
    #[instrument(skip(self, caller, reason), fields(user = %caller.user))]
    pub async fn cancel_execution(
        &self,
        caller: &Identity,
        execution: &ExecutionId,
        reason: impl Into<String>,
    ) -> DmResult<bool> {
        self.acl.check(caller, Access::Write)?;
        let ctx = self.ctx();
        let Some(current) =
            fetch::<Execution>(ctx.store.as_ref(), &Execution::key_for(execution)).await?
        else {
            return Err(DmError::NotFound(format!("execution {execution}")));
        };
        if current.state.is_terminal() {
            return Ok(false);
        }

        if let Some(token) = current.distributor_token.as_deref() {
            let quest = ctx.load_quest(&execution.attempt.quest).await?;
            match ctx.registry.make_distributor(&current.distributor_config_name) {
                Ok((distributor, _)) => {
                    if let Err(e) = distributor.cancel(&quest.desc, token).await {
                        warn!(error = %e, "distributor cancel failed");
                    }
                }
                Err(e) => warn!(error = %e, "cannot resolve distributor to cancel"),
            }
        }

        let reason = reason.into();
        info!(%execution, %reason, "cancelling execution");
        let mutation = Mutation::from(FinishExecution {
            execution: execution.clone(),
            result: ExecutionResult::abnormal(AbnormalStatus::Cancelled, reason),
        });
        self.engine.run_mutation(&mutation).await?;
        Ok(true)
    }

    /// Report the graph reachable from `roots`.
    pub async fn walk_graph(
        &self,
        caller: &Identity,
        roots: &BTreeMap<QuestId, BTreeSet<u32>>,
        limits: &WalkLimits,
        include: IncludeOptions,
    ) -> DmResult<GraphData> {
        self.acl.check(caller, Access::Read)?;
        let ctx = self.ctx();
        walk_graph(ctx.store.as_ref(), &ctx.config.graph, roots, limits, include).await
    }
}
