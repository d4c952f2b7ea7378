//! # EnsureGraphData
//!
//! Reconcile a caller's requested quests, attempts and dependencies against the
//! existing graph.
//!
//! ## Overview
//!
//! 1. Render templates and validate descriptors. Template failures are reported
//!    per template and nothing is written.
//! 2. Probe the store concurrently: which quests exist and with what
//!    provenance, which attempts exist, and (for calls on behalf of an
//!    execution) which dependency edges are already recorded.
//! 3. Without an execution: journal `MergeQuest`/`EnsureAttempt` for whatever is
//!    missing and return.
//! 4. On behalf of an execution, the requested attempts are its dependencies:
//!    - none missing: create whatever is missing and let it continue
//!    - every missing dependee already terminal: record the edges with
//!      `AddFinishedDeps` and let it continue
//!    - otherwise run `AddDeps` now, which revokes the execution's token, and
//!      tell the caller to halt
//!
//! No distributor is ever asked to run anything from here.

use super::acl::{Access, Identity};
use super::graph_walk::{walk_graph, GraphData, IncludeOptions, WalkLimits};
use super::service::DmService;
use crate::error::{DmError, DmResult};
use crate::models::{Attempt, AttemptId, ExecutionAuth, FwdDep, Quest, QuestDesc, QuestId};
use crate::mutation::{AddDeps, AddFinishedDeps, EnsureAttempt, MergeQuest, Mutation};
use crate::store::fetch;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument};

/// A quest to be rendered from a named template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateInstance {
    pub name: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsureGraphDataRequest {
    pub quests: Vec<QuestDesc>,
    /// Attempt numbers per entry of `quests`
    pub quest_attempts: Vec<Vec<u32>>,
    pub template_quests: Vec<TemplateInstance>,
    /// Attempt numbers per entry of `template_quests`
    pub template_attempts: Vec<Vec<u32>>,
    /// Attempts of quests that must already exist
    pub raw_attempts: BTreeMap<QuestId, Vec<u32>>,
    pub for_execution: Option<ExecutionAuth>,
    pub limits: WalkLimits,
    pub include: IncludeOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateError {
    /// Index into `template_quests`
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsureGraphDataResponse {
    pub accepted: bool,
    /// Ids of `quests`, in request order
    pub quest_ids: Vec<QuestId>,
    /// Ids of `template_quests`, in request order
    pub template_ids: Vec<QuestId>,
    pub template_errors: Vec<TemplateError>,
    pub result: GraphData,
    /// The calling execution was blocked on its new dependencies and must exit
    pub should_halt: bool,
}

/// Requested quests and attempts after rendering and validation
#[derive(Debug, Default)]
struct Requested {
    /// Quests built from descriptors or templates, merged by id
    introduced: BTreeMap<QuestId, Quest>,
    /// Every quest referenced, with the attempts asked for
    attempts: BTreeMap<QuestId, BTreeSet<u32>>,
}

impl Requested {
    fn introduce(&mut self, quest: Quest, attempts: &[u32]) -> DmResult<QuestId> {
        let id = quest.id.clone();
        self.add_attempts(&id, attempts)?;
        match self.introduced.get_mut(&id) {
            Some(existing) => {
                existing.merge_built_by(&quest.built_by);
            }
            None => {
                self.introduced.insert(id.clone(), quest);
            }
        }
        Ok(id)
    }

    fn add_attempts(&mut self, quest: &QuestId, attempts: &[u32]) -> DmResult<()> {
        if attempts.contains(&0) {
            return Err(DmError::invalid_argument(format!(
                "attempt numbers of quest {quest} must start at 1"
            )));
        }
        self.attempts
            .entry(quest.clone())
            .or_default()
            .extend(attempts.iter().copied());
        Ok(())
    }

    fn attempt_ids(&self) -> Vec<AttemptId> {
        self.attempts
            .iter()
            .flat_map(|(quest, ids)| ids.iter().map(move |&id| quest.attempt(id)))
            .collect()
    }
}

/// What the store already holds for one requested attempt
#[derive(Debug)]
struct AttemptProbe {
    id: AttemptId,
    attempt: Option<Attempt>,
    edge_recorded: bool,
}

fn attempts_for<'a>(lists: &'a [Vec<u32>], index: usize) -> &'a [u32] {
    lists.get(index).map(Vec::as_slice).unwrap_or(&[])
}

impl DmService {
    #[instrument(skip(self, caller, request), fields(
        user = %caller.user,
        quests = request.quests.len(),
        templates = request.template_quests.len(),
        on_behalf = request.for_execution.is_some()
    ))]
    pub async fn ensure_graph_data(
        &self,
        caller: &Identity,
        request: EnsureGraphDataRequest,
    ) -> DmResult<EnsureGraphDataResponse> {
        match &request.for_execution {
            Some(auth) => {
                self.verify_execution(auth).await?;
            }
            None => self.acl().check(caller, Access::Write)?,
        }
        if request.quest_attempts.len() > request.quests.len() {
            return Err(DmError::invalid_argument(
                "quest_attempts has more entries than quests",
            ));
        }
        if request.template_attempts.len() > request.template_quests.len() {
            return Err(DmError::invalid_argument(
                "template_attempts has more entries than template_quests",
            ));
        }

        let ctx = self.ctx();
        let now = ctx.now();
        let mut requested = Requested::default();
        let mut response = EnsureGraphDataResponse::default();

        for (index, desc) in request.quests.iter().enumerate() {
            self.validate_distributor_params(desc)
                .map_err(|e| DmError::invalid_argument(format!("quests[{index}]: {e}")))?;
            let quest = Quest::new(desc.clone(), now)?;
            let id = requested.introduce(quest, attempts_for(&request.quest_attempts, index))?;
            response.quest_ids.push(id);
        }

        for (index, instance) in request.template_quests.iter().enumerate() {
            let rendered = self
                .templates()
                .render(&instance.name, &instance.parameters)
                .and_then(|(desc, spec)| {
                    self.validate_distributor_params(&desc)
                        .map_err(|e| e.to_string())?;
                    Quest::new(desc, now)
                        .map(|q| q.with_built_by(spec))
                        .map_err(|e| e.to_string())
                });
            match rendered {
                Ok(quest) => {
                    let id =
                        requested.introduce(quest, attempts_for(&request.template_attempts, index))?;
                    response.template_ids.push(id);
                }
                Err(error) => response.template_errors.push(TemplateError { index, error }),
            }
        }
        if !response.template_errors.is_empty() {
            info!(errors = response.template_errors.len(), "template rendering failed");
            return Ok(response);
        }

        for (quest, attempts) in &request.raw_attempts {
            requested.add_attempts(quest, attempts)?;
        }

        if let Some(auth) = &request.for_execution {
            let own = &auth.id.attempt;
            if requested.attempt_ids().contains(own) {
                return Err(DmError::invalid_argument(format!(
                    "attempt {own} cannot depend on itself"
                )));
            }
        }

        let existing_quests = self.probe_quests(&requested).await?;
        for quest in request.raw_attempts.keys() {
            if !requested.introduced.contains_key(quest) && !existing_quests.contains_key(quest) {
                return Err(DmError::invalid_argument(format!("unknown quest {quest}")));
            }
        }
        let probes = self
            .probe_attempts(&requested, request.for_execution.as_ref())
            .await?;

        let to_merge: Vec<&Quest> = requested
            .introduced
            .values()
            .filter(|quest| match existing_quests.get(&quest.id) {
                None => true,
                Some(existing) => !existing.has_provenance_of(quest),
            })
            .collect();
        let missing_attempts: Vec<&AttemptId> = probes
            .iter()
            .filter(|p| p.attempt.is_none())
            .map(|p| &p.id)
            .collect();
        let creations = creation_mutations(&to_merge, &missing_attempts);

        match &request.for_execution {
            None => {
                debug!(mutations = creations.len(), "journaling graph creations");
                self.engine().journal(creations).await?;
            }
            Some(auth) => {
                let missing_deps: Vec<&AttemptProbe> =
                    probes.iter().filter(|p| !p.edge_recorded).collect();
                let all_terminal = missing_deps
                    .iter()
                    .all(|p| p.attempt.as_ref().is_some_and(|a| a.state.is_terminal()));

                if missing_deps.is_empty() {
                    self.engine().journal(creations).await?;
                } else if all_terminal {
                    debug!(deps = missing_deps.len(), "dependencies already finished");
                    let mut mutations = creations;
                    mutations.push(
                        AddFinishedDeps {
                            auth: auth.clone(),
                            deps: missing_deps.iter().map(|p| p.id.clone()).collect(),
                        }
                        .into(),
                    );
                    self.engine().journal(mutations).await?;
                } else {
                    info!(deps = missing_deps.len(), "blocking execution on dependencies");
                    let add_deps = Mutation::from(AddDeps {
                        auth: auth.clone(),
                        quests: to_merge.into_iter().cloned().collect(),
                        deps: missing_deps.iter().map(|p| p.id.clone()).collect(),
                    });
                    self.engine().run_mutation(&add_deps).await?;
                    response.should_halt = true;
                }
            }
        }

        response.result = walk_graph(
            ctx.store.as_ref(),
            &ctx.config.graph,
            &requested.attempts,
            &request.limits,
            request.include,
        )
        .await?;
        response.accepted = true;
        Ok(response)
    }

    fn validate_distributor_params(&self, desc: &QuestDesc) -> DmResult<()> {
        desc.validate()?;
        let (distributor, _) = self
            .ctx()
            .registry
            .make_distributor(&desc.distributor_config_name)?;
        distributor.validate(&desc.distributor_parameters)?;
        Ok(())
    }

    async fn probe_quests(&self, requested: &Requested) -> DmResult<BTreeMap<QuestId, Quest>> {
        let ctx = self.ctx();
        let store = ctx.store.as_ref();
        let found: Vec<(QuestId, Option<Quest>)> =
            stream::iter(requested.attempts.keys().cloned())
                .map(|id| async move {
                    let quest = fetch::<Quest>(store, &Quest::key_for(&id)).await?;
                    Ok::<_, DmError>((id, quest))
                })
                .buffer_unordered(ctx.config.graph.max_concurrency.max(1))
                .try_collect()
                .await?;
        Ok(found
            .into_iter()
            .filter_map(|(id, quest)| quest.map(|q| (id, q)))
            .collect())
    }

    async fn probe_attempts(
        &self,
        requested: &Requested,
        for_execution: Option<&ExecutionAuth>,
    ) -> DmResult<Vec<AttemptProbe>> {
        let ctx = self.ctx();
        let store = ctx.store.as_ref();
        let depender = for_execution.map(|auth| &auth.id.attempt);
        let mut probes: Vec<AttemptProbe> = stream::iter(requested.attempt_ids())
            .map(|id| async move {
                let attempt = fetch::<Attempt>(store, &Attempt::key_for(&id)).await?;
                let edge_recorded = match depender {
                    Some(depender) => store.exists(&FwdDep::key_for(depender, &id)).await?,
                    None => false,
                };
                Ok::<_, DmError>(AttemptProbe {
                    id,
                    attempt,
                    edge_recorded,
                })
            })
            .buffer_unordered(ctx.config.graph.max_concurrency.max(1))
            .try_collect()
            .await?;
        probes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(probes)
    }
}

fn creation_mutations(to_merge: &[&Quest], missing_attempts: &[&AttemptId]) -> Vec<Mutation> {
    let merged: BTreeSet<&QuestId> = to_merge.iter().map(|q| &q.id).collect();
    let mut mutations: Vec<Mutation> = to_merge
        .iter()
        .map(|quest| {
            MergeQuest {
                quest: (*quest).clone(),
                attempts: missing_attempts
                    .iter()
                    .filter(|a| a.quest == quest.id)
                    .map(|a| a.id)
                    .collect(),
            }
            .into()
        })
        .collect();
    mutations.extend(
        missing_attempts
            .iter()
            .filter(|a| !merged.contains(&a.quest))
            .map(|a| {
                EnsureAttempt {
                    attempt: (*a).clone(),
                }
                .into()
            }),
    );
    mutations
}
