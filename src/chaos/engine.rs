//! Action execution engine
//!
//! Each action owns its state behind a per-action mutex. Once started, a
//! dedicated tick task drives it to a terminal phase, so a slow cluster call
//! in one action never delays another. Revert runs at most once per action:
//! the `reverted` flag is checked and set under the same lock by every path
//! that can trigger it (duration elapsed, failure, stop, recovery).
//!
//! Terminal actions are kept for the configured retention and then swept,
//! together with their reverted rows in the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::strategies::{self, Progress, StrategyContext};
use super::types::{
    ActionErrorReport, ActionKind, ActionPhase, ActionStatus, Disruption, PrepareRequest,
};
use crate::config::Config;
use crate::db::Database;
use crate::error::ActionError;
use crate::k8s::{ClusterApi, SnapshotCache};

/// Mutable record of one action
#[derive(Debug)]
struct ActionState {
    phase: ActionPhase,
    disruption: Disruption,
    duration: Option<Duration>,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    reverted: bool,
    error: Option<ActionError>,
    messages: Vec<String>,
    /// When the action reached a terminal phase
    finished: Option<Instant>,
}

struct ActionHandle {
    id: Uuid,
    kind: ActionKind,
    created_at: DateTime<Utc>,
    state: Mutex<ActionState>,
    cancel: Notify,
}

impl ActionHandle {
    fn status(&self, state: &ActionState) -> ActionStatus {
        let elapsed = state.started.map(|s| s.elapsed());
        let remaining = match (state.duration, elapsed) {
            (Some(d), Some(e)) if !state.phase.is_terminal() => Some(d.saturating_sub(e)),
            _ => None,
        };
        ActionStatus {
            id: self.id,
            kind: self.kind,
            phase: state.phase,
            disruption: state.disruption.clone(),
            duration_ms: state.duration.map(|d| d.as_millis() as u64),
            created_at: self.created_at,
            started_at: state.started_at,
            elapsed_ms: elapsed.map(|e| e.as_millis() as u64),
            remaining_ms: remaining.map(|r| r.as_millis() as u64),
            reverted: state.reverted,
            error: state.error.as_ref().map(ActionErrorReport::from),
            messages: state.messages.clone(),
        }
    }
}

/// How a revert was triggered; decides the resulting phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Completed,
    Failed,
    Stopped,
}

/// Runs disruptions through prepare, start, status and stop
#[derive(Clone)]
pub struct ActionEngine {
    api: Arc<dyn ClusterApi>,
    cache: Arc<SnapshotCache>,
    config: Arc<Config>,
    store: Option<Database>,
    actions: Arc<RwLock<HashMap<Uuid, Arc<ActionHandle>>>>,
}

impl ActionEngine {
    pub fn new(api: Arc<dyn ClusterApi>, cache: Arc<SnapshotCache>, config: Arc<Config>) -> Self {
        Self {
            api,
            cache,
            config,
            store: None,
            actions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Persist started actions so a restart can revert them
    pub fn with_store(mut self, db: Database) -> Self {
        self.store = Some(db);
        self
    }

    fn context(&self) -> StrategyContext<'_> {
        StrategyContext::new(self.api.as_ref(), self.cache.as_ref(), self.config.as_ref())
    }

    async fn handle(&self, id: Uuid) -> Result<Arc<ActionHandle>, ActionError> {
        self.actions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ActionError::UnknownAction(id.to_string()))
    }

    /// Validate the target and capture original state. Nothing is mutated.
    pub async fn prepare(
        &self,
        kind: ActionKind,
        request: PrepareRequest,
    ) -> Result<ActionStatus, ActionError> {
        let prepared = strategies::prepare(kind, &request, &self.context()).await?;

        let handle = Arc::new(ActionHandle {
            id: Uuid::new_v4(),
            kind,
            created_at: Utc::now(),
            state: Mutex::new(ActionState {
                phase: ActionPhase::Prepared,
                disruption: prepared.disruption,
                duration: prepared.duration,
                started_at: None,
                started: None,
                reverted: false,
                error: None,
                messages: Vec::new(),
                finished: None,
            }),
            cancel: Notify::new(),
        });

        let status = {
            let state = handle.state.lock().await;
            handle.status(&state)
        };
        self.actions.write().await.insert(handle.id, handle.clone());
        info!(action_id = %handle.id, kind = %kind, "Action prepared");
        Ok(status)
    }

    /// Issue the forward mutation and hand the action to its tick task. A
    /// failed start is reverted immediately, and so is one interrupted by
    /// [`stop`](Self::stop) while the mutation is still in flight.
    pub async fn start(&self, id: Uuid) -> Result<ActionStatus, ActionError> {
        let handle = self.handle(id).await?;
        let mut state = handle.state.lock().await;
        if state.phase != ActionPhase::Prepared {
            return Err(ActionError::InvalidTransition(format!(
                "cannot start action {} in phase {}",
                id, state.phase
            )));
        }

        state.started_at = Some(Utc::now());
        state.started = Some(Instant::now());

        // Recorded before anything is mutated so a crash mid-apply is recoverable
        let intended = state.disruption.intended();
        self.persist(&handle, &intended, &mut state.messages).await;

        let ctx = self.context();
        let outcome = tokio::select! {
            result = state.disruption.apply(&ctx) => Some(result),
            _ = handle.cancel.notified() => None,
        };

        match outcome {
            Some(Ok(())) => {
                state.phase = ActionPhase::Started;
                state
                    .messages
                    .push(format!("{} started", handle.kind));
                let applied = state.disruption.clone();
                self.persist(&handle, &applied, &mut state.messages).await;
                info!(action_id = %id, kind = %handle.kind, "Action started");
            }
            Some(Err(e)) => {
                error!(action_id = %id, kind = %handle.kind, error = %e, "Action start failed");
                // Partial forward mutations (e.g. a cordon before a failed
                // eviction) still need undoing
                let applied = state.disruption.clone();
                self.persist(&handle, &applied, &mut state.messages).await;
                state.error = Some(e);
                self.finish(&handle, &mut state, Finish::Failed).await;
                return Ok(handle.status(&state));
            }
            None => {
                warn!(action_id = %id, kind = %handle.kind, "Action stopped while starting");
                state.messages.push("stopped while starting".to_string());
                self.finish(&handle, &mut state, Finish::Stopped).await;
                return Ok(handle.status(&state));
            }
        }

        let status = handle.status(&state);
        drop(state);

        let engine = self.clone();
        let ticked = handle.clone();
        tokio::spawn(async move { engine.run(ticked).await });

        Ok(status)
    }

    /// Current status. Also advances the action, so a caller polling
    /// status sees completion as soon as the duration has elapsed.
    pub async fn status(&self, id: Uuid) -> Result<ActionStatus, ActionError> {
        let handle = self.handle(id).await?;
        let mut state = handle.state.lock().await;
        if matches!(state.phase, ActionPhase::Started | ActionPhase::Running) {
            self.advance(&handle, &mut state).await;
        }
        Ok(handle.status(&state))
    }

    /// Cancel the action, reverting right away. Stopping an action that is
    /// already terminal returns its status unchanged.
    pub async fn stop(&self, id: Uuid) -> Result<ActionStatus, ActionError> {
        let handle = self.handle(id).await?;
        // Wakes a start still applying, which holds the lock until it returns
        handle.cancel.notify_one();
        let mut state = handle.state.lock().await;
        match state.phase {
            ActionPhase::Prepared => {
                state.phase = ActionPhase::Stopped;
                state.finished = Some(Instant::now());
                state.messages.push("stopped before start".to_string());
            }
            ActionPhase::Started | ActionPhase::Running => {
                info!(action_id = %id, "Stopping action");
                self.finish(&handle, &mut state, Finish::Stopped).await;
            }
            _ => {}
        }
        Ok(handle.status(&state))
    }

    /// Stop every action that is still in flight. Used on shutdown.
    pub async fn stop_all(&self) -> usize {
        let handles: Vec<_> = self
            .actions
            .read()
            .await
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();
        let mut stopped = 0;
        for (id, handle) in handles {
            if handle.state.lock().await.phase.is_terminal() {
                continue;
            }
            match self.stop(id).await {
                Ok(_) => stopped += 1,
                Err(e) => error!(action_id = %id, error = %e, "Failed to stop action"),
            }
        }
        stopped
    }

    /// Forget actions that finished more than `retention` ago, and delete
    /// their reverted rows from the store. Returns how many were dropped.
    pub async fn prune_finished(&self, retention: Duration) -> usize {
        let handles: Vec<_> = self.actions.read().await.values().cloned().collect();
        let mut expired = Vec::new();
        for handle in handles {
            let state = handle.state.lock().await;
            if state.finished.is_some_and(|f| f.elapsed() >= retention) {
                expired.push(handle.id);
            }
        }

        if !expired.is_empty() {
            let mut actions = self.actions.write().await;
            for id in &expired {
                actions.remove(id);
            }
            debug!(count = expired.len(), "Finished actions pruned");
        }

        if let Some(store) = &self.store {
            let cutoff = chrono::Duration::from_std(retention)
                .map(|r| Utc::now() - r)
                .unwrap_or_else(|_| Utc::now());
            match store.prune_reverted(cutoff).await {
                Ok(0) => {}
                Ok(rows) => debug!(rows, "Reverted action rows pruned"),
                Err(e) => warn!(error = %e, "Failed to prune reverted actions"),
            }
        }

        expired.len()
    }

    /// Prune finished actions on a fixed interval until the task is aborted
    pub fn spawn_sweeper(self, interval: Duration, retention: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = interval.as_secs(),
                retention_secs = retention.as_secs(),
                "Starting finished action sweeper"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.prune_finished(retention).await;
            }
        })
    }

    /// Every known action, oldest first
    pub async fn list(&self) -> Vec<ActionStatus> {
        let handles: Vec<_> = self.actions.read().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(handles.len());
        for handle in handles {
            let state = handle.state.lock().await;
            statuses.push(handle.status(&state));
        }
        statuses.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        statuses
    }

    /// Revert every persisted action a previous process left in place.
    /// Returns how many were reverted.
    pub async fn recover(&self) -> Result<usize, ActionError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let pending = store.unreverted_actions().await?;
        if pending.is_empty() {
            return Ok(0);
        }
        warn!(count = pending.len(), "Reverting actions left over from a previous run");

        let ctx = self.context();
        let mut reverted = 0;
        for action in pending {
            match action.disruption.revert(&ctx).await {
                Ok(()) => {
                    store.mark_reverted(action.id).await?;
                    info!(action_id = %action.id, kind = %action.kind, "Recovered action reverted");
                    reverted += 1;
                }
                Err(e) => {
                    error!(action_id = %action.id, kind = %action.kind, error = %e, "Recovered action could not be reverted");
                }
            }
        }
        Ok(reverted)
    }

    /// Tick loop owned by one started action
    async fn run(self, handle: Arc<ActionHandle>) {
        let mut ticker = tokio::time::interval(self.config.action_poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = handle.cancel.notified() => {}
                _ = ticker.tick() => {}
            }

            let mut state = handle.state.lock().await;
            if state.phase.is_terminal() {
                break;
            }
            self.advance(&handle, &mut state).await;
            if state.phase.is_terminal() {
                break;
            }
        }
    }

    /// One evaluation step of a started action
    async fn advance(&self, handle: &ActionHandle, state: &mut ActionState) {
        state.phase = ActionPhase::Running;
        let elapsed = state.started.map(|s| s.elapsed()).unwrap_or_default();
        let expired = state.duration.is_some_and(|d| elapsed >= d);

        if !state.disruption.is_convergence_bound() {
            // Held disruptions complete when their duration runs out;
            // one-shot ones as soon as they have been applied
            if expired || state.duration.is_none() {
                self.finish(handle, state, Finish::Completed).await;
            }
            return;
        }

        if expired {
            // Only a status check fails on its deadline. A restart that was
            // issued succeeded; waiting for it is best effort.
            if matches!(state.disruption, Disruption::RolloutStatus { .. }) {
                let waited = state.duration.unwrap_or_default();
                state.error = Some(ActionError::ConvergenceTimeout(format!(
                    "rollout did not converge within {}s",
                    waited.as_secs()
                )));
                self.finish(handle, state, Finish::Failed).await;
            } else {
                state
                    .messages
                    .push("stopped waiting for rollout".to_string());
                self.finish(handle, state, Finish::Completed).await;
            }
            return;
        }

        let ctx = self.context();
        match state.disruption.poll(&ctx).await {
            Ok(Progress::Running) => {}
            Ok(Progress::Converged) => {
                state.messages.push("rollout converged".to_string());
                self.finish(handle, state, Finish::Completed).await;
            }
            Ok(Progress::Failed(reason)) => {
                state.error = Some(ActionError::ConvergenceTimeout(reason));
                self.finish(handle, state, Finish::Failed).await;
            }
            Err(e) => {
                warn!(action_id = %handle.id, error = %e, "Status poll failed");
                state.error = Some(e);
                self.finish(handle, state, Finish::Failed).await;
            }
        }
    }

    /// Revert once and settle the terminal phase. A failed revert always
    /// ends in `Failed` with the revert error reported.
    async fn finish(&self, handle: &ActionHandle, state: &mut ActionState, how: Finish) {
        if !state.reverted {
            let ctx = self.context();
            match state.disruption.revert(&ctx).await {
                Ok(()) => {
                    state.reverted = true;
                    self.mark_reverted(handle).await;
                    state.messages.push("reverted".to_string());
                    info!(action_id = %handle.id, kind = %handle.kind, "Action reverted");
                }
                Err(e) => {
                    error!(action_id = %handle.id, kind = %handle.kind, error = %e, "Revert failed");
                    state.error = Some(ActionError::RevertFailed(e.to_string()));
                    state.phase = ActionPhase::Failed;
                    state.finished = Some(Instant::now());
                    return;
                }
            }
        }

        state.phase = match how {
            Finish::Completed if state.error.is_none() => ActionPhase::Completed,
            Finish::Completed | Finish::Failed => ActionPhase::Failed,
            Finish::Stopped => ActionPhase::Stopped,
        };
        state.finished = Some(Instant::now());
        info!(action_id = %handle.id, phase = %state.phase, "Action finished");
    }

    /// Save the revert record. A failure leaves the action running but is
    /// reported in its messages, since a restart could not undo it.
    async fn persist(
        &self,
        handle: &ActionHandle,
        disruption: &Disruption,
        messages: &mut Vec<String>,
    ) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_action(handle.id, handle.kind, disruption).await {
                error!(action_id = %handle.id, error = %e, "Failed to persist action");
                messages.push(format!("not persisted, a restart will not revert it: {e}"));
            }
        }
    }

    async fn mark_reverted(&self, handle: &ActionHandle) {
        if let Some(store) = &self.store {
            if let Err(e) = store.mark_reverted(handle.id).await {
                error!(action_id = %handle.id, error = %e, "Failed to mark action reverted");
            }
        }
    }
}
