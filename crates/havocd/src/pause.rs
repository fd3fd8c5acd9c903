//! Keeps the pause annotation of every active job equal to its schedule's.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info};

use havoc_core::events::EventReason;
use havoc_core::experiment::{Experiment, CONTROLLED_BY_LABEL};
use havoc_core::schedule::Schedule;
use havoc_core::types::{ObjectKey, ObjectKind};

use crate::client::{Client, ClientExt, ObjectChange, StoreError};
use crate::error::ReconcileError;
use crate::manager::{labeled_owner, Action, Reconciler};
use crate::recorder::EventRecorder;
use crate::retry::{retry_on_conflict, Backoff};

/// Lists the jobs a schedule spawned that have not finished yet.
#[derive(Clone)]
pub struct ActiveLister {
    client: Arc<dyn Client>,
}

impl ActiveLister {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self { client }
    }

    pub fn list_active_jobs(&self, schedule: &Schedule) -> Result<Vec<Experiment>, StoreError> {
        Ok(self
            .client
            .list_labeled::<Experiment>(
                &schedule.metadata.namespace,
                CONTROLLED_BY_LABEL,
                &schedule.metadata.name,
            )?
            .into_iter()
            .filter(|job| !job.is_finished())
            .collect())
    }
}

pub struct PauseReconciler {
    client: Arc<dyn Client>,
    lister: ActiveLister,
    recorder: EventRecorder,
    backoff: Backoff,
}

impl PauseReconciler {
    pub fn new(client: Arc<dyn Client>, recorder: EventRecorder) -> Self {
        Self {
            lister: ActiveLister::new(client.clone()),
            client,
            recorder,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    async fn set_pause(&self, key: &ObjectKey, paused: bool) -> Result<(), StoreError> {
        retry_on_conflict(self.backoff, || {
            let mut job = self
                .client
                .get::<Experiment>(key)?
                .ok_or_else(|| StoreError::NotFound {
                    kind: ObjectKind::Experiment,
                    key: key.clone(),
                })?;
            job.set_paused(paused);
            self.client.update(&mut job)
        })
        .await
    }
}

#[async_trait]
impl Reconciler for PauseReconciler {
    fn name(&self) -> &'static str {
        "schedule-pause"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Schedule
    }

    fn map_change(&self, change: &ObjectChange) -> Vec<ObjectKey> {
        match change.kind {
            ObjectKind::Schedule => vec![change.key.clone()],
            ObjectKind::Experiment => labeled_owner(change, CONTROLLED_BY_LABEL)
                .into_iter()
                .collect(),
            _ => Vec::new(),
        }
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let schedule = match self.client.get::<Schedule>(key) {
            Ok(Some(schedule)) => schedule,
            Ok(None) => return Ok(Action::done()),
            Err(err) => {
                error!(schedule = %key, error = %err, "unable to get schedule");
                return Ok(Action::done());
            }
        };

        let jobs = match self.lister.list_active_jobs(&schedule) {
            Ok(jobs) => jobs,
            Err(err) => {
                self.recorder.warning(
                    &schedule,
                    EventReason::PauseUpdateFailed,
                    format!("Failed to list active jobs: {err}"),
                );
                return Ok(Action::done());
            }
        };

        let paused = schedule.is_paused();
        let mut updated = 0;
        for job in jobs.iter().filter(|job| job.is_paused() != paused) {
            let job_key = job.metadata.key();
            debug!(schedule = %key, job = %job_key, paused, "updating job pause");
            if let Err(err) = self.set_pause(&job_key, paused).await {
                error!(schedule = %key, job = %job_key, error = %err, "failed to update job pause");
                self.recorder.warning(
                    &schedule,
                    EventReason::PauseUpdateFailed,
                    format!("Failed to set pause to {paused} for {job_key}"),
                );
                return Ok(Action::done());
            }
            updated += 1;
        }

        if updated > 0 {
            info!(schedule = %key, updated, paused, "job pause synced");
            self.recorder.normal(
                &schedule,
                EventReason::PauseUpdated,
                format!("set pause to {paused} on {updated} jobs"),
            );
            let synced = retry_on_conflict(self.backoff, || {
                let Some(mut latest) = self.client.get::<Schedule>(key)? else {
                    return Ok(());
                };
                latest.status.last_pause_sync = Some(Utc::now());
                self.client.update(&mut latest)
            })
            .await;
            if let Err(err) = synced {
                error!(schedule = %key, error = %err, "failed to record pause sync time");
            }
        }
        Ok(Action::done())
    }
}
