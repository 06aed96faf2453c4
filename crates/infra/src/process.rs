//! `ListenerProcess`: the claim protocol, batch engine, retry scheduler and
//! driver wired over one store, dispatcher and scheduling collaborator.

use std::sync::Arc;

use tracing::info;

use changewatch_core::{DbName, DomainResult, ListenerConfig, ListenerRecord};
use changewatch_events::ChangeDispatcher;

use crate::batch::{BatchEngine, BatchError};
use crate::claim::{ClaimError, ClaimProtocol, ClaimReport};
use crate::driver::{DrainSummary, ListenerDriver};
use crate::retry::RetryDecision;
use crate::scheduling::{Scheduling, SchedulingError, StoreScheduling};
use crate::store::ListenerStore;

#[derive(Debug)]
pub struct ListenerProcess<S, D, H> {
    config: ListenerConfig,
    claim: ClaimProtocol<S, H>,
    engine: BatchEngine<S, D, H>,
}

impl<S, D> ListenerProcess<S, D, Arc<StoreScheduling<S>>>
where
    S: ListenerStore + Clone,
    D: ChangeDispatcher,
{
    /// Build a process whose scheduling collaborator is backed by `store`.
    pub fn new(store: S, dispatcher: D, config: ListenerConfig) -> DomainResult<Self> {
        let scheduling = StoreScheduling::arc(store.clone());
        Self::with_scheduling(store, dispatcher, scheduling, config)
    }
}

impl<S, D, H> ListenerProcess<S, D, H>
where
    S: ListenerStore + Clone,
    D: ChangeDispatcher,
    H: Scheduling + Clone,
{
    pub fn with_scheduling(
        store: S,
        dispatcher: D,
        scheduling: H,
        config: ListenerConfig,
    ) -> DomainResult<Self> {
        config.validate()?;
        let claim = ClaimProtocol::new(store.clone(), scheduling.clone(), &config);
        let engine = BatchEngine::new(store, dispatcher, scheduling, &config);
        Ok(Self {
            config,
            claim,
            engine,
        })
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        self.engine.store()
    }

    pub fn scheduling(&self) -> &H {
        self.engine.scheduling()
    }

    pub fn engine(&self) -> &BatchEngine<S, D, H> {
        &self.engine
    }

    /// Install the listener index.
    pub async fn install(&self) -> Result<(), SchedulingError> {
        self.scheduling().install_views().await?;
        info!(batch_size = self.config.batch_size, "listener process installed");
        Ok(())
    }

    pub async fn uninstall(&self) -> Result<(), SchedulingError> {
        self.scheduling().uninstall_views().await
    }

    /// Claim the given (raw, unescaped) database names.
    pub async fn dirty_if_clean_or_locked<I, N>(
        &self,
        db_names: I,
    ) -> Result<ClaimReport, ClaimError>
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        let names = db_names.into_iter().map(|n| DbName::escape(n.as_ref()));
        self.claim.dirty_if_clean_or_locked(names).await
    }

    pub async fn process_one_batch(&self, listener: &ListenerRecord) -> Result<bool, BatchError> {
        self.engine.process_one_batch(listener).await
    }

    pub async fn schedule_retry(
        &self,
        listener: &ListenerRecord,
    ) -> Result<RetryDecision, SchedulingError> {
        self.engine.retry_scheduler().schedule_retry(listener).await
    }

    pub async fn drain(&self, listener: &ListenerRecord) -> Result<DrainSummary, BatchError> {
        ListenerDriver::new(&self.engine, self.config.max_batches_per_drain)
            .drain(listener)
            .await
    }
}
