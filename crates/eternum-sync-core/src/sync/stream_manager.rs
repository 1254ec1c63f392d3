//! Stream manager - owns the single live bounded subscription.
//!
//! Every [`StreamManager::switch_bounds`] call is checked against the current
//! signature first. Calls that get past the check receive a [`RequestTicket`]
//! and their subscribe attempt is chained behind the previous one, so the
//! remote never sees two subscribe calls from the same manager at once.
//!
//! Whether an attempt may install itself is decided when its subscribe call
//! resolves: only the holder of the latest ticket wins. Anything older cancels
//! the handle it just received and reports [`SwitchOutcome::StaleDropped`].

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{Result, SyncError};
use crate::observability::SyncMetrics;
use crate::torii::{Bounds, BoxedSubscription, Clause, IndexerClient, UpdateSink};

/// Position fields of one model compared against the bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelBounds {
    pub model: String,
    pub col_field: String,
    pub row_field: String,
}

impl ModelBounds {
    pub fn new(model: impl Into<String>, col_field: impl Into<String>, row_field: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            col_field: col_field.into(),
            row_field: row_field.into(),
        }
    }
}

/// Region and model set one live subscription covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundsDescriptor {
    pub bounds: Bounds,
    pub models: Vec<ModelBounds>,
    #[serde(default)]
    pub additional_clauses: Vec<Clause>,
}

impl BoundsDescriptor {
    pub fn new(bounds: Bounds, models: Vec<ModelBounds>) -> Self {
        Self {
            bounds,
            models,
            additional_clauses: Vec::new(),
        }
    }

    pub fn with_clause(mut self, clause: Clause) -> Self {
        self.additional_clauses.push(clause);
        self
    }

    /// Stable serialization used for change detection.
    pub fn signature(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

/// Turns a descriptor into the clause sent with the subscribe call.
pub trait ClauseBuilder: Send + Sync {
    fn build(&self, descriptor: &BoundsDescriptor) -> Clause;
}

impl<F> ClauseBuilder for F
where
    F: Fn(&BoundsDescriptor) -> Clause + Send + Sync,
{
    fn build(&self, descriptor: &BoundsDescriptor) -> Clause {
        self(descriptor)
    }
}

/// Per-model range clauses OR-ed together with the extra clauses.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundedClauseBuilder;

impl ClauseBuilder for BoundedClauseBuilder {
    fn build(&self, descriptor: &BoundsDescriptor) -> Clause {
        let clauses = descriptor
            .models
            .iter()
            .map(|m| Clause::within_bounds(&m.model, &m.col_field, &m.row_field, &descriptor.bounds))
            .chain(descriptor.additional_clauses.iter().cloned())
            .collect();
        Clause::or_flat(clauses)
    }
}

/// Identity of one switch request, strictly increasing per manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestTicket(u64);

impl RequestTicket {
    pub fn id(self) -> u64 {
        self.0
    }

    /// A ticket may install its subscription only if it is still the latest.
    pub fn is_current(self, latest: RequestTicket) -> bool {
        self == latest
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchOutcome {
    Applied,
    StaleDropped,
    SkippedSameSignature,
}

type SwitchTail = Shared<BoxFuture<'static, ()>>;

#[derive(Default)]
struct ManagerState {
    active: Option<BoxedSubscription>,
    current_signature: Option<String>,
    /// Signature of the latest allocated request while it is in flight.
    pending_signature: Option<String>,
    latest: u64,
    in_flight: usize,
    tail: Option<SwitchTail>,
}

struct Inner {
    client: Arc<dyn IndexerClient>,
    sink: UpdateSink,
    builder: Box<dyn ClauseBuilder>,
    metrics: Arc<SyncMetrics>,
    state: Mutex<ManagerState>,
}

/// Lifecycle owner of one live bounded subscription.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<Inner>,
}

impl StreamManager {
    pub fn new(client: Arc<dyn IndexerClient>, sink: UpdateSink, metrics: Arc<SyncMetrics>) -> Self {
        Self::with_builder(client, sink, metrics, BoundedClauseBuilder)
    }

    pub fn with_builder(
        client: Arc<dyn IndexerClient>,
        sink: UpdateSink,
        metrics: Arc<SyncMetrics>,
        builder: impl ClauseBuilder + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                sink,
                builder: Box::new(builder),
                metrics,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    /// Move the live subscription to `descriptor`.
    ///
    /// The signature check, ticket allocation and queueing happen before this
    /// returns; the future only waits for the outcome. Dropping it does not
    /// cancel the switch.
    ///
    /// A descriptor matching the current signature is skipped even while a
    /// switch to other bounds is in flight, so that switch still installs.
    /// Callers returning to the active bounds mid-switch must request them
    /// again once [`Self::wait_for_pending_switch`] resolves.
    pub fn switch_bounds(
        &self,
        descriptor: &BoundsDescriptor,
    ) -> impl Future<Output = Result<SwitchOutcome>> + Send + 'static {
        let signature = descriptor.signature();
        let mut state = self.inner.state.lock();

        let same_as_current = state.current_signature.as_deref() == Some(signature.as_str());
        let same_as_pending = state.pending_signature.as_deref() == Some(signature.as_str());
        let spawned = if same_as_current || same_as_pending {
            drop(state);
            self.inner.metrics.record_switch_skipped(1);
            tracing::debug!(pending = same_as_pending, "Switch skipped, same signature");
            None
        } else {
            let clause = self.inner.builder.build(descriptor);
            state.latest += 1;
            let ticket = RequestTicket(state.latest);
            state.pending_signature = Some(signature.clone());
            state.in_flight += 1;

            let previous = state.tail.take();
            let (done_tx, done_rx) = oneshot::channel::<()>();
            state.tail = Some(done_rx.map(|_| ()).boxed().shared());
            drop(state);

            tracing::debug!(ticket = ticket.id(), "Switch queued");
            let inner = self.inner.clone();
            Some(tokio::spawn(async move {
                if let Some(previous) = previous {
                    previous.await;
                }
                let outcome = inner.attempt(ticket, signature, clause).await;
                inner.state.lock().in_flight -= 1;
                let _ = done_tx.send(());
                outcome
            }))
        };

        async move {
            match spawned {
                None => Ok(SwitchOutcome::SkippedSameSignature),
                Some(task) => task.await.map_err(|_| SyncError::SwitchAborted)?,
            }
        }
    }

    /// Cancel and clear the active subscription. Idempotent.
    pub fn cancel_current_subscription(&self) {
        let active = {
            let mut state = self.inner.state.lock();
            state.current_signature = None;
            state.active.take()
        };
        if let Some(active) = active {
            active.cancel();
            tracing::debug!("Cancelled current subscription");
        }
    }

    /// Wait for the most recently queued switch to settle.
    pub async fn wait_for_pending_switch(&self) {
        let tail = self.inner.state.lock().tail.clone();
        if let Some(tail) = tail {
            tail.await;
        }
    }

    /// Cancel the active subscription.
    ///
    /// In-flight switches are left to settle; one that still holds the latest
    /// ticket will install itself afterwards.
    pub fn shutdown(&self) {
        self.cancel_current_subscription();
    }

    pub fn current_signature(&self) -> Option<String> {
        self.inner.state.lock().current_signature.clone()
    }

    pub fn has_active(&self) -> bool {
        self.inner.state.lock().active.is_some()
    }

    pub fn is_switching(&self) -> bool {
        self.inner.state.lock().in_flight > 0
    }

    pub fn latest_ticket(&self) -> RequestTicket {
        RequestTicket(self.inner.state.lock().latest)
    }
}

impl Inner {
    async fn attempt(&self, ticket: RequestTicket, signature: String, clause: Clause) -> Result<SwitchOutcome> {
        let handle = match self.client.subscribe_entities(Some(clause), self.sink.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                let mut state = self.state.lock();
                if ticket.is_current(RequestTicket(state.latest)) {
                    state.pending_signature = None;
                }
                drop(state);
                self.metrics.record_switch_failed(1);
                tracing::error!(ticket = ticket.id(), error = %e, "Switch subscribe failed");
                return Err(e.into());
            }
        };

        let mut state = self.state.lock();
        if !ticket.is_current(RequestTicket(state.latest)) {
            drop(state);
            handle.cancel();
            self.metrics.record_switch_stale(1);
            tracing::debug!(ticket = ticket.id(), "Switch superseded, dropping subscription");
            return Ok(SwitchOutcome::StaleDropped);
        }

        let previous = state.active.replace(handle);
        state.current_signature = Some(signature);
        state.pending_signature = None;
        drop(state);

        if let Some(previous) = previous {
            previous.cancel();
        }
        self.metrics.record_switch_applied(1);
        tracing::debug!(ticket = ticket.id(), "Switch applied");
        Ok(SwitchOutcome::Applied)
    }
}
