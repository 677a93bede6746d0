//! Owner of every subscription instance; routes external commands.

use super::outcome::{
    AckOutcome, CreateOutcome, DeleteOutcome, ReadNextOutcome, ReplayOutcome, StatsOutcome,
    UpdateOutcome,
};
use super::MAX_READ_NEXT_COUNT;
use crate::auth::{Access, Authorizer, Operation, Principal};
use crate::checkpoint::CheckpointStore;
use crate::config::EngineConfig;
use crate::error::{Result, SubscriptionError};
use crate::log::{EventLog, LogReader};
use crate::stats::{StatsCollector, StatsScope};
use crate::subscriptions::{
    ConnectionRequest, ConsumerHandle, InstanceContext, InstanceState, InstanceWorker, NackAction,
    SubscriptionConfig, SubscriptionInstance,
};
use crate::types::{ConnectionId, EventData, Position, ResolvedEvent, SubscriptionKey};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A registered instance and the thread ticking it, if any.
struct InstanceEntry {
    instance: Arc<Mutex<SubscriptionInstance>>,
    worker: Mutex<Option<InstanceWorker>>,
}

impl InstanceEntry {
    fn stop_worker(&self) {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop();
        }
    }

    fn is_stopped(&self) -> bool {
        self.instance.lock().is_stopped()
    }
}

/// Registry of persistent subscriptions.
///
/// Keys are unique. A deleted subscription leaves the map immediately and
/// drains in the background; acks for it are still accepted until it stops.
pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<SubscriptionKey, Arc<InstanceEntry>>>,
    draining: Mutex<Vec<(SubscriptionKey, Arc<InstanceEntry>)>>,
    reader: LogReader,
    checkpoints: Arc<dyn CheckpointStore>,
    authorizer: Arc<dyn Authorizer>,
    config: EngineConfig,
}

impl SubscriptionRegistry {
    pub fn new(
        log: Arc<dyn EventLog>,
        checkpoints: Arc<dyn CheckpointStore>,
        authorizer: Arc<dyn Authorizer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            draining: Mutex::new(Vec::new()),
            reader: LogReader::new(log, config.read_retry.clone()),
            checkpoints,
            authorizer,
            config,
        }
    }

    fn allowed(&self, principal: &Principal, operation: Operation, target: Option<&str>) -> bool {
        match self.authorizer.check(principal, operation, target) {
            Access::Allowed => true,
            Access::Denied => {
                debug!(principal = %principal.name, ?operation, stream = ?target, "access denied");
                false
            }
        }
    }

    fn get(&self, key: &SubscriptionKey) -> Option<Arc<InstanceEntry>> {
        self.subscriptions.read().get(key).cloned()
    }

    /// Live instance, or one still draining after delete.
    fn get_or_draining(&self, key: &SubscriptionKey) -> Option<Arc<InstanceEntry>> {
        self.get(key).or_else(|| {
            self.draining
                .lock()
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, entry)| entry.clone())
        })
    }

    fn context(&self) -> InstanceContext {
        InstanceContext {
            reader: self.reader.clone(),
            checkpoints: self.checkpoints.clone(),
            engine: self.config.clone(),
        }
    }

    // --- Management ---

    pub fn create(
        &self,
        key: SubscriptionKey,
        config: SubscriptionConfig,
        principal: &Principal,
    ) -> CreateOutcome {
        if !self.allowed(principal, Operation::Create, Some(key.stream_id.as_str())) {
            return CreateOutcome::AccessDenied;
        }
        if let Err(e) = config.validate() {
            return CreateOutcome::InvalidArgument(e.to_string());
        }
        if self.subscriptions.read().contains_key(&key) {
            return CreateOutcome::AlreadyExists;
        }

        let instance = SubscriptionInstance::new(key.clone(), config, self.context(), Instant::now());
        let instance = Arc::new(Mutex::new(instance));

        let entry = {
            let mut subscriptions = self.subscriptions.write();
            if subscriptions.contains_key(&key) {
                return CreateOutcome::AlreadyExists;
            }
            let entry = Arc::new(InstanceEntry {
                instance: instance.clone(),
                worker: Mutex::new(None),
            });
            subscriptions.insert(key.clone(), entry.clone());
            entry
        };

        if let Some(interval) = self.config.tick_interval {
            match InstanceWorker::spawn(instance, interval) {
                Ok(worker) => *entry.worker.lock() = Some(worker),
                Err(e) => error!(subscription = %key, error = %e, "failed to start worker"),
            }
        }

        info!(subscription = %key, principal = %principal.name, "subscription created");
        CreateOutcome::Success {
            location: key.location(),
        }
    }

    pub fn update(
        &self,
        key: &SubscriptionKey,
        config: SubscriptionConfig,
        principal: &Principal,
    ) -> UpdateOutcome {
        if !self.allowed(principal, Operation::Update, Some(key.stream_id.as_str())) {
            return UpdateOutcome::AccessDenied;
        }
        if let Err(e) = config.validate() {
            return UpdateOutcome::InvalidArgument(e.to_string());
        }
        let Some(entry) = self.get(key) else {
            return UpdateOutcome::DoesNotExist;
        };

        entry.instance.lock().update_config(config, Instant::now());
        UpdateOutcome::Success {
            location: key.location(),
        }
    }

    /// Remove the subscription and drain it. Its checkpoint is discarded; the
    /// parked stream stays in the log.
    pub fn delete(&self, key: &SubscriptionKey, principal: &Principal) -> DeleteOutcome {
        if !self.allowed(principal, Operation::Delete, Some(key.stream_id.as_str())) {
            return DeleteOutcome::AccessDenied;
        }
        // The checkpoint goes before the key is free again, so a create racing
        // this delete cannot resume from it.
        let finished = {
            let mut subscriptions = self.subscriptions.write();
            let Some(entry) = subscriptions.remove(key) else {
                return DeleteOutcome::DoesNotExist;
            };
            let stopped = {
                let mut instance = entry.instance.lock();
                instance.begin_drain(Instant::now());
                instance.is_stopped()
            };
            if let Err(e) = self.checkpoints.remove(key) {
                warn!(subscription = %key, error = %e, "failed to remove checkpoint");
            }
            if stopped {
                Some(entry)
            } else {
                self.draining.lock().push((key.clone(), entry));
                None
            }
        };

        if let Some(entry) = finished {
            entry.stop_worker();
        }
        self.prune_draining();

        info!(subscription = %key, principal = %principal.name, "subscription deleted");
        DeleteOutcome::Success
    }

    pub fn replay_parked(&self, key: &SubscriptionKey, principal: &Principal) -> ReplayOutcome {
        if !self.allowed(principal, Operation::ReplayParked, Some(key.stream_id.as_str())) {
            return ReplayOutcome::AccessDenied;
        }
        let Some(entry) = self.get(key) else {
            return ReplayOutcome::DoesNotExist;
        };

        let result = entry.instance.lock().replay_parked(Instant::now());
        match result {
            Ok(replayed) => ReplayOutcome::Success { replayed },
            Err(e) => {
                warn!(subscription = %key, error = %e, "parked replay failed");
                ReplayOutcome::Unavailable(e.to_string())
            }
        }
    }

    pub fn stats(&self, scope: &StatsScope, principal: &Principal) -> StatsOutcome {
        if !self.allowed(principal, Operation::Stats, scope.target()) {
            return StatsOutcome::AccessDenied;
        }

        let mut entries: Vec<(SubscriptionKey, Arc<InstanceEntry>)> = self
            .subscriptions
            .read()
            .iter()
            .filter(|(key, _)| scope.matches(key))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        match scope {
            StatsScope::All => {}
            StatsScope::Stream(_) if entries.is_empty() => return StatsOutcome::NotFound,
            StatsScope::Stream(_) => {}
            StatsScope::Subscription(_) => {
                let Some((_, entry)) = entries.first() else {
                    return StatsOutcome::NotFound;
                };
                if entry.instance.lock().state() == InstanceState::Initializing {
                    return StatsOutcome::NotReady;
                }
            }
        }

        StatsOutcome::Success(
            entries
                .iter()
                .map(|(_, entry)| StatsCollector::collect(&entry.instance))
                .collect(),
        )
    }

    // --- Consumers ---

    /// Pull up to `count` events without an attached connection. Ack them by
    /// event id like any other delivery.
    pub fn read_next(
        &self,
        key: &SubscriptionKey,
        count: usize,
        principal: &Principal,
    ) -> ReadNextOutcome {
        if !(1..=MAX_READ_NEXT_COUNT).contains(&count) {
            return ReadNextOutcome::InvalidArgument(format!(
                "count must be between 1 and {}, got {}",
                MAX_READ_NEXT_COUNT, count
            ));
        }
        if !self.allowed(principal, Operation::ReadNext, Some(key.stream_id.as_str())) {
            return ReadNextOutcome::AccessDenied;
        }
        let Some(entry) = self.get(key) else {
            return ReadNextOutcome::DoesNotExist;
        };

        let events = entry.instance.lock().read_next(count, Instant::now());
        ReadNextOutcome::Success(events)
    }

    pub fn attach(
        &self,
        key: &SubscriptionKey,
        request: ConnectionRequest,
        principal: &Principal,
    ) -> Result<ConsumerHandle> {
        if !self.allowed(principal, Operation::Attach, Some(key.stream_id.as_str())) {
            return Err(SubscriptionError::AccessDenied {
                principal: principal.name.clone(),
                target: key.to_string(),
            });
        }
        let entry = self
            .get(key)
            .ok_or_else(|| SubscriptionError::NotFound(key.clone()))?;

        let handle = entry.instance.lock().attach(request, Instant::now());
        Ok(handle)
    }

    /// Detach a connection; its outstanding messages are redelivered elsewhere.
    pub fn detach(&self, key: &SubscriptionKey, connection: ConnectionId) -> bool {
        let Some(entry) = self.get(key) else {
            return false;
        };
        let mut instance = entry.instance.lock();
        let attached = instance.pool().contains(connection);
        instance.detach(connection, Instant::now());
        attached
    }

    pub fn ack(&self, key: &SubscriptionKey, ids: &[Uuid]) -> AckOutcome {
        let Some(entry) = self.get_or_draining(key) else {
            return AckOutcome::DoesNotExist;
        };
        let resolved = entry.instance.lock().ack(ids, Instant::now());
        AckOutcome::Success { resolved }
    }

    pub fn nack(&self, key: &SubscriptionKey, ids: &[Uuid], action: NackAction) -> AckOutcome {
        let Some(entry) = self.get_or_draining(key) else {
            return AckOutcome::DoesNotExist;
        };
        let resolved = entry.instance.lock().nack(ids, action, Instant::now());
        AckOutcome::Success { resolved }
    }

    // --- Log input ---

    /// Append to a stream and feed the new events to its live subscriptions.
    pub fn publish(&self, stream_id: &str, events: Vec<EventData>) -> Result<Position> {
        let count = events.len();
        let last = self.reader.append(stream_id, events)?;
        let first = Position(last.0 + 1 - count as u64);
        let appended = self.reader.read_batch(stream_id, first, count, false)?;
        for event in &appended {
            self.notify_appended(stream_id, event);
        }
        Ok(last)
    }

    /// Offer an event appended to `stream_id` to every subscription on it.
    pub fn notify_appended(&self, stream_id: &str, event: &ResolvedEvent) {
        let entries: Vec<Arc<InstanceEntry>> = self
            .subscriptions
            .read()
            .iter()
            .filter(|(key, _)| key.stream_id == stream_id)
            .map(|(_, entry)| entry.clone())
            .collect();

        let now = Instant::now();
        for entry in entries {
            entry.instance.lock().on_appended(event.clone(), now);
        }
    }

    // --- Timers ---

    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    /// Run one timer pass over every instance, draining ones included.
    pub fn tick_at(&self, now: Instant) {
        let entries: Vec<Arc<InstanceEntry>> =
            self.subscriptions.read().values().cloned().collect();
        let draining: Vec<Arc<InstanceEntry>> = self
            .draining
            .lock()
            .iter()
            .map(|(_, entry)| entry.clone())
            .collect();

        for entry in entries.iter().chain(draining.iter()) {
            entry.instance.lock().tick(now);
        }
        self.prune_draining();
    }

    fn prune_draining(&self) {
        let finished: Vec<(SubscriptionKey, Arc<InstanceEntry>)> = {
            let mut draining = self.draining.lock();
            let (finished, pending) = draining.drain(..).partition(|(_, e)| e.is_stopped());
            *draining = pending;
            finished
        };
        for (key, entry) in finished {
            entry.stop_worker();
            debug!(subscription = %key, "drained");
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn draining_count(&self) -> usize {
        self.draining.lock().len()
    }

    /// Stop every instance and worker without draining.
    pub fn shutdown(&self) {
        let entries: Vec<Arc<InstanceEntry>> = self
            .subscriptions
            .write()
            .drain()
            .map(|(_, entry)| entry)
            .chain(self.draining.lock().drain(..).map(|(_, entry)| entry))
            .collect();

        for entry in &entries {
            entry.stop_worker();
            entry.instance.lock().stop();
        }
        info!(stopped = entries.len(), "registry shut down");
    }
}
