//! Reconcile engine
//!
//! Triggers from the primary and secondary watches arrive on a bounded
//! channel. The dispatcher records them in the [`ReconcileQueue`] and
//! spawns one worker task per key that goes from idle to queued; that task
//! keeps reconciling the key until it settles. Distinct keys run in
//! parallel up to the worker limit, a single key never runs twice at once.

use crate::cluster::FinalizerChange;
use crate::desired;
use crate::error::ErrorClass;
use crate::queue::{KeyPhase, Next, ReconcileQueue};
use crate::trigger::stopped;
use crate::watch::run_primary_watch;
use crate::{
    ClusterClient, DesiredStateBuilder, ExponentialBackoff, ObjectKey, ResourceReconciler, Result,
    SecondaryWatchBridge, StatusSynchronizer, Trigger, TriggerClosed, TriggerSender,
};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use kube::ResourceExt;
use tomcat_api::{Tomcat, FINALIZER};
use tracing::{debug, error, info, instrument, warn};

/// Result of one reconciliation pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Managed resources and status match the Tomcat
    Converged,
    /// The attempt failed; try again after the delay
    Requeue(Duration),
    /// The Tomcat is gone and its resources are cleaned up
    Terminated,
}

/// Engine tuning
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Reconciliations allowed to run at the same time
    pub workers: usize,
    /// Capacity of the trigger channel
    pub queue_capacity: usize,
    pub backoff: ExponentialBackoff,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            backoff: ExponentialBackoff::default(),
        }
    }
}

struct Inner {
    cluster: Arc<dyn ClusterClient>,
    builder: DesiredStateBuilder,
    reconciler: ResourceReconciler,
    status: StatusSynchronizer,
    bridge: SecondaryWatchBridge,
    queue: ReconcileQueue,
    workers: Arc<Semaphore>,
    /// Keys left queued by a caller-driven pass, picked up by the dispatcher
    handoff: mpsc::UnboundedSender<(ObjectKey, Option<Duration>)>,
    shutdown: watch::Receiver<bool>,
}

pub struct ReconcileEngine {
    inner: Arc<Inner>,
    triggers: TriggerSender,
    in_flight: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ReconcileEngine {
    /// Start the dispatcher. Must be called from within a Tokio runtime.
    pub fn start(
        cluster: Arc<dyn ClusterClient>,
        builder: DesiredStateBuilder,
        config: EngineConfig,
    ) -> Self {
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (triggers, rx, in_flight) =
            TriggerSender::channel(config.queue_capacity, shutdown.clone());
        let (handoff, handoff_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            reconciler: ResourceReconciler::new(cluster.clone()),
            status: StatusSynchronizer::new(cluster.clone()),
            bridge: SecondaryWatchBridge::new(cluster.clone(), triggers.clone(), shutdown.clone()),
            queue: ReconcileQueue::new(config.backoff),
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            handoff,
            cluster,
            builder,
            shutdown,
        });
        info!(
            "Starting reconcile engine with {} workers",
            config.workers.max(1)
        );
        let dispatcher = tokio::spawn(dispatch(inner.clone(), rx, handoff_rx, in_flight.clone()));
        Self {
            inner,
            triggers,
            in_flight,
            shutdown_tx,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Sender for feeding triggers into the engine
    pub fn triggers(&self) -> TriggerSender {
        self.triggers.clone()
    }

    /// Queue a reconciliation of one Tomcat
    pub async fn trigger(&self, trigger: Trigger) -> std::result::Result<(), TriggerClosed> {
        self.triggers.send(trigger).await
    }

    /// Watch Tomcats and feed them to the engine until shutdown
    pub fn primary_watch(&self) -> impl Future<Output = ()> + Send + 'static {
        run_primary_watch(
            self.inner.cluster.clone(),
            self.triggers.clone(),
            self.inner.shutdown.clone(),
        )
    }

    /// Run one reconciliation pass for a Tomcat.
    ///
    /// Waits while a worker holds the key, so passes for one Tomcat never
    /// overlap. Errors never escape: they are logged and turned into a
    /// requeue with backoff. A retry, or a trigger that arrived during the
    /// pass, is handed to a worker.
    pub async fn reconcile(&self, key: &ObjectKey) -> ReconcileOutcome {
        while !self.inner.queue.try_claim(key).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let outcome = self.inner.reconcile(key).await;
        if let Next::Again(delay) = self.inner.queue.finish(key, &outcome).await {
            if self.inner.handoff.send((key.clone(), delay)).is_err() {
                self.inner.queue.forget(key).await;
            }
        }
        outcome
    }

    /// Phase of a key, `None` when idle
    pub async fn phase(&self, key: &ObjectKey) -> Option<KeyPhase> {
        self.inner.queue.phase(key).await
    }

    /// True when no trigger is pending and no key is queued or reconciling
    pub async fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0 && self.inner.queue.is_empty().await
    }

    /// Wait until the engine is idle
    pub async fn wait_idle(&self) {
        while !self.is_idle().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop accepting triggers and wait for running reconciliations
    pub async fn shutdown(&self) {
        info!("Shutting down reconcile engine");
        let _ = self.shutdown_tx.send(true);
        let dispatcher = self.dispatcher.lock().await.take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                error!("Reconcile dispatcher failed: {}", e);
            }
        }
        info!("Reconcile engine stopped");
    }
}

impl Inner {
    #[instrument(skip(self), fields(tomcat = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> ReconcileOutcome {
        match self.reconcile_once(key).await {
            Ok(outcome) => {
                debug!("Reconcile finished: {:?}", outcome);
                outcome
            }
            Err(e) => {
                let delay = self.queue.record_failure(key).await;
                match e.class() {
                    ErrorClass::Configuration => {
                        error!("Reconcile failed, retrying in {:?}: {}", delay, e)
                    }
                    ErrorClass::StaleWrite => {
                        info!("Stale write, retrying in {:?}: {}", delay, e)
                    }
                    ErrorClass::Transient => {
                        warn!("Reconcile failed, retrying in {:?}: {}", delay, e)
                    }
                }
                ReconcileOutcome::Requeue(delay)
            }
        }
    }

    async fn reconcile_once(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let Some(tomcat) = self.cluster.get_tomcat(key).await? else {
            debug!("Tomcat {} not found, removing leftovers", key);
            self.reconciler.delete_managed(key).await?;
            return Ok(ReconcileOutcome::Terminated);
        };

        if tomcat.metadata.deletion_timestamp.is_some() {
            info!("Tomcat {} is being deleted", key);
            self.reconciler.delete_managed(key).await?;
            self.remove_finalizer(key, &tomcat).await?;
            return Ok(ReconcileOutcome::Terminated);
        }

        self.add_finalizer(key, &tomcat).await?;
        self.bridge.ensure_subscribed().await;

        let mut desired = self.builder.build(&tomcat)?;
        let workload = self.reconciler.apply_workload(&desired.workload).await?;
        desired::select_pods(&mut desired.service, &workload);
        self.reconciler.apply_service(&desired.service).await?;
        self.status.sync(&tomcat, &workload).await?;
        Ok(ReconcileOutcome::Converged)
    }

    async fn add_finalizer(&self, key: &ObjectKey, tomcat: &Tomcat) -> Result<()> {
        let current = tomcat.finalizers();
        if current.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        debug!("Adding finalizer to Tomcat {}", key);
        self.cluster
            .patch_tomcat_finalizers(key, current, FinalizerChange::Add(FINALIZER.to_string()))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, key: &ObjectKey, tomcat: &Tomcat) -> Result<()> {
        let current = tomcat.finalizers();
        if !current.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        debug!("Removing finalizer from Tomcat {}", key);
        self.cluster
            .patch_tomcat_finalizers(key, current, FinalizerChange::Remove(FINALIZER.to_string()))
            .await?;
        Ok(())
    }
}

async fn dispatch(
    inner: Arc<Inner>,
    mut rx: mpsc::Receiver<Trigger>,
    mut handoff: mpsc::UnboundedReceiver<(ObjectKey, Option<Duration>)>,
    in_flight: Arc<AtomicUsize>,
) {
    let mut shutdown = inner.shutdown.clone();
    let mut workers = JoinSet::new();
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            trigger = rx.recv() => {
                let Some(trigger) = trigger else {
                    break;
                };
                debug!("{} trigger for {}", trigger.source, trigger.key);
                if inner.queue.enqueue(&trigger.key).await {
                    workers.spawn(drive(inner.clone(), trigger.key, None));
                }
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            Some((key, delay)) = handoff.recv() => {
                debug!("Picking up {} after a direct reconcile", key);
                workers.spawn(drive(inner.clone(), key, delay));
            }
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = joined {
                    error!("Reconcile worker failed: {}", e);
                }
            }
        }
    }

    rx.close();
    let mut dropped = 0;
    while rx.try_recv().is_ok() {
        in_flight.fetch_sub(1, Ordering::SeqCst);
        dropped += 1;
    }
    if dropped > 0 {
        debug!("Dropped {} triggers queued before shutdown", dropped);
    }
    handoff.close();
    while let Ok((key, _)) = handoff.try_recv() {
        inner.queue.forget(&key).await;
    }
    info!("Waiting for {} reconcile workers", workers.len());
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!("Reconcile worker failed: {}", e);
        }
    }
    inner.bridge.join().await;
}

/// Reconcile one key until it goes idle or the engine shuts down
async fn drive(inner: Arc<Inner>, key: ObjectKey, mut delay: Option<Duration>) {
    let mut shutdown = inner.shutdown.clone();
    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Some(delay) = delay.take() {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        let permit = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            permit = inner.workers.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        inner.queue.begin(&key).await;
        let outcome = inner.reconcile(&key).await;
        drop(permit);

        match inner.queue.finish(&key, &outcome).await {
            Next::Idle => return,
            Next::Again(next) => delay = next,
        }
    }
    inner.queue.forget(&key).await;
}
