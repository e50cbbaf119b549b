//! Reconcile requests flowing from the watches into the engine

use crate::ObjectKey;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Where a reconcile request came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerSource {
    /// A change to the Tomcat itself
    Primary,
    /// A change to a Deployment owned by the Tomcat
    Secondary,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::Primary => write!(f, "primary"),
            TriggerSource::Secondary => write!(f, "secondary"),
        }
    }
}

/// Request to reconcile one Tomcat
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trigger {
    pub key: ObjectKey,
    pub source: TriggerSource,
}

impl Trigger {
    pub fn primary(key: ObjectKey) -> Self {
        Self {
            key,
            source: TriggerSource::Primary,
        }
    }

    pub fn secondary(key: ObjectKey) -> Self {
        Self {
            key,
            source: TriggerSource::Secondary,
        }
    }
}

/// The engine no longer accepts triggers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerClosed;

impl fmt::Display for TriggerClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reconcile engine is shut down")
    }
}

impl std::error::Error for TriggerClosed {}

/// Sending half of the engine's bounded trigger channel
#[derive(Clone, Debug)]
pub struct TriggerSender {
    tx: mpsc::Sender<Trigger>,
    /// Triggers sent but not yet taken off the channel
    in_flight: Arc<AtomicUsize>,
    /// Once true, sends fail even if the receiver is still draining
    shutdown: watch::Receiver<bool>,
}

impl TriggerSender {
    pub(crate) fn channel(
        capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, mpsc::Receiver<Trigger>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let in_flight = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                in_flight: in_flight.clone(),
                shutdown,
            },
            rx,
            in_flight,
        )
    }

    /// Queue a trigger, waiting for room when the channel is full
    pub async fn send(&self, trigger: Trigger) -> Result<(), TriggerClosed> {
        if self.is_closed() {
            return Err(TriggerClosed);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(trigger).await.is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(TriggerClosed);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow() || self.tx.is_closed()
    }
}

/// Resolves once shutdown was requested or the engine is gone
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
