//! Background thread driving one subscription's timers.

use super::instance::SubscriptionInstance;
use crate::error::Result;
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// Ticks a subscription instance at a fixed interval until it stops.
pub struct InstanceWorker {
    stop: Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl InstanceWorker {
    pub fn spawn(instance: Arc<Mutex<SubscriptionInstance>>, interval: Duration) -> Result<Self> {
        let (stop, stopped) = bounded::<()>(1);
        let name = format!("persub-{}", instance.lock().key());
        let ticker = tick(interval);

        let join = thread::Builder::new().name(name).spawn(move || loop {
            select! {
                recv(ticker) -> _ => {
                    let mut guard = instance.lock();
                    guard.tick(Instant::now());
                    if guard.is_stopped() {
                        debug!(subscription = %guard.key(), "worker exiting");
                        break;
                    }
                }
                recv(stopped) -> _ => break,
            }
        })?;

        Ok(Self {
            stop,
            join: Some(join),
        })
    }

    /// Stop the thread and wait for it.
    pub fn stop(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for InstanceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
