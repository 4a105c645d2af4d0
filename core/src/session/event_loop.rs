use super::BleSession;
use crate::radio::{RadioEvent, RadioEventHub};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Running dispatch task; dropping it unsubscribes the session from the hub
#[derive(Debug)]
pub struct EventLoopHandle {
    task: Option<JoinHandle<()>>,
}

impl EventLoopHandle {
    /// Stop dispatching radio events
    pub fn detach(mut self) {
        self.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for EventLoopHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

impl BleSession {
    /// Subscribe to every stream of `hub` and feed events into
    /// [`BleSession::handle_event`] on a spawned task.
    ///
    /// Streams are polled in a fixed order, data before state changes: a
    /// value published just ahead of its link's disconnect or power-off is
    /// applied first. Order across categories is otherwise not preserved.
    ///
    /// Must be called inside a tokio runtime.
    pub fn attach(self: &Arc<Self>, hub: &RadioEventHub) -> EventLoopHandle {
        let mut subscription = hub.subscribe();
        let session = Arc::clone(self);

        let task = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    r = subscription.value.recv() => r.map(RadioEvent::Value),
                    r = subscription.discovered.recv() => r.map(RadioEvent::Discovered),
                    r = subscription.scan_stopped.recv() => r.map(RadioEvent::ScanStopped),
                    r = subscription.connection.recv() => r.map(RadioEvent::Connection),
                    r = subscription.power.recv() => r.map(RadioEvent::Power),
                };

                match received {
                    Ok(event) => session.handle_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Session lagged behind the radio; {} events dropped", skipped);
                    }
                    Err(RecvError::Closed) => {
                        debug!("Radio event hub closed");
                        break;
                    }
                }
            }
        });

        EventLoopHandle { task: Some(task) }
    }
}
