//! Shared stop/ack plumbing for the serve loops owned by
//! [`crate::endpoint::Endpoint`] and the control-plane subscriptions in
//! [`crate::service::Service`] (spec §4.D "stop() drains and
//! unsubscribes; idempotent", §4.F "stop()... drain every endpoint...").
//!
//! Both loops run on a spawned task that owns the subscription; the
//! owner-side handle only gets a one-shot "please drain" signal and a
//! one-shot "done" acknowledgement, so `stop()` can be `async` and block
//! until no more messages will be delivered, while still being callable
//! more than once.

use std::sync::Mutex;
use tokio::sync::oneshot;

/// The owner-side half: call [`StopHandle::stop`] to request a drain and
/// wait for the spawned loop to finish. Safe to call more than once.
pub(crate) struct StopHandle {
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

/// The loop-side half, handed to the spawned task.
pub(crate) struct StopSignal {
    pub(crate) stop_rx: oneshot::Receiver<()>,
    pub(crate) done_tx: oneshot::Sender<()>,
}

/// Build a fresh stop/ack pair.
pub(crate) fn pair() -> (StopHandle, StopSignal) {
    let (stop_tx, stop_rx) = oneshot::channel();
    let (done_tx, done_rx) = oneshot::channel();
    (
        StopHandle {
            stop_tx: Mutex::new(Some(stop_tx)),
            done_rx: Mutex::new(Some(done_rx)),
        },
        StopSignal { stop_rx, done_tx },
    )
}

impl StopHandle {
    /// Idempotent: the first call signals the loop and waits for it to
    /// finish; later calls are no-ops.
    pub(crate) async fn stop(&self) {
        let stop_tx = self.stop_tx.lock().unwrap().take();
        let Some(stop_tx) = stop_tx else {
            return;
        };
        let _ = stop_tx.send(());
        let done_rx = self.done_rx.lock().unwrap().take();
        if let Some(done_rx) = done_rx {
            let _ = done_rx.await;
        }
    }
}
