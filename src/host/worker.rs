//! Worker thread hosting the simulation
//!
//! The isolation boundary is a pair of mpsc channels: operations go in,
//! envelopes come out, and the [`SimulationHost`] lives entirely on the
//! other side. Transform buffers move through the channels by value, so
//! at any instant exactly one side owns them.

use crate::error::BridgeError;
use crate::host::SimulationHost;
use crate::protocol::{Reply, Request};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// Handle to the simulation thread.
///
/// Dropping the handle asks the thread to shut down without blocking;
/// [`PhysicsWorker::terminate`] additionally joins it.
pub struct PhysicsWorker {
    requests: Sender<Request>,
    replies: Receiver<Reply>,
    handle: Option<JoinHandle<()>>,
}

impl PhysicsWorker {
    /// Spawn the simulation thread with an empty world
    pub fn spawn() -> Result<Self, BridgeError> {
        let (request_tx, request_rx) = mpsc::channel::<Request>();
        let (reply_tx, reply_rx) = mpsc::channel::<Reply>();

        let handle = std::thread::Builder::new()
            .name("physics-worker".into())
            .spawn(move || worker_loop(request_rx, reply_tx))
            .map_err(|error| {
                error!(?error, "failed to spawn physics worker");
                BridgeError::WorkerStopped
            })?;

        info!("physics worker spawned");
        Ok(Self {
            requests: request_tx,
            replies: reply_rx,
            handle: Some(handle),
        })
    }

    /// Post one operation to the worker
    pub fn send(&self, request: Request) -> Result<(), BridgeError> {
        self.requests
            .send(request)
            .map_err(|_| BridgeError::WorkerStopped)
    }

    /// Drain every envelope the worker has produced so far, without
    /// blocking
    pub fn drain(&self) -> Vec<Reply> {
        self.replies.try_iter().collect()
    }

    /// Block until the next envelope arrives, or the worker stops
    pub fn recv(&self) -> Result<Reply, BridgeError> {
        self.replies.recv().map_err(|_| BridgeError::WorkerStopped)
    }

    /// Whether the worker thread is still reachable
    pub fn is_alive(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Shut the worker down and wait for the thread to exit
    pub fn terminate(mut self) {
        let _ = self.requests.send(Request::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("physics worker panicked during shutdown");
            }
        }
        debug!("physics worker terminated");
    }
}

impl Drop for PhysicsWorker {
    fn drop(&mut self) {
        // Best-effort: the loop also exits when the sender disconnects
        let _ = self.requests.send(Request::Shutdown);
    }
}

fn worker_loop(requests: Receiver<Request>, replies: Sender<Reply>) {
    let mut host = SimulationHost::new();
    debug!("physics worker loop started");

    // Channel disconnection on either side ends the loop; the facade
    // surfaces that as WorkerStopped on its next send.
    for request in requests.iter() {
        if matches!(request, Request::Shutdown) {
            break;
        }
        for reply in host.execute(request) {
            if replies.send(reply).is_err() {
                debug!("reply channel closed, stopping worker");
                return;
            }
        }
    }
    debug!(bodies = host.body_count(), "physics worker loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BodyDesc, ShapeDesc, ShapeEntry};
    use std::time::Duration;

    fn sphere_desc() -> BodyDesc {
        BodyDesc {
            shapes: vec![ShapeEntry::new(ShapeDesc::Sphere { radius: 0.5 })],
            ..Default::default()
        }
    }

    #[test]
    fn test_round_trip_produces_sync_then_frame() {
        let worker = PhysicsWorker::spawn().unwrap();
        worker
            .send(Request::AddBody {
                identity: "ball".into(),
                desc: sphere_desc(),
            })
            .unwrap();
        worker
            .send(Request::Step {
                time_since_last_called: 1.0 / 60.0,
                step_size: 1.0 / 60.0,
                max_sub_steps: 10,
                positions: Vec::new(),
                quaternions: Vec::new(),
            })
            .unwrap();

        let first = worker.recv().unwrap();
        assert!(matches!(first, Reply::Sync { .. }), "got {first:?}");

        let second = worker.recv().unwrap();
        match second {
            Reply::Frame { positions, .. } => assert_eq!(positions.len(), 3),
            other => panic!("expected frame, got {other:?}"),
        }

        worker.terminate();
    }

    #[test]
    fn test_terminate_joins_cleanly() {
        let worker = PhysicsWorker::spawn().unwrap();
        worker.terminate();
    }

    #[test]
    fn test_send_after_shutdown_reports_worker_stopped() {
        let worker = PhysicsWorker::spawn().unwrap();
        worker.send(Request::Shutdown).unwrap();

        // Give the loop a moment to exit, then the channel is closed.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while worker.is_alive() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!worker.is_alive());
        assert!(matches!(
            worker.send(Request::Step {
                time_since_last_called: 0.0,
                step_size: 1.0 / 60.0,
                max_sub_steps: 10,
                positions: Vec::new(),
                quaternions: Vec::new(),
            }),
            Err(BridgeError::WorkerStopped)
        ));
    }
}
