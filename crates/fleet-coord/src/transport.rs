//! # Transport
//!
//! Delivery seam between the coordinator and the fleet. The pipeline
//! only needs two operations: push to one device, push to all. The
//! concrete wiring (in-process channels here, a network layer elsewhere)
//! stays behind the trait so dispatch logic and its failure handling can
//! be tested against controllable doubles.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{CoordError, CoordResult};
use crate::protocol::OutboundEvent;

/// Outbound delivery to fleet devices.
pub trait Transport: Send + Sync + 'static {
    /// Delivers an event to a single device.
    fn send_to(
        &self,
        device_id: &str,
        event: &OutboundEvent,
    ) -> impl Future<Output = CoordResult<()>> + Send;

    /// Delivers an event to every connected device.
    fn broadcast(&self, event: &OutboundEvent) -> impl Future<Output = CoordResult<()>> + Send;
}

// =============================================================================
// Local Transport
// =============================================================================

/// In-process transport backed by per-device channels.
///
/// Devices (or tests) subscribe and receive the events the coordinator
/// dispatches to them. Sending to a device with no subscription is a
/// transport failure, mirroring an unreachable peer.
#[derive(Clone, Default)]
pub struct LocalTransport {
    subscribers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<OutboundEvent>>>>,
}

impl LocalTransport {
    /// Creates an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a device, returning its event receiver. Replaces any
    /// previous subscription for the same device.
    pub async fn subscribe(&self, device_id: &str) -> mpsc::UnboundedReceiver<OutboundEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .await
            .insert(device_id.to_string(), tx);
        debug!(device_id = %device_id, "Device subscribed to local transport");
        rx
    }

    /// Removes a device's subscription.
    pub async fn unsubscribe(&self, device_id: &str) {
        self.subscribers.lock().await.remove(device_id);
    }
}

impl Transport for LocalTransport {
    async fn send_to(&self, device_id: &str, event: &OutboundEvent) -> CoordResult<()> {
        let subscribers = self.subscribers.lock().await;
        let tx = subscribers
            .get(device_id)
            .ok_or_else(|| CoordError::Transport {
                peer: device_id.to_string(),
                message: "not connected".into(),
            })?;

        tx.send(event.clone()).map_err(|_| CoordError::Transport {
            peer: device_id.to_string(),
            message: "receiver dropped".into(),
        })
    }

    async fn broadcast(&self, event: &OutboundEvent) -> CoordResult<()> {
        let mut subscribers = self.subscribers.lock().await;
        // Closed receivers are pruned as we go; a broadcast to an empty
        // fleet is not an error.
        subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
