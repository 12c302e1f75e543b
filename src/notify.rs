use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// A change notice for one vehicle's calendar. The payload is the JSON
/// encoding of the event, ready to hand to a LISTEN subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub vehicle_id: Ulid,
    pub payload: String,
}

impl Notice {
    pub fn new(vehicle_id: Ulid, event: &Event) -> Self {
        let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".into());
        Self { vehicle_id, payload }
    }

    /// LISTEN channel name for this vehicle.
    pub fn channel(&self) -> String {
        format!("vehicle_{}", self.vehicle_id)
    }
}

/// Broadcast hub: one channel per vehicle.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to calendar changes for a vehicle. Creates the channel if needed.
    pub fn subscribe(&self, vehicle_id: Ulid) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(vehicle_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, vehicle_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&vehicle_id) {
            let _ = sender.send(Notice::new(vehicle_id, event));
        }
    }

    /// Remove a channel (e.g. when the vehicle is deleted).
    pub fn remove(&self, vehicle_id: &Ulid) {
        self.channels.remove(vehicle_id);
    }
}
