use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;
const FIREHOSE_CAPACITY: usize = 4096;

/// Fan-out of persisted events to notification dispatchers.
///
/// Every event goes to the firehose; room-scoped events also go to that
/// room's channel. Sends never block and are dropped when nobody listens, so
/// delivery stays outside the transactional path. Lagging receivers lose the
/// oldest events (`RecvError::Lagged`).
pub struct NotifyHub {
    rooms: DashMap<Ulid, broadcast::Sender<Event>>,
    firehose: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            firehose: broadcast::channel(FIREHOSE_CAPACITY).0,
        }
    }

    /// Events touching one room. Creates the channel on first use.
    pub fn subscribe(&self, room_id: Ulid) -> broadcast::Receiver<Event> {
        self.rooms
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Every persisted event.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.firehose.subscribe()
    }

    pub fn publish(&self, event: &Event) {
        if let Some(room_id) = event.room_id()
            && let Some(sender) = self.rooms.get(&room_id)
        {
            let _ = sender.send(event.clone());
        }
        let _ = self.firehose.send(event.clone());
    }

    /// Drop a room channel once its last receiver is gone.
    pub fn prune(&self) {
        self.rooms.retain(|_, sender| sender.receiver_count() > 0);
    }
}
