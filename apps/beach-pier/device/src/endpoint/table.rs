use axum::extract::ws::Message;
use beach_pier_core::ClientId;
use tokio::sync::{mpsc, watch};

/// Media a client has asked to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    /// Every published camera frame.
    Camera,
    /// The next published camera frame only.
    CameraSnapshot,
}

impl Topic {
    fn bit(self) -> u8 {
        match self {
            Topic::Camera => 0b01,
            Topic::CameraSnapshot => 0b10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicSet(u8);

impl TopicSet {
    pub fn contains(self, topic: Topic) -> bool {
        self.0 & topic.bit() != 0
    }

    pub fn insert(&mut self, topic: Topic) {
        self.0 |= topic.bit();
    }

    pub fn remove(&mut self, topic: Topic) {
        self.0 &= !topic.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

pub(crate) struct ClientSlot {
    pub id: ClientId,
    pub seq: u64,
    pub sender: mpsc::Sender<Message>,
    pub topics: TopicSet,
    evicted: watch::Sender<bool>,
}

impl ClientSlot {
    /// Fires once the slot leaves the table through eviction or shutdown.
    pub fn subscribe_eviction(&self) -> watch::Receiver<bool> {
        self.evicted.subscribe()
    }

    /// Tells the connection task to stop, whether or not its queue has room
    /// for a close frame.
    pub fn shut_out(&self) {
        self.evicted.send_replace(true);
    }
}

/// Fixed-capacity client arena. Slots are scanned linearly; the capacity
/// never grows after construction.
pub(crate) struct ClientTable {
    slots: Box<[Option<ClientSlot>]>,
    next_seq: u64,
}

impl ClientTable {
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity.max(1)).map(|_| None).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            next_seq: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Tracks a new client. When every slot is taken the oldest entry is
    /// overwritten and handed back so the caller can close it.
    pub fn insert(&mut self, id: ClientId, sender: mpsc::Sender<Message>) -> Option<ClientSlot> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let slot = ClientSlot {
            id,
            seq,
            sender,
            topics: TopicSet::default(),
            evicted: watch::channel(false).0,
        };

        if let Some(free) = self.slots.iter_mut().find(|slot| slot.is_none()) {
            *free = Some(slot);
            return None;
        }

        let oldest = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|s| (index, s.seq)))
            .min_by_key(|(_, seq)| *seq)
            .map(|(index, _)| index)?;
        self.slots[oldest].replace(slot)
    }

    pub fn remove(&mut self, id: ClientId) -> Option<ClientSlot> {
        self.slots
            .iter_mut()
            .find(|slot| matches!(slot, Some(s) if s.id == id))
            .and_then(Option::take)
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientSlot> {
        self.slots.iter().flatten().find(|slot| slot.id == id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientSlot> {
        self.slots.iter_mut().flatten().find(|slot| slot.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientSlot> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientSlot> {
        self.slots.iter_mut().flatten()
    }

    pub fn drain(&mut self) -> Vec<ClientSlot> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> mpsc::Sender<Message> {
        mpsc::channel(1).0
    }

    #[test]
    fn fills_free_slots_before_evicting() {
        let mut table = ClientTable::with_capacity(3);
        for id in 1..=3 {
            assert!(table.insert(ClientId(id), sender()).is_none());
        }
        assert_eq!(table.len(), 3);

        let evicted = table.insert(ClientId(4), sender()).expect("eviction");
        assert_eq!(evicted.id, ClientId(1));
        assert_eq!(table.len(), 3);
        assert!(table.get(ClientId(1)).is_none());
    }

    #[test]
    fn evicts_by_age_not_position() {
        let mut table = ClientTable::with_capacity(2);
        table.insert(ClientId(1), sender());
        table.insert(ClientId(2), sender());
        table.remove(ClientId(1));
        table.insert(ClientId(3), sender());

        let evicted = table.insert(ClientId(4), sender()).expect("eviction");
        assert_eq!(evicted.id, ClientId(2));
        let ids: Vec<_> = table.iter().map(|slot| slot.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&ClientId(3)) && ids.contains(&ClientId(4)));
    }

    #[test]
    fn single_slot_table_replaces_its_sole_entry() {
        let mut table = ClientTable::with_capacity(1);
        table.insert(ClientId(1), sender());
        let replaced = table.insert(ClientId(2), sender()).expect("replaced");
        assert_eq!(replaced.id, ClientId(1));
        assert_eq!(table.len(), 1);
        assert!(table.get(ClientId(2)).is_some());
    }

    #[test]
    fn shut_out_reaches_existing_subscribers() {
        let mut table = ClientTable::with_capacity(1);
        table.insert(ClientId(1), sender());
        let signal = table.get(ClientId(1)).unwrap().subscribe_eviction();
        assert!(!*signal.borrow());

        let evicted = table.insert(ClientId(2), sender()).expect("replaced");
        evicted.shut_out();
        assert!(*signal.borrow());
        assert!(!*table.get(ClientId(2)).unwrap().subscribe_eviction().borrow());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut table = ClientTable::with_capacity(2);
        table.insert(ClientId(7), sender());
        assert!(table.remove(ClientId(7)).is_some());
        assert!(table.remove(ClientId(7)).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn topic_set_tracks_membership() {
        let mut topics = TopicSet::default();
        assert!(topics.is_empty());
        topics.insert(Topic::Camera);
        topics.insert(Topic::CameraSnapshot);
        topics.remove(Topic::CameraSnapshot);
        assert!(topics.contains(Topic::Camera));
        assert!(!topics.contains(Topic::CameraSnapshot));
    }
}
