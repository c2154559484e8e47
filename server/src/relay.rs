//! Data plane of the alternate transport.
//!
//! Each reachability token names a track with one publisher and any number
//! of subscribers. Frames fan out through a bounded broadcast channel, so a
//! lagging subscriber loses its oldest frames instead of slowing the others.

use crate::outbound::Frame;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug)]
struct Track {
    sender: broadcast::Sender<Frame>,
    generation: u64,
}

#[derive(Debug, Default)]
struct Tracks {
    by_path: HashMap<String, Track>,
    next_generation: u64,
}

#[derive(Debug, Clone)]
pub struct RelayHub {
    tracks: Arc<Mutex<Tracks>>,
    capacity: usize,
}

impl RelayHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            tracks: Arc::new(Mutex::new(Tracks::default())),
            capacity: capacity.max(1),
        }
    }

    /// Opens the track at `path`, replacing any previous publisher.
    pub fn publish(&self, path: &str) -> Publisher {
        let mut tracks = self.tracks.lock();
        tracks.next_generation += 1;
        let generation = tracks.next_generation;
        let (sender, _) = broadcast::channel(self.capacity);

        if let Some(previous) = tracks.by_path.insert(
            path.to_string(),
            Track {
                sender: sender.clone(),
                generation,
            },
        ) {
            debug!("Relay track {} replaced", path);
            let _ = previous.sender.send(Arc::new(Vec::new()));
        }

        Publisher {
            path: path.to_string(),
            sender,
            generation,
            hub: self.clone(),
            closed: false,
        }
    }

    /// Receiver for the live track at `path`, if one is published.
    pub fn subscribe(&self, path: &str) -> Option<broadcast::Receiver<Frame>> {
        self.tracks
            .lock()
            .by_path
            .get(path)
            .map(|track| track.sender.subscribe())
    }

    pub fn has_track(&self, path: &str) -> bool {
        self.tracks.lock().by_path.contains_key(path)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().by_path.len()
    }

    fn remove(&self, path: &str, generation: u64) {
        let mut tracks = self.tracks.lock();
        if tracks
            .by_path
            .get(path)
            .is_some_and(|track| track.generation == generation)
        {
            tracks.by_path.remove(path);
            debug!("Relay track {} closed", path);
        }
    }
}

/// Write side of a track. Closing (or dropping) it sends an empty frame to
/// subscribers and discards the track.
#[derive(Debug)]
pub struct Publisher {
    path: String,
    sender: broadcast::Sender<Frame>,
    generation: u64,
    hub: RelayHub,
    closed: bool,
}

impl Publisher {
    /// Fans a frame out; returns how many subscribers will see it.
    pub fn send(&self, frame: Frame) -> usize {
        self.sender.send(frame).unwrap_or(0)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.sender.send(Arc::new(Vec::new()));
        self.hub.remove(&self.path, self.generation);
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_subscribe_without_publisher() {
        let hub = RelayHub::new(4);
        assert!(hub.subscribe("lobby/p1").is_none());
        assert!(!hub.has_track("lobby/p1"));
    }

    #[test]
    fn test_fan_out_to_subscribers() {
        let hub = RelayHub::new(4);
        let publisher = hub.publish("lobby/p1");
        let mut first = hub.subscribe("lobby/p1").unwrap();
        let mut second = hub.subscribe("lobby/p1").unwrap();

        assert_eq!(publisher.send(Arc::new(vec![1, 2])), 2);
        assert_eq!(*first.try_recv().unwrap(), vec![1, 2]);
        assert_eq!(*second.try_recv().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_close_sends_end_of_data() {
        let hub = RelayHub::new(4);
        let mut publisher = hub.publish("lobby/p1");
        let mut subscriber = hub.subscribe("lobby/p1").unwrap();

        publisher.close();
        publisher.close();
        assert!(subscriber.try_recv().unwrap().is_empty());
        assert!(!hub.has_track("lobby/p1"));

        drop(publisher);
        assert!(matches!(subscriber.try_recv(), Err(TryRecvError::Closed)));
    }

    #[test]
    fn test_stale_publisher_keeps_new_track() {
        let hub = RelayHub::new(4);
        let stale = hub.publish("lobby/p1");
        let fresh = hub.publish("lobby/p1");

        drop(stale);
        assert!(hub.has_track("lobby/p1"));
        assert_eq!(fresh.path(), "lobby/p1");
        assert_eq!(hub.track_count(), 1);
    }

    #[test]
    fn test_lagging_subscriber_loses_oldest() {
        let hub = RelayHub::new(2);
        let publisher = hub.publish("t");
        let mut subscriber = hub.subscribe("t").unwrap();

        for byte in 0..4u8 {
            publisher.send(Arc::new(vec![byte]));
        }
        assert!(matches!(subscriber.try_recv(), Err(TryRecvError::Lagged(2))));
        assert_eq!(*subscriber.try_recv().unwrap(), vec![2]);
    }
}
