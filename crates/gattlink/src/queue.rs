//! Notification queue
//!
//! One queue is shared by every session of a client or central. Transport
//! callbacks push tagged events from their own threads; consumers drain them
//! per device, blocking on a condition variable while the device's stream is
//! open and nothing is buffered.

use crate::error::{Error, Result};
use crate::gap::DeviceIdentity;
use crate::gatt::ServiceTag;
use crate::uuid::Uuid;
use log::{debug, info, trace};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// A notification received from a peer, tagged with its logical service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub device: DeviceIdentity,
    pub service: ServiceTag,
    pub characteristic: Uuid,
    pub payload: Vec<u8>,
    /// Global arrival order, assigned when the event is queued
    pub sequence: u64,
    pub received_at: Instant,
}

impl NotificationEvent {
    pub fn new(
        device: DeviceIdentity,
        service: ServiceTag,
        characteristic: Uuid,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            device,
            service,
            characteristic,
            payload,
            sequence: 0,
            received_at: Instant::now(),
        }
    }
}

/// Why a device's notification stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Closed locally; buffered events are discarded
    Closed,
    /// The link dropped; buffered events stay readable
    LinkLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Ended(EndReason),
}

#[derive(Default)]
struct QueueState {
    /// Buffered events per device, each in arrival order
    pending: HashMap<DeviceIdentity, VecDeque<NotificationEvent>>,
    streams: HashMap<DeviceIdentity, StreamState>,
    next_sequence: u64,
}

impl QueueState {
    fn is_open(&self, device: &DeviceIdentity) -> bool {
        self.streams.get(device) == Some(&StreamState::Open)
    }

    /// Remove up to `limit` of the oldest events of `device`
    fn take(&mut self, device: &DeviceIdentity, limit: usize) -> Vec<NotificationEvent> {
        match self.pending.get_mut(device) {
            Some(events) => {
                let count = limit.min(events.len());
                events.drain(..count).collect()
            }
            None => Vec::new(),
        }
    }

    /// Remove every buffered event, merged back into arrival order
    fn take_all(&mut self) -> Vec<NotificationEvent> {
        let mut taken = Vec::new();
        for events in self.pending.values_mut() {
            taken.extend(events.drain(..));
        }
        taken.sort_unstable_by_key(|event| event.sequence);
        taken
    }

    /// Drop everything buffered for `device`, returning how much that was
    fn discard(&mut self, device: &DeviceIdentity) -> usize {
        self.pending.remove(device).map_or(0, |events| events.len())
    }

    fn len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }
}

/// Unbounded FIFO of notification events keyed by device
#[derive(Default)]
pub struct NotificationQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

fn deadline_after(max_wait: Option<Duration>) -> Option<Instant> {
    // A wait too long to represent is the same as waiting forever
    max_wait.and_then(|wait| Instant::now().checked_add(wait))
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event. Returns `false` if the device's stream is not open.
    pub fn push(&self, mut event: NotificationEvent) -> bool {
        let mut state = self.state.lock();
        if !state.is_open(&event.device) {
            trace!(
                "Dropping notification from {} on {}: stream not open",
                event.device,
                event.characteristic
            );
            return false;
        }

        event.sequence = state.next_sequence;
        state.next_sequence += 1;
        state
            .pending
            .entry(event.device.clone())
            .or_default()
            .push_back(event);
        drop(state);

        self.available.notify_all();
        true
    }

    /// Start accepting events for `device`. Anything an earlier stream of
    /// the device left unread is dropped.
    pub fn open_stream(&self, device: &DeviceIdentity) {
        let mut state = self.state.lock();
        let stale = state.discard(device);
        if stale > 0 {
            debug!("Dropped {} unread notification(s) from an earlier link to {}", stale, device);
        }
        state.streams.insert(device.clone(), StreamState::Open);
    }

    /// Stop accepting events for `device` and wake every waiter
    pub fn end_stream(&self, device: &DeviceIdentity, reason: EndReason) {
        let mut state = self.state.lock();
        state
            .streams
            .insert(device.clone(), StreamState::Ended(reason));
        if reason == EndReason::Closed {
            state.discard(device);
        }
        drop(state);

        self.available.notify_all();
    }

    pub fn stream_state(&self, device: &DeviceIdentity) -> Option<StreamState> {
        self.state.lock().streams.get(device).copied()
    }

    /// Pop every buffered event of `device`, waiting up to `max_wait` for
    /// one if none is buffered (`None` waits indefinitely).
    ///
    /// Returns an empty vector when the wait times out, and
    /// [`Error::NotConnected`] once the stream has ended and nothing of the
    /// device is left.
    pub fn drain(
        &self,
        device: &DeviceIdentity,
        max_wait: Option<Duration>,
    ) -> Result<Vec<NotificationEvent>> {
        self.pop_n(device, usize::MAX, max_wait)
    }

    /// Like [`drain`](Self::drain) but pops at most `count` events.
    pub fn pop_n(
        &self,
        device: &DeviceIdentity,
        count: usize,
        max_wait: Option<Duration>,
    ) -> Result<Vec<NotificationEvent>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let deadline = deadline_after(max_wait);
        let mut state = self.state.lock();
        loop {
            let taken = state.take(device, count);
            if !taken.is_empty() {
                return Ok(taken);
            }
            if !state.is_open(device) {
                return Err(Error::NotConnected);
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(Vec::new());
                    }
                    self.available.wait_until(&mut state, deadline);
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    /// Pop every buffered event of every device in arrival order, waiting up
    /// to `max_wait` for one. Returns empty on timeout, or straight away when
    /// no device stream is open to produce anything.
    pub fn drain_all(&self, max_wait: Option<Duration>) -> Vec<NotificationEvent> {
        let deadline = deadline_after(max_wait);
        let mut state = self.state.lock();
        loop {
            let taken = state.take_all();
            if !taken.is_empty() {
                return taken;
            }
            if !state.streams.values().any(|s| *s == StreamState::Open) {
                return taken;
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return taken;
                    }
                    self.available.wait_until(&mut state, deadline);
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    pub fn has_pending(&self, device: &DeviceIdentity) -> bool {
        self.state
            .lock()
            .pending
            .get(device)
            .map_or(false, |events| !events.is_empty())
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Log every buffered event without consuming it. Returns the count.
    pub fn log_pending(&self) -> usize {
        let state = self.state.lock();
        let mut events: Vec<&NotificationEvent> = state.pending.values().flatten().collect();
        events.sort_unstable_by_key(|event| event.sequence);
        info!("{} notification(s) pending", events.len());
        for event in &events {
            info!(
                "  #{} {} {} {}: {}",
                event.sequence,
                event.device,
                event.service,
                event.characteristic,
                hex::encode(&event.payload)
            );
        }
        events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gap::BdAddr;
    use std::sync::Arc;
    use std::thread;

    fn device(last: u8) -> DeviceIdentity {
        DeviceIdentity::new(BdAddr::new([last, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]))
    }

    fn event(device: &DeviceIdentity, payload: &[u8]) -> NotificationEvent {
        NotificationEvent::new(
            device.clone(),
            ServiceTag::new("MMP"),
            Uuid::from_u16(0x2A37),
            payload.to_vec(),
        )
    }

    #[test]
    fn test_drain_returns_push_order() {
        let queue = NotificationQueue::new();
        let dev = device(0xFF);
        queue.open_stream(&dev);

        for i in 0..5u8 {
            assert!(queue.push(event(&dev, &[i])));
        }

        let events = queue.drain(&dev, Some(Duration::ZERO)).unwrap();
        let payloads: Vec<u8> = events.iter().map(|e| e.payload[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);

        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_producers_deliver_each_event_once() {
        let queue = Arc::new(NotificationQueue::new());
        let dev = device(0xFF);
        queue.open_stream(&dev);

        let producers: Vec<_> = (0..4u8)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                let dev = dev.clone();
                thread::spawn(move || {
                    for i in 0..50u8 {
                        assert!(queue.push(event(&dev, &[producer, i])));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let events = queue.drain(&dev, Some(Duration::ZERO)).unwrap();
        assert_eq!(events.len(), 200);

        // Sequence numbers are strictly increasing in drain order
        assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));

        // Each producer's own events keep their relative order
        for producer in 0..4u8 {
            let mine: Vec<u8> = events
                .iter()
                .filter(|e| e.payload[0] == producer)
                .map(|e| e.payload[1])
                .collect();
            assert_eq!(mine, (0..50u8).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_drain_times_out_empty() {
        let queue = NotificationQueue::new();
        let dev = device(0xFF);
        queue.open_stream(&dev);

        let start = Instant::now();
        let events = queue.drain(&dev, Some(Duration::from_millis(50))).unwrap();
        assert!(events.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_waiter_wakes_on_push() {
        let queue = Arc::new(NotificationQueue::new());
        let dev = device(0xFF);
        queue.open_stream(&dev);

        let producer = {
            let queue = Arc::clone(&queue);
            let dev = dev.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push(event(&dev, &[0x01, 0x02]));
            })
        };

        let events = queue.pop_n(&dev, 1, None).unwrap();
        assert_eq!(events[0].payload, vec![0x01, 0x02]);
        producer.join().unwrap();
    }

    #[test]
    fn test_end_stream_wakes_blocked_waiter() {
        let queue = Arc::new(NotificationQueue::new());
        let dev = device(0xFF);
        queue.open_stream(&dev);

        let closer = {
            let queue = Arc::clone(&queue);
            let dev = dev.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.end_stream(&dev, EndReason::Closed);
            })
        };

        let start = Instant::now();
        let result = queue.drain(&dev, None);
        assert!(matches!(result, Err(Error::NotConnected)));
        assert!(start.elapsed() < Duration::from_secs(2));
        closer.join().unwrap();
    }

    #[test]
    fn test_closed_discards_buffered_events() {
        let queue = NotificationQueue::new();
        let dev = device(0xFF);
        let other = device(0x01);
        queue.open_stream(&dev);
        queue.open_stream(&other);
        queue.push(event(&dev, &[1]));
        queue.push(event(&other, &[2]));

        queue.end_stream(&dev, EndReason::Closed);

        assert!(!queue.has_pending(&dev));
        assert!(queue.has_pending(&other));
        assert!(matches!(
            queue.drain(&dev, Some(Duration::ZERO)),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_link_lost_keeps_buffered_events() {
        let queue = NotificationQueue::new();
        let dev = device(0xFF);
        queue.open_stream(&dev);
        queue.push(event(&dev, &[1]));
        queue.push(event(&dev, &[2]));

        queue.end_stream(&dev, EndReason::LinkLost);
        assert_eq!(
            queue.stream_state(&dev),
            Some(StreamState::Ended(EndReason::LinkLost))
        );

        let first = queue.pop_n(&dev, 1, None).unwrap();
        assert_eq!(first[0].payload, vec![1]);
        let rest = queue.drain(&dev, None).unwrap();
        assert_eq!(rest[0].payload, vec![2]);
        assert!(matches!(queue.drain(&dev, None), Err(Error::NotConnected)));
    }

    #[test]
    fn test_reopened_stream_starts_empty() {
        let queue = NotificationQueue::new();
        let dev = device(0xFF);
        let other = device(0x01);
        queue.open_stream(&dev);
        queue.open_stream(&other);
        queue.push(event(&dev, &[1]));
        queue.push(event(&other, &[2]));
        queue.end_stream(&dev, EndReason::LinkLost);
        assert!(queue.has_pending(&dev));

        queue.open_stream(&dev);
        assert!(!queue.has_pending(&dev));
        assert!(queue.has_pending(&other));

        queue.push(event(&dev, &[3]));
        let events = queue.drain(&dev, Some(Duration::ZERO)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, vec![3]);
    }

    #[test]
    fn test_device_backlog_behind_other_devices() {
        let queue = NotificationQueue::new();
        let a = device(0x0A);
        let b = device(0x0B);
        queue.open_stream(&a);
        queue.open_stream(&b);
        for i in 0..1000u16 {
            queue.push(event(&b, &i.to_le_bytes()));
            queue.push(event(&a, &i.to_le_bytes()));
        }

        // One at a time, the way the byte stream pops
        let mut seen = Vec::new();
        while let Ok(events) = queue.pop_n(&a, 1, Some(Duration::ZERO)) {
            if events.is_empty() {
                break;
            }
            seen.push(u16::from_le_bytes([events[0].payload[0], events[0].payload[1]]));
        }
        assert_eq!(seen, (0..1000u16).collect::<Vec<_>>());
        assert_eq!(queue.len(), 1000);

        let rest = queue.drain_all(Some(Duration::ZERO));
        assert!(rest.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert!(rest.iter().all(|e| e.device == b));
    }

    #[test]
    fn test_push_rejected_unless_open() {
        let queue = NotificationQueue::new();
        let dev = device(0xFF);
        assert!(!queue.push(event(&dev, &[1])));

        queue.open_stream(&dev);
        assert!(queue.push(event(&dev, &[1])));

        queue.end_stream(&dev, EndReason::LinkLost);
        assert!(!queue.push(event(&dev, &[2])));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_per_device_filtering() {
        let queue = NotificationQueue::new();
        let a = device(0x0A);
        let b = device(0x0B);
        queue.open_stream(&a);
        queue.open_stream(&b);

        queue.push(event(&a, &[1]));
        queue.push(event(&b, &[2]));
        queue.push(event(&a, &[3]));

        let from_b = queue.drain(&b, Some(Duration::ZERO)).unwrap();
        assert_eq!(from_b.len(), 1);
        assert_eq!(from_b[0].payload, vec![2]);

        let all = queue.drain_all(Some(Duration::ZERO));
        let payloads: Vec<u8> = all.iter().map(|e| e.payload[0]).collect();
        assert_eq!(payloads, vec![1, 3]);
        assert!(all.iter().all(|e| e.device == a));
    }

    #[test]
    fn test_log_pending_does_not_consume() {
        let queue = NotificationQueue::new();
        let dev = device(0xFF);
        queue.open_stream(&dev);
        queue.push(event(&dev, &[0xDE, 0xAD]));

        assert_eq!(queue.log_pending(), 1);
        assert_eq!(queue.len(), 1);
    }
}
