//! Subscriber: one delivery endpoint attached to a room

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use crate::error::Result;
use crate::media::packet::AvPacket;

/// Delivery protocol of a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberProtocol {
    Rtmp,
    HttpFlv,
    Hls,
}

/// Subscriber lifecycle: New -> Running -> Closed, never backwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriberState {
    /// Attached, cache not yet flushed
    New = 0,
    /// Receiving live packets
    Running = 1,
    /// Finished; removed on the next broadcast pass
    Closed = 2,
}

/// Non-blocking packet writer owned by a subscriber
///
/// `write_packet` must not suspend: it enqueues or reports
/// `SubscriberLagging` / `BackendIO`-class failures immediately.
pub trait PacketSink: Send + Sync {
    fn write_packet(&self, packet: &AvPacket) -> Result<()>;
    fn close(&self);
}

/// One delivery endpoint
pub struct Subscriber {
    uid: u64,
    protocol: SubscriberProtocol,
    subscribed_at: Instant,
    state: AtomicU8,
    sink: Box<dyn PacketSink>,
}

impl Subscriber {
    pub fn new(uid: u64, protocol: SubscriberProtocol, sink: Box<dyn PacketSink>) -> Self {
        Self {
            uid,
            protocol,
            subscribed_at: Instant::now(),
            state: AtomicU8::new(SubscriberState::New as u8),
            sink,
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn protocol(&self) -> SubscriberProtocol {
        self.protocol
    }

    pub fn subscribed_at(&self) -> Instant {
        self.subscribed_at
    }

    pub fn state(&self) -> SubscriberState {
        match self.state.load(Ordering::Acquire) {
            0 => SubscriberState::New,
            1 => SubscriberState::Running,
            _ => SubscriberState::Closed,
        }
    }

    /// New -> Running, once the cache has been flushed
    pub fn mark_running(&self) {
        // Only forward transitions; a concurrent close wins
        let _ = self.state.compare_exchange(
            SubscriberState::New as u8,
            SubscriberState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Terminal transition; closes the sink exactly once
    pub fn close(&self) {
        let prev = self.state.swap(SubscriberState::Closed as u8, Ordering::AcqRel);
        if prev != SubscriberState::Closed as u8 {
            self.sink.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SubscriberState::Closed
    }

    pub fn write_packet(&self, packet: &AvPacket) -> Result<()> {
        self.sink.write_packet(packet)
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("uid", &self.uid)
            .field("protocol", &self.protocol)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    /// Records every packet; can be switched to start failing
    pub struct RecordingSink {
        pub packets: Arc<Mutex<Vec<AvPacket>>>,
        pub fail: Arc<AtomicBool>,
        pub closed: Arc<AtomicBool>,
    }

    impl RecordingSink {
        pub fn new() -> (Self, Arc<Mutex<Vec<AvPacket>>>, Arc<AtomicBool>, Arc<AtomicBool>) {
            let packets = Arc::new(Mutex::new(Vec::new()));
            let fail = Arc::new(AtomicBool::new(false));
            let closed = Arc::new(AtomicBool::new(false));
            (
                Self {
                    packets: packets.clone(),
                    fail: fail.clone(),
                    closed: closed.clone(),
                },
                packets,
                fail,
                closed,
            )
        }
    }

    impl PacketSink for RecordingSink {
        fn write_packet(&self, packet: &AvPacket) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(Error::SubscriberLagging);
            }
            self.packets.lock().unwrap().push(packet.clone());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingSink;
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_state_machine_never_regresses() {
        let (sink, _, _, closed) = RecordingSink::new();
        let sub = Subscriber::new(1, SubscriberProtocol::Rtmp, Box::new(sink));

        assert_eq!(sub.state(), SubscriberState::New);
        sub.mark_running();
        assert_eq!(sub.state(), SubscriberState::Running);

        sub.close();
        assert_eq!(sub.state(), SubscriberState::Closed);
        assert!(closed.load(Ordering::Relaxed));

        // A late mark_running cannot resurrect a closed subscriber
        sub.mark_running();
        assert_eq!(sub.state(), SubscriberState::Closed);
    }

    #[test]
    fn test_close_is_idempotent_on_sink() {
        let (sink, _, _, closed) = RecordingSink::new();
        let sub = Subscriber::new(2, SubscriberProtocol::HttpFlv, Box::new(sink));
        sub.close();
        closed.store(false, Ordering::Relaxed);
        sub.close();
        // Second close must not reach the sink again
        assert!(!closed.load(Ordering::Relaxed));
    }

    #[test]
    fn test_write_forwards_to_sink() {
        let (sink, packets, _, _) = RecordingSink::new();
        let sub = Subscriber::new(3, SubscriberProtocol::Rtmp, Box::new(sink));
        let pkt = AvPacket::video(7, Bytes::from_static(&[0x17, 0x01, 0, 0, 0]));
        sub.write_packet(&pkt).unwrap();
        assert_eq!(packets.lock().unwrap().len(), 1);
    }
}
