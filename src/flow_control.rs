//! Credit based flow control and the linear send throttle.
//!
//! A peer may hold at most `recv_buffer_count` unacknowledged general
//! messages. Each SEND consumes one transmit credit; the receiver returns
//! credit in batches with a `CreditUpdate` once buffers are re-posted.

use std::{
    sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
    time::Duration,
};

use crate::config::{ConnectionConfig, ThrottleConfig};

/// Selects one of the two completion queues of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqKind {
    Send,
    Recv,
}

impl CqKind {
    fn index(self) -> usize {
        match self {
            CqKind::Send => 0,
            CqKind::Recv => 1,
        }
    }
}

/// Per connection credit and work-request accounting.
///
/// Counters are atomics so they can be read from any thread; every grant
/// that is followed by a post is made under the connection's send lock.
#[derive(Debug)]
pub struct FlowControl {
    connected: AtomicBool,
    /// Receive buffers re-posted since the last credit announcement
    recv_credit: AtomicU32,
    /// Sends the peer can still absorb
    xmit_credit: AtomicI64,
    /// Send work requests posted but not completed
    outstanding_send: AtomicU32,
    /// Completion events delivered but not acknowledged, per queue
    unacked_cq_events: [AtomicU32; 2],
    max_send_wr: u32,
    reserved_credit: i64,
    credit_threshold: u32,
    cq_ack_batch: u32,
}

impl FlowControl {
    /// Both peers must share `recv_buffer_count`, so the local receive pool
    /// size is also the initial credit granted by the peer.
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            connected: AtomicBool::new(false),
            recv_credit: AtomicU32::new(0),
            xmit_credit: AtomicI64::new(i64::from(config.recv_buffer_count)),
            outstanding_send: AtomicU32::new(0),
            unacked_cq_events: [AtomicU32::new(0), AtomicU32::new(0)],
            max_send_wr: config.max_send_wr,
            reserved_credit: i64::from(config.reserved_credit),
            credit_threshold: config.credit_threshold,
            cq_ack_batch: config.cq_ack_batch,
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Marks the connection closed. Returns `true` only for the first call.
    pub fn disconnect(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn xmit_credit(&self) -> i64 {
        self.xmit_credit.load(Ordering::Acquire)
    }

    pub fn recv_credit(&self) -> u32 {
        self.recv_credit.load(Ordering::Acquire)
    }

    pub fn outstanding_send(&self) -> u32 {
        self.outstanding_send.load(Ordering::Acquire)
    }

    /// Grants one credit-consuming send. Keeps `reserved_credit` back for
    /// credit announcements and leaves half the send queue for them too.
    pub fn request_send(&self) -> bool {
        self.is_connected()
            && self.outstanding_send() < self.max_send_wr / 2
            && self.take_credit(self.reserved_credit)
            && self.take_slot()
    }

    /// Grants a credit announcement, which may use the last credit and the
    /// whole send queue.
    pub fn request_ack(&self) -> bool {
        self.is_connected()
            && self.outstanding_send() < self.max_send_wr
            && self.take_credit(0)
            && self.take_slot()
    }

    /// Grants a one-sided READ or WRITE. These consume no peer receive
    /// buffer, only a send work request.
    pub fn request_wr_slot(&self) -> bool {
        self.is_connected() && self.outstanding_send() < self.max_send_wr && self.take_slot()
    }

    /// Undoes a [`Self::request_send`] or [`Self::request_ack`] grant whose
    /// post was rejected.
    pub fn refund_send(&self) {
        let _prev = self.xmit_credit.fetch_add(1, Ordering::AcqRel);
        self.release_slot();
    }

    /// Undoes a [`Self::request_wr_slot`] grant whose post was rejected.
    pub fn refund_wr_slot(&self) {
        self.release_slot();
    }

    /// A send work request completed.
    pub fn complete_send(&self) {
        self.release_slot();
    }

    pub fn add_xmit_credit(&self, credit: u32) {
        let _prev = self
            .xmit_credit
            .fetch_add(i64::from(credit), Ordering::AcqRel);
    }

    /// A receive buffer went back to the queue pair.
    pub fn on_recv_reposted(&self) {
        let _prev = self.recv_credit.fetch_add(1, Ordering::AcqRel);
    }

    pub fn recv_credit_due(&self) -> bool {
        self.recv_credit() >= self.credit_threshold
    }

    /// Takes the accumulated receive credit for an announcement.
    pub fn take_recv_credit(&self) -> u32 {
        self.recv_credit.swap(0, Ordering::AcqRel)
    }

    /// Puts back credit whose announcement could not be posted.
    pub fn restore_recv_credit(&self, credit: u32) {
        let _prev = self.recv_credit.fetch_add(credit, Ordering::AcqRel);
    }

    /// Counts one completion event. Returns the number of events to
    /// acknowledge once a full batch accumulated.
    #[allow(clippy::indexing_slicing)]
    pub fn on_cq_event(&self, cq: CqKind) -> Option<u32> {
        let events = self.unacked_cq_events[cq.index()].fetch_add(1, Ordering::AcqRel) + 1;
        (events >= self.cq_ack_batch).then(|| self.take_unacked_cq_events(cq))
    }

    #[allow(clippy::indexing_slicing)]
    pub fn take_unacked_cq_events(&self, cq: CqKind) -> u32 {
        self.unacked_cq_events[cq.index()].swap(0, Ordering::AcqRel)
    }

    fn take_credit(&self, floor: i64) -> bool {
        self.xmit_credit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |credit| {
                (credit > floor).then(|| credit - 1)
            })
            .is_ok()
    }

    fn take_slot(&self) -> bool {
        let _prev = self.outstanding_send.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn release_slot(&self) {
        let _ignore = self
            .outstanding_send
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Linear backoff applied before sends once the send path pushes back.
#[derive(Debug, Clone)]
pub struct SendThrottle {
    delay: Duration,
    slow_step: Duration,
    speed_step: Duration,
    max_delay: Duration,
    ok_count: u32,
    ok_threshold: u32,
}

impl SendThrottle {
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            delay: Duration::ZERO,
            slow_step: Duration::from_micros(config.slow_step_us),
            speed_step: Duration::from_micros(config.speed_step_us),
            max_delay: Duration::from_micros(config.max_delay_us),
            ok_count: 0,
            ok_threshold: config.ok_threshold.max(1),
        }
    }

    /// Current delay applied before a send.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn on_failure(&mut self) {
        self.delay = (self.delay + self.slow_step).min(self.max_delay);
        self.ok_count = 0;
    }

    pub fn on_success(&mut self) {
        self.ok_count += 1;
        if self.ok_count >= self.ok_threshold {
            self.delay = self.delay.saturating_sub(self.speed_step);
            self.ok_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(count: u32, threshold: u32, reserved: u32, max_send_wr: u32) -> ConnectionConfig {
        ConnectionConfig {
            recv_buffer_count: count,
            credit_threshold: threshold,
            reserved_credit: reserved,
            max_send_wr,
            cq_ack_batch: 4,
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn nothing_is_granted_before_connect() {
        let fc = FlowControl::new(&config(16, 4, 2, 64));
        assert!(!fc.request_send());
        assert!(!fc.request_ack());
        assert!(!fc.request_wr_slot());
        fc.set_connected(true);
        assert!(fc.request_send());
        assert!(fc.disconnect());
        assert!(!fc.disconnect());
        assert!(!fc.request_send());
    }

    #[test]
    fn initial_credit_is_the_shared_receive_pool_size() {
        let fc = FlowControl::new(&config(48, 4, 2, 256));
        assert_eq!(fc.xmit_credit(), 48);
        assert_eq!(fc.recv_credit(), 0);
    }

    #[test]
    fn general_sends_stop_at_reserved_credit() {
        let fc = FlowControl::new(&config(16, 4, 2, 64));
        fc.set_connected(true);
        let granted = (0..32).filter(|_| fc.request_send()).count();
        assert_eq!(granted, 14);
        assert_eq!(fc.xmit_credit(), 2);

        // announcements may drain the reserve but never go negative
        assert!(fc.request_ack());
        assert!(fc.request_ack());
        assert!(!fc.request_ack());
        assert_eq!(fc.xmit_credit(), 0);
        assert_eq!(fc.outstanding_send(), 16);
    }

    #[test]
    fn outstanding_sends_gate_before_credit() {
        let fc = FlowControl::new(&config(64, 4, 2, 8));
        fc.set_connected(true);
        let granted = (0..8).filter(|_| fc.request_send()).count();
        assert_eq!(granted, 4);
        assert!(fc.request_ack());
        assert!(fc.request_wr_slot());
        assert!(fc.request_wr_slot());
        assert!(fc.request_ack());
        assert!(!fc.request_wr_slot());
        for _ in 0..8 {
            fc.complete_send();
        }
        assert_eq!(fc.outstanding_send(), 0);
        fc.complete_send();
        assert_eq!(fc.outstanding_send(), 0);
    }

    #[test]
    fn refund_restores_credit_and_slot() {
        let fc = FlowControl::new(&config(16, 4, 2, 64));
        fc.set_connected(true);
        assert!(fc.request_send());
        assert_eq!(fc.xmit_credit(), 15);
        fc.refund_send();
        assert_eq!(fc.xmit_credit(), 16);
        assert_eq!(fc.outstanding_send(), 0);
    }

    #[test]
    fn credit_is_conserved_across_announcements() {
        let fc = FlowControl::new(&config(16, 4, 2, 64));
        fc.set_connected(true);
        let mut sent = 0u32;
        let mut announced = 0u32;
        for round in 0..10 {
            while fc.request_send() {
                sent += 1;
                fc.complete_send();
            }
            assert!(fc.xmit_credit() >= 0);
            let credit = 4 + round % 3;
            fc.add_xmit_credit(credit);
            announced += credit;
        }
        assert!(i64::from(sent) <= 16 + i64::from(announced));
        assert_eq!(i64::from(sent), 16 + i64::from(announced) - fc.xmit_credit());
    }

    #[test]
    fn recv_credit_becomes_due_at_threshold() {
        let fc = FlowControl::new(&config(16, 4, 2, 64));
        for _ in 0..3 {
            fc.on_recv_reposted();
        }
        assert!(!fc.recv_credit_due());
        fc.on_recv_reposted();
        assert!(fc.recv_credit_due());
        assert_eq!(fc.take_recv_credit(), 4);
        assert_eq!(fc.recv_credit(), 0);
        fc.restore_recv_credit(4);
        assert!(fc.recv_credit_due());
    }

    #[test]
    fn cq_events_are_acked_in_batches() {
        let fc = FlowControl::new(&config(16, 4, 2, 64));
        assert_eq!(fc.on_cq_event(CqKind::Send), None);
        assert_eq!(fc.on_cq_event(CqKind::Send), None);
        assert_eq!(fc.on_cq_event(CqKind::Recv), None);
        assert_eq!(fc.on_cq_event(CqKind::Send), None);
        assert_eq!(fc.on_cq_event(CqKind::Send), Some(4));
        assert_eq!(fc.on_cq_event(CqKind::Send), None);
        assert_eq!(fc.take_unacked_cq_events(CqKind::Send), 1);
        assert_eq!(fc.take_unacked_cq_events(CqKind::Recv), 1);
    }

    #[test]
    fn throttle_backs_off_linearly_and_recovers() {
        let mut throttle = SendThrottle::new(&ThrottleConfig {
            slow_step_us: 10,
            speed_step_us: 4,
            max_delay_us: 25,
            ok_threshold: 2,
        });
        assert_eq!(throttle.delay(), Duration::ZERO);
        throttle.on_failure();
        throttle.on_failure();
        assert_eq!(throttle.delay(), Duration::from_micros(20));
        throttle.on_failure();
        assert_eq!(throttle.delay(), Duration::from_micros(25));

        throttle.on_success();
        assert_eq!(throttle.delay(), Duration::from_micros(25));
        throttle.on_success();
        assert_eq!(throttle.delay(), Duration::from_micros(21));

        // a failure resets the success streak
        throttle.on_success();
        throttle.on_failure();
        throttle.on_success();
        assert_eq!(throttle.delay(), Duration::from_micros(25));
        for _ in 0..20 {
            throttle.on_success();
        }
        assert_eq!(throttle.delay(), Duration::ZERO);
    }
}
