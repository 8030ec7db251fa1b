//! Credit accounting for the write and control channels.
//!
//! The negotiated queue depth `D` is split asymmetrically: the write side
//! gets `D/2 - 2` credits, the control side `D/2 + 2`, leaving headroom for
//! control traffic that shares the queue pair's work-request slots with
//! data writes. One credit buys one posted work request, regardless of byte
//! count. Credits are replenished by the peer: write credits through the
//! `writes_received` field of FC messages, control credits through the
//! 4-bit ack field piggy-backed on incoming data writes.
//!
//! Counter bounds are invariants of the protocol, not recoverable
//! conditions: a credit that goes negative or exceeds the depth means the
//! two sides disagree about outstanding work, and the assertion failure is
//! the defect report.

use crate::protocol::MAX_ACKS_PER_IMM;

/// Credit state for one connection.
#[derive(Debug)]
pub struct Credits {
    depth: i64,
    /// Permission to post RDMA writes.
    write_credits: i64,
    /// Permission to post control messages.
    control_credits: i64,
    /// Peer writes received and not yet reported in an FC message.
    writes_pending: i64,
    /// Peer FC messages received and not yet acked in an immediate.
    acks_pending: i64,
}

impl Credits {
    /// Split `depth` work-request slots between the two channels.
    pub fn new(depth: u16) -> Self {
        let depth = i64::from(depth);
        Self {
            depth,
            write_credits: depth / 2 - 2,
            control_credits: depth / 2 + 2,
            writes_pending: 0,
            acks_pending: 0,
        }
    }

    #[inline]
    pub fn write_credits(&self) -> i64 {
        self.write_credits
    }

    #[inline]
    pub fn control_credits(&self) -> i64 {
        self.control_credits
    }

    #[inline]
    pub fn has_write_credit(&self) -> bool {
        self.write_credits > 0
    }

    #[inline]
    pub fn has_control_credit(&self) -> bool {
        self.control_credits > 0
    }

    /// Spend one write credit for a posted RDMA write.
    pub fn consume_write(&mut self) {
        self.write_credits -= 1;
        assert!(self.write_credits >= 0, "write credits went negative");
    }

    /// Spend one control credit for a posted control message.
    pub fn consume_control(&mut self) {
        self.control_credits -= 1;
        assert!(self.control_credits >= 0, "control credits went negative");
    }

    /// Apply the `writes_received` field of a peer FC message.
    pub fn on_flow_control(&mut self, writes_received: u32) {
        self.write_credits += i64::from(writes_received);
        assert!(
            self.write_credits <= self.depth,
            "write credits {} exceed depth {}",
            self.write_credits,
            self.depth
        );
        self.acks_pending += 1;
    }

    /// Apply the ack field of an incoming data write's immediate.
    pub fn on_write_received(&mut self, acks: u32) {
        self.control_credits += i64::from(acks);
        assert!(
            self.control_credits <= self.depth,
            "control credits {} exceed depth {}",
            self.control_credits,
            self.depth
        );
        self.writes_pending += 1;
    }

    /// Take up to 15 pending acks for the immediate of an outgoing write;
    /// the remainder rolls over to later writes.
    pub fn take_imm_acks(&mut self) -> u32 {
        let n = self.acks_pending.min(i64::from(MAX_ACKS_PER_IMM));
        self.acks_pending -= n;
        n as u32
    }

    /// Take the received-write count for an outgoing FC message.
    pub fn take_fc_writes(&mut self) -> u32 {
        let n = self.writes_pending;
        self.writes_pending = 0;
        n as u32
    }

    /// Whether the read path should send explicit flow control.
    ///
    /// Always true: piggy-backed acks alone do not keep the sender moving
    /// when traffic is one-directional. This heuristic favors latency and
    /// is not proven deadlock-free for very small depths or high-latency
    /// links.
    pub fn flow_control_required(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_split_is_asymmetric() {
        let c = Credits::new(64);
        assert_eq!(c.write_credits(), 30);
        assert_eq!(c.control_credits(), 34);
    }

    #[test]
    fn consume_and_replenish_stay_bounded() {
        let depth = 16u16;
        let mut c = Credits::new(depth);
        // Exhaust the write channel, then replenish it via FC.
        let initial = c.write_credits();
        for _ in 0..initial {
            c.consume_write();
        }
        assert!(!c.has_write_credit());
        c.on_flow_control(initial as u32);
        assert_eq!(c.write_credits(), initial);

        // Interleaved traffic never leaves [0, depth].
        for round in 0..100u32 {
            if c.has_write_credit() {
                c.consume_write();
            }
            if round % 3 == 0 {
                c.on_flow_control(1);
            }
            if c.has_control_credit() {
                c.consume_control();
            }
            c.on_write_received(1);
            assert!(c.write_credits() >= 0 && c.write_credits() <= i64::from(depth));
            assert!(c.control_credits() >= 0 && c.control_credits() <= i64::from(depth));
        }
    }

    #[test]
    fn imm_acks_cap_at_fifteen() {
        let mut c = Credits::new(64);
        for _ in 0..20 {
            c.on_flow_control(0);
        }
        assert_eq!(c.take_imm_acks(), 15);
        assert_eq!(c.take_imm_acks(), 5);
        assert_eq!(c.take_imm_acks(), 0);
    }

    #[test]
    fn fc_writes_drain_completely() {
        let mut c = Credits::new(64);
        for _ in 0..7 {
            c.on_write_received(0);
        }
        assert_eq!(c.take_fc_writes(), 7);
        assert_eq!(c.take_fc_writes(), 0);
    }

    #[test]
    #[should_panic(expected = "went negative")]
    fn overdraw_is_a_defect() {
        let mut c = Credits::new(8);
        for _ in 0..8 {
            c.consume_write();
        }
    }

    #[test]
    #[should_panic(expected = "exceed depth")]
    fn overgrant_is_a_defect() {
        let mut c = Credits::new(8);
        c.on_flow_control(100);
    }
}
