use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bus::address::Address;
use crate::bus::config::BusConfig;

/// Created when a reliable message is sent, destroyed on the matching
///  acknowledgement or on exhausting the retransmission budget. The datagram
///  is a private copy of the exact bytes that went out, including every
///  piggybacked command captured at creation time, so a retransmission is
///  byte-identical to the original send.
pub struct OutstandingAck {
    pub seq: u64,
    pub source: Address,
    pub dest: Address,
    pub datagram: Bytes,
    /// timestamp of the *original* send; the whole retransmission schedule is
    ///  measured against it
    pub sent_at: Instant,
    pub retransmits: u8,
}

/// What the retransmit pass decided to do with its (single) candidate.
pub enum PassAction {
    Retransmit { seq: u64, datagram: Bytes },
    Fail { seq: u64, dest: Address, retransmits: u8 },
}

/// The endpoint's outstanding-ack set with the per-record state machine
///  `SENT(n=0..3)` -> `ACKED` (record removed) or `FAILED` (terminal).
pub struct RetransmitQueue {
    config: Arc<BusConfig>,
    records: FxHashMap<u64, OutstandingAck>,
}

impl RetransmitQueue {
    pub fn new(config: Arc<BusConfig>) -> RetransmitQueue {
        RetransmitQueue {
            config,
            records: FxHashMap::default(),
        }
    }

    pub fn register(&mut self, record: OutstandingAck) {
        let prev = self.records.insert(record.seq, record);
        // the sequence counter is monotonic, so a collision is a programming error
        debug_assert!(prev.is_none(), "duplicate outstanding sequence number");
    }

    /// Consumes one acknowledged sequence number: removes the record matched
    ///  by source pattern, destination pattern and sequence number. Returns
    ///  false if nothing matched (duplicate or late ack - the caller logs and
    ///  ignores it).
    pub fn apply_ack(&mut self, ack_seq: u64, ack_source: &Address, ack_dest: &Address) -> bool {
        let matched = self
            .records
            .get(&ack_seq)
            .map(|r| r.dest.matches(ack_source) && r.source.matches(ack_dest))
            .unwrap_or(false);

        if matched {
            self.records.remove(&ack_seq);
        }
        matched
    }

    /// One retransmit pass: picks at most one actionable record (the oldest,
    ///  to stay deterministic without bursting) and either schedules its
    ///  retransmission or fails it.
    pub fn sweep(&mut self, now: Instant) -> Option<PassAction> {
        let seq = self
            .records
            .values()
            .filter(|r| self.is_actionable(r, now))
            .min_by_key(|r| r.sent_at)
            .map(|r| r.seq)?;

        let record = self.records.get_mut(&seq)?;
        let elapsed = now.duration_since(record.sent_at);

        if elapsed > self.config.delivery_failure_after {
            let record = self.records.remove(&seq)?;
            warn!("reliable message {} to {:?} still unacknowledged after {:?}, giving up", seq, record.dest, elapsed);
            Some(PassAction::Fail {
                seq,
                dest: record.dest,
                retransmits: record.retransmits,
            })
        }
        else {
            record.retransmits += 1;
            debug!("retransmitting message {} to {:?} (attempt {})", seq, record.dest, record.retransmits);
            Some(PassAction::Retransmit {
                seq,
                datagram: record.datagram.clone(),
            })
        }
    }

    fn is_actionable(&self, record: &OutstandingAck, now: Instant) -> bool {
        let elapsed = now.duration_since(record.sent_at);
        elapsed > self.config.delivery_failure_after
            || (elapsed > self.config.third_retransmit_after && record.retransmits == 2)
            || (elapsed > self.config.second_retransmit_after && record.retransmits == 1)
            || (elapsed > self.config.first_retransmit_after && record.retransmits == 0)
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.records.contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::advance;

    use super::*;

    fn record(seq: u64, dest: &str) -> OutstandingAck {
        OutstandingAck {
            seq,
            source: Address::parse("module:control app:rat"),
            dest: Address::parse(dest),
            datagram: Bytes::from(format!("datagram {}", seq)),
            sent_at: Instant::now(),
            retransmits: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmission_schedule() {
        let mut queue = RetransmitQueue::new(Arc::new(BusConfig::new(0)));
        queue.register(record(7, "module:engine"));

        advance(Duration::from_millis(100)).await;
        assert!(queue.sweep(Instant::now()).is_none());

        // first retransmission shortly after 250ms
        advance(Duration::from_millis(160)).await;
        match queue.sweep(Instant::now()) {
            Some(PassAction::Retransmit { seq: 7, datagram }) => {
                assert_eq!(datagram.as_ref(), b"datagram 7")
            }
            _ => panic!("expected first retransmission"),
        }
        // not again until the next threshold
        assert!(queue.sweep(Instant::now()).is_none());

        // second shortly after 500ms
        advance(Duration::from_millis(250)).await;
        assert!(matches!(queue.sweep(Instant::now()), Some(PassAction::Retransmit { seq: 7, .. })));

        // third shortly after 750ms
        advance(Duration::from_millis(250)).await;
        assert!(matches!(queue.sweep(Instant::now()), Some(PassAction::Retransmit { seq: 7, .. })));
        assert!(queue.sweep(Instant::now()).is_none());

        // failure after 1000ms, with exactly 3 retransmissions on record
        advance(Duration::from_millis(250)).await;
        match queue.sweep(Instant::now()) {
            Some(PassAction::Fail { seq: 7, retransmits, .. }) => assert_eq!(retransmits, 3),
            _ => panic!("expected delivery failure"),
        }
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_candidate_per_pass() {
        let mut queue = RetransmitQueue::new(Arc::new(BusConfig::new(0)));
        queue.register(record(1, "module:engine"));
        advance(Duration::from_millis(10)).await;
        queue.register(record(2, "module:ui"));

        advance(Duration::from_millis(300)).await;

        // oldest record goes first, one per pass
        assert!(matches!(queue.sweep(Instant::now()), Some(PassAction::Retransmit { seq: 1, .. })));
        assert!(matches!(queue.sweep(Instant::now()), Some(PassAction::Retransmit { seq: 2, .. })));
        assert!(queue.sweep(Instant::now()).is_none());
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_ack_removes_matching_record() {
        let mut queue = RetransmitQueue::new(Arc::new(BusConfig::new(0)));
        queue.register(record(5, "media:audio module:engine"));

        let engine = Address::parse("media:audio module:engine instance:99");
        let us = Address::parse("module:control app:rat");
        assert!(queue.apply_ack(5, &engine, &us));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_or_unknown_ack_is_ignored() {
        let mut queue = RetransmitQueue::new(Arc::new(BusConfig::new(0)));
        queue.register(record(5, "module:engine"));

        let engine = Address::parse("module:engine");
        let us = Address::parse("module:control app:rat");

        // unknown sequence number
        assert!(!queue.apply_ack(99, &engine, &us));
        // ack from a sender the record was not addressed to
        assert!(!queue.apply_ack(5, &Address::parse("module:ui"), &us));
        assert_eq!(queue.len(), 1);

        assert!(queue.apply_ack(5, &engine, &us));
        // duplicate ack after the record is gone
        assert!(!queue.apply_ack(5, &engine, &us));
        assert!(queue.is_empty());
    }
}
