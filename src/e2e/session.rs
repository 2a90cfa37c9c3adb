//! Sans-I/O state of one E2E session.
//!
//! The caller supplies the clock (`now` in milliseconds) and moves bytes;
//! the session decides which paths a packet goes out on and which inbound
//! packets reach the application.
use std::collections::VecDeque;

use highway::{HighwayHash, HighwayHasher, Key};
use tracing::{debug, trace};

use super::packet::{E2ePacket, SessionAddr};
use crate::{
    cache::RecentSet,
    config::E2eConfig,
    error::Error,
    specification::{
        DEDUP_WINDOW, MAX_PING_SAMPLE_MS, MIN_SCORE_PING_MS, SEND_TIMES_LEN, UNKNOWN_PING_MS,
    },
    token_bucket::TokenBucket,
};

/// What [`Session::process`] did with a packet.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Processed {
    /// Queued for the application.
    Enqueued,
    /// Body already delivered recently.
    Duplicate,
    /// Sequence number not newer than the last one on this path.
    Stale,
}

/// Per-path statistics.
#[derive(Debug)]
struct Link<A> {
    path: A,
    sendsn: u64,
    acksn: u64,
    recvsn: u64,
    received_any: bool,
    recvcnt: u64,
    /// `(ack, sent_at)` keyed by `ack % SEND_TIMES_LEN`, where `ack` is the
    /// acknowledgement the peer will send for that packet.
    send_times: Vec<Option<(u64, u64)>>,
    last_ping: f64,
    last_recv_ms: u64,
}

impl<A> Link<A> {
    fn new(path: A) -> Self {
        Self {
            path,
            sendsn: 0,
            acksn: 0,
            recvsn: 0,
            received_any: false,
            recvcnt: 0,
            send_times: vec![None; SEND_TIMES_LEN],
            last_ping: UNKNOWN_PING_MS,
            last_recv_ms: 0,
        }
    }

    /// Expected staleness weighted by latency; lower is better.
    fn score(&self, now: u64) -> f64 {
        let since_recv = now.saturating_sub(self.last_recv_ms) as f64;
        (since_recv * self.last_ping.max(MIN_SCORE_PING_MS)).sqrt()
    }

    /// Takes one RTT sample from `ack`. Acks whose slot has since been reused
    /// by a newer packet, or was never filled, are ignored.
    fn record_ping(&mut self, ack: u64, now: u64) {
        let slot = &mut self.send_times[(ack % SEND_TIMES_LEN as u64) as usize];
        let Some((_, sent_at)) = slot.take_if(|(expected, _)| *expected == ack) else {
            return;
        };
        let sample = now.saturating_sub(sent_at);
        if sample >= MAX_PING_SAMPLE_MS {
            return;
        }
        let sample = sample as f64;
        self.last_ping = if sample < self.last_ping {
            sample
        } else {
            0.9 * self.last_ping + 0.1 * sample
        };
    }
}

/// One E2E session: its paths, inbound queue and dedup window.
#[derive(Debug)]
pub(crate) struct Session<A> {
    addr: SessionAddr,
    links: Vec<Link<A>>,
    rdqueue: VecDeque<Vec<u8>>,
    dedup: RecentSet<u128>,
    dup_limit: TokenBucket,
    reselect_interval_ms: u64,
    last_select_ms: Option<u64>,
    last_remid: usize,
}

impl<A: Clone + Eq> Session<A> {
    pub(crate) fn new(addr: SessionAddr, config: &E2eConfig) -> Self {
        Self {
            addr,
            links: Vec::new(),
            rdqueue: VecDeque::new(),
            dedup: RecentSet::with_capacity(DEDUP_WINDOW),
            dup_limit: TokenBucket::new(config.dup_rate_per_sec, config.dup_burst),
            reselect_interval_ms: config.reselect_interval.as_millis() as u64,
            last_select_ms: None,
            last_remid: 0,
        }
    }

    /// Adds `path` unless it is already known. Returns its link index.
    pub(crate) fn add_path(&mut self, path: A) -> usize {
        if let Some(i) = self.links.iter().position(|l| l.path == path) {
            return i;
        }
        self.links.push(Link::new(path));
        self.links.len() - 1
    }

    pub(crate) fn paths(&self) -> impl Iterator<Item = &A> {
        self.links.iter().map(|l| &l.path)
    }

    /// Builds the datagrams carrying `body` and the paths to send them on.
    ///
    /// While the duplication budget lasts, every path gets a copy. Otherwise
    /// a single path is used; it is re-chosen by score at most once per
    /// reselection interval.
    pub(crate) fn prepare_send(&mut self, body: &[u8], now: u64) -> Result<Vec<(Vec<u8>, A)>, Error> {
        if self.links.is_empty() {
            return Err(Error::PathUnknown);
        }

        if self.links.len() > 1 && self.dup_limit.try_acquire(now) {
            return (0..self.links.len())
                .map(|i| self.encode_on(i, body, now))
                .collect();
        }

        let stale = match self.last_select_ms {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.reselect_interval_ms,
        };
        if stale || self.last_remid >= self.links.len() {
            let best = self
                .links
                .iter()
                .enumerate()
                .map(|(i, l)| (i, l.score(now)))
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map_or(0, |(i, _)| i);
            if best != self.last_remid {
                debug!(session = ?self.addr, from = self.last_remid, to = best, "e2e: switching path");
            }
            self.last_remid = best;
            self.last_select_ms = Some(now);
        }
        Ok(vec![self.encode_on(self.last_remid, body, now)?])
    }

    /// Builds the next packet on link `index`. The link is left untouched if
    /// the body cannot be encoded.
    fn encode_on(&mut self, index: usize, body: &[u8], now: u64) -> Result<(Vec<u8>, A), Error> {
        let link = &mut self.links[index];
        let sn = link.sendsn;
        let ack = if link.received_any { link.recvsn + 1 } else { 0 };
        let wire = E2ePacket {
            session: self.addr,
            sn,
            ack,
            body: body.to_vec(),
        }
        .encode()?;

        link.sendsn += 1;
        link.send_times[((sn + 1) % SEND_TIMES_LEN as u64) as usize] = Some((sn + 1, now));
        Ok((wire, link.path.clone()))
    }

    /// Accounts for an inbound packet that arrived over `path`.
    pub(crate) fn process(&mut self, packet: E2ePacket, path: A, now: u64) -> Processed {
        let index = self.add_path(path);
        let link = &mut self.links[index];

        if link.received_any && packet.sn <= link.recvsn {
            trace!(session = ?self.addr, sn = packet.sn, recvsn = link.recvsn, "e2e: stale packet");
            return Processed::Stale;
        }
        link.received_any = true;
        link.recvsn = packet.sn;
        link.acksn = packet.ack;
        link.recvcnt += 1;
        link.last_recv_ms = now;
        if packet.ack != 0 {
            link.record_ping(packet.ack, now);
        }

        let hash = HighwayHasher::new(Key([0; 4])).hash128(&packet.body);
        let hash = (hash[0] as u128) << 64 | hash[1] as u128;
        if !self.dedup.insert(hash) {
            trace!(session = ?self.addr, "e2e: duplicate body");
            return Processed::Duplicate;
        }
        self.rdqueue.push_back(packet.body);
        Processed::Enqueued
    }

    /// Hands every queued body to `f`, oldest first.
    pub(crate) fn flush(&mut self, mut f: impl FnMut(Vec<u8>)) {
        while let Some(body) = self.rdqueue.pop_front() {
            f(body);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::DecodeError;

    const P1: &str = "p1";
    const P2: &str = "p2";

    fn config() -> E2eConfig {
        E2eConfig::client()
    }

    fn session() -> Session<&'static str> {
        Session::new(SessionAddr::from([1u8; 16]), &config())
    }

    fn decode(wire: &[u8]) -> E2ePacket {
        E2ePacket::decode(wire).unwrap()
    }

    fn drained(s: &mut Session<&'static str>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        s.flush(|b| out.push(b));
        out
    }

    #[test]
    fn test_no_paths() {
        let mut s = session();
        assert_eq!(s.prepare_send(b"x", 0), Err(Error::PathUnknown));
    }

    #[test]
    fn test_oversized_body_is_refused() {
        let mut s = session();
        s.add_path(P1);
        let body = vec![0u8; u16::MAX as usize + 1];
        assert_eq!(
            s.prepare_send(&body, 0),
            Err(Error::Decode(DecodeError::RecordTooLarge { len: body.len() }))
        );
        assert_eq!(s.links[0].sendsn, 0);
        let sent = s.prepare_send(b"fits", 0).unwrap();
        assert_eq!(decode(&sent[0].0).sn, 0);
    }

    #[test]
    fn test_sequence_and_ack() {
        let mut a = session();
        let mut b = session();
        a.add_path(P1);

        let out = a.prepare_send(b"one", 0).unwrap();
        assert_eq!(out.len(), 1);
        let first = decode(&out[0].0);
        assert_eq!((first.sn, first.ack), (0, 0));

        assert_eq!(b.process(first, P1, 0), Processed::Enqueued);
        let reply = b.prepare_send(b"two", 40).unwrap();
        let reply = decode(&reply[0].0);
        assert_eq!((reply.sn, reply.ack), (0, 1));

        // The ack for sn 0 arrives 60 ms after sending it.
        assert_eq!(a.process(reply, P1, 60), Processed::Enqueued);
        assert_eq!(a.links[0].last_ping, 60.0);
        assert_eq!(drained(&mut a), vec![b"two".to_vec()]);
    }

    #[test]
    fn test_ping_ewma() {
        let mut link = Link::new(P1);
        link.send_times[1] = Some((1, 0));
        link.record_ping(1, 100);
        assert_eq!(link.last_ping, 100.0);
        // A worse sample moves the estimate a tenth of the way.
        link.send_times[2] = Some((2, 1000));
        link.record_ping(2, 1200);
        assert!((link.last_ping - 110.0).abs() < 1e-9);
        // A better sample replaces it.
        link.send_times[3] = Some((3, 2000));
        link.record_ping(3, 2050);
        assert_eq!(link.last_ping, 50.0);
        // Too slow to count.
        link.send_times[4] = Some((4, 3000));
        link.record_ping(4, 4000);
        assert_eq!(link.last_ping, 50.0);
        // Each send time yields one sample.
        link.record_ping(3, 2100);
        assert_eq!(link.last_ping, 50.0);
    }

    #[test]
    fn test_ack_of_overwritten_send_time_is_ignored() {
        let mut s = session();
        s.add_path(P1);
        // Sn 4 is acked with 5, whose slot Sn 1028 reused.
        for now in 0..1100 {
            s.prepare_send(b"x", now).unwrap();
        }
        assert_eq!(s.process(from_peer(0, 5, b"old"), P1, 1200), Processed::Enqueued);
        assert_eq!(s.links[0].last_ping, UNKNOWN_PING_MS);

        // An ack from the future matches nothing either.
        assert_eq!(s.process(from_peer(1, 5000, b"bogus"), P1, 1200), Processed::Enqueued);
        assert_eq!(s.links[0].last_ping, UNKNOWN_PING_MS);

        // The ack for the last packet still counts.
        assert_eq!(s.process(from_peer(2, 1100, b"new"), P1, 1200), Processed::Enqueued);
        assert_eq!(s.links[0].last_ping, 101.0);
    }

    #[test]
    fn test_stale_packet_leaves_no_trace() {
        let mut s = session();
        let pkt = |sn, body: &[u8]| E2ePacket {
            session: SessionAddr::from([1u8; 16]),
            sn,
            ack: 0,
            body: body.to_vec(),
        };
        assert_eq!(s.process(pkt(5, b"a"), P1, 10), Processed::Enqueued);
        assert_eq!(s.process(pkt(5, b"b"), P1, 20), Processed::Stale);
        assert_eq!(s.process(pkt(3, b"c"), P1, 30), Processed::Stale);
        let link = &s.links[0];
        assert_eq!((link.recvsn, link.recvcnt, link.last_recv_ms), (5, 1, 10));
        assert_eq!(drained(&mut s), vec![b"a".to_vec()]);

        // Sequence numbers are per path.
        assert_eq!(s.process(pkt(0, b"d"), P2, 40), Processed::Enqueued);
    }

    #[test]
    fn test_duplication_then_single_path() {
        let mut s = session();
        s.add_path(P1);
        s.add_path(P2);
        for _ in 0..10 {
            assert_eq!(s.prepare_send(b"x", 0).unwrap().len(), 2);
        }
        assert_eq!(s.prepare_send(b"x", 0).unwrap().len(), 1);
        // A tenth of a second buys one more duplicated send.
        assert_eq!(s.prepare_send(b"x", 100).unwrap().len(), 2);
        assert_eq!(s.prepare_send(b"x", 100).unwrap().len(), 1);
    }

    #[test]
    fn test_dedup_under_duplication() {
        let mut sender = session();
        let mut receiver = session();
        sender.add_path(P1);
        sender.add_path(P2);

        let copies = sender.prepare_send(b"Y", 0).unwrap();
        assert_eq!(copies.len(), 2);
        let results: Vec<_> = copies
            .into_iter()
            .map(|(wire, path)| receiver.process(decode(&wire), path, 1))
            .collect();
        assert_eq!(results, vec![Processed::Enqueued, Processed::Duplicate]);
        assert_eq!(drained(&mut receiver), vec![b"Y".to_vec()]);
    }

    #[test]
    fn test_empty_body_delivered_once() {
        let mut sender = session();
        let mut receiver = session();
        sender.add_path(P1);
        sender.add_path(P2);
        for (wire, path) in sender.prepare_send(b"", 0).unwrap() {
            receiver.process(decode(&wire), path, 0);
        }
        for (wire, path) in sender.prepare_send(b"", 5).unwrap() {
            receiver.process(decode(&wire), path, 5);
        }
        assert_eq!(drained(&mut receiver), vec![Vec::<u8>::new()]);
    }

    fn from_peer(sn: u64, ack: u64, body: &[u8]) -> E2ePacket {
        E2ePacket {
            session: SessionAddr::from([1u8; 16]),
            sn,
            ack,
            body: body.to_vec(),
        }
    }

    /// `X` goes out on the best path and is lost; the other path turns
    /// fresher and takes over once the reselection interval has passed.
    #[test]
    fn test_multipath_reselection() {
        let single = E2eConfig::client().with_duplication(0.0, 0);
        let mut client = Session::new(SessionAddr::from([1u8; 16]), &single);
        let mut server = Session::new(SessionAddr::from([1u8; 16]), &E2eConfig::server());
        client.add_path(P1);
        client.add_path(P2);

        // Both paths score zero; ties go to the first.
        let hello = client.prepare_send(b"hello", 0).unwrap();
        assert_eq!(hello.len(), 1);
        assert_eq!(hello[0].1, P1);

        // The answer on P1 carries an ack, giving P1 a 30 ms ping.
        assert_eq!(client.process(from_peer(0, 1, b"welcome"), P1, 30), Processed::Enqueued);
        assert_eq!(client.links[0].last_ping, 30.0);

        // X rides P1 and is lost.
        assert_eq!(client.prepare_send(b"X", 40).unwrap()[0].1, P1);

        // P2 hears from the server; P1 stays quiet.
        client.process(from_peer(0, 0, b"via p2"), P2, 400);
        // Inside the interval the choice is sticky.
        assert_eq!(client.prepare_send(b"X", 400).unwrap()[0].1, P1);

        client.process(from_peer(1, 0, b"via p2 again"), P2, 550);
        let resent = client.prepare_send(b"X", 550).unwrap();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].1, P2);
        assert_eq!(server.process(decode(&resent[0].0), P2, 560), Processed::Enqueued);

        // Another copy on the same path is dropped by content.
        let again = client.prepare_send(b"X", 600).unwrap();
        assert_eq!(again[0].1, P2);
        assert_eq!(server.process(decode(&again[0].0), P2, 610), Processed::Duplicate);
        assert_eq!(drained(&mut server), vec![b"X".to_vec()]);
    }
}
