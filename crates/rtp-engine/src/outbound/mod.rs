//! Outbound pacing queue
//!
//! Payloads handed in by the application are split into packets, stamped with
//! the session's random initial timestamp and sequence, protected if an SRTP
//! context is configured and kept in a FIFO. The service loop asks
//! [`OutgoingQueue::scheduling_timeout`] how long until the head is due, then
//! dispatches it to every destination.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tracing::{debug, trace};

use crate::error::Error;
use crate::packet::{RtpHeader, RtpPacket, RTP_MAX_CSRC};
use crate::session::config::OutboundConfig;
use crate::session::SessionHooks;
use crate::srtp::{self, CryptoContexts};
use crate::time::duration_to_rtp_units;
use crate::transport::{self, Destination, DestinationList, Transport};
use crate::{Result, RtpCsrc, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// Result of one scheduling pass over the queue head
#[derive(Debug)]
pub struct Schedule {
    /// Time until the head is due; zero when it should go out now
    pub wait: Duration,
    /// Packets dropped for being later than the expire timeout
    pub expired: Vec<RtpPacket>,
}

impl Schedule {
    /// Report the dropped packets through [`SessionHooks::on_expire_send`]
    pub fn notify(&self, hooks: &dyn SessionHooks) {
        for packet in &self.expired {
            hooks.on_expire_send(packet);
        }
    }
}

/// Lateness beyond which the head's stamp is assumed to have wrapped
const WRAP_PAST_THRESHOLD: Duration = Duration::from_secs(5000);

/// Lead beyond which a wrap correction is undone
const WRAP_FUTURE_THRESHOLD: Duration = Duration::from_secs(20000);

/// Longest wait ever returned by the scheduler
const MAX_SCHEDULING_WAIT: Duration = Duration::from_secs(3600);

/// A queued outgoing packet
#[derive(Debug, Clone)]
pub struct SendLink {
    pub packet: RtpPacket,

    /// Application timestamp, relative to the initial timestamp
    pub stamp: RtpTimestamp,

    protected: bool,
}

/// A packet taken off the queue, ready for the wire
#[derive(Debug, Clone)]
pub struct OutboundDatagram {
    pub packet: RtpPacket,
    pub destinations: Vec<SocketAddr>,
}

impl OutboundDatagram {
    pub fn payload_size(&self) -> usize {
        self.packet.payload_size()
    }

    /// Send to every destination's data port. Returns the payload size.
    pub async fn send(&self, transport: &dyn Transport) -> Result<usize> {
        if self.destinations.is_empty() {
            trace!("No destinations for seq {}", self.packet.sequence_number());
        } else {
            transport::send_to_all(transport, self.packet.as_bytes(), &self.destinations, false).await?;
        }
        Ok(self.payload_size())
    }
}

/// FIFO of outgoing packets with their send deadlines
#[derive(Debug)]
pub struct OutgoingQueue {
    queue: VecDeque<SendLink>,
    destinations: DestinationList,

    ssrc: RtpSsrc,
    payload_type: u8,
    clock_rate: u32,
    contributors: Vec<RtpCsrc>,

    initial_timestamp: RtpTimestamp,
    initial_time: SystemTime,
    /// Timestamp wraps folded into the schedule so far
    overflow_wraps: i64,
    sequence: RtpSequenceNumber,
    mark: bool,

    config: OutboundConfig,

    packet_count: u32,
    octet_count: u32,
}

impl OutgoingQueue {
    /// Create a queue for `ssrc`, with a random initial timestamp and
    /// sequence number. `now` anchors the send schedule.
    pub fn new(ssrc: RtpSsrc, payload_type: u8, clock_rate: u32, config: OutboundConfig, now: SystemTime) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            queue: VecDeque::new(),
            destinations: DestinationList::new(),
            ssrc,
            payload_type: payload_type & 0x7F,
            clock_rate,
            contributors: Vec::new(),
            initial_timestamp: rng.gen(),
            initial_time: now,
            overflow_wraps: 0,
            sequence: rng.gen(),
            mark: false,
            config,
            packet_count: 0,
            octet_count: 0,
        }
    }

    fn trailer_length(crypto: &mut CryptoContexts, ssrc: RtpSsrc) -> Result<usize> {
        Ok(crypto
            .get_or_derive(ssrc)?
            .map(|context| context.tag_length() + context.mki_length())
            .unwrap_or(0))
    }

    fn header(&self, stamp: RtpTimestamp, sequence: RtpSequenceNumber, marker: bool) -> RtpHeader {
        let mut header = RtpHeader::new(
            self.payload_type,
            sequence,
            stamp.wrapping_add(self.initial_timestamp),
            self.ssrc,
        )
        .with_csrc(self.contributors.clone());
        header.marker = marker;
        header
    }

    /// Split `payload` into packets stamped `stamp` and queue them.
    ///
    /// Segments are at most `segment_size` (capped by the configured maximum)
    /// bytes. Only the first one carries a pending marker. Returns the number
    /// of packets queued; nothing is queued if any packet fails to build.
    pub fn put_data(
        &mut self,
        stamp: RtpTimestamp,
        payload: &[u8],
        segment_size: Option<usize>,
        crypto: &mut CryptoContexts,
    ) -> Result<usize> {
        if payload.is_empty() {
            return Ok(0);
        }
        let segment = segment_size
            .unwrap_or(self.config.max_segment_size)
            .min(self.config.max_segment_size);
        if segment == 0 {
            return Err(Error::InvalidParameter("Segment size must be positive".to_string()));
        }

        let trailer = Self::trailer_length(crypto, self.ssrc)?;
        let mut links = Vec::with_capacity((payload.len() + segment - 1) / segment);
        for (i, chunk) in payload.chunks(segment).enumerate() {
            let sequence = self.sequence.wrapping_add(i as u16);
            let header = self.header(stamp, sequence, self.mark && i == 0);
            let packet = RtpPacket::build(header, chunk, self.config.padding, trailer)?;
            links.push(SendLink { packet, stamp, protected: false });
        }

        let mut context = crypto.get_or_derive(self.ssrc)?;
        if let Some(ctx) = context.as_deref_mut() {
            for link in links.iter_mut() {
                srtp::protect(&mut link.packet, ctx.as_mut())?;
                link.protected = true;
            }
        }

        let queued = links.len();
        self.sequence = self.sequence.wrapping_add(queued as u16);
        self.mark = false;
        self.queue.extend(links);
        trace!("Queued {} packets at stamp {} ({} waiting)", queued, stamp, self.queue.len());
        Ok(queued)
    }

    /// Build one packet for `stamp` that bypasses the queue.
    ///
    /// The packet is counted as sent; the caller puts it on the wire.
    pub fn send_immediate(
        &mut self,
        stamp: RtpTimestamp,
        payload: &[u8],
        crypto: &mut CryptoContexts,
    ) -> Result<OutboundDatagram> {
        if payload.len() > self.config.max_segment_size {
            return Err(Error::InvalidParameter(format!(
                "Payload of {} bytes exceeds the maximum segment size of {}",
                payload.len(),
                self.config.max_segment_size
            )));
        }

        let trailer = Self::trailer_length(crypto, self.ssrc)?;
        let header = self.header(stamp, self.sequence, self.mark);
        let mut packet = RtpPacket::build(header, payload, self.config.padding, trailer)?;
        if let Some(ctx) = crypto.get_or_derive(self.ssrc)? {
            srtp::protect(&mut packet, ctx.as_mut())?;
        }

        self.sequence = self.sequence.wrapping_add(1);
        self.mark = false;
        self.account(&packet);
        Ok(OutboundDatagram {
            packet,
            destinations: self.destinations.data_addrs(),
        })
    }

    fn account(&mut self, packet: &RtpPacket) {
        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self.octet_count.wrapping_add(packet.payload_size() as u32);
    }

    /// Length of one full timestamp cycle at the current clock rate
    fn wrap_nanos(&self) -> i128 {
        ((1u128 << 32) * 1_000_000_000 / self.clock_rate.max(1) as u128) as i128
    }

    fn stamp_nanos(&self, stamp: RtpTimestamp) -> i128 {
        stamp as i128 * 1_000_000_000 / self.clock_rate.max(1) as i128
    }

    fn nanos_since_start(&self, now: SystemTime) -> i128 {
        match now.duration_since(self.initial_time) {
            Ok(elapsed) => elapsed.as_nanos() as i128,
            Err(e) => -(e.duration().as_nanos() as i128),
        }
    }

    /// Time until the head of the queue is due.
    ///
    /// Packets later than the expire timeout are discarded on the way and
    /// reported through [`SessionHooks::on_expire_send`]. An empty queue
    /// yields the configured scheduling timeout.
    pub fn scheduling_timeout(&mut self, now: SystemTime, hooks: &dyn SessionHooks) -> Duration {
        let schedule = self.poll_schedule(now);
        schedule.notify(hooks);
        schedule.wait
    }

    /// Like [`scheduling_timeout`](Self::scheduling_timeout), but hands the
    /// discarded packets back instead of calling the hook, so callers holding
    /// a lock can report them after releasing it.
    pub fn poll_schedule(&mut self, now: SystemTime) -> Schedule {
        let now_nanos = self.nanos_since_start(now);
        let wrap = self.wrap_nanos();
        let past = WRAP_PAST_THRESHOLD.as_nanos() as i128;
        let future = WRAP_FUTURE_THRESHOLD.as_nanos() as i128;
        let expire = self.config.expire_timeout.as_nanos() as i128;
        let mut expired = Vec::new();

        loop {
            let Some(head) = self.queue.front() else {
                return Schedule { wait: self.config.scheduling_timeout, expired };
            };

            let mut send = self.stamp_nanos(head.stamp) + self.overflow_wraps as i128 * wrap;
            while now_nanos - send > past {
                send += wrap;
                self.overflow_wraps += 1;
            }
            if send - now_nanos > future {
                send -= wrap;
                self.overflow_wraps -= 1;
            }

            let diff = send - now_nanos;
            if diff >= 0 {
                let wait = Duration::from_nanos(diff.min(u64::MAX as i128) as u64);
                return Schedule { wait: wait.min(MAX_SCHEDULING_WAIT), expired };
            }
            if -diff <= expire {
                return Schedule { wait: Duration::ZERO, expired };
            }

            if let Some(link) = self.queue.pop_front() {
                debug!(
                    "Outgoing seq {} expired before it could be sent",
                    link.packet.sequence_number()
                );
                expired.push(link.packet);
            }
        }
    }

    /// Pop the head for sending and count it as sent
    pub fn take_next(&mut self) -> Option<OutboundDatagram> {
        let link = self.queue.pop_front()?;
        self.account(&link.packet);
        Some(OutboundDatagram {
            packet: link.packet,
            destinations: self.destinations.data_addrs(),
        })
    }

    /// Send the head to every destination. Returns its payload size, or 0
    /// when nothing is queued.
    pub async fn dispatch_next(&mut self, transport: &dyn Transport) -> Result<usize> {
        match self.take_next() {
            Some(datagram) => datagram.send(transport).await,
            None => Ok(0),
        }
    }

    /// Overwrite part of the payload of a queued packet stamped `stamp`.
    ///
    /// Returns the number of bytes written, 0 when no such packet is queued
    /// or `offset` is past its payload.
    pub fn set_partial(&mut self, stamp: RtpTimestamp, data: &[u8], offset: usize) -> Result<usize> {
        let Some(link) = self.queue.iter_mut().find(|link| link.stamp == stamp) else {
            return Ok(0);
        };
        if link.protected {
            return Err(Error::InvalidParameter(format!(
                "Packet at stamp {} is already protected",
                stamp
            )));
        }
        let payload = link.packet.payload_mut();
        if offset >= payload.len() {
            return Ok(0);
        }
        let count = data.len().min(payload.len() - offset);
        payload[offset..offset + count].copy_from_slice(&data[..count]);
        Ok(count)
    }

    /// Add a destination. Returns `false` if it is already listed.
    pub fn add_destination(&mut self, destination: Destination) -> bool {
        let added = self.destinations.add(destination);
        if added {
            debug!("Added destination {}", destination.data_addr());
        }
        added
    }

    pub fn forget_destination(&mut self, destination: &Destination) -> bool {
        self.destinations.forget(destination)
    }

    pub fn destinations(&self) -> &DestinationList {
        &self.destinations
    }

    /// Add a contributing source to the CSRC list of later packets
    pub fn add_contributor(&mut self, csrc: RtpCsrc) -> Result<()> {
        if self.contributors.contains(&csrc) {
            return Ok(());
        }
        if self.contributors.len() >= RTP_MAX_CSRC {
            return Err(Error::InvalidParameter(format!(
                "CSRC list already holds {} entries",
                RTP_MAX_CSRC
            )));
        }
        self.contributors.push(csrc);
        Ok(())
    }

    pub fn remove_contributor(&mut self, csrc: RtpCsrc) -> bool {
        let before = self.contributors.len();
        self.contributors.retain(|c| *c != csrc);
        self.contributors.len() != before
    }

    pub fn contributors(&self) -> &[RtpCsrc] {
        &self.contributors
    }

    /// Set the marker on the first packet of the next `put_data`
    pub fn set_mark(&mut self, mark: bool) {
        self.mark = mark;
    }

    pub fn set_payload_format(&mut self, payload_type: u8, clock_rate: u32) -> Result<()> {
        if payload_type > 127 || clock_rate == 0 {
            return Err(Error::InvalidParameter(format!(
                "Invalid payload format {}/{}",
                payload_type, clock_rate
            )));
        }
        self.payload_type = payload_type;
        self.clock_rate = clock_rate;
        Ok(())
    }

    /// Use a new SSRC for packets queued from now on
    pub fn set_ssrc(&mut self, ssrc: RtpSsrc) {
        self.ssrc = ssrc;
    }

    pub fn ssrc(&self) -> RtpSsrc {
        self.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Sequence number the next packet will carry
    pub fn current_sequence(&self) -> RtpSequenceNumber {
        self.sequence
    }

    pub fn initial_timestamp(&self) -> RtpTimestamp {
        self.initial_timestamp
    }

    /// Application stamp corresponding to `now`
    pub fn current_stamp(&self, now: SystemTime) -> RtpTimestamp {
        let elapsed = now.duration_since(self.initial_time).unwrap_or(Duration::ZERO);
        duration_to_rtp_units(elapsed, self.clock_rate)
    }

    /// Wire timestamp corresponding to `now`, as carried in sender reports
    pub fn rtp_timestamp_at(&self, now: SystemTime) -> RtpTimestamp {
        self.current_stamp(now).wrapping_add(self.initial_timestamp)
    }

    /// Packets sent so far (wraps at 2^32)
    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    /// Payload octets sent so far (wraps at 2^32)
    pub fn octet_count(&self) -> u32 {
        self.octet_count
    }

    /// Discard everything queued
    pub fn purge(&mut self) {
        debug!("Purging {} outgoing packets", self.queue.len());
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SendLink> + '_ {
        self.queue.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::hooks::NoopHooks;
    use crate::srtp::{CryptoContext, SrtpContext, SrtpCryptoKey, SRTP_AES128_CM_SHA1_80, WILDCARD_SSRC};
    use crate::transport::testing::MemoryTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SSRC: RtpSsrc = 0x5151_0001;

    fn queue(now: SystemTime) -> OutgoingQueue {
        OutgoingQueue::new(SSRC, 0, 8000, OutboundConfig::default(), now)
    }

    #[derive(Default)]
    struct CountingHooks {
        expired: AtomicUsize,
    }

    impl SessionHooks for CountingHooks {
        fn on_expire_send(&self, _packet: &RtpPacket) {
            self.expired.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_segmentation_and_marker() {
        let now = SystemTime::now();
        let mut q = queue(now);
        let mut crypto = CryptoContexts::new();
        let first_seq = q.current_sequence();

        q.set_mark(true);
        let payload: Vec<u8> = (0..250u8).collect();
        assert_eq!(q.put_data(160, &payload, Some(100), &mut crypto).unwrap(), 3);
        assert_eq!(q.len(), 3);
        assert_eq!(q.current_sequence(), first_seq.wrapping_add(3));

        let links: Vec<&SendLink> = q.iter().collect();
        assert!(links[0].packet.header.marker);
        assert!(!links[1].packet.header.marker);
        assert_eq!(links[2].packet.payload(), &payload[200..]);
        for (i, link) in links.iter().enumerate() {
            assert_eq!(link.packet.sequence_number(), first_seq.wrapping_add(i as u16));
            assert_eq!(link.packet.timestamp(), 160u32.wrapping_add(q.initial_timestamp()));
            assert_eq!(link.packet.ssrc(), SSRC);
        }

        // The marker does not carry over to the next frame
        q.put_data(320, b"next", None, &mut crypto).unwrap();
        assert!(!q.iter().last().unwrap().packet.header.marker);
        assert_eq!(q.put_data(480, b"", None, &mut crypto).unwrap(), 0);
    }

    #[test]
    fn test_contributors_and_padding() {
        let now = SystemTime::now();
        let config = OutboundConfig { padding: 8, ..OutboundConfig::default() };
        let mut q = OutgoingQueue::new(SSRC, 96, 90000, config, now);
        let mut crypto = CryptoContexts::new();
        q.add_contributor(7).unwrap();
        q.add_contributor(7).unwrap();
        q.add_contributor(9).unwrap();
        assert!(q.remove_contributor(9));
        assert!(!q.remove_contributor(9));

        q.put_data(0, b"abc", None, &mut crypto).unwrap();
        let link = q.iter().next().unwrap();
        assert_eq!(link.packet.header.csrc, vec![7]);
        assert_eq!(link.packet.header.payload_type, 96);
        assert_eq!(link.packet.size() % 8, 0);

        for csrc in 100..114 {
            q.add_contributor(csrc).unwrap();
        }
        assert!(q.add_contributor(200).is_err());
    }

    #[test]
    fn test_scheduling_timeout() {
        let start = SystemTime::now();
        let mut q = queue(start);
        let mut crypto = CryptoContexts::new();
        let hooks = NoopHooks;

        assert_eq!(q.scheduling_timeout(start, &hooks), Duration::from_millis(8));

        // Stamp 8000 at 8 kHz is due one second after the start
        q.put_data(8000, b"later", None, &mut crypto).unwrap();
        let wait = q.scheduling_timeout(start + Duration::from_millis(250), &hooks);
        assert_eq!(wait, Duration::from_millis(750));

        // Late but within the expire timeout: send now
        assert_eq!(q.scheduling_timeout(start + Duration::from_secs(30), &hooks), Duration::ZERO);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_scheduling_caps_long_waits() {
        let start = SystemTime::now();
        let mut q = queue(start);
        let mut crypto = CryptoContexts::new();

        // Two hours ahead
        q.put_data(8000 * 7200, b"far", None, &mut crypto).unwrap();
        assert_eq!(q.scheduling_timeout(start, &NoopHooks), Duration::from_secs(3600));
    }

    #[test]
    fn test_scheduling_expires_stale_packets() {
        let start = SystemTime::now();
        let mut q = queue(start);
        let mut crypto = CryptoContexts::new();
        let hooks = CountingHooks::default();

        q.put_data(0, b"stale", None, &mut crypto).unwrap();
        q.put_data(8000 * 100, b"fresh", None, &mut crypto).unwrap();

        // 60 s late is beyond the 40 s expire timeout
        let wait = q.scheduling_timeout(start + Duration::from_secs(60), &hooks);
        assert_eq!(hooks.expired.load(Ordering::SeqCst), 1);
        assert_eq!(q.len(), 1);
        assert_eq!(wait, Duration::from_secs(40));
    }

    #[test]
    fn test_poll_schedule_hands_back_expired() {
        let start = SystemTime::now();
        let mut q = queue(start);
        let mut crypto = CryptoContexts::new();
        q.put_data(0, b"stale", None, &mut crypto).unwrap();
        q.put_data(8000 * 60, b"due", None, &mut crypto).unwrap();

        let schedule = q.poll_schedule(start + Duration::from_secs(60));
        assert_eq!(schedule.wait, Duration::ZERO);
        assert_eq!(schedule.expired.len(), 1);
        assert_eq!(schedule.expired[0].payload(), b"stale");
        assert_eq!(q.len(), 1);

        let hooks = CountingHooks::default();
        schedule.notify(&hooks);
        assert_eq!(hooks.expired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_counts_and_destinations() {
        let now = SystemTime::now();
        let mut q = queue(now);
        let mut crypto = CryptoContexts::new();
        let transport = MemoryTransport::new("127.0.0.1:4000".parse().unwrap());

        assert_eq!(q.dispatch_next(&transport).await.unwrap(), 0);

        let a = Destination::new("192.0.2.10".parse().unwrap(), 5004, None);
        let b = Destination::new("192.0.2.11".parse().unwrap(), 6004, None);
        assert!(q.add_destination(a));
        assert!(!q.add_destination(a));
        assert!(q.add_destination(b));

        q.put_data(0, &[1u8; 160], None, &mut crypto).unwrap();
        assert_eq!(q.dispatch_next(&transport).await.unwrap(), 160);
        assert!(q.is_empty());
        assert_eq!(q.packet_count(), 1);
        assert_eq!(q.octet_count(), 160);

        let sent = transport.sent_data();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, a.data_addr());
        assert_eq!(sent[1].1, b.data_addr());
        let packet = RtpPacket::parse(&sent[0].0).unwrap();
        assert_eq!(packet.payload(), &[1u8; 160][..]);

        assert!(q.forget_destination(&b));
        assert_eq!(q.destinations().len(), 1);
    }

    #[test]
    fn test_send_immediate_bypasses_queue() {
        let now = SystemTime::now();
        let mut q = queue(now);
        let mut crypto = CryptoContexts::new();
        q.add_destination(Destination::new("192.0.2.10".parse().unwrap(), 5004, None));
        let seq = q.current_sequence();

        let datagram = q.send_immediate(40, b"now", &mut crypto).unwrap();
        assert!(q.is_empty());
        assert_eq!(datagram.packet.sequence_number(), seq);
        assert_eq!(datagram.destinations.len(), 1);
        assert_eq!(q.current_sequence(), seq.wrapping_add(1));
        assert_eq!(q.packet_count(), 1);
        assert_eq!(q.octet_count(), 3);
    }

    #[test]
    fn test_set_partial() {
        let now = SystemTime::now();
        let mut q = queue(now);
        let mut crypto = CryptoContexts::new();
        q.put_data(160, b"hello world", None, &mut crypto).unwrap();

        assert_eq!(q.set_partial(160, b"HELLO", 0).unwrap(), 5);
        assert_eq!(q.set_partial(160, b"WORLD!!", 6).unwrap(), 5);
        assert_eq!(q.set_partial(160, b"x", 11).unwrap(), 0);
        assert_eq!(q.set_partial(320, b"x", 0).unwrap(), 0);
        assert_eq!(q.iter().next().unwrap().packet.payload(), b"HELLO WORLD");
    }

    #[test]
    fn test_protected_packets() {
        let now = SystemTime::now();
        let mut q = queue(now);
        let mut crypto = CryptoContexts::new();
        let key = SrtpCryptoKey::new((0u8..16).collect(), (100u8..114).collect());
        let template = SrtpContext::new(WILDCARD_SSRC, 0, 0, SRTP_AES128_CM_SHA1_80, key).unwrap();
        crypto.insert(Box::new(template));

        q.put_data(0, b"secret", None, &mut crypto).unwrap();
        assert_eq!(crypto.len(), 2);
        let sealed = {
            let link = q.iter().next().unwrap();
            assert_eq!(link.packet.trailer_size(), 10);
            assert_ne!(link.packet.payload(), b"secret");
            link.packet.as_bytes().to_vec()
        };
        assert!(q.set_partial(0, b"x", 0).is_err());

        let mut receiver = crypto.get(WILDCARD_SSRC).unwrap().derive_for_ssrc(SSRC, 0, 0);
        receiver.derive_keys(0).unwrap();
        let mut received = RtpPacket::parse(&sealed).unwrap();
        srtp::unprotect(&mut received, receiver.as_mut()).unwrap();
        assert_eq!(received.payload(), b"secret");
    }

    #[test]
    fn test_payload_format() {
        let mut q = queue(SystemTime::now());
        assert!(q.set_payload_format(200, 8000).is_err());
        assert!(q.set_payload_format(8, 0).is_err());
        q.set_payload_format(8, 16000).unwrap();
        assert_eq!(q.payload_type(), 8);
        assert_eq!(q.clock_rate(), 16000);
    }
}
