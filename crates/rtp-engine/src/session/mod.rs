//! RTP session
//!
//! [`RtpSession`] ties the queues, the source registry, the RTCP engine and
//! the crypto contexts to a [`Transport`], and drives them from a single
//! service loop ([`RtpSession::run`]).
//!
//! Every component sits behind its own lock. Locks are taken in the order
//! inbound, rtcp, registry, conflicts, crypto; the outbound queue is only
//! locked on its own or after the registry. No lock is held across an
//! `.await`.

pub mod config;
pub mod hooks;

pub use config::{InboundConfig, OutboundConfig, RtcpConfig, SdesConfig, SessionConfig, SessionConfigBuilder};
pub use hooks::{NoopHooks, RandomSsrc, SessionHooks, SsrcGenerator};

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::inbound::{Admission, AdmissionContext, DropCounts, IncomingQueue, ReceivedPacket};
use crate::outbound::OutgoingQueue;
use crate::packet::rtcp::RtcpSdesItemType;
use crate::rtcp::{ByeSchedule, ControlAdmission, ControlContext, RtcpEngine, SenderState};
use crate::source::{ConflictList, SourceRegistry, SourceState};
use crate::srtp::{CryptoContext, CryptoContexts};
use crate::stats::SourceStats;
use crate::transport::{send_to_all, Destination, Transport};
use crate::{Result, RtpCsrc, RtpSsrc, RtpTimestamp};

/// BYE reason sent when another participant uses our SSRC for data
pub const DATA_COLLISION_REASON: &str = "SSRC collision detected when receiving data packet.";

/// BYE reason sent when another participant uses our SSRC for RTCP
pub const CONTROL_COLLISION_REASON: &str = "SSRC collision detected when receiving RTCP packet.";

/// Attempts at drawing a local SSRC nobody in the session uses
const MAX_SSRC_TRIES: usize = 20;

/// Control datagrams handled per service round
const MAX_CONTROL_PER_ROUND: usize = 32;

/// Conflict list entries live this many RTCP intervals
const CONFLICT_INTERVALS: u32 = 10;

/// One RTP session: a local source, its peers and the queues between them
pub struct RtpSession {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    hooks: Arc<dyn SessionHooks>,
    ssrc_generator: Arc<dyn SsrcGenerator>,

    local_ssrc: AtomicU32,
    local_data_addr: Option<SocketAddr>,
    local_control_addr: Option<SocketAddr>,

    inbound: RwLock<IncomingQueue>,
    outbound: RwLock<OutgoingQueue>,
    registry: RwLock<SourceRegistry>,
    conflicts: RwLock<ConflictList>,
    inbound_crypto: RwLock<CryptoContexts>,
    outbound_crypto: RwLock<CryptoContexts>,
    rtcp: Mutex<RtcpEngine>,

    cancel: CancellationToken,
}

impl std::fmt::Debug for RtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpSession")
            .field("local_ssrc", &format_args!("{:08x}", self.local_ssrc()))
            .field("local_data_addr", &self.local_data_addr)
            .field("members", &self.members_count())
            .finish()
    }
}

impl RtpSession {
    /// Create a session with no-op hooks and random SSRCs
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_hooks(config, transport, Arc::new(NoopHooks), Arc::new(RandomSsrc))
    }

    /// Create a session with application hooks and an SSRC source
    pub fn with_hooks(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        hooks: Arc<dyn SessionHooks>,
        ssrc_generator: Arc<dyn SsrcGenerator>,
    ) -> Result<Self> {
        config.validate()?;
        let now = SystemTime::now();
        let local_ssrc = ssrc_generator.next_ssrc();
        let local_data_addr = transport.local_data_addr().ok();
        let local_control_addr = transport.local_control_addr().ok();

        let mut registry = SourceRegistry::new(config.membership_buckets);
        Self::register_local(&mut registry, local_ssrc, &config.sdes, local_data_addr, local_control_addr);

        let inbound = IncomingQueue::new(
            config.inbound.sequence,
            config.clock_rate,
            config.inbound.end_to_end_delay,
        );
        let outbound = OutgoingQueue::new(
            local_ssrc,
            config.payload_type,
            config.clock_rate,
            config.outbound.clone(),
            now,
        );
        let rtcp = RtcpEngine::new(config.rtcp.clone(), now);

        info!(
            "RTP session created: SSRC {:08x}, PT {}, {} Hz, CNAME {}",
            local_ssrc, config.payload_type, config.clock_rate, config.sdes.cname
        );

        Ok(Self {
            config,
            transport,
            hooks,
            ssrc_generator,
            local_ssrc: AtomicU32::new(local_ssrc),
            local_data_addr,
            local_control_addr,
            inbound: RwLock::new(inbound),
            outbound: RwLock::new(outbound),
            registry: RwLock::new(registry),
            conflicts: RwLock::new(ConflictList::new()),
            inbound_crypto: RwLock::new(CryptoContexts::new()),
            outbound_crypto: RwLock::new(CryptoContexts::new()),
            rtcp: Mutex::new(rtcp),
            cancel: CancellationToken::new(),
        })
    }

    fn register_local(
        registry: &mut SourceRegistry,
        ssrc: RtpSsrc,
        sdes: &SdesConfig,
        data_addr: Option<SocketAddr>,
        control_addr: Option<SocketAddr>,
    ) {
        let (record, _) = registry.get_or_create(ssrc);
        record.data_addr = data_addr;
        record.control_addr = control_addr;
        for item in std::iter::once(RtcpSdesItemType::CName).chain(RtcpSdesItemType::ROTATION) {
            if let Some(value) = sdes.item(item) {
                record.participant.set(item, value);
            }
        }
        registry.set_state(ssrc, SourceState::Valid);
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn local_ssrc(&self) -> RtpSsrc {
        self.local_ssrc.load(Ordering::Acquire)
    }

    /// Token that stops [`RtpSession::run`] when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // Destinations and outgoing stream parameters

    /// Add a peer. The control port defaults to `data_port + 1`. Returns
    /// `false` if the destination is already listed.
    pub fn add_destination(&self, addr: IpAddr, data_port: u16, control_port: Option<u16>) -> bool {
        self.outbound.write().add_destination(Destination::new(addr, data_port, control_port))
    }

    /// Remove a peer added with the same addresses
    pub fn forget_destination(&self, addr: IpAddr, data_port: u16, control_port: Option<u16>) -> bool {
        self.outbound.write().forget_destination(&Destination::new(addr, data_port, control_port))
    }

    pub fn set_mark(&self, mark: bool) {
        self.outbound.write().set_mark(mark);
    }

    pub fn add_contributor(&self, csrc: RtpCsrc) -> Result<()> {
        self.outbound.write().add_contributor(csrc)
    }

    pub fn remove_contributor(&self, csrc: RtpCsrc) -> bool {
        self.outbound.write().remove_contributor(csrc)
    }

    /// Change the payload type and clock rate of both directions
    pub fn set_payload_format(&self, payload_type: u8, clock_rate: u32) -> Result<()> {
        self.outbound.write().set_payload_format(payload_type, clock_rate)?;
        self.inbound.write().set_clock_rate(clock_rate);
        Ok(())
    }

    /// Key the outgoing stream. A context for SSRC 0 is used as a template.
    pub fn set_outbound_crypto(&self, context: Box<dyn CryptoContext>) {
        self.outbound_crypto.write().insert(context);
    }

    /// Key incoming streams. A context for SSRC 0 is derived for every
    /// source without one of its own.
    pub fn set_inbound_crypto(&self, context: Box<dyn CryptoContext>) {
        self.inbound_crypto.write().insert(context);
    }

    pub fn remove_inbound_crypto(&self, ssrc: RtpSsrc) -> bool {
        self.inbound_crypto.write().remove(ssrc)
    }

    pub fn remove_outbound_crypto(&self, ssrc: RtpSsrc) -> bool {
        self.outbound_crypto.write().remove(ssrc)
    }

    // Sending

    /// Application stamp corresponding to the current time
    pub fn current_stamp(&self) -> RtpTimestamp {
        self.outbound.read().current_stamp(SystemTime::now())
    }

    /// Queue `payload` for sending at `stamp`, split into segments of the
    /// configured maximum size. Returns the number of packets queued.
    pub fn put_data(&self, stamp: RtpTimestamp, payload: &[u8]) -> Result<usize> {
        self.put_data_segmented(stamp, payload, None)
    }

    pub fn put_data_segmented(&self, stamp: RtpTimestamp, payload: &[u8], segment_size: Option<usize>) -> Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(Error::SessionError("service loop stopped, queued data would never be sent".to_string()));
        }
        let mut outbound = self.outbound.write();
        let mut crypto = self.outbound_crypto.write();
        outbound.put_data(stamp, payload, segment_size, &mut crypto)
    }

    /// Build and send one packet right away, bypassing the queue. Returns
    /// the payload size.
    pub async fn send_immediate(&self, stamp: RtpTimestamp, payload: &[u8]) -> Result<usize> {
        let datagram = {
            let mut outbound = self.outbound.write();
            let mut crypto = self.outbound_crypto.write();
            outbound.send_immediate(stamp, payload, &mut crypto)?
        };
        datagram.send(self.transport.as_ref()).await
    }

    /// Overwrite payload bytes of a queued packet stamped `stamp`
    pub fn set_partial(&self, stamp: RtpTimestamp, data: &[u8], offset: usize) -> Result<usize> {
        self.outbound.write().set_partial(stamp, data, offset)
    }

    /// Send every queued packet whose deadline has arrived. Returns the
    /// number of packets sent.
    pub async fn dispatch_data(&self) -> Result<usize> {
        let mut sent = 0;
        loop {
            let (schedule, datagram) = {
                let mut outbound = self.outbound.write();
                let schedule = outbound.poll_schedule(SystemTime::now());
                let datagram = if schedule.wait.is_zero() { outbound.take_next() } else { None };
                (schedule, datagram)
            };
            schedule.notify(self.hooks.as_ref());
            let Some(datagram) = datagram else {
                break;
            };
            datagram.send(self.transport.as_ref()).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Time until the next queued packet is due
    pub fn next_data_deadline(&self) -> Duration {
        let schedule = self.outbound.write().poll_schedule(SystemTime::now());
        schedule.notify(self.hooks.as_ref());
        schedule.wait
    }

    pub fn outgoing_len(&self) -> usize {
        self.outbound.read().len()
    }

    pub fn packet_count(&self) -> u32 {
        self.outbound.read().packet_count()
    }

    pub fn octet_count(&self) -> u32 {
        self.outbound.read().octet_count()
    }

    // Receiving

    /// Read one datagram from the data channel and run it through admission
    pub async fn data_reception_service(&self) -> Result<Admission> {
        let mut buffer = vec![0u8; self.config.inbound.max_packet_size];
        let (len, from) = self.transport.recv_data(&mut buffer).await?;
        let admission = self.admit_data(&buffer[..len], from, SystemTime::now());
        if admission == Admission::LocalCollision {
            self.resolve_local_collision(DATA_COLLISION_REASON).await?;
        }
        Ok(admission)
    }

    fn admit_data(&self, datagram: &[u8], from: SocketAddr, now: SystemTime) -> Admission {
        let local_ssrc = self.local_ssrc();
        let mut inbound = self.inbound.write();
        let mut registry = self.registry.write();
        let mut conflicts = self.conflicts.write();
        let mut crypto = self.inbound_crypto.write();
        let ctx = AdmissionContext {
            registry: &mut registry,
            crypto: &mut crypto,
            conflicts: &mut conflicts,
            local_ssrc,
            local_addr: self.local_data_addr,
            hooks: self.hooks.as_ref(),
        };
        inbound.admit(datagram, from, now, ctx)
    }

    /// Remove and return every received packet with a timestamp at or
    /// before `timestamp`, for one source or all of them
    pub fn take_ready(&self, timestamp: RtpTimestamp, source: Option<RtpSsrc>) -> Vec<ReceivedPacket> {
        let mut inbound = self.inbound.write();
        let registry = self.registry.read();
        inbound.take_ready(timestamp, source, SystemTime::now(), &registry, self.hooks.as_ref())
    }

    /// Return the oldest packet not newer than `timestamp`, discarding
    /// anything older
    pub fn get_data(&self, timestamp: RtpTimestamp, source: Option<RtpSsrc>) -> Option<ReceivedPacket> {
        let mut inbound = self.inbound.write();
        let registry = self.registry.read();
        inbound.get_data(timestamp, source, SystemTime::now(), &registry, self.hooks.as_ref())
    }

    pub fn is_waiting(&self, source: Option<RtpSsrc>) -> bool {
        self.inbound.read().is_waiting(source)
    }

    pub fn first_timestamp(&self, source: Option<RtpSsrc>) -> Option<RtpTimestamp> {
        self.inbound.read().first_timestamp(source)
    }

    pub fn incoming_len(&self) -> usize {
        self.inbound.read().len()
    }

    pub fn drop_counts(&self) -> DropCounts {
        self.inbound.read().drop_counts()
    }

    // Membership

    pub fn members_count(&self) -> u32 {
        self.registry.read().members_count()
    }

    pub fn senders_count(&self) -> u32 {
        self.registry.read().senders_count()
    }

    /// SSRCs of all known sources, local one included, in arrival order
    pub fn sources(&self) -> Vec<RtpSsrc> {
        self.registry.read().ssrcs()
    }

    /// CNAME a source announced
    pub fn source_cname(&self, ssrc: RtpSsrc) -> Option<String> {
        self.registry.read().get(ssrc)?.participant.cname().map(str::to_string)
    }

    pub fn source_state(&self, ssrc: RtpSsrc) -> Option<SourceState> {
        self.registry.read().get(ssrc).map(|r| r.state())
    }

    /// Reception statistics for a remote source
    pub fn source_stats(&self, ssrc: RtpSsrc) -> Option<SourceStats> {
        let clock_rate = self.inbound.read().clock_rate();
        let registry = self.registry.read();
        let record = registry.get(ssrc)?;
        Some(SourceStats::from_reception(ssrc, &record.stats, record.last_fraction_lost, clock_rate))
    }

    // Control

    /// Read one datagram from the control channel and apply it
    pub async fn control_reception_service(&self) -> Result<ControlAdmission> {
        let size = self.config.inbound.max_packet_size.max(self.config.rtcp.path_mtu);
        let mut buffer = vec![0u8; size];
        let (len, from) = self.transport.recv_control(&mut buffer).await?;
        let outcome = self.take_in_control(&buffer[..len], from, SystemTime::now());
        if outcome == ControlAdmission::LocalCollision {
            self.resolve_local_collision(CONTROL_COLLISION_REASON).await?;
        }
        Ok(outcome)
    }

    fn take_in_control(&self, datagram: &[u8], from: SocketAddr, now: SystemTime) -> ControlAdmission {
        let local_ssrc = self.local_ssrc();
        let mut rtcp = self.rtcp.lock();
        let mut registry = self.registry.write();
        let mut conflicts = self.conflicts.write();
        let ctx = ControlContext {
            registry: &mut registry,
            conflicts: &mut conflicts,
            local_ssrc,
            local_addr: self.local_control_addr,
            hooks: self.hooks.as_ref(),
        };
        rtcp.take_in_control_packet(datagram, from, now, ctx)
    }

    fn sender_state(&self, now: SystemTime) -> SenderState {
        let outbound = self.outbound.read();
        SenderState {
            packet_count: outbound.packet_count(),
            octet_count: outbound.octet_count(),
            rtp_timestamp: outbound.rtp_timestamp_at(now),
        }
    }

    /// Send the periodic report if it is due. Returns `true` when one went
    /// out.
    pub async fn control_transmission_service(&self, now: SystemTime) -> Result<bool> {
        let sender = self.sender_state(now);
        let local_ssrc = self.local_ssrc();
        let (report, conflict_age) = {
            let mut rtcp = self.rtcp.lock();
            let mut registry = self.registry.write();
            let report = rtcp.control_transmission_service(now, sender, &mut registry, local_ssrc, &self.config.sdes)?;
            let age = rtcp.deterministic_interval(registry.members_count(), registry.senders_count()) * CONFLICT_INTERVALS;
            (report, age)
        };
        let Some(report) = report else {
            return Ok(false);
        };

        if !report.expired.is_empty() {
            let mut inbound = self.inbound.write();
            let mut crypto = self.inbound_crypto.write();
            for &ssrc in &report.expired {
                let dropped = inbound.remove_source(ssrc);
                crypto.remove(ssrc);
                trace!("Dropped {} queued packets of expired source {:08x}", dropped, ssrc);
            }
        }
        self.conflicts.write().expire(now, conflict_age);

        let destinations = self.outbound.read().destinations().control_addrs();
        send_to_all(self.transport.as_ref(), &report.bytes, &destinations, true).await?;
        Ok(true)
    }

    /// Time of the next scheduled report
    pub fn next_report_time(&self) -> SystemTime {
        self.rtcp.lock().next_transmission()
    }

    // Leaving and collisions

    async fn send_bye(&self, reason: Option<&str>) -> Result<usize> {
        let local_ssrc = self.local_ssrc();
        let bytes = self.rtcp.lock().build_bye(local_ssrc, reason).serialize()?;
        let destinations = self.outbound.read().destinations().control_addrs();
        let written = send_to_all(self.transport.as_ref(), &bytes, &destinations, true).await?;
        debug!("Sent BYE for {:08x} to {} destinations", local_ssrc, destinations.len());
        Ok(written)
    }

    /// Send a BYE for the local source. Returns the bytes written, 0 when
    /// nothing was ever sent in this session.
    ///
    /// In sessions of more than 50 members the BYE waits for its own
    /// reconsidered transmission time, counting only other BYEs meanwhile.
    pub async fn dispatch_bye(&self, reason: Option<&str>) -> Result<usize> {
        let now = SystemTime::now();
        let packets_sent = self.outbound.read().packet_count();
        let members = self.registry.read().members_count();
        let schedule = self.rtcp.lock().schedule_bye(now, members, packets_sent, reason);

        match schedule {
            ByeSchedule::Never => return Ok(0),
            ByeSchedule::Immediate => {}
            ByeSchedule::Deferred(mut at) => loop {
                let wait = at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                let next = self.rtcp.lock().bye_reconsideration(SystemTime::now());
                match next {
                    Some(later) => at = later,
                    None => break,
                }
            },
        }
        self.send_bye(reason).await
    }

    /// Leave the session: send the BYE, wait the leaving delay and stop the
    /// service loop.
    pub async fn leave(&self, reason: Option<&str>) -> Result<()> {
        let written = self.dispatch_bye(reason).await?;
        if written > 0 {
            tokio::time::sleep(self.config.rtcp.leaving_delay).await;
        }
        self.outbound.write().purge();
        self.cancel.cancel();
        info!("Left RTP session as {:08x}", self.local_ssrc());
        Ok(())
    }

    async fn resolve_local_collision(&self, reason: &str) -> Result<()> {
        let packets_sent = self.outbound.read().packet_count();
        let reports_sent = self.rtcp.lock().reports_sent();
        if packets_sent > 0 || reports_sent > 0 {
            self.send_bye(Some(reason)).await?;
        }
        self.renew_local_ssrc()?;
        Ok(())
    }

    /// Pick a new local SSRC that no known source uses.
    ///
    /// The old local record is dropped so the colliding participant is
    /// learned afresh. Packets already queued keep the old SSRC.
    pub fn renew_local_ssrc(&self) -> Result<RtpSsrc> {
        let old = self.local_ssrc();
        let mut registry = self.registry.write();
        let candidate = (0..MAX_SSRC_TRIES)
            .map(|_| self.ssrc_generator.next_ssrc())
            .find(|&ssrc| ssrc != old && !registry.is_registered(ssrc))
            .ok_or_else(|| {
                Error::ResourceExhausted(format!("No free SSRC after {} attempts", MAX_SSRC_TRIES))
            })?;

        registry.remove(old);
        Self::register_local(
            &mut registry,
            candidate,
            &self.config.sdes,
            self.local_data_addr,
            self.local_control_addr,
        );
        self.local_ssrc.store(candidate, Ordering::Release);
        self.outbound.write().set_ssrc(candidate);
        warn!("Local SSRC renewed: {:08x} -> {:08x}", old, candidate);
        Ok(candidate)
    }

    // Service loop

    async fn service_control(&self) {
        for _ in 0..MAX_CONTROL_PER_ROUND {
            match self.transport.control_readable(Duration::ZERO).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!("Control channel error: {}", e);
                    break;
                }
            }
            if let Err(e) = self.control_reception_service().await {
                warn!("Failed to receive RTCP: {}", e);
                break;
            }
        }
        if let Err(e) = self.control_transmission_service(SystemTime::now()).await {
            warn!("Failed to send RTCP report: {}", e);
        }
    }

    /// Drive the session until its cancellation token fires.
    ///
    /// Each round waits for data with a timeout of the next send deadline
    /// (at most the RTCP check interval), admits what arrived, services the
    /// control channel at the check cadence and sends due packets.
    pub async fn run(&self) -> Result<()> {
        let check_interval = self.config.rtcp.check_interval;
        let mut next_check = SystemTime::now();
        debug!("RTP session {:08x} service loop started", self.local_ssrc());

        loop {
            let wait = self.next_data_deadline().min(check_interval);
            let readable = tokio::select! {
                _ = self.cancel.cancelled() => break,
                readable = self.transport.data_readable(wait) => readable,
            };

            match readable {
                Ok(true) => {
                    if let Err(e) = self.data_reception_service().await {
                        warn!("Failed to receive RTP: {}", e);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Data channel error: {}", e),
            }

            let now = SystemTime::now();
            if now >= next_check {
                self.service_control().await;
                next_check = now + check_interval;
            }

            if let Err(e) = self.dispatch_data().await {
                warn!("Failed to send RTP: {}", e);
            }
        }

        debug!("RTP session {:08x} service loop stopped", self.local_ssrc());
        Ok(())
    }
}
