// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for the engine's integration tests and benches:
//! packet builders, capturing providers and a harness tying them to a
//! [`Pf`] with a hand-driven clock.

pub use pf::api::*;
pub use pf::ddi::time::Clock;
pub use pf::engine::Outcome;
pub use pf::engine::Pf;
pub use pf::engine::eval::EvalMode;
pub use pf::engine::nat::Pool;
pub use pf::engine::nat::PoolAddr;
pub use pf::engine::packet::ICMP_ECHO;
pub use pf::engine::packet::ICMP6_ECHO_REQUEST;
pub use pf::engine::packet::IcmpHdr;
pub use pf::engine::packet::L4;
pub use pf::engine::packet::Packet;
pub use pf::engine::packet::Quoted;
pub use pf::engine::packet::TcpHdr;
pub use pf::engine::packet::UdpHdr;
pub use pf::engine::predicate::RuleAddr;
pub use pf::engine::rule::Rule;
pub use pf::engine::ruleset::Anchor;
pub use pf::engine::ruleset::Ruleset;
pub use pf::engine::stat::Counter;
pub use pf::engine::table::AddrTable;
pub use pf::provider::FlowExport;
pub use pf::provider::IcmpReply;
pub use pf::provider::PacketLog;
pub use pf::provider::PacketSender;
pub use pf::provider::PrintlnLog;
pub use pf::provider::Providers;
pub use pf::provider::StateSync;
pub use pf::provider::TcpReply;
pub use std::net::IpAddr;
pub use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// The interface every harness packet is seen on.
pub const IFNAME: &str = "em0";

/// The window advertised by built TCP segments.
pub const TEST_WIN: u16 = 65535;

/// Expects that a packet got the given action.
#[macro_export]
macro_rules! expect_action {
    ($out:expr, $action:expr) => {
        let out = $out;
        assert_eq!(
            out.action, $action,
            "expected {:?}, got {:?}",
            $action, out
        );
    };
}

/// Expects that a packet was dropped for the given reason.
#[macro_export]
macro_rules! expect_drop {
    ($out:expr, $reason:expr) => {
        let out = $out;
        assert!(
            out.action == $crate::Action::Drop && out.reason == $reason,
            "expected drop ({}), got {:?}",
            $reason,
            out
        );
    };
}

/// Parse an address, returning it with its family.
pub fn addr(s: &str) -> (Af, PfAddr) {
    let ip: IpAddr = s.parse().unwrap();
    PfAddr::from_ip(ip)
}

pub fn cidr(s: &str) -> PfCidr {
    s.parse().unwrap()
}

fn ip_pkt(src: &str, dst: &str, proto: Protocol, l4: L4) -> Packet {
    let (af, src) = addr(src);
    let (_, dst) = addr(dst);
    Packet::new(af, src, dst, proto, l4, vec![])
}

/// A TCP segment with the given flags and sequence numbers.
pub fn tcp_pkt(
    src: (&str, u16),
    dst: (&str, u16),
    flags: TcpFlags,
    seq: u32,
    ack: u32,
) -> Packet {
    let mut t = TcpHdr::new(src.1, dst.1, flags);
    t.seq = seq;
    t.ack = ack;
    t.win = TEST_WIN;
    ip_pkt(src.0, dst.0, Protocol::TCP, L4::Tcp(t))
}

pub fn tcp_syn(src: (&str, u16), dst: (&str, u16), seq: u32) -> Packet {
    tcp_pkt(src, dst, TcpFlags::SYN, seq, 0)
}

pub fn udp_pkt(src: (&str, u16), dst: (&str, u16)) -> Packet {
    let (af, s) = addr(src.0);
    let (_, d) = addr(dst.0);
    let l4 = L4::Udp(UdpHdr { sport: src.1, dport: dst.1, sum: 0 });
    Packet::new(af, s, d, Protocol::UDP, l4, vec![0; 32])
}

/// An echo request, or an echo reply if `reply` is set.
pub fn icmp_echo(src: &str, dst: &str, id: u16, reply: bool) -> Packet {
    let (af, s) = addr(src);
    let (_, d) = addr(dst);
    let ty = match (af, reply) {
        (Af::Inet, false) => ICMP_ECHO,
        (Af::Inet, true) => 0,
        (Af::Inet6, false) => ICMP6_ECHO_REQUEST,
        (Af::Inet6, true) => ICMP6_ECHO_REQUEST + 1,
    };
    let icmp =
        IcmpHdr { ty, code: 0, sum: 0, id, seq: 1, inner: None };
    Packet::new(af, s, d, af.icmp_proto(), L4::Icmp(icmp), vec![0; 8])
}

/// An ICMP error sent by `from` about `orig`, addressed to the
/// original sender.
pub fn icmp_error_for(from: &str, orig: &Packet, ty: u8, code: u8) -> Packet {
    let (af, s) = addr(from);
    let icmp = IcmpHdr {
        ty,
        code,
        sum: 0,
        id: 0,
        seq: 0,
        inner: Some(Box::new(Quoted::of(orig))),
    };
    Packet::new(af, s, orig.src, af.icmp_proto(), L4::Icmp(icmp), vec![])
}

/// A clock moved by hand. Clones share the same time.
#[derive(Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self(Arc::new(AtomicU64::new(now)))
    }

    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::Relaxed);
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn uptime(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Records every generated reply.
#[derive(Clone, Default)]
pub struct CaptureSender {
    tcp: Arc<Mutex<Vec<TcpReply>>>,
    icmp: Arc<Mutex<Vec<IcmpReply>>>,
}

impl CaptureSender {
    pub fn tcp(&self) -> Vec<TcpReply> {
        self.tcp.lock().unwrap().clone()
    }

    pub fn icmp(&self) -> Vec<IcmpReply> {
        self.icmp.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.tcp.lock().unwrap().clear();
        self.icmp.lock().unwrap().clear();
    }
}

impl PacketSender for CaptureSender {
    fn send_tcp(&self, reply: TcpReply) {
        self.tcp.lock().unwrap().push(reply);
    }

    fn send_icmp(&self, reply: IcmpReply) {
        self.icmp.lock().unwrap().push(reply);
    }
}

/// Records packet log entries.
#[derive(Clone, Default)]
pub struct CaptureLog(Arc<Mutex<Vec<PacketLogRecord>>>);

impl CaptureLog {
    pub fn records(&self) -> Vec<PacketLogRecord> {
        self.0.lock().unwrap().clone()
    }
}

impl PacketLog for CaptureLog {
    fn log_packet(&self, rec: &PacketLogRecord) {
        self.0.lock().unwrap().push(rec.clone());
    }
}

/// Records exported flows.
#[derive(Clone, Default)]
pub struct CaptureExport(Arc<Mutex<Vec<FlowRecord>>>);

impl CaptureExport {
    pub fn records(&self) -> Vec<FlowRecord> {
        self.0.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<FlowEvent> {
        self.records().iter().map(|r| r.event).collect()
    }
}

impl FlowExport for CaptureExport {
    fn export(&self, rec: FlowRecord) {
        self.0.lock().unwrap().push(rec);
    }
}

/// Records the state ids seen by a sync peer, and optionally defers
/// every new state.
#[derive(Clone, Default)]
pub struct CaptureSync {
    inserted: Arc<Mutex<Vec<u64>>>,
    deleted: Arc<Mutex<Vec<u64>>>,
    defer: bool,
}

impl CaptureSync {
    pub fn deferring() -> Self {
        Self { defer: true, ..Default::default() }
    }

    pub fn inserted(&self) -> Vec<u64> {
        self.inserted.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<u64> {
        self.deleted.lock().unwrap().clone()
    }
}

impl StateSync for CaptureSync {
    fn insert_state(&self, state: &StateDump) {
        self.inserted.lock().unwrap().push(state.id);
    }

    fn delete_state(&self, state: &StateDump) {
        self.deleted.lock().unwrap().push(state.id);
    }

    fn defer(&self, _state: &StateDump, _pkt: &Packet) -> bool {
        self.defer
    }
}

/// An engine wired to capturing providers.
pub struct TestPf {
    pub pf: Pf,
    pub clock: ManualClock,
    pub sent: CaptureSender,
    pub pkt_log: CaptureLog,
    pub flows: CaptureExport,
    pub sync: CaptureSync,
}

impl TestPf {
    /// The clock starts at 1000 and the random source is seeded, so
    /// runs are repeatable.
    pub fn new(cfg: PfConfig) -> Self {
        Self::with_sync(cfg, CaptureSync::default())
    }

    pub fn with_sync(cfg: PfConfig, sync: CaptureSync) -> Self {
        let cfg = PfConfig { seed: cfg.seed.or(Some(0x5eed)), ..cfg };
        let clock = ManualClock::new(1000);
        let sent = CaptureSender::default();
        let pkt_log = CaptureLog::default();
        let flows = CaptureExport::default();

        let mut providers = Providers::new(Box::new(PrintlnLog));
        providers.clock = Box::new(clock.clone());
        providers.sender = Some(Box::new(sent.clone()));
        providers.pkt_log = Some(Box::new(pkt_log.clone()));
        providers.export = Some(Box::new(flows.clone()));
        providers.sync = Some(Box::new(sync.clone()));

        let pf = Pf::new(cfg, providers);
        Self { pf, clock, sent, pkt_log, flows, sync }
    }

    /// A default-configured engine running `rs`.
    pub fn with_rules(rs: Ruleset) -> Self {
        let t = Self::new(PfConfig::default());
        t.pf.activate(rs).unwrap();
        t
    }

    pub fn out(&self, pkt: &mut Packet) -> Outcome {
        self.pf.process(Direction::Out, IFNAME, pkt)
    }

    pub fn inb(&self, pkt: &mut Packet) -> Outcome {
        self.pf.process(Direction::In, IFNAME, pkt)
    }

    /// Run purges until a whole sweep frees nothing more.
    pub fn purge_all(&self) -> usize {
        let interval = self.pf.config().timeouts.interval.max(1);
        let mut total = 0;
        loop {
            let freed: usize =
                (0..interval).map(|_| self.pf.purge()).sum();
            total += freed;
            if freed == 0 {
                return total;
            }
        }
    }
}

/// A ruleset holding only filter rules.
pub fn filter(rules: Vec<Rule>) -> Ruleset {
    Ruleset::new().with_rules(RuleClass::Filter, rules)
}

/// Outbound NAT of `from` behind the single address `to`, using ports
/// `lo..=hi`.
pub fn nat_rule(from: &str, to: &str, lo: u16, hi: u16) -> Rule {
    let pool = Pool::new(PoolType::None, vec![cidr(to).into()]).ports(lo, hi);
    Rule::new(RuleAction::Nat)
        .dir(Direction::Out)
        .from(RuleAddr::cidr(cidr(from)))
        .pool(pool)
}

/// A pass rule keeping state.
pub fn pass_keep() -> Rule {
    Rule::pass().keep_state(KeepState::Keep)
}
