// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Offline replay of packet scenarios through the filter engine.

pub mod scenario;

use anyhow::bail;
use pf::api::Action;
use pf::api::Direction;
use pf::api::FlowRecord;
use pf::api::FlowTuple;
use pf::api::PfConfig;
use pf::api::Reason;
use pf::ddi::time::Clock;
use pf::engine::Pf;
use pf::engine::table::AddrTable;
use pf::provider::FlowExport;
use pf::provider::IcmpReply;
use pf::provider::PacketSender;
use pf::provider::Providers;
use pf::provider::SlogLog;
use pf::provider::SlogPacketLog;
use pf::provider::TcpReply;
use scenario::PacketSpec;
use scenario::Scenario;
use serde::Serialize;
use slog::Logger;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// The engine uptime at the start of a replay.
pub const REPLAY_START: u64 = 1;

/// The seed used when a scenario does not pick one, so that replays
/// are repeatable.
pub const REPLAY_SEED: u64 = 0x7066;

/// A clock advanced by the replay. Clones share the same time.
#[derive(Clone, Debug)]
pub struct ReplayClock(Arc<AtomicU64>);

impl ReplayClock {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(REPLAY_START)))
    }

    pub fn set(&self, uptime: u64) {
        self.0.store(uptime, Ordering::Relaxed);
    }
}

impl Default for ReplayClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ReplayClock {
    fn uptime(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Logs the packets the engine would have sent.
pub struct SlogSender {
    log: Logger,
}

impl SlogSender {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }
}

impl PacketSender for SlogSender {
    fn send_tcp(&self, r: TcpReply) {
        slog::info!(self.log, "send tcp";
            "src" => %r.src.display(r.af),
            "sport" => r.sport,
            "dst" => %r.dst.display(r.af),
            "dport" => r.dport,
            "flags" => %r.flags,
            "seq" => r.seq,
            "ack" => r.ack,
            "outbound" => r.outbound
        );
    }

    fn send_icmp(&self, r: IcmpReply) {
        slog::info!(self.log, "send icmp";
            "type" => r.ty,
            "code" => r.code,
            "dir" => %r.dir,
            "orig" => %r.orig.tuple()
        );
    }
}

/// Logs flow records at debug level.
pub struct SlogExport {
    log: Logger,
}

impl SlogExport {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }
}

impl FlowExport for SlogExport {
    fn export(&self, rec: FlowRecord) {
        slog::debug!(self.log, "flow";
            "event" => ?rec.event,
            "tuple" => %rec.tuple,
            "pkts_in" => rec.packets[0],
            "pkts_out" => rec.packets[1],
            "start" => rec.start,
            "end" => rec.end
        );
    }
}

/// What became of one replayed packet.
#[derive(Clone, Debug, Serialize)]
pub struct Verdict {
    pub idx: usize,
    pub at: u64,
    pub dir: Direction,
    pub ifname: String,
    /// The packet as it arrived.
    pub before: FlowTuple,
    /// The packet after any translation.
    pub after: FlowTuple,
    pub action: Action,
    pub reason: Reason,
    pub rule_nr: Option<u32>,
    pub state_id: Option<u64>,
}

/// An engine loaded with a scenario's configuration and rules.
pub struct Replay {
    pub pf: Pf,
    pub tables: Vec<Arc<AddrTable>>,
    clock: ReplayClock,
    // Seconds into the replay.
    now: u64,
}

impl Replay {
    pub fn new(sc: &Scenario, log: &Logger) -> anyhow::Result<Self> {
        let loaded = sc.build()?;
        let cfg = PfConfig {
            seed: sc.config.seed.or(Some(REPLAY_SEED)),
            ..sc.config.clone()
        };
        let clock = ReplayClock::new();

        let pf_log = log.new(slog::o!("unit" => "pf"));
        let mut providers = Providers::new(Box::new(SlogLog::new(pf_log)));
        providers.clock = Box::new(clock.clone());
        let pkt_log = log.new(slog::o!("unit" => "pflog"));
        providers.pkt_log = Some(Box::new(SlogPacketLog::new(pkt_log)));
        providers.sender = Some(Box::new(SlogSender::new(log.clone())));
        providers.export = Some(Box::new(SlogExport::new(log.clone())));

        let pf = Pf::new(cfg, providers);
        pf.activate(loaded.ruleset)?;
        Ok(Self { pf, tables: loaded.tables, clock, now: 0 })
    }

    /// Seconds into the replay.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Move the clock forward to `to` seconds into the replay, running
    /// the state sweep once per second and the source node sweep once
    /// per interval along the way.
    pub fn advance(&mut self, to: u64) -> anyhow::Result<()> {
        if to < self.now {
            bail!("time runs backwards: {to} < {}", self.now);
        }
        let interval = u64::from(self.pf.config().timeouts.interval.max(1));
        while self.now < to {
            self.now += 1;
            self.clock.set(REPLAY_START + self.now);
            self.pf.purge();
            if self.now % interval == 0 {
                self.pf.purge_src_nodes();
            }
        }
        Ok(())
    }

    /// Replay one packet.
    pub fn packet(
        &mut self,
        idx: usize,
        spec: &PacketSpec,
    ) -> anyhow::Result<Verdict> {
        self.advance(spec.at)?;
        let dir = spec.direction()?;
        let mut pkt = spec.to_packet()?;
        let before = pkt.tuple();
        let out = self.pf.process(dir, &spec.ifname, &mut pkt);
        Ok(Verdict {
            idx,
            at: self.now,
            dir,
            ifname: spec.ifname.clone(),
            before,
            after: pkt.tuple(),
            action: out.action,
            reason: out.reason,
            rule_nr: out.rule_nr,
            state_id: out.state_id,
        })
    }

    /// Replay every packet of a scenario, then run on to its end time.
    pub fn run(&mut self, sc: &Scenario) -> anyhow::Result<Vec<Verdict>> {
        let verdicts = sc
            .packets
            .iter()
            .enumerate()
            .map(|(i, spec)| self.packet(i, spec))
            .collect::<anyhow::Result<Vec<_>>>()?;
        if let Some(end) = sc.end {
            self.advance(end)?;
        }
        Ok(verdicts)
    }
}
