// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Providers plug the engine's external collaborators into it.
//!
//! The engine never performs I/O itself. Diagnostics, packet logs,
//! flow records, generated replies, socket owner lookups and state
//! synchronization all leave through one of the traits below. Only
//! logging and the clock are mandatory; every other collaborator is
//! optional and the engine degrades gracefully without it.

use crate::ddi::time::Clock;
use crate::ddi::time::SystemClock;
use crate::engine::packet::Packet;
use core::fmt;
use core::fmt::Display;
use pf_api::Af;
use pf_api::Direction;
use pf_api::FlowRecord;
use pf_api::PacketLogRecord;
use pf_api::PfAddr;
use pf_api::Protocol;
use pf_api::StateDump;
use pf_api::TcpFlags;

/// The set of collaborators handed to an engine instance.
pub struct Providers {
    pub log: Box<dyn LogProvider>,
    pub clock: Box<dyn Clock>,
    pub pkt_log: Option<Box<dyn PacketLog>>,
    pub export: Option<Box<dyn FlowExport>>,
    pub sockets: Option<Box<dyn SocketLookup>>,
    pub sender: Option<Box<dyn PacketSender>>,
    pub sync: Option<Box<dyn StateSync>>,
}

impl Providers {
    /// Providers with the given logger, the system clock and no
    /// optional collaborators.
    pub fn new(log: Box<dyn LogProvider>) -> Self {
        Self {
            log,
            clock: Box::new(SystemClock::new()),
            pkt_log: None,
            export: None,
            sockets: None,
            sender: None,
            sync: None,
        }
    }
}

/// A logging provider for engine diagnostics.
///
/// Levels map onto the underlying sink with varying degrees of
/// success; [`LogLevel::Debug`] is used for the per-packet chatter
/// (rejected segments, translation failures) that a production sink
/// will usually filter out.
pub trait LogProvider: Send + Sync {
    /// Log a message at the specified level.
    fn log(&self, level: LogLevel, msg: &str);
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Debug,
    Note,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let level_s = match self {
            Self::Debug => "[DEBUG]",
            Self::Note => "[NOTE]",
            Self::Warn => "[WARN]",
            Self::Error => "[ERROR]",
        };
        write!(f, "{level_s}")
    }
}

#[derive(Clone, Copy)]
pub struct PrintlnLog;

impl LogProvider for PrintlnLog {
    fn log(&self, level: LogLevel, msg: &str) {
        println!("{level} {msg}");
    }
}

/// Route engine diagnostics into a `slog` logger.
pub struct SlogLog {
    log: slog::Logger,
}

impl SlogLog {
    pub fn new(log: slog::Logger) -> Self {
        Self { log }
    }
}

impl LogProvider for SlogLog {
    fn log(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Debug => slog::debug!(self.log, "{}", msg),
            LogLevel::Note => slog::info!(self.log, "{}", msg),
            LogLevel::Warn => slog::warn!(self.log, "{}", msg),
            LogLevel::Error => slog::error!(self.log, "{}", msg),
        }
    }
}

/// The sink for packets matched by a rule with logging enabled.
///
/// Implementations must not block: the call is made from the packet
/// path.
pub trait PacketLog: Send + Sync {
    fn log_packet(&self, rec: &PacketLogRecord);
}

/// Emit packet log records as structured `slog` entries.
///
/// Pair this with an asynchronous drain so that logging never stalls
/// evaluation.
pub struct SlogPacketLog {
    log: slog::Logger,
}

impl SlogPacketLog {
    pub fn new(log: slog::Logger) -> Self {
        Self { log }
    }
}

impl PacketLog for SlogPacketLog {
    fn log_packet(&self, rec: &PacketLogRecord) {
        let anchor = rec.anchor.as_deref().unwrap_or("");
        let error = rec.error.join(".");
        slog::info!(self.log, "pf";
            "rule" => rec.rule_nr,
            "anchor" => anchor,
            "action" => %rec.action,
            "reason" => %rec.reason,
            "dir" => %rec.dir,
            "af" => %rec.af,
            "ifname" => &rec.ifname,
            "flow" => %rec.hdr.tuple,
            "len" => rec.hdr.len,
            "error" => error
        );
    }
}

/// The receiver of flow records on state creation, update and
/// removal. Delivery is best-effort.
pub trait FlowExport: Send + Sync {
    fn export(&self, rec: FlowRecord);
}

/// The owner of a local socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SocketOwner {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

/// Resolve the local socket a packet belongs to.
pub trait SocketLookup: Send + Sync {
    /// Find the owner of the local endpoint of a flow. `local` and
    /// `remote` are already oriented for the packet's direction.
    fn lookup(
        &self,
        af: Af,
        proto: Protocol,
        local: (PfAddr, u16),
        remote: (PfAddr, u16),
    ) -> Option<SocketOwner>;
}

/// A TCP segment generated by the engine: resets for blocked or
/// unlinked connections and the synproxy handshake segments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TcpReply {
    pub af: Af,
    pub src: PfAddr,
    pub dst: PfAddr,
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub win: u16,
    /// MSS option to include, if any.
    pub mss: Option<u16>,
    /// The TTL to send with; zero means the system default.
    pub ttl: u8,
    pub tag: u16,
    /// Whether the segment travels out of the interface (true) or is
    /// delivered back up towards the local stack.
    pub outbound: bool,
}

/// An ICMP error generated in response to a blocked packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IcmpReply {
    pub af: Af,
    pub ty: u8,
    pub code: u8,
    /// The offending packet, with any translation undone.
    pub orig: Packet,
    pub dir: Direction,
}

/// The means of putting generated packets on the wire.
pub trait PacketSender: Send + Sync {
    fn send_tcp(&self, reply: TcpReply);
    fn send_icmp(&self, reply: IcmpReply);
}

/// A state synchronization peer.
pub trait StateSync: Send + Sync {
    /// A state was inserted into the table.
    fn insert_state(&self, _state: &StateDump) {}

    /// A state was removed from the table.
    fn delete_state(&self, _state: &StateDump) {}

    /// Offered the first packet of a freshly created state. Return
    /// true to take the packet; the engine then reports
    /// [`pf_api::Action::Defer`] and the caller must hold it.
    fn defer(&self, _state: &StateDump, _pkt: &Packet) -> bool {
        false
    }
}
