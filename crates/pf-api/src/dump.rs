// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Read-only views of engine state handed to external consumers.

use super::Af;
use super::Direction;
use super::PeerState;
use super::PfAddr;
use super::PfCidr;
use super::Protocol;
use super::Reason;
use super::RuleAction;
use super::TcpFlags;
use super::TimeoutClass;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// A connection tuple as seen from one side.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub struct FlowTuple {
    pub af: Af,
    pub proto: Protocol,
    pub src: PfAddr,
    pub dst: PfAddr,
    pub sport: u16,
    pub dport: u16,
}

impl Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.proto,
            self.src.display(self.af),
            self.sport,
            self.dst.display(self.af),
            self.dport,
        )
    }
}

/// One side of a state as shown by dumps.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PeerDump {
    pub state: PeerState,
    pub seqlo: u32,
    pub seqhi: u32,
    pub seqdiff: u32,
    pub max_win: u16,
    pub wscale: Option<u8>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StateDump {
    pub id: u64,
    pub creatorid: u32,
    pub direction: Direction,
    pub ifname: Option<String>,
    /// The tuple as seen on the interface side.
    pub wire: FlowTuple,
    /// The tuple as seen by the local stack.
    pub stack: FlowTuple,
    pub src: PeerDump,
    pub dst: PeerDump,
    pub timeout: TimeoutClass,
    pub creation: u64,
    pub expire: u64,
    pub packets: [u64; 2],
    pub bytes: [u64; 2],
    pub rule_nr: u32,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SrcNodeDump {
    pub af: Af,
    pub addr: PfAddr,
    /// The sticky translated address, if any.
    pub raddr: Option<PfAddr>,
    pub rule_nr: Option<u32>,
    pub states: u32,
    pub conn: u32,
    pub conn_rate: u32,
    pub creation: u64,
    pub expire: u64,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RuleDump {
    pub nr: u32,
    pub action: RuleAction,
    pub desc: String,
    pub evaluations: u64,
    pub packets: [u64; 2],
    pub bytes: [u64; 2],
    pub states_cur: u32,
    pub states_tot: u64,
    pub src_nodes: u32,
}

/// Engine-wide counters.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PfStatsDump {
    pub reasons: Vec<(Reason, u64)>,
    pub states: u64,
    pub src_nodes: u64,
    pub state_searches: u64,
    pub state_inserts: u64,
    pub state_removals: u64,
    pub src_node_searches: u64,
    pub src_node_inserts: u64,
    pub src_node_removals: u64,
    pub limit_states: u64,
    pub limit_src_states: u64,
    pub limit_src_nodes: u64,
    pub limit_src_conn: u64,
    pub limit_src_conn_rate: u64,
    pub overload_table: u64,
    pub overload_flush: u64,
}

/// Selects the states removed by a kill request. Unset fields match
/// anything; addresses match either side of a translated state.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct KillFilter {
    pub af: Option<Af>,
    pub proto: Option<Protocol>,
    pub src: Option<PfCidr>,
    pub dst: Option<PfCidr>,
    pub rule_nr: Option<u32>,
}

impl KillFilter {
    /// Does the flow, as seen by its originator, match?
    pub fn matches_tuple(&self, t: &FlowTuple) -> bool {
        self.af.is_none_or(|af| af == t.af)
            && self.proto.is_none_or(|p| p == t.proto)
            && self.src.is_none_or(|c| c.contains(t.af, t.src))
            && self.dst.is_none_or(|c| c.contains(t.af, t.dst))
    }
}

/// A flow lifecycle event handed to the flow exporter.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum FlowEvent {
    Create,
    Update,
    Delete,
}

/// The pre- and post-translation tuples of a translated flow.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NatTuples {
    pub pre: FlowTuple,
    pub post: FlowTuple,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowRecord {
    pub event: FlowEvent,
    pub tuple: FlowTuple,
    pub packets: [u64; 2],
    pub bytes: [u64; 2],
    pub start: u64,
    pub end: u64,
    pub tos: u8,
    pub nat: Option<NatTuples>,
}

impl FlowRecord {
    /// Encode the record in the compact form sent to collectors.
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// The header fields of a logged packet.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HeaderSnapshot {
    pub tuple: FlowTuple,
    pub len: u16,
    pub tcp_flags: Option<TcpFlags>,
    pub tos: u8,
}

/// A packet log entry: emitted when a rule with logging enabled
/// decides a packet's fate.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PacketLogRecord {
    pub rule_nr: u32,
    pub anchor: Option<String>,
    pub action: RuleAction,
    pub reason: Reason,
    pub dir: Direction,
    pub af: Af,
    pub ifname: String,
    pub hdr: HeaderSnapshot,
    /// The error chain behind a drop, outermost first.
    pub error: Vec<&'static str>,
}
