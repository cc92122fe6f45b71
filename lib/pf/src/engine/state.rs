// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The state table.
//!
//! A state remembers one connection that a rule let through. It is
//! reachable under two keys: the flow as it appears on the wire and
//! the flow as the local stack sees it. The two differ only when the
//! connection is translated. Inbound packets are looked up by their
//! wire key and outbound packets by their stack key.
//!
//! States leave the table in two steps. Unlinking takes a state out
//! of the key index, so no packet can find it any more; freeing drops
//! it from the id list once the purge walk reaches it. Anything that
//! still holds a [`StateRef`] in between sees the unlinked phase and
//! treats the state as gone.

use super::packet::Packet;
use super::rule::Rule;
use super::src_node::SrcNodeRef;
use crate::d_error::DError;
use crate::ddi::sync::KMutex;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::fmt::Display;
use pf_api::Af;
use pf_api::Direction;
use pf_api::FlowEvent;
use pf_api::FlowRecord;
use pf_api::FlowTuple;
use pf_api::NatTuples;
use pf_api::PeerDump;
use pf_api::PeerState;
use pf_api::PfAddr;
use pf_api::Protocol;
use pf_api::StateDump;
use pf_api::TimeoutClass;

/// The index of the wire key in [`State::key`].
pub const SK_WIRE: usize = 0;
/// The index of the stack key in [`State::key`].
pub const SK_STACK: usize = 1;

/// The key slot holding the source of a packet travelling in `dir`.
pub const fn sidx(dir: Direction) -> usize {
    match dir {
        Direction::In => 0,
        Direction::Out => 1,
    }
}

/// The key slot holding the destination of a packet travelling in
/// `dir`.
pub const fn didx(dir: Direction) -> usize {
    match dir {
        Direction::In => 1,
        Direction::Out => 0,
    }
}

/// A flow as stored in the table.
///
/// Slot 0 always holds the external (wire-side) end of the flow and
/// slot 1 the internal end, whatever the direction of the packet the
/// key was made from. That way a packet and its reply produce the same
/// key. ICMP queries store their identifier in both port slots.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StateKey {
    pub af: Af,
    pub proto: Protocol,
    pub addr: [PfAddr; 2],
    pub port: [u16; 2],
}

impl StateKey {
    pub fn new(
        af: Af,
        proto: Protocol,
        src: (PfAddr, u16),
        dst: (PfAddr, u16),
        dir: Direction,
    ) -> Self {
        let mut addr = [PfAddr::ANY; 2];
        let mut port = [0; 2];
        (addr[sidx(dir)], port[sidx(dir)]) = src;
        (addr[didx(dir)], port[didx(dir)]) = dst;
        Self { af, proto, addr, port }
    }

    /// The key for `pkt` travelling in `dir`.
    pub fn from_packet(pkt: &Packet, dir: Direction) -> Self {
        let sport = pkt.sport().unwrap_or(0);
        let dport = pkt.dport().unwrap_or(0);
        Self::new(pkt.af, pkt.proto, (pkt.src, sport), (pkt.dst, dport), dir)
    }

    /// The source end of a packet travelling in `dir`.
    pub fn src(&self, dir: Direction) -> (PfAddr, u16) {
        (self.addr[sidx(dir)], self.port[sidx(dir)])
    }

    /// The destination end of a packet travelling in `dir`.
    pub fn dst(&self, dir: Direction) -> (PfAddr, u16) {
        (self.addr[didx(dir)], self.port[didx(dir)])
    }

    /// The flow as a packet travelling in `dir` carries it.
    pub fn tuple(&self, dir: Direction) -> FlowTuple {
        let (src, sport) = self.src(dir);
        let (dst, dport) = self.dst(dir);
        FlowTuple { af: self.af, proto: self.proto, src, dst, sport, dport }
    }
}

impl Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}:{} {}:{}",
            self.proto,
            self.addr[0].display(self.af),
            self.port[0],
            self.addr[1].display(self.af),
            self.port[1],
        )
    }
}

/// One end of a tracked connection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Peer {
    /// The lowest sequence number the peer may send next.
    pub seqlo: u32,
    /// The highest sequence number the peer may send, plus one.
    pub seqhi: u32,
    /// The offset added to this peer's sequence numbers on the wire.
    pub seqdiff: u32,
    pub max_win: u16,
    pub mss: u16,
    pub state: PeerState,
    pub wscale: Option<u8>,
}

impl Peer {
    pub fn to_dump(&self) -> PeerDump {
        PeerDump {
            state: self.state,
            seqlo: self.seqlo,
            seqhi: self.seqhi,
            seqdiff: self.seqdiff,
            max_win: self.max_win,
            wscale: self.wscale,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct StateFlags: u8 {
        /// Pass IP options on packets matching this state.
        const ALLOW_OPTS = 0x01;
        /// Track TCP without sequence number checks.
        const SLOPPY = 0x02;
        /// The connection is counted against its source node.
        const SRC_CONN = 0x04;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Lifecycle {
    Live,
    Unlinked,
    Freed,
}

#[derive(Debug)]
pub struct State {
    pub(crate) id: u64,
    pub(crate) creatorid: u32,
    pub(crate) key: [StateKey; 2],
    /// The direction of the packet that created the state.
    pub(crate) direction: Direction,
    /// The interface the state is bound to, or `None` if it floats.
    pub(crate) ifname: Option<String>,
    pub(crate) src: Peer,
    pub(crate) dst: Peer,
    pub(crate) rule: Arc<Rule>,
    pub(crate) nat_rule: Option<Arc<Rule>>,
    pub(crate) anchor: Option<Arc<Rule>>,
    pub(crate) src_node: Option<SrcNodeRef>,
    pub(crate) nat_src_node: Option<SrcNodeRef>,
    pub(crate) creation: u64,
    /// The time of the last packet that refreshed the state.
    pub(crate) expire: u64,
    pub(crate) timeout: TimeoutClass,
    pub(crate) packets: [u64; 2],
    pub(crate) bytes: [u64; 2],
    pub(crate) tag: u16,
    pub(crate) log: bool,
    pub(crate) flags: StateFlags,
    pub(crate) lifecycle: Lifecycle,
}

impl State {
    pub fn new(
        key: [StateKey; 2],
        direction: Direction,
        rule: Arc<Rule>,
        now: u64,
    ) -> Self {
        Self {
            id: 0,
            creatorid: 0,
            key,
            direction,
            ifname: None,
            src: Peer::default(),
            dst: Peer::default(),
            rule,
            nat_rule: None,
            anchor: None,
            src_node: None,
            nat_src_node: None,
            creation: now,
            expire: now,
            timeout: TimeoutClass::OtherFirstPacket,
            packets: [0; 2],
            bytes: [0; 2],
            tag: 0,
            log: false,
            flags: StateFlags::empty(),
            lifecycle: Lifecycle::Live,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self, side: usize) -> &StateKey {
        &self.key[side]
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn timeout(&self) -> TimeoutClass {
        self.timeout
    }

    pub fn peers(&self) -> (&Peer, &Peer) {
        (&self.src, &self.dst)
    }

    pub fn is_live(&self) -> bool {
        self.lifecycle == Lifecycle::Live
    }

    /// Does the state rewrite the packets that match it?
    pub fn is_translated(&self) -> bool {
        self.key[SK_WIRE] != self.key[SK_STACK]
    }

    /// The (source, destination) peers of a packet travelling in
    /// `dir`.
    pub fn peers_mut(&mut self, dir: Direction) -> (&mut Peer, &mut Peer) {
        if dir == self.direction {
            (&mut self.src, &mut self.dst)
        } else {
            (&mut self.dst, &mut self.src)
        }
    }

    pub fn count_packet(&mut self, dir: Direction, len: usize) {
        let i = usize::from(dir != self.direction);
        self.packets[i] += 1;
        self.bytes[i] += len as u64;
    }

    /// Mark the state for removal by the next purge.
    pub fn kill(&mut self) {
        self.timeout = TimeoutClass::Purge;
        self.src.state = PeerState::Closed;
        self.dst.state = PeerState::Closed;
    }

    pub fn to_dump(&self, expires: u64) -> StateDump {
        StateDump {
            id: self.id,
            creatorid: self.creatorid,
            direction: self.direction,
            ifname: self.ifname.clone(),
            wire: self.key[SK_WIRE].tuple(self.direction),
            stack: self.key[SK_STACK].tuple(self.direction),
            src: self.src.to_dump(),
            dst: self.dst.to_dump(),
            timeout: self.timeout,
            creation: self.creation,
            expire: expires,
            packets: self.packets,
            bytes: self.bytes,
            rule_nr: self.rule.nr(),
        }
    }

    /// A flow record describing the connection from its originator's
    /// point of view.
    pub fn flow_record(&self, event: FlowEvent) -> FlowRecord {
        let inside = sidx(self.direction);
        let pre = self.key[inside].tuple(self.direction);
        let nat = self.is_translated().then(|| NatTuples {
            pre,
            post: self.key[1 - inside].tuple(self.direction),
        });
        FlowRecord {
            event,
            tuple: pre,
            packets: self.packets,
            bytes: self.bytes,
            start: self.creation,
            end: self.expire,
            tos: 0,
            nat,
        }
    }
}

pub type StateRef = Arc<KMutex<State>>;

#[derive(Clone, Copy, Debug, DError, Eq, PartialEq, thiserror::Error)]
#[derror(leaf_data = InsertError::data)]
pub enum InsertError {
    #[error("wire key collides with state {id}")]
    WireCollision { id: u64 },

    #[error("stack key collides with state {id}")]
    StackCollision { id: u64 },
}

impl InsertError {
    fn data(&self, data: &mut [u64]) {
        match self {
            Self::WireCollision { id } | Self::StackCollision { id } => {
                data[0] = *id
            }
        }
    }
}

// The facts about a state that lookups need, copied out of it so the
// key index can be searched without taking state locks.
struct KeyEntry {
    id: u64,
    state: StateRef,
    ifname: Option<String>,
    direction: Direction,
    wire: bool,
    stack: bool,
}

#[derive(Default)]
pub struct StateTable {
    keys: BTreeMap<StateKey, Vec<KeyEntry>>,
    // Every state not yet freed, live or unlinked. Purging walks it in
    // id order.
    ids: BTreeMap<u64, StateRef>,
    live: usize,
    next_id: u64,
    purge_cursor: u64,
}

impl StateTable {
    pub fn new() -> Self {
        Self { next_id: 1, ..Default::default() }
    }

    /// The number of live states.
    pub fn len(&self) -> usize {
        self.live
    }

    /// The number of states not yet freed, including unlinked ones.
    pub fn tracked(&self) -> usize {
        self.ids.len()
    }

    /// Add a state under both of its keys, assigning its id.
    ///
    /// A key already used by a state bound to the same interface in
    /// the same direction is a collision, unless that state is a TCP
    /// connection closed on both sides: it is then marked closed and
    /// returned for the caller to unlink.
    pub fn insert(
        &mut self,
        mut st: State,
    ) -> Result<(StateRef, Vec<StateRef>), InsertError> {
        let wire = st.key[SK_WIRE];
        let stack = st.key[SK_STACK];
        let mut superseded: Vec<StateRef> = Vec::new();

        let mut check = |key: &StateKey, is_wire: bool| {
            let Some(list) = self.keys.get(key) else {
                return Ok(());
            };
            let Some(e) = list.iter().find(|e| {
                e.ifname == st.ifname && e.direction == st.direction
            }) else {
                return Ok(());
            };
            let mut old = e.state.lock();
            if key.proto == Protocol::TCP
                && old.src.state >= PeerState::FinWait2
                && old.dst.state >= PeerState::FinWait2
            {
                old.src.state = PeerState::Closed;
                old.dst.state = PeerState::Closed;
                if !superseded.iter().any(|s| Arc::ptr_eq(s, &e.state)) {
                    superseded.push(Arc::clone(&e.state));
                }
                Ok(())
            } else if is_wire {
                Err(InsertError::WireCollision { id: e.id })
            } else {
                Err(InsertError::StackCollision { id: e.id })
            }
        };
        check(&wire, true)?;
        if stack != wire {
            check(&stack, false)?;
        }

        let id = self.next_id;
        self.next_id += 1;
        st.id = id;
        st.lifecycle = Lifecycle::Live;
        let ifname = st.ifname.clone();
        let direction = st.direction;
        let sref = Arc::new(KMutex::new(st));

        let mut attach = |key: StateKey, wire: bool, stack: bool| {
            let entry = KeyEntry {
                id,
                state: Arc::clone(&sref),
                ifname: ifname.clone(),
                direction,
                wire,
                stack,
            };
            let list = self.keys.entry(key).or_default();
            // Interface-bound states are found before floating ones.
            if entry.ifname.is_some() {
                list.insert(0, entry);
            } else {
                list.push(entry);
            }
        };
        if wire == stack {
            attach(wire, true, true);
        } else {
            attach(wire, true, false);
            attach(stack, false, true);
        }

        self.ids.insert(id, Arc::clone(&sref));
        self.live += 1;
        Ok((sref, superseded))
    }

    /// Find the state a packet travelling in `dir` on `ifname`
    /// belongs to. Inbound packets match wire keys and outbound
    /// packets stack keys.
    pub fn lookup(
        &self,
        key: &StateKey,
        dir: Direction,
        ifname: &str,
    ) -> Option<StateRef> {
        self.keys.get(key)?.iter().find_map(|e| {
            let side = match dir {
                Direction::In => e.wire,
                Direction::Out => e.stack,
            };
            let iface = e.ifname.as_deref().is_none_or(|n| n == ifname);
            (side && iface).then(|| Arc::clone(&e.state))
        })
    }

    /// Is `key` the wire key of any state, on any interface?
    pub fn wire_key_in_use(&self, key: &StateKey) -> bool {
        self.keys.get(key).is_some_and(|l| l.iter().any(|e| e.wire))
    }

    pub fn get(&self, id: u64) -> Option<StateRef> {
        self.ids.get(&id).cloned()
    }

    /// Every state not yet freed, in id order.
    pub fn iter(&self) -> impl Iterator<Item = &StateRef> {
        self.ids.values()
    }

    /// Take the state out of the key index. It stays reachable by id
    /// until [`StateTable::release`]. Returns false if it was not
    /// live.
    pub fn detach(&mut self, st: &mut State) -> bool {
        if st.lifecycle != Lifecycle::Live {
            return false;
        }
        let id = st.id;
        let keys = if st.key[SK_WIRE] == st.key[SK_STACK] {
            &st.key[..1]
        } else {
            &st.key[..]
        };
        for key in keys {
            if let Some(list) = self.keys.get_mut(key) {
                list.retain(|e| e.id != id);
                if list.is_empty() {
                    self.keys.remove(key);
                }
            }
        }
        st.lifecycle = Lifecycle::Unlinked;
        st.timeout = TimeoutClass::Unlinked;
        self.live -= 1;
        true
    }

    /// Forget a detached state.
    pub fn release(&mut self, st: &mut State) -> bool {
        if st.lifecycle != Lifecycle::Unlinked {
            return false;
        }
        st.lifecycle = Lifecycle::Freed;
        self.ids.remove(&st.id).is_some()
    }

    /// The next `budget` states of the purge walk, resuming where the
    /// last batch stopped and wrapping around at the end.
    pub fn purge_batch(&mut self, budget: usize) -> Vec<StateRef> {
        let mut batch: Vec<(u64, StateRef)> = self
            .ids
            .range(self.purge_cursor..)
            .take(budget)
            .map(|(id, s)| (*id, Arc::clone(s)))
            .collect();
        if batch.len() < budget {
            let more = budget - batch.len();
            let wrapped = self
                .ids
                .range(..self.purge_cursor)
                .take(more)
                .map(|(id, s)| (*id, Arc::clone(s)));
            batch.extend(wrapped);
        }
        self.purge_cursor = batch.last().map(|(id, _)| id + 1).unwrap_or(0);
        batch.into_iter().map(|(_, s)| s).collect()
    }
}
