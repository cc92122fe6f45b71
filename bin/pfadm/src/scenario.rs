// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The scenario file.
//!
//! A scenario is a TOML document holding engine tunables, address
//! tables, anchors, the four rule lists and the packets to replay:
//!
//! ```toml
//! [config.timeouts]
//! udp_single = 10
//!
//! [[table]]
//! name = "bad"
//!
//! [[filter]]
//! action = "Drop"
//! quick = true
//! from = "<bad>"
//!
//! [[filter]]
//! action = "Pass"
//! dir = "out"
//! proto = "udp"
//! keep_state = "Keep"
//!
//! [[packet]]
//! dir = "out"
//! proto = "udp"
//! src = "10.0.0.5:4000"
//! dst = "203.0.113.5:53"
//! ```
//!
//! Addresses in rules are `any`, a CIDR or `<table>`, optionally
//! negated with a leading `!`. Ports are a number or an inclusive
//! `[lo, hi]` pair.

use anyhow::Context;
use anyhow::anyhow;
use anyhow::bail;
use pf::api::Af;
use pf::api::Direction;
use pf::api::FlushScope;
use pf::api::KeepState;
use pf::api::OpMatch;
use pf::api::PfAddr;
use pf::api::PfCidr;
use pf::api::PfConfig;
use pf::api::PoolType;
use pf::api::Protocol;
use pf::api::RateLimit;
use pf::api::ReturnPolicy;
use pf::api::RuleAction;
use pf::api::RuleClass;
use pf::api::SrcTrack;
use pf::api::TcpFlags;
use pf::api::TimeoutClass;
use pf::engine::nat::Pool;
use pf::engine::nat::PoolAddr;
use pf::engine::packet::ICMP_ECHO;
use pf::engine::packet::ICMP6_ECHO_REQUEST;
use pf::engine::packet::IcmpHdr;
use pf::engine::packet::L4;
use pf::engine::packet::Packet;
use pf::engine::packet::TcpHdr;
use pf::engine::packet::UdpHdr;
use pf::engine::predicate::Predicate;
use pf::engine::predicate::RuleAddr;
use pf::engine::rule::Rule;
use pf::engine::ruleset::Anchor;
use pf::engine::ruleset::Ruleset;
use pf::engine::table::AddrTable;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

/// The interface packets are seen on unless they name one.
pub const DEFAULT_IFNAME: &str = "em0";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub config: PfConfig,
    #[serde(rename = "table")]
    pub tables: Vec<TableSpec>,
    /// Anchors, in dependency order: an anchor may only refer to
    /// anchors defined before it.
    #[serde(rename = "anchor")]
    pub anchors: Vec<AnchorSpec>,
    #[serde(flatten)]
    pub rules: RuleLists,
    #[serde(rename = "packet")]
    pub packets: Vec<PacketSpec>,
    /// Keep the clock running until this many seconds into the
    /// replay, expiring states as it goes.
    pub end: Option<u64>,
}

/// The engine objects a scenario describes.
pub struct Loaded {
    pub ruleset: Ruleset,
    pub tables: Vec<Arc<AddrTable>>,
}

impl Scenario {
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&s)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Build the tables, anchors and main ruleset.
    pub fn build(&self) -> anyhow::Result<Loaded> {
        let mut names = Names::default();
        for spec in &self.tables {
            let entries = spec.entries.iter().copied();
            let tbl = Arc::new(AddrTable::with_entries(&spec.name, entries));
            if names.tables.insert(spec.name.clone(), tbl).is_some() {
                bail!("table <{}> defined twice", spec.name);
            }
        }

        for spec in &self.anchors {
            let rs = spec
                .rules
                .build(&names)
                .with_context(|| format!("in anchor {}", spec.name))?;
            let mut anchor = Anchor::new(&spec.name, rs);
            for child in &spec.children {
                anchor = anchor.with_child(names.anchor(child)?);
            }
            names.anchors.insert(spec.name.clone(), Arc::new(anchor));
        }

        let ruleset = self.rules.build(&names)?;
        let tables = names.tables.into_values().collect();
        Ok(Loaded { ruleset, tables })
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RuleLists {
    pub filter: Vec<RuleSpec>,
    pub nat: Vec<RuleSpec>,
    pub rdr: Vec<RuleSpec>,
    pub binat: Vec<RuleSpec>,
}

impl RuleLists {
    fn build(&self, names: &Names) -> anyhow::Result<Ruleset> {
        let lists = [
            (RuleClass::Filter, &self.filter),
            (RuleClass::Nat, &self.nat),
            (RuleClass::Rdr, &self.rdr),
            (RuleClass::Binat, &self.binat),
        ];
        let mut rs = Ruleset::new();
        for (class, specs) in lists {
            let rules = specs
                .iter()
                .enumerate()
                .map(|(i, spec)| {
                    spec.build(names)
                        .with_context(|| format!("{class:?} rule {i}"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            rs = rs.with_rules(class, rules);
        }
        Ok(rs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableSpec {
    pub name: String,
    #[serde(default)]
    pub entries: Vec<PfCidr>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AnchorSpec {
    pub name: String,
    /// Earlier anchors visited by a wildcard call into this one.
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(flatten)]
    pub rules: RuleLists,
}

#[derive(Default)]
struct Names {
    tables: BTreeMap<String, Arc<AddrTable>>,
    anchors: BTreeMap<String, Arc<Anchor>>,
}

impl Names {
    fn table(&self, name: &str) -> anyhow::Result<Arc<AddrTable>> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no such table: <{name}>"))
    }

    fn anchor(&self, name: &str) -> anyhow::Result<Arc<Anchor>> {
        self.anchors
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no such anchor: {name}"))
    }

    // `any`, a CIDR or `<table>`, with an optional leading `!`.
    fn addr(
        &self,
        s: &str,
        port: Option<&PortSpec>,
    ) -> anyhow::Result<RuleAddr> {
        let (neg, s) = match s.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, s.trim()),
        };
        let mut ra = if s == "any" {
            RuleAddr::any()
        } else if let Some(name) =
            s.strip_prefix('<').and_then(|s| s.strip_suffix('>'))
        {
            RuleAddr::table(self.table(name)?)
        } else {
            RuleAddr::cidr(parse_cidr(s)?)
        };
        if neg {
            ra = ra.negated();
        }
        if let Some(port) = port {
            ra = ra.with_port(port.to_match());
        }
        Ok(ra)
    }
}

// A bare address is a host route.
fn parse_cidr(s: &str) -> anyhow::Result<PfCidr> {
    s.parse::<PfCidr>().map_err(|e| anyhow!(e))
}

fn parse_af(s: &str) -> anyhow::Result<Af> {
    match s {
        "inet" | "ipv4" => Ok(Af::Inet),
        "inet6" | "ipv6" => Ok(Af::Inet6),
        _ => bail!("invalid address family: {s}"),
    }
}

/// A single port or an inclusive range.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum PortSpec {
    One(u16),
    Range([u16; 2]),
}

impl PortSpec {
    fn to_match(self) -> OpMatch<u16> {
        match self {
            Self::One(port) => OpMatch::exact(port),
            Self::Range([lo, hi]) => OpMatch::range(lo, hi),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSpec {
    pub class: TimeoutClass,
    pub secs: u32,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdaptiveSpec {
    pub start: u32,
    pub end: u32,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSpec {
    #[serde(rename = "type")]
    pub ty: PoolType,
    /// CIDRs or `<table>` names.
    pub addrs: Vec<String>,
    pub ports: Option<[u16; 2]>,
    pub sticky: bool,
}

impl PoolSpec {
    fn build(&self, names: &Names) -> anyhow::Result<Pool> {
        let addrs = self
            .addrs
            .iter()
            .map(|s| {
                match s.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
                    Some(name) => Ok(PoolAddr::from(names.table(name)?)),
                    None => Ok(PoolAddr::from(parse_cidr(s)?)),
                }
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let mut pool = Pool::new(self.ty, addrs);
        if let Some([lo, hi]) = self.ports {
            pool = pool.ports(lo, hi);
        }
        if self.sticky {
            pool = pool.sticky();
        }
        Ok(pool)
    }
}

/// One rule, in any of the four lists.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleSpec {
    pub action: RuleAction,
    /// Descend into the named anchor instead of deciding.
    pub anchor: Option<String>,
    /// Visit the anchor's children rather than the anchor itself.
    pub wildcard: bool,
    pub quick: bool,
    pub log: bool,
    /// An interface name; a leading `!` excludes it.
    pub on: Option<String>,
    pub dir: Option<String>,
    pub af: Option<String>,
    pub proto: Option<String>,
    pub from: Option<String>,
    pub from_port: Option<PortSpec>,
    pub to: Option<String>,
    pub to_port: Option<PortSpec>,
    /// TCP flags as `flags/mask`, e.g. `S/SA`.
    pub flags: Option<String>,
    pub tos: Option<u8>,
    pub icmp_type: Option<u8>,
    pub icmp_code: Option<u8>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Match probability in percent.
    pub prob: Option<f64>,
    pub tag: Option<u16>,
    pub tagged: Option<u16>,
    pub not_tagged: Option<u16>,
    pub keep_state: KeepState,
    pub if_bound: bool,
    pub sloppy: bool,
    pub allow_opts: bool,
    pub natpass: bool,
    pub return_policy: ReturnPolicy,
    pub max_states: Option<u32>,
    pub max_src_nodes: Option<u32>,
    pub max_src_states: Option<u32>,
    pub max_src_conn: Option<u32>,
    pub max_src_conn_rate: Option<RateLimit>,
    pub src_track: SrcTrack,
    /// The table offending sources are added to.
    pub overload: Option<String>,
    pub flush: FlushScope,
    pub timeouts: Vec<TimeoutSpec>,
    pub adaptive: Option<AdaptiveSpec>,
    pub pool: Option<PoolSpec>,
}

impl RuleSpec {
    fn build(&self, names: &Names) -> anyhow::Result<Rule> {
        let mut r = match &self.anchor {
            Some(name) if self.wildcard => {
                Rule::anchor_wildcard(names.anchor(name)?)
            }
            Some(name) => Rule::anchor(names.anchor(name)?),
            None => Rule::new(self.action),
        };

        if self.quick {
            r = r.quick();
        }
        if self.log {
            r = r.log();
        }
        if let Some(ifname) = &self.on {
            r = match ifname.strip_prefix('!') {
                Some(ifname) => r.not_on(ifname),
                None => r.on(ifname),
            };
        }
        if let Some(dir) = &self.dir {
            r = r.dir(dir.parse::<Direction>().map_err(|e| anyhow!(e))?);
        }
        if let Some(af) = &self.af {
            r = r.af(parse_af(af)?);
        }
        if let Some(proto) = &self.proto {
            r = r.proto(proto.parse::<Protocol>().map_err(|e| anyhow!(e))?);
        }
        if self.from.is_some() || self.from_port.is_some() {
            let from = self.from.as_deref().unwrap_or("any");
            r = r.from(names.addr(from, self.from_port.as_ref())?);
        }
        if self.to.is_some() || self.to_port.is_some() {
            let to = self.to.as_deref().unwrap_or("any");
            r = r.to(names.addr(to, self.to_port.as_ref())?);
        }

        for pred in self.preds()? {
            r = r.pred(pred);
        }
        if let Some(tag) = self.tag {
            r = r.tag(tag);
        }

        r = r.keep_state(self.keep_state).return_policy(self.return_policy);
        if self.if_bound {
            r = r.if_bound();
        }
        if self.sloppy {
            r = r.sloppy();
        }
        if self.allow_opts {
            r = r.allow_opts();
        }
        if self.natpass {
            r = r.natpass();
        }

        if let Some(max) = self.max_states {
            r = r.max_states(max);
        }
        if let Some(max) = self.max_src_nodes {
            r = r.max_src_nodes(max);
        }
        if let Some(max) = self.max_src_states {
            r = r.max_src_states(max);
        }
        if let Some(max) = self.max_src_conn {
            r = r.max_src_conn(max);
        }
        if let Some(rate) = self.max_src_conn_rate {
            r = r.max_src_conn_rate(rate.limit, rate.seconds);
        }
        r = r.src_track(self.src_track);
        if let Some(name) = &self.overload {
            r = r.overload(names.table(name)?, self.flush);
        }

        for t in &self.timeouts {
            r = r.timeout(t.class, t.secs);
        }
        if let Some(a) = self.adaptive {
            r = r.adaptive(a.start, a.end);
        }
        if let Some(pool) = &self.pool {
            r = r.pool(pool.build(names)?);
        }
        Ok(r)
    }

    fn preds(&self) -> anyhow::Result<Vec<Predicate>> {
        let mut preds = Vec::new();
        if let Some(tos) = self.tos {
            preds.push(Predicate::Tos(tos));
        }
        if let Some(spec) = &self.flags {
            let (flags, mask) = spec.split_once('/').unwrap_or((spec, ""));
            let flags = flags.parse::<TcpFlags>().map_err(|e| anyhow!(e))?;
            let mask = if mask.is_empty() {
                TcpFlags::all()
            } else {
                mask.parse::<TcpFlags>().map_err(|e| anyhow!(e))?
            };
            preds.push(Predicate::TcpFlags { flags, mask });
        }
        if let Some(uid) = self.uid {
            preds.push(Predicate::Uid(OpMatch::exact(uid)));
        }
        if let Some(gid) = self.gid {
            preds.push(Predicate::Gid(OpMatch::exact(gid)));
        }
        if let Some(ty) = self.icmp_type {
            preds.push(Predicate::IcmpType(ty));
        }
        if let Some(code) = self.icmp_code {
            preds.push(Predicate::IcmpCode(code));
        }
        if let Some(pct) = self.prob {
            preds.extend(Predicate::prob_percent(pct));
        }
        if let Some(tag) = self.tagged {
            preds.push(Predicate::Tagged { tag, neg: false });
        }
        if let Some(tag) = self.not_tagged {
            preds.push(Predicate::Tagged { tag, neg: true });
        }
        Ok(preds)
    }
}

/// One packet to replay.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PacketSpec {
    /// Seconds into the replay; never earlier than the packet before.
    #[serde(default)]
    pub at: u64,
    pub dir: String,
    #[serde(default = "default_ifname")]
    pub ifname: String,
    pub proto: String,
    /// `addr:port`, or a bare address for protocols without ports.
    pub src: String,
    pub dst: String,
    /// TCP flags in letter form.
    #[serde(default)]
    pub flags: Option<String>,
    #[serde(default)]
    pub seq: u32,
    #[serde(default)]
    pub ack: u32,
    #[serde(default = "default_win")]
    pub win: u16,
    /// ICMP type; an echo request when unset.
    #[serde(default)]
    pub icmp_type: Option<u8>,
    #[serde(default)]
    pub icmp_code: u8,
    /// ICMP query identifier.
    #[serde(default)]
    pub id: u16,
    /// Payload bytes.
    #[serde(default)]
    pub len: usize,
}

fn default_ifname() -> String {
    DEFAULT_IFNAME.to_string()
}

fn default_win() -> u16 {
    65535
}

fn parse_endpoint(s: &str) -> anyhow::Result<(IpAddr, u16)> {
    if let Ok(sa) = s.parse::<SocketAddr>() {
        return Ok((sa.ip(), sa.port()));
    }
    let ip = s.parse().with_context(|| format!("bad endpoint {s}"))?;
    Ok((ip, 0))
}

impl PacketSpec {
    pub fn direction(&self) -> anyhow::Result<Direction> {
        self.dir.parse().map_err(|e| anyhow!("{e}"))
    }

    /// Build the packet, with valid checksums.
    pub fn to_packet(&self) -> anyhow::Result<Packet> {
        let proto = self.proto.parse::<Protocol>().map_err(|e| anyhow!(e))?;
        let (src_ip, sport) = parse_endpoint(&self.src)?;
        let (dst_ip, dport) = parse_endpoint(&self.dst)?;
        let (af, src) = PfAddr::from_ip(src_ip);
        let (daf, dst) = PfAddr::from_ip(dst_ip);
        if af != daf {
            bail!("{} and {} are of different families", self.src, self.dst);
        }

        let l4 = match proto {
            Protocol::TCP => {
                let flags = match &self.flags {
                    Some(f) => f.parse::<TcpFlags>().map_err(|e| anyhow!(e))?,
                    None => TcpFlags::empty(),
                };
                let mut t = TcpHdr::new(sport, dport, flags);
                t.seq = self.seq;
                t.ack = self.ack;
                t.win = self.win;
                L4::Tcp(t)
            }
            Protocol::UDP => L4::Udp(UdpHdr { sport, dport, sum: 0 }),
            Protocol::ICMP | Protocol::ICMPv6 => {
                if proto != af.icmp_proto() {
                    bail!("{proto} over {af}");
                }
                let ty = self.icmp_type.unwrap_or(match af {
                    Af::Inet => ICMP_ECHO,
                    Af::Inet6 => ICMP6_ECHO_REQUEST,
                });
                L4::Icmp(IcmpHdr {
                    ty,
                    code: self.icmp_code,
                    sum: 0,
                    id: self.id,
                    seq: 0,
                    inner: None,
                })
            }
            _ => L4::None,
        };
        Ok(Packet::new(af, src, dst, proto, l4, vec![0; self.len]))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SCENARIO: &str = r#"
        [config]
        hostid = 3

        [[table]]
        name = "bad"
        entries = ["198.51.100.0/24"]

        [[anchor]]
        name = "web"
        [[anchor.filter]]
        action = "Pass"
        proto = "tcp"
        to_port = 80
        keep_state = "Keep"

        [[filter]]
        action = "Drop"
        quick = true
        from = "<bad>"

        [[filter]]
        anchor = "web"

        [[nat]]
        action = "Nat"
        dir = "out"
        from = "10.0.0.0/8"
        pool = { addrs = ["192.0.2.1"], ports = [50001, 65535] }

        [[packet]]
        dir = "out"
        proto = "tcp"
        src = "10.0.0.5:40000"
        dst = "203.0.113.5:80"
        flags = "S"
        seq = 1000
    "#;

    #[test]
    fn parse_and_build() {
        let sc = Scenario::from_toml(SCENARIO).unwrap();
        assert_eq!(sc.config.hostid, 3);
        assert_eq!(sc.rules.filter.len(), 2);
        assert_eq!(sc.rules.nat.len(), 1);

        let loaded = sc.build().unwrap();
        assert_eq!(loaded.tables.len(), 1);
        assert_eq!(loaded.ruleset.list(RuleClass::Filter).len(), 2);
        assert_eq!(loaded.ruleset.list(RuleClass::Nat).len(), 1);

        let pkt = sc.packets[0].to_packet().unwrap();
        assert_eq!(pkt.proto, Protocol::TCP);
        assert_eq!(pkt.sport(), Some(40000));
        assert_eq!(pkt.tcp_flags(), Some(TcpFlags::SYN));
        assert!(pkt.checksums_ok());
        assert_eq!(sc.packets[0].ifname, DEFAULT_IFNAME);
    }

    #[test]
    fn unknown_names_are_errors() {
        let sc = Scenario::from_toml(
            r#"
            [[filter]]
            from = "<nope>"
            "#,
        )
        .unwrap();
        let err = sc.build().err().unwrap();
        assert!(format!("{err:#}").contains("no such table"));

        let sc = Scenario::from_toml(
            r#"
            [[filter]]
            anchor = "missing"
            "#,
        )
        .unwrap();
        assert!(sc.build().is_err());
    }

    #[test]
    fn addresses_and_ports() {
        let names = Names::default();
        let ra = names.addr("!10.0.0.0/8", Some(&PortSpec::Range([1, 5])));
        let ra = ra.unwrap();
        assert!(ra.neg);
        assert!(ra.port_matches(Some(5)));
        assert!(!ra.port_matches(Some(6)));

        let (af, a) = PfAddr::from_ip("10.1.2.3".parse().unwrap());
        assert!(!ra.addr_matches(af, a));
        assert!(names.addr("10.0.0.1", None).unwrap().addr_matches(
            af,
            PfAddr::from_ip("10.0.0.1".parse().unwrap()).1
        ));
        assert!(names.addr("any", None).unwrap().addr_matches(af, a));
    }

    #[test]
    fn flag_predicates() {
        let spec =
            RuleSpec { flags: Some("S/SA".into()), ..Default::default() };
        let preds = spec.preds().unwrap();
        assert_eq!(
            preds,
            vec![Predicate::TcpFlags {
                flags: TcpFlags::SYN,
                mask: TcpFlags::SYN | TcpFlags::ACK,
            }]
        );
    }

    #[test]
    fn icmp_needs_matching_family() {
        let spec = PacketSpec {
            at: 0,
            dir: "in".into(),
            ifname: default_ifname(),
            proto: "icmp".into(),
            src: "fd00::1".into(),
            dst: "fd00::2".into(),
            flags: None,
            seq: 0,
            ack: 0,
            win: default_win(),
            icmp_type: None,
            icmp_code: 0,
            id: 7,
            len: 0,
        };
        assert!(spec.to_packet().is_err());

        let spec = PacketSpec { proto: "icmp6".into(), ..spec };
        let pkt = spec.to_packet().unwrap();
        assert_eq!(pkt.icmp().unwrap().ty, ICMP6_ECHO_REQUEST);
        assert_eq!(pkt.icmp().unwrap().id, 7);
    }
}
