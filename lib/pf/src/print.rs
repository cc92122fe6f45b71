// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print engine dumps in a human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both pfadm and integration tests.

use crate::api::PfStatsDump;
use crate::api::RuleDump;
use crate::api::SrcNodeDump;
use crate::api::StateDump;
use std::io::Write;
use tabwriter::TabWriter;

/// Print a list of [`StateDump`].
pub fn print_states(states: &[StateDump]) -> std::io::Result<()> {
    print_states_into(&mut std::io::stdout(), states)
}

/// Print a list of [`StateDump`] into a given writer.
///
/// A translated state shows its stack-side tuple in parentheses after
/// the wire-side one.
pub fn print_states_into(
    writer: &mut impl Write,
    states: &[StateDump],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "States: {}", states.len())?;
    write_hr(&mut t)?;
    writeln!(
        t,
        "ID\tIF\tDIR\tFLOW\tSTATE\tTIMEOUT\tEXPIRE\tPKTS\tBYTES\tRULE"
    )?;
    for st in states {
        let flow = if st.wire == st.stack {
            st.wire.to_string()
        } else {
            format!("{} ({})", st.wire, st.stack)
        };
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}:{}\t{}\t{}\t{}:{}\t{}:{}\t{}",
            st.id,
            st.ifname.as_deref().unwrap_or("all"),
            st.direction,
            flow,
            st.src.state,
            st.dst.state,
            st.timeout,
            st.expire,
            st.packets[0],
            st.packets[1],
            st.bytes[0],
            st.bytes[1],
            st.rule_nr,
        )?;
    }
    t.flush()
}

/// Print a list of [`SrcNodeDump`].
pub fn print_src_nodes(nodes: &[SrcNodeDump]) -> std::io::Result<()> {
    print_src_nodes_into(&mut std::io::stdout(), nodes)
}

/// Print a list of [`SrcNodeDump`] into a given writer.
pub fn print_src_nodes_into(
    writer: &mut impl Write,
    nodes: &[SrcNodeDump],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "Source Nodes: {}", nodes.len())?;
    write_hr(&mut t)?;
    writeln!(t, "ADDR\tSTICKY\tRULE\tSTATES\tCONN\tRATE\tEXPIRE")?;
    for n in nodes {
        let raddr = match n.raddr {
            Some(a) => a.display(n.af).to_string(),
            None => "-".to_string(),
        };
        let rule = match n.rule_nr {
            Some(nr) => nr.to_string(),
            None => "*".to_string(),
        };
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            n.addr.display(n.af),
            raddr,
            rule,
            n.states,
            n.conn,
            n.conn_rate,
            n.expire,
        )?;
    }
    t.flush()
}

/// Print a list of [`RuleDump`].
pub fn print_rules(title: &str, rules: &[RuleDump]) -> std::io::Result<()> {
    print_rules_into(&mut std::io::stdout(), title, rules)
}

/// Print a list of [`RuleDump`] into a given writer.
pub fn print_rules_into(
    writer: &mut impl Write,
    title: &str,
    rules: &[RuleDump],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "{title}")?;
    write_hr(&mut t)?;
    writeln!(t, "NR\tEVALS\tPKTS IN\tPKTS OUT\tSTATES\tNODES\tRULE")?;
    for r in rules {
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}/{}\t{}\t{}",
            r.nr,
            r.evaluations,
            r.packets[0],
            r.packets[1],
            r.states_cur,
            r.states_tot,
            r.src_nodes,
            r.desc,
        )?;
    }
    t.flush()
}

/// Print a [`PfStatsDump`].
pub fn print_stats(stats: &PfStatsDump) -> std::io::Result<()> {
    print_stats_into(&mut std::io::stdout(), stats)
}

/// Print a [`PfStatsDump`] into a given writer. Reasons that never
/// fired are left out.
pub fn print_stats_into(
    writer: &mut impl Write,
    stats: &PfStatsDump,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "State Table")?;
    write_hrb(&mut t)?;
    writeln!(t, "current entries\t{}", stats.states)?;
    writeln!(t, "searches\t{}", stats.state_searches)?;
    writeln!(t, "inserts\t{}", stats.state_inserts)?;
    writeln!(t, "removals\t{}", stats.state_removals)?;
    t.flush()?;

    writeln!(t, "\nSource Tracking Table")?;
    write_hrb(&mut t)?;
    writeln!(t, "current entries\t{}", stats.src_nodes)?;
    writeln!(t, "searches\t{}", stats.src_node_searches)?;
    writeln!(t, "inserts\t{}", stats.src_node_inserts)?;
    writeln!(t, "removals\t{}", stats.src_node_removals)?;
    t.flush()?;

    writeln!(t, "\nCounters")?;
    write_hrb(&mut t)?;
    for (reason, n) in stats.reasons.iter().filter(|(_, n)| *n != 0) {
        writeln!(t, "{reason}\t{n}")?;
    }
    t.flush()?;

    writeln!(t, "\nLimit Counters")?;
    write_hrb(&mut t)?;
    writeln!(t, "max states per rule\t{}", stats.limit_states)?;
    writeln!(t, "max-src-states\t{}", stats.limit_src_states)?;
    writeln!(t, "max-src-nodes\t{}", stats.limit_src_nodes)?;
    writeln!(t, "max-src-conn\t{}", stats.limit_src_conn)?;
    writeln!(t, "max-src-conn-rate\t{}", stats.limit_src_conn_rate)?;
    writeln!(t, "overload table insertion\t{}", stats.overload_table)?;
    writeln!(t, "overload flush states\t{}", stats.overload_flush)?;
    t.flush()
}

/// Print a horizontal rule in bold.
pub fn write_hrb(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:=<70}", "=")
}

/// Print a horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::Reason;

    #[test]
    fn stats_skip_quiet_reasons() {
        let stats = PfStatsDump {
            reasons: vec![(Reason::Match, 3), (Reason::Short, 0)],
            states: 2,
            ..Default::default()
        };
        let mut out = Vec::new();
        print_stats_into(&mut out, &stats).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains(&Reason::Match.to_string()));
        assert!(!out.contains(&Reason::Short.to_string()));
        assert!(out.lines().any(|l| l.starts_with("current entries")));
    }
}
