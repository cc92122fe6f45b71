// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::io;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use slog::Drain;
use tabwriter::TabWriter;

use pf::api::PfConfig;
use pf::api::RuleClass;
use pf::engine::Pf;
use pf::engine::table::AddrTable;
use pf::print::print_rules;
use pf::print::print_src_nodes;
use pf::print::print_states;
use pf::print::print_stats;
use pf::print::write_hr;
use pf::print::write_hrb;
use pfadm::Replay;
use pfadm::Verdict;
use pfadm::scenario::Scenario;

/// Replay packet scenarios through the pf engine.
///
/// Engine diagnostics, packet logs and generated replies are logged to
/// stderr; set RUST_LOG (e.g. `RUST_LOG=debug`) to see more.
#[derive(Debug, Parser)]
#[command(version)]
enum Command {
    /// Replay the packets of a scenario and show the resulting tables.
    Replay {
        file: PathBuf,

        /// Print verdicts and tables as JSON.
        #[arg(long)]
        json: bool,

        /// Only print the verdicts.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Load a scenario's rules and show them without replaying.
    Check { file: PathBuf },

    /// Print the default engine configuration as TOML.
    Defaults,
}

const CLASSES: [(RuleClass, &str); 4] = [
    (RuleClass::Nat, "NAT Rules"),
    (RuleClass::Binat, "BINAT Rules"),
    (RuleClass::Rdr, "RDR Rules"),
    (RuleClass::Filter, "Filter Rules"),
];

fn print_verdicts(verdicts: &[Verdict]) -> io::Result<()> {
    let mut t = TabWriter::new(io::stdout());
    writeln!(t, "Packets: {}", verdicts.len())?;
    write_hr(&mut t)?;
    writeln!(t, "#\tAT\tDIR\tIF\tFLOW\tACTION\tREASON\tRULE\tSTATE")?;
    for v in verdicts {
        let flow = if v.before == v.after {
            v.before.to_string()
        } else {
            format!("{} -> {}", v.before, v.after)
        };
        let rule = v.rule_nr.map_or("-".to_string(), |nr| nr.to_string());
        let state = v.state_id.map_or("-".to_string(), |id| id.to_string());
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            v.idx,
            v.at,
            v.dir,
            v.ifname,
            flow,
            v.action,
            v.reason,
            rule,
            state,
        )?;
    }
    t.flush()
}

fn print_tables(tables: &[Arc<AddrTable>]) -> io::Result<()> {
    let mut t = TabWriter::new(io::stdout());
    writeln!(t, "Tables: {}", tables.len())?;
    write_hr(&mut t)?;
    writeln!(t, "NAME\tMATCHES\tMISSES\tENTRIES")?;
    for tbl in tables {
        let (matches, misses) = tbl.stats();
        let entries = tbl
            .entries()
            .iter()
            .map(|e| {
                if e.neg { format!("!{}", e.cidr) } else { e.cidr.to_string() }
            })
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(t, "<{}>\t{matches}\t{misses}\t{entries}", tbl.name())?;
    }
    t.flush()
}

fn print_all_rules(pf: &Pf) -> io::Result<()> {
    for (class, title) in CLASSES {
        let rules = pf.rule_dump(class);
        if !rules.is_empty() {
            print_rules(title, &rules)?;
            println!();
        }
    }
    Ok(())
}

fn print_json(replay: &Replay, verdicts: &[Verdict]) -> anyhow::Result<()> {
    let pf = &replay.pf;
    let rules = CLASSES
        .iter()
        .map(|(class, _)| (format!("{class:?}"), pf.rule_dump(*class)))
        .collect::<BTreeMap<_, _>>();
    let doc = serde_json::json!({
        "verdicts": verdicts,
        "states": pf.state_dump(),
        "src_nodes": pf.src_node_dump(),
        "rules": rules,
        "stats": pf.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

fn logger() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain);
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), slog::o!()), guard)
}

fn main() -> anyhow::Result<()> {
    let cmd = Command::parse();
    let (log, _guard) = logger();

    match cmd {
        Command::Replay { file, json, quiet } => {
            let sc = Scenario::load(&file)?;
            let mut replay = Replay::new(&sc, &log)?;
            let verdicts = replay.run(&sc)?;

            if json {
                return print_json(&replay, &verdicts);
            }

            print_verdicts(&verdicts)?;
            if quiet {
                return Ok(());
            }
            println!();
            print_states(&replay.pf.state_dump())?;
            println!();
            print_src_nodes(&replay.pf.src_node_dump())?;
            println!();
            if !replay.tables.is_empty() {
                print_tables(&replay.tables)?;
                println!();
            }
            print_all_rules(&replay.pf)?;
            print_stats(&replay.pf.stats())?;
        }

        Command::Check { file } => {
            let sc = Scenario::load(&file)?;
            let replay = Replay::new(&sc, &log)?;
            let mut out = io::stdout();
            write_hrb(&mut out)?;
            writeln!(out, "{}", file.display())?;
            write_hrb(&mut out)?;
            print_all_rules(&replay.pf)?;
            writeln!(
                out,
                "{} tables, {} packets",
                replay.tables.len(),
                sc.packets.len()
            )?;
        }

        Command::Defaults => {
            print!("{}", toml::to_string_pretty(&PfConfig::default())?);
        }
    }

    Ok(())
}
