// sv_netoverhead.rs — bandwidth accounting by entity and command predicates
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.
//
// Tooling registers named predicates; every byte the encoder writes for an
// entity or reliable command matching one is charged to that name. Encodes
// run on worker threads, so counters are atomics and the tracker lists sit
// behind a lock.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use myq3_common::q_shared::EntityState;

pub type EntityPredicate = Box<dyn Fn(&EntityState) -> bool + Send + Sync>;
pub type CommandPredicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

struct Tracker<P> {
    name: String,
    predicate: P,
    count: u64,
    bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverheadLine {
    pub name: String,
    pub count: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverheadReport {
    pub messages: u64,
    pub message_bytes: u64,
    /// grouped by tracker name, sorted by name
    pub entities: Vec<OverheadLine>,
    pub commands: Vec<OverheadLine>,
}

#[derive(Default)]
pub struct NetOverhead {
    entity_trackers: Mutex<Vec<Tracker<EntityPredicate>>>,
    command_trackers: Mutex<Vec<Tracker<CommandPredicate>>>,
    messages: AtomicU64,
    message_bytes: AtomicU64,
}

impl NetOverhead {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entity_tracker(&self, name: &str, predicate: EntityPredicate) {
        self.entity_trackers.lock().push(Tracker {
            name: name.to_string(),
            predicate,
            count: 0,
            bytes: 0,
        });
    }

    pub fn register_command_tracker(&self, name: &str, predicate: CommandPredicate) {
        self.command_trackers.lock().push(Tracker {
            name: name.to_string(),
            predicate,
            count: 0,
            bytes: 0,
        });
    }

    /// Charges `bytes` to every entity tracker matching `state`.
    pub fn track_entity_overhead(&self, state: &EntityState, bytes: usize) {
        for tracker in self.entity_trackers.lock().iter_mut() {
            if (tracker.predicate)(state) {
                tracker.count += 1;
                tracker.bytes += bytes as u64;
            }
        }
    }

    pub fn track_command_overhead(&self, cmd: &str, bytes: usize) {
        for tracker in self.command_trackers.lock().iter_mut() {
            if (tracker.predicate)(cmd) {
                tracker.count += 1;
                tracker.bytes += bytes as u64;
            }
        }
    }

    /// Counts one whole message handed to the netchan.
    pub fn track_message(&self, bytes: usize) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.message_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn report(&self) -> OverheadReport {
        OverheadReport {
            messages: self.messages.load(Ordering::Relaxed),
            message_bytes: self.message_bytes.load(Ordering::Relaxed),
            entities: group_lines(self.entity_trackers.lock().iter().map(|t| (&t.name, t.count, t.bytes))),
            commands: group_lines(self.command_trackers.lock().iter().map(|t| (&t.name, t.count, t.bytes))),
        }
    }

    /// Zeroes the counters; registered trackers stay.
    pub fn reset(&self) {
        for tracker in self.entity_trackers.lock().iter_mut() {
            tracker.count = 0;
            tracker.bytes = 0;
        }
        for tracker in self.command_trackers.lock().iter_mut() {
            tracker.count = 0;
            tracker.bytes = 0;
        }
        self.messages.store(0, Ordering::Relaxed);
        self.message_bytes.store(0, Ordering::Relaxed);
    }
}

fn group_lines<'a>(trackers: impl Iterator<Item = (&'a String, u64, u64)>) -> Vec<OverheadLine> {
    let mut grouped: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
    for (name, count, bytes) in trackers {
        let entry = grouped.entry(name.as_str()).or_default();
        entry.0 += count;
        entry.1 += bytes;
    }
    grouped
        .into_iter()
        .map(|(name, (count, bytes))| OverheadLine {
            name: name.to_string(),
            count,
            bytes,
        })
        .collect()
}

impl OverheadReport {
    /// Console text for the net_overhead command.
    pub fn format(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} messages, {} bytes", self.messages, self.message_bytes);
        for (title, lines) in [("entities", &self.entities), ("commands", &self.commands)] {
            if lines.is_empty() {
                continue;
            }
            let _ = writeln!(out, "{}:", title);
            for line in lines {
                let pct = if self.message_bytes > 0 {
                    line.bytes as f64 * 100.0 / self.message_bytes as f64
                } else {
                    0.0
                };
                let _ = writeln!(
                    out,
                    "  {:<24} {:>8} {:>10} bytes {:>6.2}%",
                    line.name, line.count, line.bytes, pct
                );
            }
        }
        out
    }
}
