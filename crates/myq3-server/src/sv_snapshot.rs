// sv_snapshot.rs — delta compressed snapshot messages
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.
//
// Per frame every due client gets a snapshot built (sequentially, since
// builds append to the shared entity history), encoded (in parallel,
// each worker touching only its own client), then transmitted and
// rescheduled by the rate controller.

use std::cmp::Ordering;
use std::iter::Peekable;

use rayon::prelude::*;

use myq3_common::common::{msg_write_byte, msg_write_data, msg_write_long, msg_write_short};
use myq3_common::msg_delta::{msg_write_delta_entity, msg_write_delta_playerstate};
use myq3_common::q_shared::*;
use myq3_common::qcommon::*;

use crate::server::*;
use crate::sv_ents::sv_build_client_snapshot;
use crate::sv_game::GameWorld;
use crate::sv_history::{EntityHistory, HistoryError};
use crate::sv_netoverhead::NetOverhead;
use crate::sv_rate::{sv_schedule_next_snapshot, RateSettings};
use crate::sv_reliable::write_server_command;

// ============================================================
// Entity list merge
// ============================================================

/// How one entity number differs between the reference frame and the new one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntityDelta<'a> {
    /// in both frames; delta from the old state
    Update(&'a EntityState, &'a EntityState),
    /// only in the new frame; delta from the baseline
    Enter(&'a EntityState),
    /// only in the old frame; removed on the client
    Leave(&'a EntityState),
}

/// Walks two entity lists sorted by number in one pass.
pub struct EntityMerge<'a, O, N>
where
    O: Iterator<Item = &'a EntityState>,
    N: Iterator<Item = &'a EntityState>,
{
    old: Peekable<O>,
    new: Peekable<N>,
}

pub fn merge_entities<'a, O, N>(old: O, new: N) -> EntityMerge<'a, O::IntoIter, N::IntoIter>
where
    O: IntoIterator<Item = &'a EntityState>,
    N: IntoIterator<Item = &'a EntityState>,
{
    EntityMerge {
        old: old.into_iter().peekable(),
        new: new.into_iter().peekable(),
    }
}

impl<'a, O, N> Iterator for EntityMerge<'a, O, N>
where
    O: Iterator<Item = &'a EntityState>,
    N: Iterator<Item = &'a EntityState>,
{
    type Item = EntityDelta<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let oldnum = self.old.peek().map(|e| e.number);
        let newnum = self.new.peek().map(|e| e.number);

        let order = match (oldnum, newnum) {
            (None, None) => return None,
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (Some(o), Some(n)) => n.cmp(&o),
        };

        match order {
            // the new entity isn't present in the old frame
            Ordering::Less => self.new.next().map(EntityDelta::Enter),
            // the old entity isn't present in the new frame
            Ordering::Greater => self.old.next().map(EntityDelta::Leave),
            Ordering::Equal => {
                let old = self.old.next()?;
                let new = self.new.next()?;
                Some(EntityDelta::Update(old, new))
            }
        }
    }
}

/// Writes the entity list of `new` relative to `old`, then the
/// terminating entity number.
pub fn sv_emit_packet_entities<'a>(
    old: impl IntoIterator<Item = &'a EntityState>,
    new: impl IntoIterator<Item = &'a EntityState>,
    sv_entities: &[SvEntity],
    msg: &mut SizeBuf,
    overhead: Option<&NetOverhead>,
) {
    for delta in merge_entities(old, new) {
        let start = msg.cursize;
        let tracked = match delta {
            EntityDelta::Update(old, new) => {
                // delta update from old position
                // because the force parm is false, this will not result
                // in any bytes being emited if the entity has not changed at all
                msg_write_delta_entity(msg, old, Some(new), false);
                new
            }
            EntityDelta::Enter(new) => {
                // this is a new entity, send it from the baseline
                let baseline = &sv_entities[new.number as usize].baseline;
                msg_write_delta_entity(msg, baseline, Some(new), true);
                new
            }
            EntityDelta::Leave(old) => {
                // the old entity isn't present in the new message
                msg_write_delta_entity(msg, old, None, true);
                old
            }
        };
        if let Some(overhead) = overhead {
            overhead.track_entity_overhead(tracked, (msg.cursize - start).max(0) as usize);
        }
    }

    // end of packetentities
    msg_write_short(msg, ENTITYNUM_NONE);
}

// ============================================================
// Client messages
// ============================================================

/// Read-only server state an encode needs; shared by the worker threads.
pub struct EncodeContext<'a> {
    pub sv: &'a Server,
    pub history: &'a EntityHistory,
    pub server_bit: SnapFlags,
    pub pad_packets: i32,
    pub overhead: Option<&'a NetOverhead>,
}

/// (re)send all server commands the client hasn't acknowledged yet.
pub fn sv_update_server_commands_to_client(client: &mut Client, msg: &mut SizeBuf, overhead: Option<&NetOverhead>) {
    for (seq, cmd) in client.reliable.pending() {
        let start = msg.cursize;
        write_server_command(msg, seq, cmd);
        if let Some(overhead) = overhead {
            overhead.track_command_overhead(cmd, (msg.cursize - start).max(0) as usize);
        }
    }
    client.reliable.mark_sent();
}

/// Writes the snapshot in the client's current frame slot, delta
/// compressed from the frame it last acknowledged when that frame and its
/// entities are still available.
pub fn sv_write_snapshot_to_client(
    enc: &EncodeContext<'_>,
    client: &Client,
    msg: &mut SizeBuf,
) -> Result<(), HistoryError> {
    // this is the snapshot we are creating
    let frame = client.current_frame();
    let outgoing = client.netchan.outgoing_sequence;

    // try to use a previous frame as the source for delta compressing the snapshot
    let (oldframe, lastframe) = if client.delta_message <= 0 || client.state != ClientState::Active {
        // client is asking for a retransmit
        (None, 0)
    } else if client.delta_message >= outgoing {
        // the client can't have received the frame being built
        log::debug!("{}: Delta request from future packet.", client.name);
        (None, 0)
    } else if outgoing - client.delta_message >= PACKET_BACKUP - 3 {
        // client hasn't gotten a good message through in a long time
        log::debug!("{}: Delta request from out of date packet.", client.name);
        (None, 0)
    } else {
        // we have a valid snapshot to delta from
        let old = &client.frames[(client.delta_message & PACKET_MASK) as usize];
        if !enc.history.is_retained(old.first_entity) {
            // the snapshot's entities may still have rolled off the buffer, though
            log::debug!("{}: Delta request from out of date entities.", client.name);
            (None, 0)
        } else {
            (Some(old), outgoing - client.delta_message)
        }
    };

    msg_write_byte(msg, SvcOps::Snapshot as i32);

    // send over the current server time so the client can drift
    // its view of time to try to match
    msg_write_long(msg, enc.sv.time + client.old_server_time);

    // what we are delta'ing from
    msg_write_byte(msg, lastframe);

    let mut snap_flags = enc.server_bit;
    if client.rate_delayed {
        snap_flags |= SnapFlags::RATE_DELAYED;
    }
    if client.state != ClientState::Active {
        snap_flags |= SnapFlags::NOT_ACTIVE;
    }
    msg_write_byte(msg, snap_flags.bits() as i32);

    // send over the areabits
    msg_write_byte(msg, frame.areabytes);
    msg_write_data(msg, &frame.areabits[..frame.areabytes.clamp(0, MAX_MAP_AREA_BYTES as i32) as usize]);

    // delta encode the playerstate
    msg_write_delta_playerstate(msg, oldframe.map(|f| &f.ps), &frame.ps);

    // delta encode the entities
    let old = oldframe
        .map(|f| enc.history.range(f.first_entity, f.num_entities))
        .transpose()?;
    let new = enc.history.range(frame.first_entity, frame.num_entities)?;
    sv_emit_packet_entities(old.into_iter().flatten(), new, &enc.sv.sv_entities, msg, enc.overhead);

    // padding for rate debugging
    for _ in 0..enc.pad_packets {
        msg_write_byte(msg, SvcOps::Nop as i32);
    }

    Ok(())
}

/// Builds the whole message for one client. `None` means it overflowed
/// and nothing should be sent this frame.
pub fn sv_encode_client_message(enc: &EncodeContext<'_>, client: &mut Client) -> Option<Vec<u8>> {
    let mut msg = SizeBuf::new(MAX_MSGLEN as i32);
    msg.allow_overflow = true;

    // we need to write the reliable commands before the snapshot
    sv_update_server_commands_to_client(client, &mut msg, enc.overhead);

    if let Err(err) = sv_write_snapshot_to_client(enc, client, &mut msg) {
        log::warn!("WARNING: snapshot for {} not written: {}", client.name, err);
        return None;
    }

    // check for overflow
    if msg.overflowed {
        log::warn!("WARNING: msg overflowed for {}", client.name);
        return None;
    }

    Some(msg.as_slice().to_vec())
}

/// Stamps the frame, hands the message to the netchan and works out when
/// the client can have its next snapshot.
pub fn sv_send_message_to_client(
    client: &mut Client,
    data: &[u8],
    time: i32,
    settings: &RateSettings,
    overhead: Option<&NetOverhead>,
) {
    // record information about the message
    let frame = client.current_frame_mut();
    frame.message_size = data.len() as i32;
    frame.message_sent = time;
    frame.message_acked = -1;

    // send the datagram
    client.netchan.transmit(data, time);
    if let Some(overhead) = overhead {
        overhead.track_message(data.len());
    }

    sv_schedule_next_snapshot(settings, client, data.len() as i32, time);
}

/// Sends a snapshot to every client whose next snapshot time has come.
pub fn sv_send_client_messages(ctx: &mut ServerContext) {
    let time = ctx.svs.time;

    // Phase 1: build snapshots (writes the shared entity history)
    let due: Vec<usize> = ctx
        .svs
        .clients
        .iter()
        .enumerate()
        .filter(|(_, c)| c.state != ClientState::Free && time >= c.next_snapshot_time)
        .map(|(i, _)| i)
        .collect();

    for &i in &due {
        sv_build_client_snapshot(ctx, i);
    }

    let settings = RateSettings::from_cvars(&mut ctx.cvars);
    let pad_packets = ctx.cvars.variable_integer("sv_padPackets").max(0);
    let track_overhead = ctx.cvars.variable_integer("sv_netOverhead") != 0;

    let ServerContext { sv, svs, game, overhead, .. } = ctx;
    let game: &GameWorld = game;
    let enc = EncodeContext {
        sv,
        history: &svs.history,
        server_bit: svs.snap_flag_server_bit,
        pad_packets,
        overhead: if track_overhead { Some(&*overhead) } else { None },
    };

    // Phase 2: encode in parallel, each worker owns one client
    let messages: Vec<(usize, Option<Vec<u8>>)> = svs
        .clients
        .par_iter_mut()
        .enumerate()
        .filter(|(i, _)| due.binary_search(i).is_ok())
        .filter(|(_, client)| {
            // bots need to have their snapshots built, but
            // they query them directly without needing to be sent
            !client
                .gentity_num
                .is_some_and(|n| game.entities[n].r.sv_flags.contains(SvFlags::BOT))
        })
        .map(|(i, client)| (i, sv_encode_client_message(&enc, client)))
        .collect();

    // Phase 3: transmit and reschedule
    for (i, message) in messages {
        if let Some(data) = message {
            sv_send_message_to_client(&mut svs.clients[i], &data, time, &settings, enc.overhead);
        }
    }
}
