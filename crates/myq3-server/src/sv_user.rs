// sv_user.rs — server code for moving users
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.

use myq3_common::common::*;
use myq3_common::q_shared::*;
use myq3_common::qcommon::*;

use crate::server::*;
use crate::sv_main::{sv_drop_client, sv_userinfo_changed};

// ============================================================
// Packet entry
// ============================================================

/// A sequenced packet arrived from a connected client.
pub fn sv_packet_event(ctx: &mut ServerContext, client_num: usize, sequence: i32, data: &[u8]) {
    let time = ctx.svs.time;
    let client = &mut ctx.svs.clients[client_num];
    if client.state == ClientState::Free {
        return;
    }

    // discard stale or duplicated packets
    if sequence <= client.netchan.incoming_sequence {
        log::debug!(
            "{}: out of order packet {} at {}",
            client.name,
            sequence,
            client.netchan.incoming_sequence
        );
        return;
    }
    client.netchan.incoming_sequence = sequence;
    client.last_packet_time = time;

    // zombie clients still need to do the netchan processing
    // to make sure they don't need to retransmit the final
    // reliable message, but they don't do any other processing
    if client.state == ClientState::Zombie {
        return;
    }

    let mut msg = SizeBuf::from_bytes(data);
    sv_execute_client_message(ctx, client_num, &mut msg);
}

// ============================================================
// Client commands
// ============================================================

type UserCommandFn = fn(&mut ServerContext, usize, &str);

static UCMDS: &[(&str, UserCommandFn)] = &[("userinfo", sv_update_userinfo_f), ("disconnect", sv_disconnect_f)];

fn sv_update_userinfo_f(ctx: &mut ServerContext, client_num: usize, args: &str) {
    let info = args.trim().trim_matches('"');
    ctx.svs.clients[client_num].userinfo = q_strncpyz(info, MAX_INFO_STRING);
    sv_userinfo_changed(ctx, client_num);
}

fn sv_disconnect_f(ctx: &mut ServerContext, client_num: usize, _args: &str) {
    sv_drop_client(ctx, client_num, "disconnected");
}

/// Runs a client command the server understands; everything else is
/// queued for the game.
pub fn sv_execute_client_command(ctx: &mut ServerContext, client_num: usize, s: &str) {
    let (name, args) = s.split_once(' ').unwrap_or((s, ""));

    if let Some(&(_, func)) = UCMDS.iter().find(|(ucmd, _)| ucmd.eq_ignore_ascii_case(name)) {
        func(ctx, client_num, args);
        return;
    }

    if ctx.sv.state == ServerState::Game {
        ctx.svs.clients[client_num].game_commands.push(s.to_string());
    }
}

/// Reads one clientCommand op. Returns false when the client was dropped
/// and the rest of the message must be ignored.
fn sv_client_command(ctx: &mut ServerContext, client_num: usize, msg: &mut SizeBuf) -> bool {
    let seq = msg_read_long(msg);
    let s = msg_read_string(msg);

    let client = &ctx.svs.clients[client_num];

    // see if we have already executed it
    if client.last_client_command >= seq {
        return true;
    }

    log::trace!("clientCommand: {} : {} : {}", client.name, seq, s);

    // drop the connection if we have somehow lost commands
    if seq > client.last_client_command + 1 {
        log::info!(
            "Client {} lost {} clientCommands",
            client.name,
            seq - client.last_client_command + 1
        );
        sv_drop_client(ctx, client_num, "Lost reliable commands");
        return false;
    }

    sv_execute_client_command(ctx, client_num, &s);
    ctx.svs.clients[client_num].last_client_command = seq;
    true
}

// ============================================================
// Moves
// ============================================================

/// Called when a client's first move arrives; snapshots switch from
/// NOT_ACTIVE to the real thing.
pub fn sv_client_enter_world(ctx: &mut ServerContext, client_num: usize) {
    let time = ctx.svs.time;
    let client = &mut ctx.svs.clients[client_num];
    log::debug!("Going from CS_PRIMED to CS_ACTIVE for {}", client.name);
    client.state = ClientState::Active;

    // force a full snapshot and send it right away
    client.delta_message = -1;
    client.next_snapshot_time = time;
}

fn sv_user_move(ctx: &mut ServerContext, client_num: usize, delta: bool) {
    let time = ctx.svs.time;
    let client = &mut ctx.svs.clients[client_num];

    client.delta_message = if delta { client.message_acknowledge } else { -1 };

    // save time for ping calculation, from the first acknowledgement only
    let frame = &mut client.frames[(client.message_acknowledge & PACKET_MASK) as usize];
    if frame.message_acked == -1 {
        frame.message_acked = time;
    }

    // if this is the first usercmd we have received
    // this gamestate, put the client into the world
    if client.state == ClientState::Primed {
        sv_client_enter_world(ctx, client_num);
    }
}

// ============================================================
// SV_ExecuteClientMessage
// ============================================================

/// Parses a current message from a client: the acknowledgement header,
/// any reliable client commands, then at most one move.
pub fn sv_execute_client_message(ctx: &mut ServerContext, client_num: usize, msg: &mut SizeBuf) {
    msg_begin_reading(msg);

    let server_id = msg_read_long(msg);
    let message_acknowledge = msg_read_long(msg);
    let reliable_acknowledge = msg_read_long(msg);
    if msg_read_overrun(msg) {
        log::debug!("{}: truncated client message", ctx.svs.clients[client_num].name);
        return;
    }

    let client = &mut ctx.svs.clients[client_num];
    if message_acknowledge < 0 {
        // usually only hackers create messages like this
        // it is more annoying for them to let them hanging
        log::debug!("{}: illegible client message", client.name);
        return;
    }
    if message_acknowledge > client.netchan.outgoing_sequence {
        // acknowledges a message we never sent
        log::debug!("{}: ack {} past outgoing {}", client.name, message_acknowledge, client.netchan.outgoing_sequence);
        return;
    }
    client.message_acknowledge = message_acknowledge;

    // NOTE: when the client message is fux0red the acknowledgement numbers
    // can be out of range, this could cause the server to send thousands of
    // server commands which the server thinks are not yet acknowledged
    if !client.reliable.acknowledge(reliable_acknowledge) {
        log::debug!("{}: illegible reliable acknowledge {}", client.name, reliable_acknowledge);
        return;
    }

    // if this is a usercmd from a previous gamestate,
    // ignore it or retransmit the current gamestate
    if server_id != ctx.sv.server_id {
        if server_id >= ctx.sv.restarted_server_id && server_id < ctx.sv.server_id {
            // they just haven't caught the map_restart yet
            log::debug!("{} : ignoring pre map_restart / outdated client message", client.name);
        } else {
            log::debug!("{} : dropped gamestate, resending", client.name);
            client.delta_message = -1;
        }
        return;
    }

    // this client has acknowledged the new gamestate so it's
    // safe to start sending it the real time again
    if client.old_server_time != 0 {
        log::debug!("{} acknowledged gamestate", client.name);
        client.old_server_time = 0;
    }

    // read optional clientCommand strings
    let mut c;
    loop {
        c = msg_read_byte(msg);
        if c != ClcOps::ClientCommand as i32 {
            break;
        }
        if !sv_client_command(ctx, client_num, msg) {
            return; // we couldn't execute it because of the flood protection
        }
        if ctx.svs.clients[client_num].state == ClientState::Zombie {
            return; // disconnect command
        }
    }

    // read the usercmd_t
    match ClcOps::from_byte(c) {
        Some(ClcOps::Move) => sv_user_move(ctx, client_num, true),
        Some(ClcOps::MoveNoDelta) => sv_user_move(ctx, client_num, false),
        Some(ClcOps::Eof) => {}
        // end of message
        _ if c == -1 => {}
        _ => log::warn!("bad command byte {} for client {}", c, ctx.svs.clients[client_num].name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use myq3_common::net::*;
    use myq3_common::snapshot_parse::SnapshotReceiver;

    use crate::sv_game::GameImport;
    use crate::sv_main::{sv_calc_pings, sv_client_connect, sv_send_server_command, sv_spawn_server};
    use crate::sv_snapshot::sv_send_client_messages;
    use crate::sv_world::VisMap;

    fn open_map() -> VisMap {
        let mut map = VisMap::new(1, 1);
        map.add_leaf([-4096.0; 3], [4096.0; 3], 0, 0);
        map
    }

    /// A running server with two linked movers and one remote client.
    fn server_with_client() -> (ServerContext, usize, [usize; 2]) {
        let mut ctx = ServerContext::new(Box::new(open_map()), 2);
        let mut movers = [0; 2];
        for (i, mover) in movers.iter_mut().enumerate() {
            let num = ctx.game.spawn().unwrap();
            let ent = ctx.game.gentity_mut(num);
            ent.s.modelindex = 3 + i as i32;
            ent.r.current_origin = [64.0 * i as f32, 0.0, 0.0];
            ent.s.origin = ent.r.current_origin;
            ent.r.linked = true;
            *mover = num;
        }
        sv_spawn_server(&mut ctx);
        let c = sv_client_connect(&mut ctx, NetAdr::ipv4([8, 8, 4, 4], 27960), "\\name\\remote\\rate\\90000")
            .unwrap();
        (ctx, c, movers)
    }

    fn client_message(server_id: i32, ack: i32, reliable_ack: i32, commands: &[(i32, &str)], op: ClcOps) -> Vec<u8> {
        let mut msg = SizeBuf::new(1024);
        msg_write_long(&mut msg, server_id);
        msg_write_long(&mut msg, ack);
        msg_write_long(&mut msg, reliable_ack);
        for (seq, cmd) in commands {
            msg_write_byte(&mut msg, ClcOps::ClientCommand as i32);
            msg_write_long(&mut msg, *seq);
            msg_write_string(&mut msg, cmd);
        }
        msg_write_byte(&mut msg, op as i32);
        msg_write_byte(&mut msg, ClcOps::Eof as i32);
        msg.as_slice().to_vec()
    }

    /// Sends whatever is due and feeds it to the receiver.
    fn deliver(ctx: &mut ServerContext, c: usize, rx: &mut SnapshotReceiver) {
        sv_send_client_messages(ctx);
        for (seq, data) in ctx.svs.clients[c].netchan.take_outgoing() {
            rx.parse_server_message(&data, seq).unwrap();
        }
    }

    fn reply(ctx: &mut ServerContext, c: usize, rx: &SnapshotReceiver, sequence: i32) {
        let mut ack = SizeBuf::new(1024);
        rx.write_ack(&mut ack, &[]);
        sv_packet_event(ctx, c, sequence, ack.as_slice());
    }

    // ============================================================
    // Round trip
    // ============================================================

    #[test]
    fn client_reconstructs_world_from_deltas() {
        let (mut ctx, c, movers) = server_with_client();
        let mut rx = SnapshotReceiver::new();
        rx.server_id = ctx.sv.server_id;
        for num in 0..ctx.game.num_entities {
            let mut baseline = ctx.sv.sv_entities[num].baseline;
            baseline.number = num as i32;
            rx.set_baseline(baseline).unwrap();
        }

        // primed: a full NOT_ACTIVE snapshot
        deliver(&mut ctx, c, &mut rx);
        let snap = rx.snap.clone().unwrap();
        assert_eq!(snap.delta_num, -1);
        assert_ne!(snap.snap_flags & SnapFlags::NOT_ACTIVE.bits() as i32, 0);
        let numbers: Vec<i32> = snap.entities.iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![movers[0] as i32, movers[1] as i32]);

        // the first move puts the client in the world
        reply(&mut ctx, c, &rx, 1);
        assert_eq!(ctx.svs.clients[c].state, ClientState::Active);
        assert_eq!(ctx.svs.clients[c].delta_message, -1);

        ctx.svs.time += 50;
        deliver(&mut ctx, c, &mut rx);
        assert_eq!(rx.snap.as_ref().unwrap().delta_num, -1);
        reply(&mut ctx, c, &rx, 2);
        let acked = ctx.svs.clients[c].delta_message;
        assert!(acked > 0);

        // move one mover and remove the other
        {
            let mut import = GameImport {
                game: &mut ctx.game,
                sv_entities: &mut ctx.sv.sv_entities,
                world: &*ctx.world,
                state: ctx.sv.state,
            };
            let ent = import.game.gentity_mut(movers[0]);
            ent.r.current_origin = [100.0, 20.0, 0.0];
            ent.s.origin = ent.r.current_origin;
            ent.s.frame = 7;
            import.link_entity(movers[0]);
            import.unlink_entity(movers[1]);
        }

        ctx.svs.time += 50;
        deliver(&mut ctx, c, &mut rx);
        let snap = rx.snap.clone().unwrap();
        assert_eq!(snap.delta_num, acked);
        let numbers: Vec<i32> = snap.entities.iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![movers[0] as i32]);
        assert_eq!(snap.entities[0], ctx.game.gentity(movers[0]).s);
    }

    #[test]
    fn acknowledged_commands_are_not_resent() {
        let (mut ctx, c, _) = server_with_client();
        let mut rx = SnapshotReceiver::new();
        rx.server_id = ctx.sv.server_id;

        sv_send_server_command(&mut ctx, Some(c), "cs 1 \"a\"");
        sv_send_server_command(&mut ctx, Some(c), "cs 2 \"b\"");
        deliver(&mut ctx, c, &mut rx);
        assert_eq!(rx.server_command_sequence, 2);

        reply(&mut ctx, c, &rx, 1);
        assert_eq!(ctx.svs.clients[c].reliable.acknowledged(), 2);
        assert_eq!(ctx.svs.clients[c].reliable.pending().count(), 0);
    }

    #[test]
    fn acks_feed_ping() {
        let (mut ctx, c, _) = server_with_client();
        let mut rx = SnapshotReceiver::new();
        rx.server_id = ctx.sv.server_id;

        ctx.svs.time = 1000;
        deliver(&mut ctx, c, &mut rx);
        ctx.svs.time = 1080;
        reply(&mut ctx, c, &rx, 1);
        // a second ack of the same frame keeps the first time
        ctx.svs.time = 1200;
        reply(&mut ctx, c, &rx, 2);

        sv_calc_pings(&mut ctx);
        assert_eq!(ctx.svs.clients[c].ping, 80);
    }

    // ============================================================
    // Message header
    // ============================================================

    #[test]
    fn out_of_order_packets_are_dropped() {
        let (mut ctx, c, _) = server_with_client();
        let id = ctx.sv.server_id;
        sv_packet_event(&mut ctx, c, 5, &client_message(id, 0, 0, &[], ClcOps::MoveNoDelta));
        assert_eq!(ctx.svs.clients[c].state, ClientState::Active);

        ctx.svs.clients[c].state = ClientState::Primed;
        sv_packet_event(&mut ctx, c, 4, &client_message(id, 0, 0, &[], ClcOps::MoveNoDelta));
        assert_eq!(ctx.svs.clients[c].state, ClientState::Primed);
        assert_eq!(ctx.svs.clients[c].netchan.incoming_sequence, 5);
    }

    #[test]
    fn outdated_server_id_is_ignored() {
        let (mut ctx, c, _) = server_with_client();
        let old = ctx.sv.server_id;
        sv_spawn_server(&mut ctx);
        ctx.sv.restarted_server_id = old;

        sv_packet_event(&mut ctx, c, 1, &client_message(old, 0, 0, &[], ClcOps::Move));
        assert_eq!(ctx.svs.clients[c].state, ClientState::Primed);

        // the current id is accepted and ends the old clock
        ctx.svs.clients[c].old_server_time = 500;
        let id = ctx.sv.server_id;
        sv_packet_event(&mut ctx, c, 2, &client_message(id, 0, 0, &[], ClcOps::Move));
        assert_eq!(ctx.svs.clients[c].old_server_time, 0);
        assert_eq!(ctx.svs.clients[c].state, ClientState::Active);
    }

    #[test]
    fn bad_reliable_ack_stops_processing() {
        let (mut ctx, c, _) = server_with_client();
        for n in 0..3 {
            sv_send_server_command(&mut ctx, Some(c), &format!("print {}", n));
        }
        let id = ctx.sv.server_id;
        sv_packet_event(&mut ctx, c, 1, &client_message(id, 0, 50, &[], ClcOps::Move));
        assert_eq!(ctx.svs.clients[c].reliable.acknowledged(), 3);
        assert_eq!(ctx.svs.clients[c].state, ClientState::Primed);
    }

    #[test]
    fn move_without_delta_requests_full_snapshot() {
        let (mut ctx, c, _) = server_with_client();
        let id = ctx.sv.server_id;
        ctx.svs.clients[c].state = ClientState::Active;
        ctx.svs.clients[c].netchan.outgoing_sequence = 12;
        sv_packet_event(&mut ctx, c, 1, &client_message(id, 9, 0, &[], ClcOps::Move));
        assert_eq!(ctx.svs.clients[c].delta_message, 9);
        sv_packet_event(&mut ctx, c, 2, &client_message(id, 10, 0, &[], ClcOps::MoveNoDelta));
        assert_eq!(ctx.svs.clients[c].delta_message, -1);
    }

    #[test]
    fn ack_past_outgoing_sequence_is_ignored() {
        let (mut ctx, c, _) = server_with_client();
        let id = ctx.sv.server_id;
        ctx.svs.clients[c].state = ClientState::Active;
        ctx.svs.clients[c].netchan.outgoing_sequence = 12;
        sv_packet_event(&mut ctx, c, 1, &client_message(id, 11, 0, &[], ClcOps::Move));
        assert_eq!(ctx.svs.clients[c].delta_message, 11);

        sv_packet_event(&mut ctx, c, 2, &client_message(id, 13, 0, &[], ClcOps::Move));
        assert_eq!(ctx.svs.clients[c].message_acknowledge, 11);
        assert_eq!(ctx.svs.clients[c].delta_message, 11);
        assert_eq!(ctx.svs.clients[c].netchan.incoming_sequence, 2);
    }

    // ============================================================
    // Client commands
    // ============================================================

    #[test]
    fn client_commands_execute_once() {
        let (mut ctx, c, _) = server_with_client();
        let id = ctx.sv.server_id;
        let cmds = [(1, "say hello"), (2, "userinfo \"\\name\\renamed\\rate\\5000\"")];
        sv_packet_event(&mut ctx, c, 1, &client_message(id, 0, 0, &cmds, ClcOps::Move));
        // resent by the client until acknowledged
        sv_packet_event(&mut ctx, c, 2, &client_message(id, 0, 0, &cmds, ClcOps::Move));

        let cl = &ctx.svs.clients[c];
        assert_eq!(cl.game_commands, vec!["say hello".to_string()]);
        assert_eq!(cl.last_client_command, 2);
        assert_eq!(cl.name, "renamed");
        assert_eq!(cl.rate, 5000);
    }

    #[test]
    fn lost_client_commands_drop_the_client() {
        let (mut ctx, c, _) = server_with_client();
        let id = ctx.sv.server_id;
        sv_packet_event(&mut ctx, c, 1, &client_message(id, 0, 0, &[(3, "say late")], ClcOps::Move));
        assert_eq!(ctx.svs.clients[c].state, ClientState::Zombie);
        assert!(ctx.svs.clients[c].game_commands.is_empty());
    }

    #[test]
    fn disconnect_command_zombies_and_stops() {
        let (mut ctx, c, _) = server_with_client();
        let id = ctx.sv.server_id;
        let cmds = [(1, "disconnect"), (2, "say ghost")];
        sv_packet_event(&mut ctx, c, 1, &client_message(id, 0, 0, &cmds, ClcOps::Move));
        assert_eq!(ctx.svs.clients[c].state, ClientState::Zombie);
        assert!(ctx.svs.clients[c].game_commands.is_empty());

        // zombies only update netchan bookkeeping
        ctx.svs.time = 700;
        sv_packet_event(&mut ctx, c, 2, &client_message(id, 0, 0, &[(2, "say ghost")], ClcOps::Move));
        assert_eq!(ctx.svs.clients[c].last_packet_time, 700);
        assert!(ctx.svs.clients[c].game_commands.is_empty());
    }
}
