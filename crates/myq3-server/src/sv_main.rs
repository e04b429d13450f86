// sv_main.rs — server frame loop, client slots and server commands
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.

use rayon::prelude::*;

use myq3_common::cvar::*;
use myq3_common::net::{net_adr_to_string, net_is_lan_address};
use myq3_common::q_shared::*;
use myq3_common::qcommon::*;

use crate::server::*;
use crate::sv_game::{GameImport, GameSimulation, GameWorld};
use crate::sv_netoverhead::NetOverhead;
use crate::sv_snapshot::sv_send_client_messages;
use crate::sv_world::{sv_link_entity, sv_unlink_entity, WorldQuery};

// ============================================================
// Initialization
// ============================================================

impl ServerContext {
    /// A server with `maxclients` slots and no map running.
    pub fn new(world: Box<dyn WorldQuery>, maxclients: usize) -> Self {
        let maxclients = maxclients.clamp(1, MAX_CLIENTS);
        let mut cvars = CvarContext::new();
        sv_register_cvars(&mut cvars, maxclients);
        Self {
            sv: Server::default(),
            svs: ServerStatic::new(maxclients),
            cvars,
            game: GameWorld::new(maxclients),
            world,
            overhead: NetOverhead::new(),
        }
    }
}

pub fn sv_register_cvars(cvars: &mut CvarContext, maxclients: usize) {
    cvars.get("sv_maxclients", &maxclients.to_string(), CVAR_SERVERINFO);
    cvars.get("sv_fps", "20", CVAR_SYSTEMINFO);
    cvars.get("sv_maxRate", "0", CVAR_ARCHIVE | CVAR_SERVERINFO);
    cvars.get("sv_minRate", "0", CVAR_ARCHIVE | CVAR_SERVERINFO);
    cvars.get("sv_lanForceRate", "1", CVAR_ARCHIVE);
    cvars.get("sv_padPackets", "0", 0);
    cvars.get("sv_portalDepth", "4", 0);
    cvars.get("sv_netOverhead", "0", 0);
    cvars.get("sv_timeout", "200", 0);
    cvars.get("sv_zombietime", "2", 0);
}

/// Starts a new map: fresh per-map state, relinked entities and
/// baselines. Connected clients keep their slots but are told the time
/// base changed through old_server_time.
pub fn sv_spawn_server(ctx: &mut ServerContext) {
    log::info!("------ Server Initialization ------");

    // the client will keep seeing the old clock until it acknowledges
    // the new gamestate
    let old_time = ctx.sv.time;
    for client in ctx.svs.clients.iter_mut() {
        if client.state >= ClientState::Connected {
            client.old_server_time = old_time;
            client.delta_message = -1;
        }
    }

    // toggle the server bit so clients can detect that a
    // server has changed
    ctx.svs.snap_flag_server_bit ^= SnapFlags::SERVERCOUNT;

    let server_id = ctx.sv.server_id.wrapping_add(1);
    ctx.sv = Server {
        state: ServerState::Loading,
        server_id,
        restarted_server_id: server_id,
        ..Server::default()
    };

    // entities the game already placed need their clusters recomputed
    for num in 0..ctx.game.num_entities {
        if ctx.game.entities[num].r.linked {
            sv_link_entity(
                &*ctx.world,
                ctx.sv.state,
                &mut ctx.game.entities[num],
                &mut ctx.sv.sv_entities[num],
            );
        }
    }

    // create a baseline for more efficient communications
    sv_create_baseline(ctx);

    ctx.sv.state = ServerState::Game;
    log::info!("-----------------------------------");
}

/// Entity baselines are used to compress non-delta messages to the
/// clients; only the fields that differ from the baseline will be
/// transmitted.
pub fn sv_create_baseline(ctx: &mut ServerContext) {
    for entnum in 1..ctx.game.num_entities {
        let ent = &mut ctx.game.entities[entnum];
        if !ent.r.linked {
            continue;
        }
        ent.s.number = entnum as i32;

        // take current state as baseline
        ctx.sv.sv_entities[entnum].baseline = ent.s;
    }
}

// ============================================================
// Client slots
// ============================================================

/// Puts a new client into the first free slot. Bots enter the world
/// immediately; everyone else waits in Primed until their first move.
pub fn sv_client_connect(ctx: &mut ServerContext, adr: NetAdr, userinfo: &str) -> Option<usize> {
    let Some(slot) = ctx.svs.clients.iter().position(|c| c.state == ClientState::Free) else {
        log::warn!("Rejected a connection from {}: server is full", net_adr_to_string(&adr));
        return None;
    };

    let is_bot = adr.adr_type == NetAdrType::Bot;
    ctx.svs.clients[slot] = Client {
        state: if is_bot { ClientState::Active } else { ClientState::Primed },
        userinfo: q_strncpyz(userinfo, MAX_INFO_STRING),
        gentity_num: Some(slot),
        last_packet_time: ctx.svs.time,
        next_snapshot_time: ctx.svs.time,
        netchan: NetChan::new(adr),
        ..Client::default()
    };

    let ent = ctx.game.gentity_mut(slot);
    ent.s.number = slot as i32;
    ent.r.sv_flags.set(SvFlags::BOT, is_bot);
    ctx.game.player_state_mut(slot).client_num = slot as i32;

    sv_userinfo_changed(ctx, slot);
    log::info!("{} connected from {}", ctx.svs.clients[slot].name, net_adr_to_string(&adr));
    Some(slot)
}

/// Called when the player is totally leaving the server, either willingly
/// or unwillingly. The slot lingers as a zombie so the disconnect command
/// can still be delivered.
pub fn sv_drop_client(ctx: &mut ServerContext, client_num: usize, reason: &str) {
    let client = &mut ctx.svs.clients[client_num];
    if client.state == ClientState::Zombie {
        return; // already dropped
    }

    let is_bot = client.netchan.remote_address.adr_type == NetAdrType::Bot;
    let name = client.name.clone();

    // become free in a few seconds
    client.state = ClientState::Zombie;
    client.last_packet_time = ctx.svs.time;

    // tell everyone why they got dropped
    sv_send_server_command(ctx, None, &format!("print \"{} {}\n\"", name, reason));

    // add the disconnect command
    let client = &mut ctx.svs.clients[client_num];
    if let Err(err) = client.reliable.add(&format!("disconnect \"{}\"", reason)) {
        log::debug!("{}: disconnect not queued: {}", name, err);
    }
    client.userinfo.clear();
    sv_unlink_entity(ctx.game.gentity_mut(client_num));

    if is_bot {
        // bots shouldn't go zombie, as there's no real net connection
        client.state = ClientState::Free;
    }
}

/// Pulls the fields the server cares about out of the client's userinfo.
pub fn sv_userinfo_changed(ctx: &mut ServerContext, client_num: usize) {
    let lan_force_rate = ctx.cvars.variable_integer("sv_lanForceRate") == 1;
    let fps = ctx.cvars.variable_integer("sv_fps").max(1);
    let client = &mut ctx.svs.clients[client_num];

    // name for C code
    client.name = q_strncpyz(&info_value_for_key(&client.userinfo, "name"), MAX_NAME_LENGTH);

    // rate command

    // if the client is on the same subnet as the server and we aren't running an
    // internet public server, assume they don't need a rate choke
    if lan_force_rate && net_is_lan_address(&client.netchan.remote_address) {
        client.rate = 99999; // lans should not rate limit
    } else {
        let val = info_value_for_key(&client.userinfo, "rate");
        client.rate = if val.is_empty() { 3000 } else { atoi(&val).clamp(1000, 90000) };
    }

    // snaps command
    let val = info_value_for_key(&client.userinfo, "snaps");
    client.snapshot_msec = if val.is_empty() {
        50
    } else {
        1000 / atoi(&val).clamp(1, fps)
    };
}

// ============================================================
// Server commands
// ============================================================

/// Queues a reliable command for one client, dropping the client when its
/// window is already full.
pub fn sv_add_server_command(ctx: &mut ServerContext, client_num: usize, cmd: &str) {
    let client = &mut ctx.svs.clients[client_num];
    if let Err(err) = client.reliable.add(cmd) {
        log::warn!("===== pending server commands for {} =====", client.name);
        for (seq, pending) in client.reliable.pending() {
            log::warn!("cmd {}: {}", seq, pending);
        }
        log::warn!("cmd {}: {} ({})", client.reliable.sequence() + 1, cmd, err);
        sv_drop_client(ctx, client_num, "Server command overflow");
    }
}

/// Sends a command string to a client, or to every client at least
/// Primed when `client_num` is None.
pub fn sv_send_server_command(ctx: &mut ServerContext, client_num: Option<usize>, cmd: &str) {
    if let Some(client_num) = client_num {
        sv_add_server_command(ctx, client_num, cmd);
        return;
    }

    // hack to echo broadcast prints to console
    if let Some(text) = cmd.strip_prefix("print ") {
        log::info!("broadcast: {}", text.trim_matches(|c| c == '"' || c == '\n'));
    }

    // send the data to all relevent clients
    for j in 0..ctx.svs.clients.len() {
        if ctx.svs.clients[j].state < ClientState::Primed {
            continue;
        }
        sv_add_server_command(ctx, j, cmd);
    }
}

// ============================================================
// Pings and timeouts
// ============================================================

/// Updates the cl->ping variables from the send/ack times of the frames
/// still in each client's ring.
pub fn sv_calc_pings(ctx: &mut ServerContext) {
    let game = &ctx.game;

    // Phase 1: parallel ping calculation
    let pings: Vec<i32> = ctx
        .svs
        .clients
        .par_iter()
        .map(|cl| {
            if cl.state != ClientState::Active {
                return 999;
            }
            let Some(gentity) = cl.gentity_num else {
                return 999;
            };
            if game.entities[gentity].r.sv_flags.contains(SvFlags::BOT) {
                return 0;
            }

            let (total, count) = cl
                .frames
                .iter()
                .filter(|f| f.message_acked > 0)
                .fold((0, 0), |(total, count), f| (total + f.message_acked - f.message_sent, count + 1));
            if count == 0 {
                999
            } else {
                (total / count).min(999)
            }
        })
        .collect();

    // Phase 2: apply, and let the game know about the ping
    for (i, ping) in pings.into_iter().enumerate() {
        ctx.svs.clients[i].ping = ping;
        if let Some(ps) = ctx.game.player_states.get_mut(i) {
            ps.ping = ping;
        }
    }
}

enum TimeoutAction {
    /// message times may be wrong across a changelevel
    FixTime(usize),
    FreeZombie(usize),
    Drop(usize),
}

/// If a packet has not been received from a client for sv_timeout
/// seconds, drop the connection. Zombie slots are freed after
/// sv_zombietime seconds.
pub fn sv_check_timeouts(ctx: &mut ServerContext) {
    let time = ctx.svs.time;
    let droppoint = time - 1000 * ctx.cvars.variable_integer("sv_timeout");
    let zombiepoint = time - 1000 * ctx.cvars.variable_integer("sv_zombietime");

    let mut actions = Vec::new();
    for (i, cl) in ctx.svs.clients.iter_mut().enumerate() {
        if cl.netchan.remote_address.adr_type == NetAdrType::Bot {
            continue;
        }
        if cl.last_packet_time > time {
            actions.push(TimeoutAction::FixTime(i));
            continue;
        }
        if cl.state == ClientState::Zombie && cl.last_packet_time < zombiepoint {
            actions.push(TimeoutAction::FreeZombie(i));
            continue;
        }
        if cl.state >= ClientState::Connected && cl.last_packet_time < droppoint {
            // wait several frames so a debugger session doesn't
            // cause a timeout
            cl.timeout_count += 1;
            if cl.timeout_count > 5 {
                actions.push(TimeoutAction::Drop(i));
            }
        } else {
            cl.timeout_count = 0;
        }
    }

    for action in actions {
        match action {
            TimeoutAction::FixTime(i) => ctx.svs.clients[i].last_packet_time = time,
            TimeoutAction::FreeZombie(i) => {
                log::debug!("Going from CS_ZOMBIE to CS_FREE for {}", ctx.svs.clients[i].name);
                ctx.svs.clients[i].state = ClientState::Free;
            }
            TimeoutAction::Drop(i) => {
                sv_drop_client(ctx, i, "timed out");
                // don't bother with zombie state
                ctx.svs.clients[i].state = ClientState::Free;
            }
        }
    }
}

// ============================================================
// SV_Frame
// ============================================================

/// Player movement occurs as a result of packet events, which happen
/// before sv_frame is called.
pub fn sv_frame(ctx: &mut ServerContext, msec: i32, game: &mut dyn GameSimulation) {
    if ctx.sv.state == ServerState::Dead {
        return;
    }

    let frame_msec = 1000 / ctx.cvars.variable_integer("sv_fps").max(1);
    ctx.sv.time_residual += msec;

    // this can happen considerably earlier when lots of clients play and
    // the map doesn't change
    let history = &ctx.svs.history;
    if history.next_index().seq >= history.limit().saturating_sub(history.capacity() as u64) {
        log::warn!("Restarting snapshot history due to numSnapshotEntities wrapping");
        ctx.svs.history.reset();
        for client in ctx.svs.clients.iter_mut() {
            client.delta_message = -1;
        }
    }

    // update ping based on the all received frames
    sv_calc_pings(ctx);

    // run the game simulation in chunks
    while ctx.sv.time_residual >= frame_msec {
        ctx.sv.time_residual -= frame_msec;
        ctx.svs.time += frame_msec;
        ctx.sv.time += frame_msec;

        let mut import = GameImport {
            game: &mut ctx.game,
            sv_entities: &mut ctx.sv.sv_entities,
            world: &*ctx.world,
            state: ctx.sv.state,
        };
        game.run_frame(&mut import, ctx.sv.time);
    }

    // check timeouts
    sv_check_timeouts(ctx);

    // send messages back to the clients
    sv_send_client_messages(ctx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sv_history::EntityHistory;
    use crate::sv_world::VisMap;

    fn open_map() -> VisMap {
        let mut map = VisMap::new(1, 1);
        map.add_leaf([-1000.0; 3], [1000.0; 3], 0, 0);
        map
    }

    fn running_server(maxclients: usize) -> ServerContext {
        let mut ctx = ServerContext::new(Box::new(open_map()), maxclients);
        sv_spawn_server(&mut ctx);
        ctx
    }

    fn internet(last: u8) -> NetAdr {
        NetAdr::ipv4([8, 8, 8, last], 27960)
    }

    /// Moves one entity a unit along x every frame.
    struct Mover {
        num: usize,
    }

    impl GameSimulation for Mover {
        fn run_frame(&mut self, import: &mut GameImport<'_>, _level_time: i32) {
            let ent = import.game.gentity_mut(self.num);
            ent.r.current_origin[0] += 1.0;
            ent.s.origin = ent.r.current_origin;
            import.link_entity(self.num);
        }
    }

    struct Idle;

    impl GameSimulation for Idle {
        fn run_frame(&mut self, _import: &mut GameImport<'_>, _level_time: i32) {}
    }

    // ============================================================
    // Userinfo
    // ============================================================

    #[test]
    fn userinfo_rate_and_snaps() {
        let mut ctx = running_server(4);
        let c = sv_client_connect(&mut ctx, internet(1), "\\name\\player\\rate\\500\\snaps\\40").unwrap();
        let cl = &ctx.svs.clients[c];
        assert_eq!(cl.name, "player");
        assert_eq!(cl.rate, 1000);
        // snaps are clamped to sv_fps
        assert_eq!(cl.snapshot_msec, 50);

        let c = sv_client_connect(&mut ctx, internet(2), "\\name\\b\\rate\\200000\\snaps\\10").unwrap();
        assert_eq!(ctx.svs.clients[c].rate, 90000);
        assert_eq!(ctx.svs.clients[c].snapshot_msec, 100);

        let c = sv_client_connect(&mut ctx, internet(3), "\\name\\c").unwrap();
        assert_eq!(ctx.svs.clients[c].rate, 3000);
        assert_eq!(ctx.svs.clients[c].snapshot_msec, 50);
    }

    #[test]
    fn lan_clients_get_unlimited_rate() {
        let mut ctx = running_server(2);
        let c = sv_client_connect(&mut ctx, NetAdr::ipv4([10, 0, 0, 2], 27960), "\\rate\\3000").unwrap();
        assert_eq!(ctx.svs.clients[c].rate, 99999);

        ctx.cvars.set("sv_lanForceRate", "0");
        sv_userinfo_changed(&mut ctx, c);
        assert_eq!(ctx.svs.clients[c].rate, 3000);
    }

    #[test]
    fn full_server_rejects() {
        let mut ctx = running_server(1);
        assert_eq!(sv_client_connect(&mut ctx, internet(1), ""), Some(0));
        assert_eq!(sv_client_connect(&mut ctx, internet(2), ""), None);
    }

    // ============================================================
    // Server commands and drops
    // ============================================================

    #[test]
    fn broadcast_skips_clients_not_primed() {
        let mut ctx = running_server(3);
        let a = sv_client_connect(&mut ctx, internet(1), "\\name\\a").unwrap();
        let b = sv_client_connect(&mut ctx, internet(2), "\\name\\b").unwrap();
        ctx.svs.clients[b].state = ClientState::Connected;

        sv_send_server_command(&mut ctx, None, "print \"hi\n\"");
        assert_eq!(ctx.svs.clients[a].reliable.sequence(), 1);
        assert_eq!(ctx.svs.clients[b].reliable.sequence(), 0);
    }

    #[test]
    fn command_overflow_drops_the_client() {
        let mut ctx = running_server(2);
        let c = sv_client_connect(&mut ctx, internet(1), "\\name\\slow").unwrap();
        for n in 0..=MAX_RELIABLE_COMMANDS {
            sv_send_server_command(&mut ctx, Some(c), &format!("cs {}", n));
        }
        assert_eq!(ctx.svs.clients[c].state, ClientState::Zombie);
        assert_eq!(ctx.svs.clients[c].reliable.sequence(), MAX_RELIABLE_COMMANDS);
    }

    #[test]
    fn drop_queues_disconnect_and_zombies() {
        let mut ctx = running_server(2);
        let c = sv_client_connect(&mut ctx, internet(1), "\\name\\quitter").unwrap();
        let other = sv_client_connect(&mut ctx, internet(2), "\\name\\other").unwrap();
        sv_drop_client(&mut ctx, c, "was kicked");

        let cl = &ctx.svs.clients[c];
        assert_eq!(cl.state, ClientState::Zombie);
        let last = cl.reliable.sequence();
        assert_eq!(cl.reliable.command(last), Some("disconnect \"was kicked\""));
        assert_eq!(
            ctx.svs.clients[other].reliable.command(1),
            Some("print \"quitter was kicked\n\"")
        );
    }

    #[test]
    fn dropped_bots_free_their_slot() {
        let mut ctx = running_server(2);
        let bot = NetAdr { adr_type: NetAdrType::Bot, ..NetAdr::default() };
        let c = sv_client_connect(&mut ctx, bot, "\\name\\bot").unwrap();
        assert_eq!(ctx.svs.clients[c].state, ClientState::Active);
        sv_drop_client(&mut ctx, c, "left");
        assert_eq!(ctx.svs.clients[c].state, ClientState::Free);
    }

    // ============================================================
    // Pings and timeouts
    // ============================================================

    #[test]
    fn ping_is_mean_of_acked_frames() {
        let mut ctx = running_server(2);
        let c = sv_client_connect(&mut ctx, internet(1), "").unwrap();
        ctx.svs.clients[c].state = ClientState::Active;
        for (j, (sent, acked)) in [(100, 140), (150, 210), (200, -1)].into_iter().enumerate() {
            ctx.svs.clients[c].frames[j].message_sent = sent;
            ctx.svs.clients[c].frames[j].message_acked = acked;
        }
        sv_calc_pings(&mut ctx);
        assert_eq!(ctx.svs.clients[c].ping, 50);
        assert_eq!(ctx.game.player_state(c).ping, 50);

        ctx.svs.clients[c].state = ClientState::Primed;
        sv_calc_pings(&mut ctx);
        assert_eq!(ctx.svs.clients[c].ping, 999);
    }

    #[test]
    fn silent_clients_time_out_and_zombies_free() {
        let mut ctx = running_server(2);
        let c = sv_client_connect(&mut ctx, internet(1), "").unwrap();
        ctx.svs.time = 201_000;
        for _ in 0..5 {
            sv_check_timeouts(&mut ctx);
            assert_eq!(ctx.svs.clients[c].state, ClientState::Primed);
        }
        sv_check_timeouts(&mut ctx);
        assert_eq!(ctx.svs.clients[c].state, ClientState::Free);

        let z = sv_client_connect(&mut ctx, internet(2), "").unwrap();
        sv_drop_client(&mut ctx, z, "bye");
        ctx.svs.time += 2001;
        sv_check_timeouts(&mut ctx);
        assert_eq!(ctx.svs.clients[z].state, ClientState::Free);
    }

    // ============================================================
    // Map and frame
    // ============================================================

    #[test]
    fn spawn_toggles_server_bit_and_keeps_clock_for_clients() {
        let mut ctx = running_server(2);
        let c = sv_client_connect(&mut ctx, internet(1), "").unwrap();
        ctx.sv.time = 4000;
        let bit = ctx.svs.snap_flag_server_bit;
        let id = ctx.sv.server_id;

        sv_spawn_server(&mut ctx);
        assert_ne!(ctx.svs.snap_flag_server_bit, bit);
        assert_eq!(ctx.sv.server_id, id + 1);
        assert_eq!(ctx.sv.time, 0);
        assert_eq!(ctx.svs.clients[c].old_server_time, 4000);
        assert_eq!(ctx.sv.state, ServerState::Game);
    }

    #[test]
    fn baseline_is_linked_state() {
        let mut ctx = ServerContext::new(Box::new(open_map()), 2);
        let num = ctx.game.spawn().unwrap();
        ctx.game.gentity_mut(num).s.modelindex = 9;
        ctx.game.gentity_mut(num).r.linked = true;
        sv_spawn_server(&mut ctx);
        assert_eq!(ctx.sv.sv_entities[num].baseline.modelindex, 9);
        assert_eq!(ctx.sv.sv_entities[num].baseline.number, num as i32);
        assert_eq!(ctx.sv.sv_entities[num].areanum, 0);
    }

    #[test]
    fn frame_runs_game_in_fixed_steps() {
        let mut ctx = running_server(2);
        let num = ctx.game.spawn().unwrap();
        let mut mover = Mover { num };
        sv_frame(&mut ctx, 120, &mut mover);
        // two 50 msec frames, 20 left over
        assert_eq!(ctx.sv.time, 100);
        assert_eq!(ctx.sv.time_residual, 20);
        assert_eq!(ctx.game.gentity(num).r.current_origin[0], 2.0);
        assert!(ctx.game.gentity(num).r.linked);
    }

    #[test]
    fn history_exhaustion_restarts_the_ring() {
        let mut ctx = running_server(2);
        let c = sv_client_connect(&mut ctx, internet(1), "").unwrap();
        ctx.svs.clients[c].state = ClientState::Active;
        ctx.svs.history = EntityHistory::with_limit(8, 16);
        for _ in 0..8 {
            ctx.svs.history.push(EntityState::default());
        }
        ctx.svs.clients[c].delta_message = 5;
        let epoch = ctx.svs.history.epoch();

        sv_frame(&mut ctx, 50, &mut Idle);
        assert_eq!(ctx.svs.history.epoch(), epoch + 1);
        assert_eq!(ctx.svs.clients[c].delta_message, -1);
    }

    #[test]
    fn dead_server_frame_does_nothing() {
        let mut ctx = ServerContext::new(Box::new(open_map()), 2);
        sv_frame(&mut ctx, 500, &mut Idle);
        assert_eq!(ctx.svs.time, 0);
    }
}
