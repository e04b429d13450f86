// server.rs — core server types and constants
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.

use myq3_common::cvar::CvarContext;
use myq3_common::q_shared::*;
use myq3_common::qcommon::*;

use crate::sv_game::GameWorld;
use crate::sv_history::{EntityHistory, HistoryIndex};
use crate::sv_netoverhead::NetOverhead;
use crate::sv_reliable::ReliableCommands;
use crate::sv_world::WorldQuery;

// ============================================================
// Constants
// ============================================================

/// Max entities in one snapshot; extras are dropped.
pub const MAX_SNAPSHOT_ENTITIES: usize = 256;

/// Max clusters stored per entity; the rest are covered by last_cluster.
pub const MAX_ENT_CLUSTERS: usize = 16;

/// Bytes added to every message by the netchan and UDP headers when
/// estimating bandwidth.
pub const HEADER_RATE_BYTES: i32 = 48;

// ============================================================
// Flags
// ============================================================

bitflags::bitflags! {
    /// Server-side entity flags set by the game.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SvFlags: u32 {
        /// don't send entity to clients, even if it has effects
        const NOCLIENT = 0x0000_0001;
        /// send to the clients whose bit is set in single_client
        const CLIENTMASK = 0x0000_0002;
        /// set if the entity is a bot
        const BOT = 0x0000_0008;
        /// send to all connected clients
        const BROADCAST = 0x0000_0020;
        /// merge a second pvs at origin2 into snapshots
        const PORTAL = 0x0000_0040;
        /// only send to a single client (single_client)
        const SINGLECLIENT = 0x0000_0100;
        /// send entity to everyone but one client (single_client)
        const NOTSINGLECLIENT = 0x0000_0800;
    }
}

bitflags::bitflags! {
    /// Per-snapshot flags written in the snapshot header.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SnapFlags: u8 {
        /// the server throttled this client below its requested rate
        const RATE_DELAYED = 0x01;
        /// the client is still loading and not yet in the world
        const NOT_ACTIVE = 0x02;
        /// toggled every map change so the client can tell server restarts apart
        const SERVERCOUNT = 0x04;
    }
}

// ============================================================
// States
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(i32)]
pub enum ServerState {
    #[default]
    Dead = 0,    // no map loaded
    Loading = 1, // spawning level entities
    Game = 2,    // actively running
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(i32)]
pub enum ClientState {
    #[default]
    Free = 0, // can be reused for a new connection
    Zombie = 1,    // client has been disconnected, but don't reuse connection for a couple seconds
    Connected = 2, // has been assigned to a client, but no gamestate yet
    Primed = 3,    // gamestate has been sent, but client hasn't sent a usercmd
    Active = 4,    // client is fully in game
}

// ============================================================
// SvEntity — per entity server bookkeeping (svEntity_t)
// ============================================================

#[derive(Debug, Clone)]
pub struct SvEntity {
    /// for delta compression of initial sighting
    pub baseline: EntityState,
    /// -1 when not in any area
    pub areanum: i32,
    pub areanum2: i32,
    pub num_clusters: usize,
    pub clusternums: [i32; MAX_ENT_CLUSTERS],
    /// set when the entity touched more clusters than fit in clusternums
    pub last_cluster: Option<i32>,
    /// if sv.snapshot_counter == snapshot_counter, it's already in this snapshot
    pub snapshot_counter: i32,
}

impl Default for SvEntity {
    fn default() -> Self {
        Self {
            baseline: EntityState::default(),
            areanum: -1,
            areanum2: -1,
            num_clusters: 0,
            clusternums: [0; MAX_ENT_CLUSTERS],
            last_cluster: None,
            snapshot_counter: 0,
        }
    }
}

// ============================================================
// ClientSnapshot — one client's view of one frame (clientSnapshot_t)
// ============================================================

#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub areabytes: i32,
    /// portalarea visibility bits
    pub areabits: [u8; MAX_MAP_AREA_BYTES],
    pub ps: PlayerState,
    pub num_entities: usize,
    /// into the entity history ring
    pub first_entity: HistoryIndex,
    /// time the message was transmitted
    pub message_sent: i32,
    /// time the message was acked, -1 until then
    pub message_acked: i32,
    /// used to rate drop packets
    pub message_size: i32,
}

impl Default for ClientSnapshot {
    fn default() -> Self {
        Self {
            areabytes: 0,
            areabits: [0; MAX_MAP_AREA_BYTES],
            ps: PlayerState::default(),
            num_entities: 0,
            first_entity: HistoryIndex::default(),
            message_sent: 0,
            message_acked: -1,
            message_size: 0,
        }
    }
}

// ============================================================
// Client — per-client server data (client_t)
// ============================================================

pub struct Client {
    pub state: ClientState,
    pub userinfo: String,
    /// extracted from userinfo
    pub name: String,

    pub reliable: ReliableCommands,

    /// reliable client message sequence
    pub last_client_command: i32,
    /// commands handed to the game, oldest first
    pub game_commands: Vec<String>,

    /// frame last client usercmd message
    pub message_acknowledge: i32,
    /// frame the client wants deltas from, -1 for a full snapshot
    pub delta_message: i32,
    /// svs.time when packet was last received
    pub last_packet_time: i32,
    /// frames in a row past sv_timeout
    pub timeout_count: i32,

    /// gentity number, None when not in the game world
    pub gentity_num: Option<usize>,

    /// send another snapshot when svs.time >= next_snapshot_time
    pub next_snapshot_time: i32,
    pub rate_delayed: bool,
    /// bytes / second
    pub rate: i32,
    /// requests a snapshot every snapshot_msec unless rate choked
    pub snapshot_msec: i32,
    pub ping: i32,
    /// set while a download is in progress
    pub downloading: bool,

    /// updates can be delta'd from here
    pub frames: Vec<ClientSnapshot>,

    pub netchan: NetChan,

    /// sv.time offset sent until the client acknowledges a new gamestate
    pub old_server_time: i32,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            state: ClientState::Free,
            userinfo: String::new(),
            name: String::new(),
            reliable: ReliableCommands::new(),
            last_client_command: 0,
            game_commands: Vec::new(),
            message_acknowledge: 0,
            delta_message: -1,
            last_packet_time: 0,
            timeout_count: 0,
            gentity_num: None,
            next_snapshot_time: 0,
            rate_delayed: false,
            rate: 3000,
            snapshot_msec: 50,
            ping: 999,
            downloading: false,
            frames: vec![ClientSnapshot::default(); PACKET_BACKUP as usize],
            netchan: NetChan::default(),
            old_server_time: 0,
        }
    }
}

impl Client {
    /// The frame slot the next outgoing message will use.
    pub fn current_frame(&self) -> &ClientSnapshot {
        &self.frames[(self.netchan.outgoing_sequence & PACKET_MASK) as usize]
    }

    pub fn current_frame_mut(&mut self) -> &mut ClientSnapshot {
        &mut self.frames[(self.netchan.outgoing_sequence & PACKET_MASK) as usize]
    }
}

// ============================================================
// Server — per-map state (server_t)
// ============================================================

pub struct Server {
    pub state: ServerState,
    /// changes each server start
    pub server_id: i32,
    /// server_id before a map_restart
    pub restarted_server_id: i32,
    /// incremented for each snapshot built
    pub snapshot_counter: i32,
    pub time_residual: i32,
    pub time: i32,
    pub sv_entities: Vec<SvEntity>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            state: ServerState::Dead,
            server_id: 0,
            restarted_server_id: 0,
            snapshot_counter: 0,
            time_residual: 0,
            time: 0,
            sv_entities: vec![SvEntity::default(); MAX_GENTITIES],
        }
    }
}

// ============================================================
// ServerStatic — persistent across map changes (serverStatic_t)
// ============================================================

pub struct ServerStatic {
    /// sv_init has completed
    pub initialized: bool,
    /// will be strictly increasing across level changes
    pub time: i32,
    /// toggled every map change
    pub snap_flag_server_bit: SnapFlags,
    pub clients: Vec<Client>,
    /// entity states of every snapshot built, shared by all clients
    pub history: EntityHistory,
}

impl ServerStatic {
    pub fn new(maxclients: usize) -> Self {
        let capacity = maxclients * PACKET_BACKUP as usize * MAX_SNAPSHOT_ENTITIES;
        Self {
            initialized: true,
            time: 0,
            snap_flag_server_bit: SnapFlags::empty(),
            clients: (0..maxclients).map(|_| Client::default()).collect(),
            history: EntityHistory::new(capacity),
        }
    }
}

// ============================================================
// ServerContext — owns everything the server touches
// ============================================================

pub struct ServerContext {
    pub sv: Server,
    pub svs: ServerStatic,
    pub cvars: CvarContext,
    pub game: GameWorld,
    pub world: Box<dyn WorldQuery>,
    pub overhead: NetOverhead,
}
