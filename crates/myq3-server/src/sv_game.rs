// sv_game.rs — entities shared between the game simulation and the server
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.

use myq3_common::q_shared::*;

use crate::server::{ServerState, SvEntity, SvFlags};
use crate::sv_world::{sv_link_entity, sv_unlink_entity, WorldQuery};

pub const CONTENTS_SOLID: i32 = 1;
pub const CONTENTS_BODY: i32 = 0x0200_0000;

/// entityState.solid value for inline bmodels
pub const SOLID_BMODEL: i32 = 0x00ff_ffff;

// ============================================================
// Shared entity
// ============================================================

/// The part of a game entity only the server looks at (entityShared_t).
#[derive(Debug, Clone, Default)]
pub struct EntityShared {
    /// false if not in any good cluster
    pub linked: bool,
    pub link_count: i32,

    pub sv_flags: SvFlags,
    /// client number for SINGLECLIENT / NOTSINGLECLIENT, or a bit mask of
    /// clients for CLIENTMASK
    pub single_client: i32,

    /// if false, assume an explicit mins / maxs bounding box
    pub bmodel: bool,
    pub contents: i32,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub current_origin: Vec3,
    pub current_angles: Vec3,

    /// derived from mins/maxs and origin + rotation
    pub absmin: Vec3,
    pub absmax: Vec3,

    /// ENTITYNUM_NONE for no owner
    pub owner_num: i32,
}

impl EntityShared {
    /// Box size packed into entityState.solid so clients can predict
    /// collisions without the bounds.
    pub fn packed_solid(&self) -> i32 {
        if self.bmodel {
            return SOLID_BMODEL;
        }
        if self.contents & (CONTENTS_SOLID | CONTENTS_BODY) == 0 {
            return 0;
        }
        // assume that x/y are equal and symetric
        let i = (self.maxs[0] as i32).clamp(1, 255);
        // z is not symetric
        let j = (-self.mins[2] as i32).clamp(1, 255);
        // and z maxs can be negative...
        let k = (self.maxs[2] as i32 + 32).clamp(1, 255);
        (k << 16) | (j << 8) | i
    }
}

#[derive(Debug, Clone, Default)]
pub struct SharedEntity {
    /// communicated by server to clients
    pub s: EntityState,
    /// shared by both the server system and game
    pub r: EntityShared,
}

// ============================================================
// GameWorld
// ============================================================

/// Entity and player state storage the game writes into every frame.
pub struct GameWorld {
    pub entities: Vec<SharedEntity>,
    /// entities in use, including the client slots
    pub num_entities: usize,
    pub player_states: Vec<PlayerState>,
}

impl GameWorld {
    pub fn new(maxclients: usize) -> Self {
        let entities = (0..MAX_GENTITIES)
            .map(|n| {
                let mut ent = SharedEntity::default();
                ent.s.number = n as i32;
                ent.r.owner_num = ENTITYNUM_NONE;
                ent
            })
            .collect();
        let player_states = (0..maxclients)
            .map(|n| PlayerState {
                client_num: n as i32,
                ..PlayerState::default()
            })
            .collect();
        Self {
            entities,
            num_entities: maxclients,
            player_states,
        }
    }

    /// Allocates the next free entity number above the client slots.
    pub fn spawn(&mut self) -> Option<usize> {
        if self.num_entities >= ENTITYNUM_WORLD as usize {
            log::warn!("G_Spawn: no free entities");
            return None;
        }
        let num = self.num_entities;
        self.num_entities += 1;
        self.entities[num] = SharedEntity::default();
        self.entities[num].s.number = num as i32;
        self.entities[num].r.owner_num = ENTITYNUM_NONE;
        Some(num)
    }

    pub fn gentity(&self, num: usize) -> &SharedEntity {
        &self.entities[num]
    }

    pub fn gentity_mut(&mut self, num: usize) -> &mut SharedEntity {
        &mut self.entities[num]
    }

    pub fn player_state(&self, client: usize) -> &PlayerState {
        &self.player_states[client]
    }

    pub fn player_state_mut(&mut self, client: usize) -> &mut PlayerState {
        &mut self.player_states[client]
    }
}

// ============================================================
// Game simulation seam
// ============================================================

/// What the game may call back into while it runs a frame.
pub struct GameImport<'a> {
    pub game: &'a mut GameWorld,
    pub sv_entities: &'a mut [SvEntity],
    pub world: &'a dyn WorldQuery,
    pub state: ServerState,
}

impl GameImport<'_> {
    pub fn link_entity(&mut self, num: usize) {
        sv_link_entity(
            self.world,
            self.state,
            &mut self.game.entities[num],
            &mut self.sv_entities[num],
        );
    }

    pub fn unlink_entity(&mut self, num: usize) {
        sv_unlink_entity(&mut self.game.entities[num]);
    }
}

/// The game logic that moves entities between snapshots.
pub trait GameSimulation {
    fn run_frame(&mut self, import: &mut GameImport<'_>, level_time: i32);
}
