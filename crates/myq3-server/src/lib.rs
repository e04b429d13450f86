#![allow(clippy::too_many_arguments, clippy::field_reassign_with_default,
         clippy::manual_range_contains, clippy::comparison_chain,
         clippy::needless_range_loop)]

// Snapshot server: builds per-client views of the world and streams them
// as delta-compressed messages alongside reliable commands.

pub mod server;
pub mod sv_history;
pub mod sv_world;
pub mod sv_game;
pub mod sv_ents;
pub mod sv_snapshot;
pub mod sv_rate;
pub mod sv_reliable;
pub mod sv_netoverhead;
pub mod sv_user;
pub mod sv_main;
pub mod sv_ccmds;
