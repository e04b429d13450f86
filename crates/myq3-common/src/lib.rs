#![allow(clippy::too_many_arguments, clippy::field_reassign_with_default,
         clippy::manual_range_contains, clippy::comparison_chain,
         clippy::needless_range_loop)]

// Shared protocol code for the snapshot server and its clients.

pub mod q_shared;
pub mod qcommon;
pub mod common;
pub mod cvar;
pub mod net;
pub mod msg_delta;
pub mod snapshot_parse;
