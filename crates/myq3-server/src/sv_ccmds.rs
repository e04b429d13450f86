// sv_ccmds.rs — server operator console commands
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.

use std::fmt::Write as _;

use crate::server::*;
use crate::sv_rate::RateSettings;

type OperatorCommandFn = fn(&mut ServerContext, usize, &dyn Fn(usize) -> String) -> String;

static OPERATOR_COMMANDS: &[(&str, OperatorCommandFn)] =
    &[("net_overhead", sv_net_overhead_f), ("sv_rates", sv_rates_f)];

/// Runs an operator command by name. Returns None for names the server
/// does not handle.
pub fn sv_execute_operator_command(
    ctx: &mut ServerContext,
    cmd_argc: usize,
    cmd_argv: &dyn Fn(usize) -> String,
) -> Option<String> {
    let name = cmd_argv(0);
    let (_, func) = OPERATOR_COMMANDS.iter().find(|(cmd, _)| cmd.eq_ignore_ascii_case(&name))?;
    let out = func(ctx, cmd_argc, cmd_argv);
    for line in out.lines() {
        log::info!("{}", line);
    }
    Some(out)
}

/// Prints the bandwidth accounting, or clears it with `net_overhead reset`.
pub fn sv_net_overhead_f(ctx: &mut ServerContext, cmd_argc: usize, cmd_argv: &dyn Fn(usize) -> String) -> String {
    if cmd_argc > 1 && cmd_argv(1).eq_ignore_ascii_case("reset") {
        ctx.overhead.reset();
        return "net overhead counters reset\n".to_string();
    }

    let mut out = String::new();
    if ctx.cvars.variable_integer("sv_netOverhead") == 0 {
        out.push_str("sv_netOverhead is 0, nothing is being counted\n");
    }
    out.push_str(&ctx.overhead.report().format());
    out
}

/// Per-client rate table.
pub fn sv_rates_f(ctx: &mut ServerContext, _cmd_argc: usize, _cmd_argv: &dyn Fn(usize) -> String) -> String {
    if ctx.sv.state == ServerState::Dead {
        return "Server is not running.\n".to_string();
    }

    let settings = RateSettings::from_cvars(&mut ctx.cvars);
    let mut out = String::new();
    out.push_str("num name            rate  snaps delayed ping\n");
    out.push_str("--- --------------- ----- ----- ------- ----\n");
    for (i, cl) in ctx.svs.clients.iter().enumerate() {
        if cl.state == ClientState::Free {
            continue;
        }
        let snaps = if cl.snapshot_msec > 0 { 1000 / cl.snapshot_msec } else { 0 };
        let ping = match cl.state {
            ClientState::Connected => "CNCT".to_string(),
            ClientState::Zombie => "ZMBI".to_string(),
            _ => cl.ping.min(9999).to_string(),
        };
        let _ = writeln!(
            out,
            "{:3} {:<15} {:5} {:5} {:>7} {:>4}",
            i,
            cl.name,
            settings.effective_rate(cl.rate),
            snaps,
            if cl.rate_delayed { "yes" } else { "no" },
            ping
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use myq3_common::q_shared::EntityState;
    use myq3_common::qcommon::NetAdr;

    use crate::sv_main::{sv_client_connect, sv_spawn_server};
    use crate::sv_world::VisMap;

    fn argv<'a>(args: &'a [&'a str]) -> impl Fn(usize) -> String + 'a {
        move |i| args.get(i).map(|s| s.to_string()).unwrap_or_default()
    }

    fn running_server() -> ServerContext {
        let mut ctx = ServerContext::new(Box::new(VisMap::new(1, 1)), 4);
        sv_spawn_server(&mut ctx);
        ctx
    }

    #[test]
    fn rates_lists_connected_clients() {
        let mut ctx = running_server();
        sv_client_connect(&mut ctx, NetAdr::ipv4([8, 8, 4, 4], 27960), "\\name\\far\\rate\\25000\\snaps\\10")
            .unwrap();
        let c = sv_client_connect(&mut ctx, NetAdr::ipv4([8, 8, 4, 5], 27960), "\\name\\slow").unwrap();
        ctx.svs.clients[c].rate_delayed = true;

        let args = ["sv_rates"];
        let out = sv_execute_operator_command(&mut ctx, 1, &argv(&args)).unwrap();
        let rows: Vec<&str> = out.lines().skip(2).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].contains("far") && rows[0].contains("25000") && rows[0].contains(" 10 "));
        assert!(rows[1].contains("slow") && rows[1].contains("yes"));
    }

    #[test]
    fn rates_apply_server_ceiling() {
        let mut ctx = running_server();
        ctx.cvars.set("sv_maxRate", "8000");
        sv_client_connect(&mut ctx, NetAdr::ipv4([8, 8, 4, 4], 27960), "\\name\\fast\\rate\\25000").unwrap();
        let out = sv_rates_f(&mut ctx, 1, &argv(&["sv_rates"]));
        assert!(out.contains(" 8000 "));
    }

    #[test]
    fn net_overhead_prints_and_resets() {
        let mut ctx = running_server();
        ctx.cvars.set("sv_netOverhead", "1");
        ctx.overhead.register_entity_tracker("all", Box::new(|_: &EntityState| true));
        ctx.overhead.track_entity_overhead(&EntityState::with_number(9), 20);
        ctx.overhead.track_message(80);

        let out = sv_execute_operator_command(&mut ctx, 1, &argv(&["net_overhead"])).unwrap();
        assert!(out.starts_with("1 messages, 80 bytes"));
        assert!(out.contains("all"));

        sv_execute_operator_command(&mut ctx, 2, &argv(&["net_overhead", "reset"])).unwrap();
        assert_eq!(ctx.overhead.report().messages, 0);
    }

    #[test]
    fn net_overhead_warns_when_disabled() {
        let mut ctx = running_server();
        let out = sv_net_overhead_f(&mut ctx, 1, &argv(&["net_overhead"]));
        assert!(out.starts_with("sv_netOverhead is 0"));
    }

    #[test]
    fn unknown_commands_are_not_handled() {
        let mut ctx = running_server();
        assert!(sv_execute_operator_command(&mut ctx, 1, &argv(&["map"])).is_none());
    }
}
