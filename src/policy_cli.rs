//! Local control plane for the firewall: `vpnd policy <subcommand> key=value...`
//!
//! | subcommand | required keys |
//! |------------|---------------|
//! | `connecting` | `relay`, `port`, `protocol`, `dhcp`, `lan` |
//! | `connected` | the above plus `tunnel`, `dns` |
//! | `netblocked` | none |
//! | `reset` | none |

use crate::dispatch::{Arguments, CommandDispatcher, DispatchError, Handler};
use crate::firewall::{FirewallController, FirewallPolicy};
use crate::net::SecuritySettings;
use std::io::Write;
use tracing::error;

fn settings(args: &Arguments) -> Result<SecuritySettings, DispatchError> {
    Ok(SecuritySettings {
        permit_dhcp: args.require_yes_no("dhcp")?,
        permit_lan: args.require_yes_no("lan")?,
    })
}

fn apply(controller: &mut FirewallController, policy: &FirewallPolicy) -> Result<(), DispatchError> {
    controller
        .apply(policy)
        .map_err(|e| DispatchError::Failed(e.to_string()))
}

/// Dispatcher with the four policy subcommands registered
pub fn policy_dispatcher() -> Result<CommandDispatcher<FirewallController>, DispatchError> {
    let mut dispatcher = CommandDispatcher::new();

    dispatcher.register(
        "connecting",
        Handler::with_args(|controller: &mut FirewallController, args: &Arguments| {
            let relay = args.require_relay()?;
            let settings = settings(args)?;
            apply(controller, &FirewallPolicy::connecting(&relay, &settings))
        }),
    )?;

    dispatcher.register(
        "connected",
        Handler::with_args(|controller: &mut FirewallController, args: &Arguments| {
            let relay = args.require_relay()?;
            let settings = settings(args)?;
            let tunnel = args.require_alias("tunnel")?;
            let dns = args.require_ip_list("dns")?;
            apply(
                controller,
                &FirewallPolicy::connected(&relay, &settings, tunnel, &dns),
            )
        }),
    )?;

    dispatcher.register(
        "netblocked",
        Handler::no_args(|controller: &mut FirewallController| {
            apply(controller, &FirewallPolicy::blocked())
        }),
    )?;

    dispatcher.register(
        "reset",
        Handler::no_args(|controller: &mut FirewallController| {
            controller
                .reset()
                .map_err(|e| DispatchError::Failed(e.to_string()))
        }),
    )?;

    Ok(dispatcher)
}

/// Run one policy subcommand and report the outcome on `out`
///
/// Usage errors (unknown subcommand, missing or invalid arguments) are returned
/// without touching the firewall.
pub fn run_policy_command<W: Write>(
    controller: &mut FirewallController,
    name: &str,
    tokens: &[String],
    out: &mut W,
) -> Result<(), DispatchError> {
    let dispatcher = policy_dispatcher()?;
    let args = Arguments::parse(tokens)?;
    let (ok_msg, fail_msg) = if name == "reset" {
        ("Successfully reset policy.", "Failed to reset policy.")
    } else {
        ("Successfully applied policy.", "Failed to apply policy.")
    };

    match dispatcher.dispatch(controller, name, &args) {
        Ok(()) => {
            let _ = writeln!(out, "{}", ok_msg);
            Ok(())
        }
        Err(DispatchError::Failed(reason)) => {
            error!("Policy {} failed: {}", name, reason);
            let _ = writeln!(out, "{}", fail_msg);
            Err(DispatchError::Failed(reason))
        }
        Err(e) => Err(e),
    }
}
