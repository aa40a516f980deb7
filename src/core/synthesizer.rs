//! Command synthesis
//!
//! Maps a [`RuleChangeRequest`] to the commands that apply it. Pure: nothing
//! here spawns a process or touches the rule table.
//!
//! Host ACL inserts and appends are emitted as a plain argument vector with no
//! existence check, so repeated inserts show up as distinct entries. Every
//! other mutation is a check/act script:
//!
//! | Category | Add | Remove |
//! |---|---|---|
//! | host (delete) | | `(check && delete) ; true` |
//! | portforward | `(check \|\| add)` | `(check && delete) ; true` |
//! | dns | `(tcp) ; (udp)` pairs | `(tcp) ; (udp) ; true` |
//! | dhcp | `(check \|\| add)` | `(check && delete) ; true` |
//! | `diag_http` | `check \|\| add` | `(check && delete) ; true` |

use crate::config::AppConfig;
use crate::core::command::{CommandPlan, CommandScript, GuardedCommand, Invocation};
use crate::core::error::Result;
use crate::core::rule::{
    DhcpMasquerade, DiagHttpRedirect, DnsRedirect, HostAcl, HostAclAction, Intent, PortForward,
    PortRange, Protocol, RuleChange, RuleChangeRequest, is_any_address, render_network,
};

const DNS_PORT: u16 = 53;
const HTTP_PORT: u16 = 80;

/// iptables action flags used by the NAT templates
const CHECK: &str = "-C";
const APPEND: &str = "-A";
const DELETE: &str = "-D";

/// Builds iptables command lines for rule change requests
#[derive(Debug, Clone)]
pub struct Synthesizer {
    program: String,
    elevation: Vec<String>,
    lan_interface: String,
    diag_redirect_port: u16,
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new("iptables")
    }
}

impl Synthesizer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            elevation: Vec::new(),
            lan_interface: "eth0".to_string(),
            diag_redirect_port: 8835,
        }
    }

    /// Builds a synthesizer from config plus a resolved elevation prefix
    /// (see [`crate::elevation::resolve_prefix`]).
    pub fn from_config(config: &AppConfig, elevation: Vec<String>) -> Self {
        Self {
            program: config.iptables_command.clone(),
            elevation,
            lan_interface: config.lan_interface.clone(),
            diag_redirect_port: config.diag_redirect_port,
        }
    }

    /// Launcher prepended to elevated commands, e.g. `["sudo"]`
    pub fn with_elevation(mut self, prefix: Vec<String>) -> Self {
        self.elevation = prefix;
        self
    }

    /// Interface matched in place of the "any" source address
    pub fn with_lan_interface(mut self, iface: impl Into<String>) -> Self {
        self.lan_interface = iface.into();
        self
    }

    pub fn with_diag_redirect_port(mut self, port: u16) -> Self {
        self.diag_redirect_port = port;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// `[launcher..., iptables, -w]`, the prefix of every elevated command
    pub fn elevated_tool(&self) -> Vec<String> {
        self.tool(true)
    }

    /// Produces the commands for one request.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the request's fields fail admission
    /// checks. Nothing is executed in either case.
    pub fn plan(&self, request: &RuleChangeRequest) -> Result<CommandPlan> {
        request.change.validate()?;

        let elevated = request.needs_elevation();
        let invocation = match &request.change {
            RuleChange::HostAcl(acl) => self.host_acl(acl, elevated),
            RuleChange::PortForward(pf) => self.port_forward(pf),
            RuleChange::DnsRedirect(dns) => self.dns_redirect(dns),
            RuleChange::DhcpMasquerade(dhcp) => self.dhcp_masquerade(dhcp),
            RuleChange::DiagHttpRedirect(diag) => self.diag_http(diag),
        };

        Ok(CommandPlan {
            category: request.category(),
            intent: request.intent(),
            invocation,
        })
    }

    /// `[launcher..., iptables, -w]` when elevated, `[iptables]` otherwise
    fn tool(&self, elevated: bool) -> Vec<String> {
        if elevated {
            let mut argv = self.elevation.clone();
            argv.push(self.program.clone());
            argv.push("-w".to_string());
            argv
        } else {
            vec![self.program.clone()]
        }
    }

    /// Elevated `-t nat <action> <rest...>`
    fn nat(&self, action: &str, rest: &[String]) -> Vec<String> {
        let mut argv = self.tool(true);
        argv.extend(["-t", "nat", action].map(String::from));
        argv.extend(rest.iter().cloned());
        argv
    }

    /// Builds the add or remove script for one NAT match, applied to every
    /// entry in `matches` (one per protocol where relevant).
    fn nat_script(&self, state: bool, matches: &[Vec<String>]) -> CommandScript {
        if state {
            CommandScript::ensure_present(
                matches
                    .iter()
                    .map(|m| GuardedCommand::add_if_absent(self.nat(CHECK, m), self.nat(APPEND, m)))
                    .collect(),
            )
        } else {
            CommandScript::ensure_absent(
                matches
                    .iter()
                    .map(|m| {
                        GuardedCommand::delete_if_present(self.nat(CHECK, m), self.nat(DELETE, m))
                    })
                    .collect(),
            )
        }
    }

    /// Match flags of a host ACL, starting with `<action> <chain>`.
    ///
    /// The "any" source address is matched as traffic arriving on the LAN
    /// interface rather than as an address.
    pub fn host_acl_args(&self, acl: &HostAcl, action: &str) -> Vec<String> {
        let mut args = vec![action.to_string(), acl.chain.clone()];

        if acl.action == HostAclAction::List {
            args.extend(["-n", "-v"].map(String::from));
            return args;
        }

        let mut push = |flag: &str, value: String| {
            args.push(flag.to_string());
            args.push(value);
        };

        if let Some(protocol) = acl.protocol {
            push("-p", protocol.to_string());
        }
        match &acl.src {
            Some(src) if is_any_address(src) => push("-i", self.lan_interface.clone()),
            Some(src) => push("--src", render_network(src)),
            None => {}
        }
        if let Some(dst) = acl.dst.as_ref().filter(|dst| !is_any_address(dst)) {
            push("--dst", render_network(dst));
        }
        if let Some(sport) = &acl.sport {
            push("--sport", sport.to_string());
        }
        if let Some(dport) = &acl.dport {
            push("--dport", dport.to_string());
        }
        if let Some(iface) = &acl.in_iface {
            push("-i", iface.clone());
        }
        if let Some(iface) = &acl.out_iface {
            push("-o", iface.clone());
        }
        if let Some(target) = acl.target {
            push("-j", target.to_string());
        }
        if let Some(mac) = &acl.mac {
            args.extend(["-m", "mac", "--mac-source"].map(String::from));
            args.push(mac.to_ascii_lowercase());
        }

        args
    }

    fn host_acl(&self, acl: &HostAcl, elevated: bool) -> Invocation {
        let with_action = |action: &str| {
            let mut argv = self.tool(elevated);
            argv.extend(self.host_acl_args(acl, action));
            argv
        };

        match acl.action {
            HostAclAction::Insert | HostAclAction::Append | HostAclAction::List => {
                Invocation::Argv(with_action(acl.action.flag()))
            }
            HostAclAction::Delete => {
                Invocation::Guarded(CommandScript::ensure_absent(vec![
                    GuardedCommand::delete_if_present(with_action(CHECK), with_action(DELETE)),
                ]))
            }
        }
    }

    fn port_forward(&self, pf: &PortForward) -> Invocation {
        let rule = vec![
            "PREROUTING".to_string(),
            "-p".to_string(),
            pf.protocol.to_string(),
            "--destination".to_string(),
            pf.dest_ip.to_string(),
            "--dport".to_string(),
            pf.dport.to_string(),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to".to_string(),
            format!("{}:{}", pf.to_ip, nat_port_range(&pf.to_port)),
        ];
        Invocation::Guarded(self.nat_script(pf.state, &[rule]))
    }

    fn dns_redirect(&self, dns: &DnsRedirect) -> Invocation {
        let source = if is_any_address(&dns.ip) {
            ["-i".to_string(), self.lan_interface.clone()]
        } else {
            ["-s".to_string(), render_network(&dns.ip)]
        };

        let rules: Vec<Vec<String>> = [Protocol::Tcp, Protocol::Udp]
            .into_iter()
            .map(|protocol| {
                let mut rule = vec!["PREROUTING".to_string(), "-p".to_string(), protocol.to_string()];
                rule.extend(source.iter().cloned());
                rule.extend([
                    "--dport".to_string(),
                    DNS_PORT.to_string(),
                    "-j".to_string(),
                    "DNAT".to_string(),
                    "--to-destination".to_string(),
                    dns.dns.clone(),
                ]);
                rule
            })
            .collect();

        Invocation::Guarded(self.nat_script(dns.state, &rules))
    }

    fn dhcp_masquerade(&self, dhcp: &DhcpMasquerade) -> Invocation {
        let rule = vec![
            "POSTROUTING".to_string(),
            "-s".to_string(),
            dhcp.ip.to_string(),
            "-j".to_string(),
            "MASQUERADE".to_string(),
        ];
        Invocation::Guarded(self.nat_script(dhcp.state, &[rule]))
    }

    fn diag_http(&self, diag: &DiagHttpRedirect) -> Invocation {
        let rule = vec![
            "PREROUTING".to_string(),
            "-d".to_string(),
            diag.ip.to_string(),
            "-p".to_string(),
            "tcp".to_string(),
            "-m".to_string(),
            "tcp".to_string(),
            "--dport".to_string(),
            HTTP_PORT.to_string(),
            "-j".to_string(),
            "REDIRECT".to_string(),
            "--to-ports".to_string(),
            self.diag_redirect_port.to_string(),
        ];
        let script = self.nat_script(diag.state, &[rule]);
        // The add form has always been emitted without parentheses
        let script = if diag.state { script.ungrouped() } else { script };
        Invocation::Guarded(script)
    }
}

/// DNAT `--to` takes port ranges as `start-end`
fn nat_port_range(range: &PortRange) -> String {
    if range.is_single() {
        range.start.to_string()
    } else {
        format!("{}-{}", range.start, range.end)
    }
}

/// Whether applying the plan a second time leaves the rule table unchanged.
///
/// Guarded scripts check before they mutate. Plain argv plans are only safe
/// to repeat when they are read-only.
pub fn is_idempotent(plan: &CommandPlan) -> bool {
    match &plan.invocation {
        Invocation::Guarded(_) => true,
        Invocation::Argv(_) | Invocation::Shell(_) => plan.intent == Intent::Read,
    }
}
