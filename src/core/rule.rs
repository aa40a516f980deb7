//! Rule change requests
//!
//! A [`RuleChangeRequest`] is the unit of work accepted by the rule queue. Its
//! [`RuleChange`] payload is a tagged variant over the five supported rule
//! categories, each with a fixed, fully-typed field set:
//!
//! | Category | Wire tag | Purpose |
//! |---|---|---|
//! | [`HostAcl`] | `host` | allow/drop/reject ACL in a filter chain |
//! | [`PortForward`] | `portforward` | NAT port forwarding (DNAT) |
//! | [`DnsRedirect`] | `dns` | redirect tcp+udp port 53 to a resolver |
//! | [`DhcpMasquerade`] | `dhcp` | masquerade a DHCP subnet |
//! | [`DiagHttpRedirect`] | `diag_http` | redirect port 80 to the diagnostic page |
//!
//! Requests are plain values. The queue takes them by value, so a caller can
//! never mutate a request that is already waiting to run.
//!
//! # Example
//!
//! ```
//! use fwqueue::core::rule::{HostAcl, PortRange, Protocol, RuleChangeRequest, Verdict};
//!
//! let acl = HostAcl {
//!     protocol: Some(Protocol::Tcp),
//!     src: Some("10.0.0.5".parse().unwrap()),
//!     dport: Some(PortRange::single(443)),
//!     target: Some(Verdict::Accept),
//!     ..HostAcl::default()
//! };
//! let request = RuleChangeRequest::new(acl.into());
//! assert_eq!(request.category().as_ref(), "host");
//! ```

use crate::core::error::{Error, Result};
use crate::validators;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use strum::IntoEnumIterator;
use uuid::Uuid;

/// Default filter chain for host ACLs
pub const DEFAULT_CHAIN: &str = "FORWARD";

/// The five rule categories; the string form is the wire tag
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum RuleCategory {
    #[serde(rename = "host")]
    #[strum(serialize = "host")]
    HostAcl,
    #[serde(rename = "portforward")]
    #[strum(serialize = "portforward")]
    PortForward,
    #[serde(rename = "dns")]
    #[strum(serialize = "dns")]
    DnsRedirect,
    #[serde(rename = "dhcp")]
    #[strum(serialize = "dhcp")]
    DhcpMasquerade,
    #[serde(rename = "diag_http")]
    #[strum(serialize = "diag_http")]
    DiagHttpRedirect,
}

impl RuleCategory {
    /// Short upper-case tag used in log lines
    pub const fn log_tag(self) -> &'static str {
        match self {
            RuleCategory::HostAcl => "HOST",
            RuleCategory::PortForward => "PORTFORWARD",
            RuleCategory::DnsRedirect => "DNS",
            RuleCategory::DhcpMasquerade => "DHCP",
            RuleCategory::DiagHttpRedirect => "DIAG_HTTP",
        }
    }
}

/// Whether a request puts a rule in place, takes one out, or only reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Intent {
    Add,
    Remove,
    Read,
}

/// Transport protocol match
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

/// Jump target of a host ACL
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Verdict {
    Accept,
    Drop,
    Reject,
}

/// Host ACL mutation, rendered as the iptables command flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostAclAction {
    #[serde(alias = "-I")]
    Insert,
    #[default]
    #[serde(alias = "-A")]
    Append,
    #[serde(alias = "-D")]
    Delete,
    /// Read-only `-L <chain> -n -v`
    #[serde(alias = "-L")]
    List,
}

impl HostAclAction {
    pub const fn flag(self) -> &'static str {
        match self {
            HostAclAction::Insert => "-I",
            HostAclAction::Append => "-A",
            HostAclAction::Delete => "-D",
            HostAclAction::List => "-L",
        }
    }
}

/// A single port or an inclusive range, rendered in iptables `start:end` form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PortRepr", into = "PortRepr")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    /// Checks both bounds and their order.
    ///
    /// # Errors
    ///
    /// Returns `Err` with the validator's message.
    pub fn validate(&self) -> std::result::Result<(), String> {
        validators::validate_port_range(self.start, self.end).map(|_| ())
    }
}

impl From<u16> for PortRange {
    fn from(port: u16) -> Self {
        Self::single(port)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| format!("'{p}' is not a port number"))
        };
        // iptables accepts both `a:b` and `a-b` in the wild
        match s.split_once([':', '-']) {
            Some((start, end)) => Ok(Self {
                start: parse(start)?,
                end: parse(end)?,
            }),
            None => parse(s).map(Self::single),
        }
    }
}

/// Wire form of a [`PortRange`]: a bare number or `"start:end"` text
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortRepr {
    Number(u16),
    Text(String),
}

impl TryFrom<PortRepr> for PortRange {
    type Error = String;

    fn try_from(repr: PortRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            PortRepr::Number(port) => Ok(Self::single(port)),
            PortRepr::Text(text) => text.parse(),
        }
    }
}

impl From<PortRange> for PortRepr {
    fn from(range: PortRange) -> Self {
        if range.is_single() {
            PortRepr::Number(range.start)
        } else {
            PortRepr::Text(range.to_string())
        }
    }
}

/// Renders a network the way iptables prints it back: host routes without the
/// prefix length, everything else in CIDR form.
pub fn render_network(net: &IpNetwork) -> String {
    let host_prefix = match net {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    };
    if net.prefix() == host_prefix {
        net.ip().to_string()
    } else {
        net.to_string()
    }
}

/// True for the "all addresses" wildcard (`0.0.0.0`, `0.0.0.0/0`, `::`)
pub fn is_any_address(net: &IpNetwork) -> bool {
    net.ip().is_unspecified()
}

/// Host-level allow/drop/reject ACL in a filter chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostAcl {
    pub action: HostAclAction,
    pub chain: String,
    pub protocol: Option<Protocol>,
    /// `0.0.0.0` is rewritten to an inbound-interface match
    pub src: Option<IpNetwork>,
    pub dst: Option<IpNetwork>,
    pub sport: Option<PortRange>,
    pub dport: Option<PortRange>,
    #[serde(rename = "in")]
    pub in_iface: Option<String>,
    #[serde(rename = "out")]
    pub out_iface: Option<String>,
    pub target: Option<Verdict>,
    pub mac: Option<String>,
}

impl Default for HostAcl {
    fn default() -> Self {
        Self {
            action: HostAclAction::Append,
            chain: DEFAULT_CHAIN.to_string(),
            protocol: None,
            src: None,
            dst: None,
            sport: None,
            dport: None,
            in_iface: None,
            out_iface: None,
            target: None,
            mac: None,
        }
    }
}

/// NAT port forward: `--destination dest_ip --dport dport -j DNAT --to to_ip:to_port`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub protocol: Protocol,
    #[serde(rename = "destIP")]
    pub dest_ip: Ipv4Addr,
    pub dport: PortRange,
    #[serde(rename = "toIP")]
    pub to_ip: Ipv4Addr,
    #[serde(rename = "toPort")]
    pub to_port: PortRange,
    /// `true` installs the forward, `false` (or absent) removes it
    #[serde(default)]
    pub state: bool,
}

/// DNS redirect of tcp and udp port 53 from `ip` to the resolver `dns`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRedirect {
    /// Source scope; the "any" address becomes an inbound-interface match
    pub ip: IpNetwork,
    /// DNAT target, `addr` or `addr:port`
    pub dns: String,
    #[serde(default)]
    pub state: bool,
}

/// Masquerade of a DHCP subnet in POSTROUTING
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpMasquerade {
    /// Subnet in CIDR form, e.g. `192.168.218.1/24`
    pub ip: IpNetwork,
    #[serde(default)]
    pub state: bool,
}

/// Redirect of port 80 traffic addressed to `ip` to the local diagnostic page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagHttpRedirect {
    pub ip: IpAddr,
    #[serde(default)]
    pub state: bool,
}

/// Tagged variant over the rule categories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuleChange {
    #[serde(rename = "host")]
    HostAcl(HostAcl),
    #[serde(rename = "portforward")]
    PortForward(PortForward),
    #[serde(rename = "dns")]
    DnsRedirect(DnsRedirect),
    #[serde(rename = "dhcp")]
    DhcpMasquerade(DhcpMasquerade),
    #[serde(rename = "diag_http")]
    DiagHttpRedirect(DiagHttpRedirect),
}

impl RuleChange {
    pub fn category(&self) -> RuleCategory {
        match self {
            RuleChange::HostAcl(_) => RuleCategory::HostAcl,
            RuleChange::PortForward(_) => RuleCategory::PortForward,
            RuleChange::DnsRedirect(_) => RuleCategory::DnsRedirect,
            RuleChange::DhcpMasquerade(_) => RuleCategory::DhcpMasquerade,
            RuleChange::DiagHttpRedirect(_) => RuleCategory::DiagHttpRedirect,
        }
    }

    /// Add vs remove, derived from the host action or the NAT `state` flag
    pub fn intent(&self) -> Intent {
        let from_state = |state: bool| if state { Intent::Add } else { Intent::Remove };
        match self {
            RuleChange::HostAcl(acl) => match acl.action {
                HostAclAction::Insert | HostAclAction::Append => Intent::Add,
                HostAclAction::Delete => Intent::Remove,
                HostAclAction::List => Intent::Read,
            },
            RuleChange::PortForward(pf) => from_state(pf.state),
            RuleChange::DnsRedirect(dns) => from_state(dns.state),
            RuleChange::DhcpMasquerade(dhcp) => from_state(dhcp.state),
            RuleChange::DiagHttpRedirect(diag) => from_state(diag.state),
        }
    }

    /// Field-level validation, run before any command is synthesized.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let check = |field: &str, result: std::result::Result<(), String>| {
            result.map_err(|message| Error::validation(field, message))
        };

        let ipv4 = |field: &str, addr: IpAddr| {
            check(field, validators::validate_ipv4(addr).map(|_| ()))
        };

        match self {
            RuleChange::HostAcl(acl) => {
                check("chain", validators::validate_chain(&acl.chain).map(|_| ()))?;
                if let Some(src) = &acl.src {
                    ipv4("src", src.ip())?;
                }
                if let Some(dst) = &acl.dst {
                    ipv4("dst", dst.ip())?;
                }
                if let Some(sport) = &acl.sport {
                    check("sport", sport.validate())?;
                }
                if let Some(dport) = &acl.dport {
                    check("dport", dport.validate())?;
                }
                if (acl.sport.is_some() || acl.dport.is_some())
                    && !matches!(acl.protocol, Some(Protocol::Tcp | Protocol::Udp))
                {
                    return Err(Error::validation(
                        "protocol",
                        "port matches require protocol tcp or udp",
                    ));
                }
                if let Some(iface) = &acl.in_iface {
                    check("in", validators::validate_interface(iface).map(|_| ()))?;
                }
                if let Some(iface) = &acl.out_iface {
                    check("out", validators::validate_interface(iface).map(|_| ()))?;
                }
                if let Some(mac) = &acl.mac {
                    check("mac", validators::validate_mac(mac).map(|_| ()))?;
                }
            }
            RuleChange::PortForward(pf) => {
                if !matches!(pf.protocol, Protocol::Tcp | Protocol::Udp) {
                    return Err(Error::validation(
                        "protocol",
                        "port forwarding requires protocol tcp or udp",
                    ));
                }
                check("dport", pf.dport.validate())?;
                check("toPort", pf.to_port.validate())?;
            }
            RuleChange::DnsRedirect(dns) => {
                ipv4("ip", dns.ip.ip())?;
                check("dns", validators::validate_dnat_target(&dns.dns).map(|_| ()))?;
            }
            RuleChange::DhcpMasquerade(dhcp) => ipv4("ip", dhcp.ip.ip())?,
            RuleChange::DiagHttpRedirect(diag) => ipv4("ip", diag.ip)?,
        }
        Ok(())
    }
}

impl From<HostAcl> for RuleChange {
    fn from(acl: HostAcl) -> Self {
        RuleChange::HostAcl(acl)
    }
}

impl From<PortForward> for RuleChange {
    fn from(pf: PortForward) -> Self {
        RuleChange::PortForward(pf)
    }
}

impl From<DnsRedirect> for RuleChange {
    fn from(dns: DnsRedirect) -> Self {
        RuleChange::DnsRedirect(dns)
    }
}

impl From<DhcpMasquerade> for RuleChange {
    fn from(dhcp: DhcpMasquerade) -> Self {
        RuleChange::DhcpMasquerade(dhcp)
    }
}

impl From<DiagHttpRedirect> for RuleChange {
    fn from(diag: DiagHttpRedirect) -> Self {
        RuleChange::DiagHttpRedirect(diag)
    }
}

/// The unit of work submitted to the rule queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleChangeRequest {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(flatten)]
    pub change: RuleChange,
    /// Run through the privilege launcher. NAT categories are always elevated.
    #[serde(default, rename = "sudo")]
    pub elevated: bool,
}

impl RuleChangeRequest {
    pub fn new(change: RuleChange) -> Self {
        Self {
            id: Uuid::new_v4(),
            change,
            elevated: false,
        }
    }

    pub fn elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    pub fn category(&self) -> RuleCategory {
        self.change.category()
    }

    pub fn intent(&self) -> Intent {
        self.change.intent()
    }

    /// Whether the synthesized commands go through the privilege launcher
    pub fn needs_elevation(&self) -> bool {
        match self.change {
            RuleChange::HostAcl(_) => self.elevated,
            _ => true,
        }
    }

    /// Admits an untyped request (the JSON shape control-plane callers send).
    ///
    /// The `type` discriminant is checked first so an unknown category fails
    /// with [`Error::InvalidCategory`] before any field is looked at.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidCategory` if `type` is missing or unknown
    /// - `Error::Validation` if the fields do not fit the category
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let tag = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::InvalidCategory("undefined".to_string()))?;

        let category = RuleCategory::iter()
            .find(|c| c.as_ref() == tag)
            .ok_or_else(|| Error::InvalidCategory(tag.to_string()))?;

        let change: RuleChange = serde_json::from_value(value.clone())
            .map_err(|e| Error::validation(category.as_ref(), e.to_string()))?;

        let elevated = value
            .get("sudo")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        Ok(Self::new(change).elevated(elevated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_port_range_display_and_parse() {
        assert_eq!(PortRange::single(443).to_string(), "443");
        let range: PortRange = "1000:2000".parse().unwrap();
        assert_eq!(range.to_string(), "1000:2000");
        let dashed: PortRange = "1000-2000".parse().unwrap();
        assert_eq!(dashed, range);
        assert!("http".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_port_range_accepts_number_or_text() {
        let from_number: PortRange = serde_json::from_value(json!(8080)).unwrap();
        let from_text: PortRange = serde_json::from_value(json!("8080")).unwrap();
        assert_eq!(from_number, from_text);
        assert_eq!(serde_json::to_value(PortRange::single(80)).unwrap(), json!(80));
    }

    #[test]
    fn test_render_network_strips_host_prefix() {
        let host: IpNetwork = "10.0.0.5".parse().unwrap();
        let subnet: IpNetwork = "192.168.218.1/24".parse().unwrap();
        assert_eq!(render_network(&host), "10.0.0.5");
        assert_eq!(render_network(&subnet), "192.168.218.1/24");
    }

    #[test]
    fn test_any_address_detection() {
        assert!(is_any_address(&"0.0.0.0".parse().unwrap()));
        assert!(is_any_address(&"0.0.0.0/0".parse().unwrap()));
        assert!(!is_any_address(&"10.0.0.0/8".parse().unwrap()));
    }

    #[test]
    fn test_intent_from_state() {
        let diag = DiagHttpRedirect {
            ip: "10.0.0.2".parse().unwrap(),
            state: false,
        };
        assert_eq!(RuleChange::from(diag.clone()).intent(), Intent::Remove);
        let diag = DiagHttpRedirect { state: true, ..diag };
        assert_eq!(RuleChange::from(diag).intent(), Intent::Add);
    }

    #[test]
    fn test_from_json_port_forward() {
        let request = RuleChangeRequest::from_json(&json!({
            "type": "portforward",
            "protocol": "tcp",
            "destIP": "1.2.3.4",
            "dport": 8080,
            "toIP": "10.0.0.9",
            "toPort": "80",
            "state": true
        }))
        .unwrap();

        assert_eq!(request.category(), RuleCategory::PortForward);
        assert_eq!(request.intent(), Intent::Add);
        assert!(request.needs_elevation());
    }

    #[test]
    fn test_from_json_host_with_legacy_action_flag() {
        let request = RuleChangeRequest::from_json(&json!({
            "type": "host",
            "action": "-D",
            "protocol": "tcp",
            "src": "10.0.0.5",
            "dport": 443,
            "target": "ACCEPT",
            "sudo": true
        }))
        .unwrap();

        let RuleChange::HostAcl(acl) = &request.change else {
            panic!("expected host acl");
        };
        assert_eq!(acl.action, HostAclAction::Delete);
        assert_eq!(acl.chain, "FORWARD");
        assert!(request.elevated);
    }

    #[test]
    fn test_from_json_unknown_category() {
        let err = RuleChangeRequest::from_json(&json!({"type": "ipv6_nat", "ip": "::1"}))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCategory(ref t) if t == "ipv6_nat"));

        let err = RuleChangeRequest::from_json(&json!({"ip": "10.0.0.1"})).unwrap_err();
        assert!(matches!(err, Error::InvalidCategory(_)));
    }

    #[test]
    fn test_from_json_bad_fields() {
        let err = RuleChangeRequest::from_json(&json!({"type": "dhcp", "ip": "not-a-cidr"}))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "dhcp"));
    }

    #[test]
    fn test_validate_rejects_ports_without_transport() {
        let acl = HostAcl {
            dport: Some(PortRange::single(22)),
            ..HostAcl::default()
        };
        let err = RuleChange::from(acl).validate().unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "protocol"));
    }

    #[test]
    fn test_validate_rejects_bad_dns_target() {
        let dns = DnsRedirect {
            ip: "10.0.0.0/24".parse().unwrap(),
            dns: "10.0.0.1; reboot".to_string(),
            state: true,
        };
        assert!(RuleChange::from(dns).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_ipv6() {
        let diag = DiagHttpRedirect {
            ip: "fe80::1".parse().unwrap(),
            state: false,
        };
        let err = RuleChange::from(diag).validate().unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "ip"));

        let dhcp = DhcpMasquerade {
            ip: "fd00::/64".parse().unwrap(),
            state: true,
        };
        assert!(RuleChange::from(dhcp).validate().is_err());

        let dns = DnsRedirect {
            ip: "::/0".parse().unwrap(),
            dns: "10.0.0.1".to_string(),
            state: true,
        };
        assert!(RuleChange::from(dns).validate().is_err());

        let acl = HostAcl {
            dst: Some("2001:db8::1".parse().unwrap()),
            ..HostAcl::default()
        };
        let err = RuleChange::from(acl).validate().unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "dst"));
    }

    #[test]
    fn test_host_acl_elevation_follows_flag() {
        let request = RuleChangeRequest::new(HostAcl::default().into());
        assert!(!request.needs_elevation());
        assert!(request.elevated(true).needs_elevation());
    }
}
