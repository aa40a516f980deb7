//! Input validation for rule change requests
//!
//! Every field that ends up on an iptables command line passes through one of
//! these checks at admission time. Shell-interpreted scripts embed the values
//! verbatim, so anything outside the allowed alphabets is rejected rather than
//! quoted.

use std::net::IpAddr;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
/// - A trailing `+` is the iptables wildcard and is allowed
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name must not be empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    let stem = name.strip_suffix('+').unwrap_or(name);
    if stem.is_empty()
        || !stem
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates an iptables chain name.
///
/// Built-in chains are upper case (`INPUT`, `FORWARD`, `PREROUTING`...), user
/// chains may be anything up to 28 characters from a conservative alphabet.
///
/// # Errors
///
/// Returns `Err` if the name is empty, too long, or not shell-safe.
pub fn validate_chain(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Chain name must not be empty".to_string());
    }

    if name.len() > 28 {
        return Err("Chain name too long (max 28 characters)".to_string());
    }

    if name.starts_with('-') {
        return Err("Chain name must not start with '-'".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err("Chain name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates a MAC address in colon-separated hex form (`aa:bb:cc:dd:ee:ff`).
///
/// # Errors
///
/// Returns `Err` unless the input is exactly six two-digit hex octets.
pub fn validate_mac(mac: &str) -> Result<String, String> {
    let octets: Vec<&str> = mac.split(':').collect();
    if octets.len() != 6
        || !octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return Err(format!("'{mac}' is not a MAC address (expected aa:bb:cc:dd:ee:ff)"));
    }
    Ok(mac.to_ascii_lowercase())
}

/// Rejects IPv6 addresses; iptables only programs the IPv4 tables.
///
/// # Errors
///
/// Returns `Err` naming the address if it is IPv6.
pub fn validate_ipv4(addr: IpAddr) -> Result<IpAddr, String> {
    if addr.is_ipv4() {
        Ok(addr)
    } else {
        Err(format!("'{addr}' is an IPv6 address, iptables handles IPv4 only"))
    }
}

/// Validates a DNAT `--to-destination` value: an IPv4 address with an
/// optional `:port` suffix.
///
/// # Errors
///
/// Returns `Err` if the address does not parse or the port is invalid.
pub fn validate_dnat_target(target: &str) -> Result<String, String> {
    let (addr, port) = match target.split_once(':') {
        Some((addr, port)) => (addr, Some(port)),
        None => (target, None),
    };

    addr.parse::<std::net::Ipv4Addr>()
        .map_err(|_| format!("'{addr}' is not an IPv4 address"))?;

    if let Some(port) = port {
        let port: u16 = port
            .parse()
            .map_err(|_| format!("'{port}' is not a port number"))?;
        validate_port(port)?;
    }

    Ok(target.to_string())
}
