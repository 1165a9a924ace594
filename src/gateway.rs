//! Default gateway discovery
//!
//! Used when no gateway is configured. Linux reads `/proc/net/route`; macOS
//! and Windows parse the routing table printed by `netstat` / `route`.

use crate::{Error, Result};
use std::net::Ipv4Addr;
use tracing::debug;

/// Find the IPv4 default gateway
pub fn find_default_gateway() -> Result<Ipv4Addr> {
    let gateway = discover()?;
    debug!("Found default gateway: {}", gateway);
    Ok(gateway)
}

#[cfg(target_os = "linux")]
fn discover() -> Result<Ipv4Addr> {
    let table = std::fs::read_to_string("/proc/net/route")?;
    parse_proc_net_route(&table).ok_or(Error::NoGateway)
}

#[cfg(target_os = "macos")]
fn discover() -> Result<Ipv4Addr> {
    let table = command_output("netstat", &["-rn", "-f", "inet"])?;
    parse_default_route(&table, "default", 1).ok_or(Error::NoGateway)
}

#[cfg(target_os = "windows")]
fn discover() -> Result<Ipv4Addr> {
    let table = command_output("route", &["print", "0.0.0.0"])?;
    parse_default_route(&table, "0.0.0.0", 2).ok_or(Error::NoGateway)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn discover() -> Result<Ipv4Addr> {
    Err(Error::NoGateway)
}

#[cfg(any(target_os = "macos", target_os = "windows"))]
fn command_output(program: &str, args: &[&str]) -> Result<String> {
    let output = std::process::Command::new(program).args(args).output()?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Default route from the contents of `/proc/net/route`
///
/// The gateway column is the network-order address printed as a host-order
/// hex word.
pub fn parse_proc_net_route(table: &str) -> Option<Ipv4Addr> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[1] != "00000000" {
            return None;
        }
        let raw = u32::from_str_radix(fields[2], 16).ok()?;
        let gateway = Ipv4Addr::from(u32::from_be(raw));
        (!gateway.is_unspecified()).then_some(gateway)
    })
}

/// Gateway column of the first line starting with `prefix` in a route listing
pub fn parse_default_route(table: &str, prefix: &str, column: usize) -> Option<Ipv4Addr> {
    table
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(prefix))
        .find_map(|line| line.split_whitespace().nth(column)?.parse().ok())
}
