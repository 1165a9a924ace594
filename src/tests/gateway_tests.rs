use crate::gateway::*;
use std::net::Ipv4Addr;

const PROC_NET_ROUTE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
";

#[test]
fn test_parse_proc_net_route() {
    assert_eq!(
        parse_proc_net_route(PROC_NET_ROUTE),
        Some(Ipv4Addr::new(192, 168, 1, 1))
    );
}

#[test]
fn test_parse_proc_net_route_without_default() {
    let table = "Iface\tDestination\tGateway\n\
                 eth0\t0001A8C0\t00000000\n";
    assert_eq!(parse_proc_net_route(table), None);
}

#[test]
fn test_parse_netstat_default_route() {
    let table = "\
Routing tables

Internet:
Destination        Gateway            Flags        Netif Expire
default            10.0.1.1           UGScg          en0
127                127.0.0.1          UCS            lo0
";
    assert_eq!(
        parse_default_route(table, "default", 1),
        Some(Ipv4Addr::new(10, 0, 1, 1))
    );
}

#[test]
fn test_parse_windows_route_print() {
    let table = "\
IPv4 Route Table
===========================================================================
Active Routes:
Network Destination        Netmask          Gateway       Interface  Metric
          0.0.0.0          0.0.0.0      192.168.0.1    192.168.0.23     25
";
    assert_eq!(
        parse_default_route(table, "0.0.0.0", 2),
        Some(Ipv4Addr::new(192, 168, 0, 1))
    );
}
