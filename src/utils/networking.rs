use crate::utils::exec::local;
use std::net::{IpAddr, Ipv4Addr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Interface name fragments that identify an OpenVPN adapter
const TUNNEL_MARKERS: [&str; 3] = ["TAP", "TUN", "OPENVPN"];

/// Attempt a TCP connection and return the connect latency in milliseconds
pub fn tcp_ping(host: &str, port: u16, timeout: Duration) -> Option<f64> {
    let addrs = (host, port).to_socket_addrs().ok()?;
    for addr in addrs {
        let start = Instant::now();
        if TcpStream::connect_timeout(&addr, timeout).is_ok() {
            let elapsed = start.elapsed().as_secs_f64() * 1000.0;
            return Some((elapsed * 1000.0).round() / 1000.0);
        }
    }
    None
}

pub fn check_tcp(host: &str, port: u16, timeout: Duration) -> bool {
    let reachable = tcp_ping(host, port, timeout).is_some();
    if !reachable {
        tracing::debug!("TCP {}:{} failed", host, port);
    }
    reachable
}

/// Arguments for a single-echo `ping` on the given platform
pub fn ping_args(windows: bool, host: &str, timeout_ms: u64) -> Vec<String> {
    if windows {
        vec![
            "-n".to_string(),
            "1".to_string(),
            "-w".to_string(),
            timeout_ms.to_string(),
            host.to_string(),
        ]
    } else {
        vec![
            "-c".to_string(),
            "1".to_string(),
            "-W".to_string(),
            (timeout_ms / 1000).max(1).to_string(),
            host.to_string(),
        ]
    }
}

/// ICMP reachability via the system `ping` binary
pub fn ping_host(host: &str, timeout_ms: u64) -> bool {
    let args = ping_args(cfg!(windows), host, timeout_ms);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match local::execute("ping", &args) {
        Ok(output) => {
            if !output.status.success() {
                tracing::debug!("Ping {} failed: {}", host, local::output_text(&output));
            }
            output.status.success()
        }
        Err(e) => {
            tracing::debug!("Ping {} could not run: {}", host, e);
            false
        }
    }
}

/// Pick the first usable IPv4 address on a TAP/TUN/OpenVPN adapter
pub fn select_tunnel_ip<'a, I>(interfaces: I) -> Option<Ipv4Addr>
where
    I: IntoIterator<Item = (&'a str, IpAddr)>,
{
    interfaces.into_iter().find_map(|(name, ip)| {
        let upper = name.to_uppercase();
        if !TUNNEL_MARKERS.iter().any(|marker| upper.contains(marker)) {
            return None;
        }
        match ip {
            IpAddr::V4(v4) if v4.octets()[0] != 0 && !v4.is_link_local() => Some(v4),
            _ => None,
        }
    })
}

/// IPv4 address of the local tunnel adapter, if the tunnel is up
pub fn tunnel_ipv4() -> Option<Ipv4Addr> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            tracing::warn!("Could not list network interfaces: {}", e);
            return None;
        }
    };
    let found = select_tunnel_ip(interfaces.iter().map(|iface| (iface.name.as_str(), iface.ip())));
    if found.is_none() {
        tracing::warn!("VPN IP not found - check if OpenVPN tunnel is up.");
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv6Addr, TcpListener};

    #[test]
    fn test_select_tunnel_ip_skips_unusable_addresses() {
        let interfaces = vec![
            ("eth0", IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))),
            ("tun0", IpAddr::V6(Ipv6Addr::LOCALHOST)),
            ("TAP-Windows Adapter V9", IpAddr::V4(Ipv4Addr::new(169, 254, 3, 4))),
            ("tun0", IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))),
            ("OpenVPN Data Channel Offload", IpAddr::V4(Ipv4Addr::new(10, 8, 0, 6))),
        ];
        assert_eq!(
            select_tunnel_ip(interfaces),
            Some(Ipv4Addr::new(10, 8, 0, 6))
        );
    }

    #[test]
    fn test_select_tunnel_ip_none_without_adapter() {
        let interfaces = vec![("wlan0", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)))];
        assert_eq!(select_tunnel_ip(interfaces), None);
    }

    #[test]
    fn test_ping_args_per_platform() {
        assert_eq!(
            ping_args(true, "192.168.1.30", 1000),
            vec!["-n", "1", "-w", "1000", "192.168.1.30"]
        );
        assert_eq!(
            ping_args(false, "192.168.1.30", 500),
            vec!["-c", "1", "-W", "1", "192.168.1.30"]
        );
    }

    #[test]
    fn test_tcp_ping_open_and_closed_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(tcp_ping("127.0.0.1", port, Duration::from_secs(1)).is_some());

        drop(listener);
        assert!(!check_tcp("127.0.0.1", port, Duration::from_millis(500)));
    }
}
