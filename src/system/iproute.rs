use std::{io, net::Ipv4Addr, sync::Arc};

use super::{CommandRunner, HostNetwork};

/// iproute2 backend used on development hosts.
///
/// The gateway is accepted for parity with `netsh` but not routed: a
/// default route per tunnel is installed by `set_metric` instead.
pub struct IprouteHost {
    runner: Arc<dyn CommandRunner>,
}

impl IprouteHost {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl HostNetwork for IprouteHost {
    fn launch_tunnel(&self, binary: &str, arguments: &[String]) -> io::Result<()> {
        let arguments: Vec<&str> = arguments.iter().map(String::as_str).collect();
        self.runner.spawn_detached(binary, &arguments)
    }

    fn kill_tunnels(&self, image_name: &str) -> bool {
        log::info!("[process] terminating every {image_name} by process name");
        self.runner.run("pkill", &["-x", image_name]).success
    }

    fn interface_exists(&self, name: &str) -> bool {
        self.runner.run("ip", &["link", "show", "dev", name]).success
    }

    fn set_static_address(&self, name: &str, address: &str, mask: &str, gateway: &str) -> bool {
        let Some(prefix) = prefix_length(mask) else {
            log::warn!("[iproute] invalid netmask {mask} for {name}");
            return false;
        };
        log::debug!("[iproute] {name}: {address}/{prefix} (gateway {gateway} left to tunnel)");

        let cidr = format!("{address}/{prefix}");
        self.runner
            .run("ip", &["addr", "replace", &cidr, "dev", name])
            .success
            && self
                .runner
                .run("ip", &["link", "set", "dev", name, "up"])
                .success
    }

    fn set_metric(&self, name: &str, metric: u32) -> bool {
        let metric = metric.to_string();
        self.runner
            .run(
                "ip",
                &["route", "replace", "default", "dev", name, "metric", &metric],
            )
            .success
    }

    fn query_ipv4(&self, name: &str) -> Option<String> {
        let output = self
            .runner
            .run("ip", &["-4", "-o", "addr", "show", "dev", name]);
        if !output.success {
            return None;
        }
        parse_inet_address(&output.stdout)
    }

    fn interface_names(&self) -> Vec<String> {
        let output = self.runner.run("ip", &["-o", "link", "show"]);
        if !output.success {
            log::warn!("[adapters] ip link listing failed");
            return Vec::new();
        }
        parse_link_names(&output.stdout)
    }
}

fn prefix_length(mask: &str) -> Option<u32> {
    let bits = u32::from(mask.parse::<Ipv4Addr>().ok()?);
    let prefix = bits.count_ones();
    // Reject non-contiguous masks such as 255.0.255.0.
    (bits.checked_shl(prefix).unwrap_or(0) == 0).then_some(prefix)
}

fn parse_inet_address(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        tokens.find(|token| *token == "inet")?;
        let cidr = tokens.next()?;
        Some(cidr.split('/').next().unwrap_or(cidr).to_string())
    })
}

fn parse_link_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let name = line.split(": ").nth(1)?.trim();
            let name = name.split('@').next().unwrap_or(name);
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_from_mask() {
        assert_eq!(prefix_length("255.255.255.0"), Some(24));
        assert_eq!(prefix_length("255.255.0.0"), Some(16));
        assert_eq!(prefix_length("0.0.0.0"), Some(0));
        assert_eq!(prefix_length("255.255.255.255"), Some(32));
        assert_eq!(prefix_length("255.0.255.0"), None);
        assert_eq!(prefix_length("not-a-mask"), None);
    }

    #[test]
    fn inet_address_is_stripped_of_prefix() {
        let stdout = "7: Proxy_1    inet 10.0.1.1/24 scope global Proxy_1\\       valid_lft forever preferred_lft forever\n";
        assert_eq!(parse_inet_address(stdout).as_deref(), Some("10.0.1.1"));
        assert_eq!(parse_inet_address(""), None);
    }

    #[test]
    fn link_names_drop_peer_suffix() {
        let stdout = "1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN\n\
                      2: eth0@if9: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue\n\
                      5: Proxy_1: <POINTOPOINT,UP,LOWER_UP> mtu 1500 qdisc fq_codel\n";
        assert_eq!(parse_link_names(stdout), vec!["lo", "eth0", "Proxy_1"]);
    }
}
