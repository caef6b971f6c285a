pub const SUBNET_MASK: &str = "255.255.255.0";

pub const INTERFACE_PREFIX: &str = "Proxy_";

/// One `host:port:username:password` line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyRecord {
    /// 1-based rank among accepted lines; drives the interface name and subnet.
    pub sequence_id: u32,
    pub host: String,
    pub port: String,
    pub username: String,
    pub password: String,
}

impl ProxyRecord {
    pub fn proxy_url(&self) -> String {
        format!(
            "socks5://{}:{}@{}:{}",
            self.username, self.password, self.host, self.port
        )
    }

    pub fn interface(&self) -> ProvisionedInterface {
        ProvisionedInterface::for_sequence(self.sequence_id)
    }

    /// Command line handed to tun2socks for this record.
    pub fn tunnel_arguments(&self) -> Vec<String> {
        vec![
            "-device".into(),
            self.interface().name,
            "-proxy".into(),
            self.proxy_url(),
            "-loglevel".into(),
            "error".into(),
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionedInterface {
    pub name: String,
    pub address: String,
    pub gateway: String,
    pub netmask: &'static str,
}

impl ProvisionedInterface {
    pub fn for_sequence(sequence_id: u32) -> Self {
        Self {
            name: format!("{INTERFACE_PREFIX}{sequence_id}"),
            address: format!("10.0.{sequence_id}.1"),
            gateway: format!("10.0.{sequence_id}.254"),
            netmask: SUBNET_MASK,
        }
    }
}

#[derive(Debug, Default)]
pub struct ParsedProxies {
    pub records: Vec<ProxyRecord>,
    /// Non-blank lines dropped for having fewer than four fields.
    pub skipped: usize,
}

impl ParsedProxies {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub fn parse_proxies(text: &str) -> ParsedProxies {
    let mut parsed = ParsedProxies::default();

    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let fields: Vec<&str> = line.split(':').collect();
        let [host, port, username, password, ..] = fields.as_slice() else {
            log::debug!("[proxies] skipping line with {} field(s)", fields.len());
            parsed.skipped += 1;
            continue;
        };

        parsed.records.push(ProxyRecord {
            sequence_id: parsed.records.len() as u32 + 1,
            host: host.to_string(),
            port: port.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        });
    }

    log::info!(
        "[proxies] parsed {} proxies ({} line(s) skipped)",
        parsed.records.len(),
        parsed.skipped,
    );
    parsed
}

/// The trimmed non-blank lines, as they are remembered between runs.
pub fn non_blank_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
