use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    proxy::{ProvisionedInterface, ProxyRecord},
    system::HostNetwork,
};

/// Receives every progress line, from the provisioning thread.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

pub const BATCH_FINISHED: &str = "All proxies started.";

#[cfg(target_os = "windows")]
pub const DEFAULT_TUNNEL_IMAGE: &str = "tun2socks.exe";
#[cfg(not(target_os = "windows"))]
pub const DEFAULT_TUNNEL_IMAGE: &str = "tun2socks";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionPolicy {
    pub poll_interval_ms: u64,
    pub appear_timeout_ms: u64,
    pub settle_ms: u64,
    pub retry_pause_ms: u64,
    pub max_attempts: u32,
    pub metric: u32,
}

impl Default for ProvisionPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            appear_timeout_ms: 10_000,
            settle_ms: 500,
            retry_pause_ms: 1_000,
            max_attempts: 3,
            metric: 500,
        }
    }
}

impl ProvisionPolicy {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn appear_timeout(&self) -> Duration {
        Duration::from_millis(self.appear_timeout_ms)
    }

    fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProvisionState {
    Launching,
    AwaitingInterface,
    AssigningAddress { attempt: u32 },
    Ready,
    Failed(FailureReason),
}

impl ProvisionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed(_))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureReason {
    Launch(String),
    InterfaceTimeout,
    AddressNotApplied {
        attempts: u32,
        last_seen: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordOutcome {
    pub sequence_id: u32,
    pub interface: String,
    pub state: ProvisionState,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<RecordOutcome>,
}

impl BatchReport {
    pub fn ready_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.state.is_ready())
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.ready_count()
    }
}

/// Brings up one tun2socks interface per proxy, strictly in order.
///
/// A second `start` while a batch is still running is rejected with
/// [`Error::BatchInProgress`]; the flag is cleared when the batch thread ends.
#[derive(Clone)]
pub struct Provisioner {
    host: Arc<dyn HostNetwork>,
    tunnel_binary: String,
    policy: ProvisionPolicy,
    running: Arc<AtomicBool>,
}

struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Provisioner {
    pub fn new(
        host: Arc<dyn HostNetwork>,
        tunnel_binary: impl Into<String>,
        policy: ProvisionPolicy,
    ) -> Self {
        Self {
            host,
            tunnel_binary: tunnel_binary.into(),
            policy,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Process image `stop_all` kills; on Windows it always carries an extension.
    pub fn image_name(&self) -> String {
        let file_name = Path::new(&self.tunnel_binary)
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_TUNNEL_IMAGE);

        if cfg!(target_os = "windows") {
            with_executable_extension(file_name)
        } else {
            file_name.to_string()
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Disrupts every tunnel, including ones a running batch just launched.
    pub fn stop_all(&self) -> bool {
        self.host.kill_tunnels(&self.image_name())
    }

    /// Kills old tunnels, then provisions `records` on a background thread.
    pub fn start(&self, records: Vec<ProxyRecord>, sink: LogSink) -> Result<JoinHandle<BatchReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("[provision] start ignored: a batch is already running");
            return Err(Error::BatchInProgress);
        }
        let guard = RunningGuard(self.running.clone());

        self.stop_all();

        let provisioner = self.clone();
        let handle = std::thread::Builder::new()
            .name("provisioner".into())
            .spawn(move || {
                let _guard = guard;
                provisioner.run_batch(&records, &sink)
            })?;
        Ok(handle)
    }

    /// Blocking body of a batch; one record never aborts the next.
    pub fn run_batch(&self, records: &[ProxyRecord], sink: &LogSink) -> BatchReport {
        log::info!("━━━ PROVISION ({} proxies) ━━━", records.len());

        let mut report = BatchReport::default();
        for record in records {
            let state = self.provision(record, sink);
            report.outcomes.push(RecordOutcome {
                sequence_id: record.sequence_id,
                interface: record.interface().name,
                state,
            });
        }

        emit(sink, log::Level::Info, BATCH_FINISHED);
        report
    }

    pub fn provision(&self, record: &ProxyRecord, sink: &LogSink) -> ProvisionState {
        let interface = record.interface();
        let mut state = ProvisionState::Launching;
        while !state.is_terminal() {
            state = self.step(record, &interface, state, sink);
        }
        state
    }

    pub fn step(
        &self,
        record: &ProxyRecord,
        interface: &ProvisionedInterface,
        state: ProvisionState,
        sink: &LogSink,
    ) -> ProvisionState {
        let id = record.sequence_id;
        match state {
            ProvisionState::Launching => {
                emit(
                    sink,
                    log::Level::Info,
                    &format!(
                        "[{id}] Starting interface {} connected to {}...",
                        interface.name, record.host
                    ),
                );
                match self.launch(record) {
                    Ok(()) => ProvisionState::AwaitingInterface,
                    Err(detail) => {
                        emit(
                            sink,
                            log::Level::Error,
                            &format!("[{id}] ERROR: Failed to launch tunnel: {detail}"),
                        );
                        ProvisionState::Failed(FailureReason::Launch(detail))
                    }
                }
            }
            ProvisionState::AwaitingInterface => {
                if !self.wait_for_interface(&interface.name) {
                    emit(
                        sink,
                        log::Level::Error,
                        &format!("[{id}] ERROR: Interface {} failed to appear.", interface.name),
                    );
                    return ProvisionState::Failed(FailureReason::InterfaceTimeout);
                }
                emit(
                    sink,
                    log::Level::Info,
                    &format!("[{id}] Setting IP {}...", interface.address),
                );
                ProvisionState::AssigningAddress { attempt: 1 }
            }
            ProvisionState::AssigningAddress { attempt } => {
                self.assign_address(id, interface, attempt, sink)
            }
            terminal => terminal,
        }
    }

    fn launch(&self, record: &ProxyRecord) -> Result<(), String> {
        if self.tunnel_binary.is_empty() {
            return Err("tun2socks path is not configured".into());
        }
        self.host
            .launch_tunnel(&self.tunnel_binary, &record.tunnel_arguments())
            .map_err(|error| format!("{}: {error}", self.tunnel_binary))
    }

    fn wait_for_interface(&self, name: &str) -> bool {
        let deadline = Instant::now() + self.policy.appear_timeout();
        loop {
            if self.host.interface_exists(name) {
                log::debug!("[provision] interface {name} is present");
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(self.policy.poll_interval());
        }
    }

    // The set commands may report success before the stack applies the
    // address, so only the readback decides the outcome.
    fn assign_address(
        &self,
        id: u32,
        interface: &ProvisionedInterface,
        attempt: u32,
        sink: &LogSink,
    ) -> ProvisionState {
        let name = &interface.name;
        if !self.host.set_static_address(
            name,
            &interface.address,
            interface.netmask,
            &interface.gateway,
        ) {
            log::debug!("[provision] set address on {name} reported failure (attempt {attempt})");
        }
        if !self.host.set_metric(name, self.policy.metric) {
            log::debug!("[provision] set metric on {name} reported failure (attempt {attempt})");
        }
        std::thread::sleep(self.policy.settle());

        let observed = self.host.query_ipv4(name);
        if observed.as_deref() == Some(interface.address.as_str()) {
            emit(sink, log::Level::Info, &format!("[{id}] Ready."));
            return ProvisionState::Ready;
        }

        let seen = observed.as_deref().unwrap_or("nothing");
        let attempts = self.policy.attempts();
        if attempt < attempts {
            emit(
                sink,
                log::Level::Warn,
                &format!(
                    "[{id}] IP not applied yet (got {seen}), retrying ({attempt}/{attempts})..."
                ),
            );
            std::thread::sleep(self.policy.retry_pause());
            ProvisionState::AssigningAddress {
                attempt: attempt + 1,
            }
        } else {
            emit(
                sink,
                log::Level::Error,
                &format!(
                    "[{id}] ERROR: Failed to assign IP {} to {name} after {attempts} attempts (got {seen}).",
                    interface.address
                ),
            );
            ProvisionState::Failed(FailureReason::AddressNotApplied {
                attempts,
                last_seen: observed,
            })
        }
    }
}

/// `taskkill /IM` matches the full image name, extension included.
fn with_executable_extension(file_name: &str) -> String {
    if Path::new(file_name).extension().is_some() {
        file_name.to_string()
    } else {
        format!("{file_name}.exe")
    }
}

fn emit(sink: &LogSink, level: log::Level, line: &str) {
    log::log!(level, "[provision] {line}");
    sink(line);
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        io,
        sync::{Mutex, mpsc},
    };

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::proxy::parse_proxies;

    fn instant_policy() -> ProvisionPolicy {
        ProvisionPolicy {
            poll_interval_ms: 0,
            appear_timeout_ms: 0,
            settle_ms: 0,
            retry_pause_ms: 0,
            ..ProvisionPolicy::default()
        }
    }

    /// Scripted host: readback answers are consumed per interface in order,
    /// the last one repeating.
    #[derive(Default)]
    struct FakeHost {
        events: Mutex<Vec<String>>,
        missing: Vec<String>,
        readbacks: Mutex<HashMap<String, Vec<Option<String>>>>,
        launch_error: bool,
    }

    impl FakeHost {
        fn readback(self, name: &str, answers: &[Option<&str>]) -> Self {
            self.readbacks.lock().unwrap().insert(
                name.to_string(),
                answers.iter().map(|a| a.map(str::to_string)).collect(),
            );
            self
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.events()
                .iter()
                .filter(|event| event.starts_with(prefix))
                .count()
        }

        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl HostNetwork for FakeHost {
        fn launch_tunnel(&self, binary: &str, arguments: &[String]) -> io::Result<()> {
            self.record(format!("launch {binary} {}", arguments.join(" ")));
            if self.launch_error {
                Err(io::Error::new(io::ErrorKind::NotFound, "missing"))
            } else {
                Ok(())
            }
        }

        fn kill_tunnels(&self, image_name: &str) -> bool {
            self.record(format!("kill {image_name}"));
            true
        }

        fn interface_exists(&self, name: &str) -> bool {
            self.record(format!("exists {name}"));
            !self.missing.iter().any(|missing| missing == name)
        }

        fn set_static_address(&self, name: &str, address: &str, mask: &str, gateway: &str) -> bool {
            self.record(format!("address {name} {address} {mask} {gateway}"));
            true
        }

        fn set_metric(&self, name: &str, metric: u32) -> bool {
            self.record(format!("metric {name} {metric}"));
            true
        }

        fn query_ipv4(&self, name: &str) -> Option<String> {
            self.record(format!("query {name}"));
            let mut readbacks = self.readbacks.lock().unwrap();
            let answers = readbacks.get_mut(name)?;
            if answers.len() > 1 {
                answers.remove(0)
            } else {
                answers.first().cloned().flatten()
            }
        }

        fn interface_names(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn collecting_sink() -> (LogSink, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let sink: LogSink = Arc::new(move |line: &str| captured.lock().unwrap().push(line.to_string()));
        (sink, lines)
    }

    fn provisioner(host: Arc<FakeHost>) -> Provisioner {
        Provisioner::new(host, "/opt/tun/tun2socks.exe", instant_policy())
    }

    #[test]
    fn first_readback_match_needs_no_retry() {
        let host = Arc::new(FakeHost::default().readback("Proxy_1", &[Some("10.0.1.1")]));
        let record = parse_proxies("1.2.3.4:1080:u:p").records.remove(0);
        let (sink, lines) = collecting_sink();

        let state = provisioner(host.clone()).provision(&record, &sink);

        assert_eq!(state, ProvisionState::Ready);
        assert_eq!(host.count("address "), 1);
        assert_eq!(host.count("metric Proxy_1 500"), 1);
        assert_eq!(
            *lines.lock().unwrap(),
            vec![
                "[1] Starting interface Proxy_1 connected to 1.2.3.4...",
                "[1] Setting IP 10.0.1.1...",
                "[1] Ready.",
            ]
        );
    }

    #[test]
    fn launch_passes_tunnel_contract() {
        let host = Arc::new(FakeHost::default().readback("Proxy_1", &[Some("10.0.1.1")]));
        let record = parse_proxies("1.2.3.4:1080:u:p").records.remove(0);
        let (sink, _) = collecting_sink();

        provisioner(host.clone()).provision(&record, &sink);

        assert_eq!(
            host.events()[0],
            "launch /opt/tun/tun2socks.exe -device Proxy_1 -proxy socks5://u:p@1.2.3.4:1080 -loglevel error"
        );
    }

    #[test]
    fn gives_up_after_three_attempts() {
        let host = Arc::new(FakeHost::default().readback("Proxy_1", &[Some("169.254.1.1")]));
        let record = parse_proxies("1.2.3.4:1080:u:p").records.remove(0);
        let (sink, lines) = collecting_sink();

        let state = provisioner(host.clone()).provision(&record, &sink);

        assert_eq!(
            state,
            ProvisionState::Failed(FailureReason::AddressNotApplied {
                attempts: 3,
                last_seen: Some("169.254.1.1".into()),
            })
        );
        assert_eq!(host.count("address "), 3);
        assert_eq!(host.count("query "), 3);
        let lines = lines.lock().unwrap();
        assert_eq!(lines.iter().filter(|l| l.contains("retrying")).count(), 2);
        assert!(lines.last().unwrap().starts_with("[1] ERROR: Failed to assign IP 10.0.1.1"));
    }

    #[test]
    fn late_address_succeeds_on_second_attempt() {
        let host = Arc::new(FakeHost::default().readback("Proxy_1", &[None, Some("10.0.1.1")]));
        let record = parse_proxies("1.2.3.4:1080:u:p").records.remove(0);
        let (sink, _) = collecting_sink();

        let state = provisioner(host.clone()).provision(&record, &sink);

        assert_eq!(state, ProvisionState::Ready);
        assert_eq!(host.count("address "), 2);
    }

    #[test]
    fn missing_interface_skips_address_assignment() {
        let host = Arc::new(FakeHost {
            missing: vec!["Proxy_1".into()],
            ..FakeHost::default()
        });
        let record = parse_proxies("1.2.3.4:1080:u:p").records.remove(0);
        let (sink, lines) = collecting_sink();

        let state = provisioner(host.clone()).provision(&record, &sink);

        assert_eq!(state, ProvisionState::Failed(FailureReason::InterfaceTimeout));
        assert_eq!(host.count("address "), 0);
        assert_eq!(
            lines.lock().unwrap().last().unwrap(),
            "[1] ERROR: Interface Proxy_1 failed to appear."
        );
    }

    #[test]
    fn launch_failure_does_not_abort_batch() {
        let host = Arc::new(FakeHost {
            launch_error: true,
            ..FakeHost::default()
        });
        let records = parse_proxies("a:1:u:p\nb:2:u:p").records;
        let (sink, lines) = collecting_sink();

        let report = provisioner(host.clone()).run_batch(&records, &sink);

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.failed_count(), 2);
        assert!(matches!(
            report.outcomes[1].state,
            ProvisionState::Failed(FailureReason::Launch(_))
        ));
        assert_eq!(host.count("exists "), 0);
        assert_eq!(lines.lock().unwrap().last().unwrap(), BATCH_FINISHED);
    }

    #[test]
    fn unconfigured_binary_fails_launch_without_spawning() {
        let host = Arc::new(FakeHost::default());
        let record = parse_proxies("1.2.3.4:1080:u:p").records.remove(0);
        let (sink, _) = collecting_sink();

        let state = Provisioner::new(host.clone(), "", instant_policy()).provision(&record, &sink);

        assert!(matches!(state, ProvisionState::Failed(FailureReason::Launch(_))));
        assert_eq!(host.count("launch "), 0);
    }

    #[test]
    fn image_name_comes_from_binary_path() {
        let host = Arc::new(FakeHost::default());
        assert_eq!(provisioner(host.clone()).image_name(), "tun2socks.exe");
        assert_eq!(
            Provisioner::new(host, "", instant_policy()).image_name(),
            DEFAULT_TUNNEL_IMAGE
        );
    }

    #[test]
    fn windows_image_gets_exe_extension() {
        assert_eq!(with_executable_extension("tun2socks"), "tun2socks.exe");
        assert_eq!(with_executable_extension("tun2socks.exe"), "tun2socks.exe");
        assert_eq!(with_executable_extension("tun2socks.EXE"), "tun2socks.EXE");
    }

    #[cfg(target_os = "windows")]
    #[test]
    fn bare_binary_name_is_killed_as_exe() {
        let host = Arc::new(FakeHost::default());
        let provisioner = Provisioner::new(host.clone(), r"C:\tools\tun2socks", instant_policy());

        provisioner.stop_all();

        assert_eq!(host.events(), vec!["kill tun2socks.exe"]);
    }

    struct GatedHost {
        inner: FakeHost,
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl HostNetwork for GatedHost {
        fn launch_tunnel(&self, binary: &str, arguments: &[String]) -> io::Result<()> {
            self.inner.launch_tunnel(binary, arguments)
        }

        fn kill_tunnels(&self, image_name: &str) -> bool {
            self.inner.kill_tunnels(image_name)
        }

        fn interface_exists(&self, name: &str) -> bool {
            let _ = self.gate.lock().unwrap().recv();
            self.inner.interface_exists(name)
        }

        fn set_static_address(&self, name: &str, address: &str, mask: &str, gateway: &str) -> bool {
            self.inner.set_static_address(name, address, mask, gateway)
        }

        fn set_metric(&self, name: &str, metric: u32) -> bool {
            self.inner.set_metric(name, metric)
        }

        fn query_ipv4(&self, name: &str) -> Option<String> {
            self.inner.query_ipv4(name)
        }

        fn interface_names(&self) -> Vec<String> {
            Vec::new()
        }
    }

    #[test]
    fn second_start_is_rejected_while_batch_runs() {
        let (release, gate) = mpsc::channel();
        let host = Arc::new(GatedHost {
            inner: FakeHost::default().readback("Proxy_1", &[Some("10.0.1.1")]),
            gate: Mutex::new(gate),
        });
        let provisioner = Provisioner::new(host.clone(), "tun2socks.exe", instant_policy());
        let records = parse_proxies("1.2.3.4:1080:u:p").records;
        let (sink, _) = collecting_sink();

        let handle = provisioner.start(records.clone(), sink.clone()).unwrap();
        assert!(provisioner.is_running());
        assert!(matches!(
            provisioner.start(records.clone(), sink.clone()),
            Err(Error::BatchInProgress)
        ));

        // Stopping mid-batch kills tunnels but the loop carries on.
        assert!(provisioner.stop_all());

        release.send(()).unwrap();
        let report = handle.join().unwrap();
        assert_eq!(report.ready_count(), 1);
        assert!(!provisioner.is_running());
        assert_eq!(host.inner.events()[0], "kill tun2socks.exe");
        assert_eq!(host.inner.count("kill "), 2);

        release.send(()).unwrap();
        let report = provisioner.start(records, sink).unwrap().join().unwrap();
        assert_eq!(report.ready_count(), 1);
    }
}
