//! Port forwarding daemon
//!
//! The orchestrator walks through
//!
//! ```text
//! AcquiringToken -> LocatingTunnel -> AcquiringLease -> Binding -> Steady -> ShuttingDown
//! ```
//!
//! Failures before `Steady` are fatal, except tunnel detection which is
//! retried until shutdown. In `Steady` the lease is re-bound every refresh
//! interval, the port is written to the output file and the automation hook
//! runs whenever the port changes. Nothing in `Steady` terminates the daemon
//! except cancellation.

pub mod output;

use crate::automation::AutomationRunner;
use crate::pia::auth::{AuthError, TokenProvider};
use crate::pia::lease::{
    BindError, ConnectError, LeaseApi, LeaseConnector, PortLease, SignatureError,
};
use crate::vpn::{TunnelDetector, VpnDetectionError, detect_with_retry};
use chrono::{DateTime, Utc};
use output::write_port_file;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long the first lease may take once the tunnel has been found
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Failed to get token: {0}")]
    Auth(#[from] AuthError),

    #[error("Failed to detect OpenVPN connection: {0}")]
    Detection(#[from] VpnDetectionError),

    #[error("Failed to create port forwarding client: {0}")]
    Connect(#[from] ConnectError),

    #[error("Failed to get port forwarding info: {0}")]
    Signature(#[from] SignatureError),

    #[error("Failed to bind port: {0}")]
    Bind(#[from] BindError),

    #[error("Timed out waiting for port forwarding initialization after {0:?}")]
    StartupTimeout(Duration),

    #[error("Orchestrator task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Lifecycle of the orchestrator, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrchestratorState {
    AcquiringToken,
    LocatingTunnel,
    AcquiringLease,
    Binding,
    Steady,
    ShuttingDown,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AcquiringToken => "acquiring token",
            Self::LocatingTunnel => "locating tunnel",
            Self::AcquiringLease => "acquiring lease",
            Self::Binding => "binding",
            Self::Steady => "steady",
            Self::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

/// Fixed inputs of the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub openvpn_config: PathBuf,
    pub output_file: PathBuf,
    pub refresh_interval: Duration,
    pub vpn_retry_interval: Duration,
}

/// Remembers the last port handed to the automation hook
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PortTracker {
    last: Option<u16>,
}

impl PortTracker {
    pub fn with_baseline(port: u16) -> Self {
        Self { last: Some(port) }
    }

    pub fn last(&self) -> Option<u16> {
        self.last
    }

    pub fn is_change(&self, port: u16) -> bool {
        self.last != Some(port)
    }

    pub fn observe(&mut self, port: u16) {
        self.last = Some(port);
    }
}

struct StateReporter {
    tx: watch::Sender<OrchestratorState>,
}

impl StateReporter {
    fn enter(&self, next: OrchestratorState) {
        let prev = self.tx.send_replace(next);
        if prev != next {
            info!("State: {} -> {}", prev, next);
        }
    }
}

/// Run `fut` unless `cancel` fires first
async fn or_cancel<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

pub struct Orchestrator<T, D, C> {
    tokens: T,
    detector: Arc<D>,
    connector: C,
    automation: Option<AutomationRunner>,
    settings: OrchestratorSettings,
}

impl<T, D, C> Orchestrator<T, D, C>
where
    T: TokenProvider,
    D: TunnelDetector + 'static,
    C: LeaseConnector,
{
    pub fn new(tokens: T, detector: D, connector: C, settings: OrchestratorSettings) -> Self {
        Self {
            tokens,
            detector: Arc::new(detector),
            connector,
            automation: None,
            settings,
        }
    }

    pub fn with_automation(mut self, runner: AutomationRunner) -> Self {
        self.automation = Some(runner);
        self
    }

    /// Drive the state machine until `cancel` fires or startup fails.
    ///
    /// Cancellation at any point is a clean shutdown and returns `Ok`.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        state_tx: watch::Sender<OrchestratorState>,
    ) -> Result<(), DaemonError> {
        let state = StateReporter { tx: state_tx };

        state.enter(OrchestratorState::AcquiringToken);
        info!("Obtaining PIA authentication token...");
        // Fail fast on bad credentials; the lease below re-checks validity
        match or_cancel(&cancel, self.tokens.get_token()).await {
            Some(token) => {
                token?;
            }
            None => {
                state.enter(OrchestratorState::ShuttingDown);
                return Ok(());
            }
        }
        info!("Successfully obtained PIA token");

        state.enter(OrchestratorState::LocatingTunnel);
        info!("Detecting OpenVPN connection...");
        let info = match detect_with_retry(
            &self.detector,
            &self.settings.openvpn_config,
            self.settings.vpn_retry_interval,
            &cancel,
        )
        .await
        {
            Ok(info) => info,
            Err(VpnDetectionError::Cancelled(last)) => {
                info!("Shutdown requested while waiting for VPN (last error: {})", last);
                state.enter(OrchestratorState::ShuttingDown);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let api = self.connector.connect(&info)?;

        state.enter(OrchestratorState::AcquiringLease);
        let Some(lease) = or_cancel(&cancel, self.acquire_lease(&api)).await else {
            state.enter(OrchestratorState::ShuttingDown);
            return Ok(());
        };
        let mut lease = lease?;

        state.enter(OrchestratorState::Binding);
        let Some(bound) = or_cancel(&cancel, api.bind_port(&lease.payload, &lease.signature)).await
        else {
            state.enter(OrchestratorState::ShuttingDown);
            return Ok(());
        };
        bound?;
        info!("Successfully bound port {}", lease.port);

        state.enter(OrchestratorState::Steady);
        let mut tracker = PortTracker::default();
        self.publish(lease.port, &mut tracker, &cancel).await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.refresh_interval) => {}
            }
            self.steady_tick(&api, &mut lease, &mut tracker, Utc::now(), &cancel)
                .await;
        }

        state.enter(OrchestratorState::ShuttingDown);
        Ok(())
    }

    /// Fresh lease, using the cached token when it is still valid
    async fn acquire_lease(&mut self, api: &C::Api) -> Result<PortLease, SignatureError> {
        let token = self.tokens.get_token().await?;
        api.request_signature(&token).await
    }

    /// One refresh cycle: renew the signature if needed, bind, publish.
    ///
    /// Every failure here is logged and absorbed.
    async fn steady_tick(
        &mut self,
        api: &C::Api,
        lease: &mut PortLease,
        tracker: &mut PortTracker,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) {
        if lease.is_near_expiry(now) {
            info!(
                "Port lease expires at {}, requesting a new signature",
                lease.expires_at
            );
            match self.acquire_lease(api).await {
                Ok(renewed) => *lease = renewed,
                Err(e) => warn!(
                    "Failed to refresh port forwarding signature: {} (keeping port {})",
                    e, lease.port
                ),
            }
        }

        if let Err(e) = api.bind_port(&lease.payload, &lease.signature).await {
            warn!("Failed to bind port: {}", e);
            return;
        }
        info!("Successfully bound port {}", lease.port);

        self.publish(lease.port, tracker, cancel).await;
    }

    /// Write the port and, if it changed, run the automation hook
    async fn publish(&self, port: u16, tracker: &mut PortTracker, cancel: &CancellationToken) {
        let output_file = &self.settings.output_file;
        if let Err(e) = write_port_file(output_file, port) {
            error!("Failed to write port to file: {}", e);
            return;
        }
        info!("Wrote port {} to file: {}", port, output_file.display());

        if !tracker.is_change(port) {
            debug!("Port {} unchanged", port);
            return;
        }
        if let Some(old) = tracker.last() {
            info!("Forwarded port changed: {} -> {}", old, port);
        }
        tracker.observe(port);

        if let Some(runner) = &self.automation {
            if let Err(e) = runner.run(port, output_file, cancel).await {
                warn!("Port change script failed: {}", e);
            }
        }
    }
}

/// Run the orchestrator until `cancel` fires.
///
/// Waits without limit while the tunnel is being located, then gives the
/// first lease `STARTUP_TIMEOUT` to be bound. On timeout the orchestrator is
/// cancelled and the daemon fails.
pub async fn run_daemon<T, D, C>(
    orchestrator: Orchestrator<T, D, C>,
    cancel: CancellationToken,
) -> Result<(), DaemonError>
where
    T: TokenProvider + 'static,
    D: TunnelDetector + 'static,
    C: LeaseConnector + 'static,
{
    let (state_tx, mut state_rx) = watch::channel(OrchestratorState::AcquiringToken);
    let task = tokio::spawn(orchestrator.run(cancel.clone(), state_tx));

    let located = state_rx
        .wait_for(|s| *s > OrchestratorState::LocatingTunnel)
        .await
        .is_ok();
    if !located {
        // Orchestrator ended before the tunnel was found
        return task.await?;
    }

    let ready = tokio::time::timeout(
        STARTUP_TIMEOUT,
        state_rx.wait_for(|s| *s >= OrchestratorState::Steady),
    )
    .await
    .map(|r| r.map(|s| *s).ok());

    match ready {
        Ok(Some(OrchestratorState::Steady)) => {
            info!("Port forwarding initialized successfully");
        }
        Ok(_) => return task.await?,
        Err(_) => {
            error!(
                "Timed out waiting for port forwarding initialization after {:?}",
                STARTUP_TIMEOUT
            );
            cancel.cancel();
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Orchestrator stopped with error during shutdown: {}", e),
                Err(e) => warn!("Orchestrator task failed during shutdown: {}", e),
            }
            return Err(DaemonError::StartupTimeout(STARTUP_TIMEOUT));
        }
    }

    task.await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::tests::RecordingLauncher;
    use crate::automation::{AutomationRunner, AutomationSpec};
    use crate::pia::auth::AuthToken;
    use crate::vpn::ConnectionInfo;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct FakeTokens {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl TokenProvider for FakeTokens {
        async fn get_token(&mut self) -> Result<AuthToken, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AuthError::ApiError("bad credentials".to_string()));
            }
            Ok(AuthToken {
                value: "token".to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(24),
            })
        }
    }

    /// Hands out tokens that expire after `validity`, re-exchanging on expiry
    struct ShortLivedTokens {
        validity: chrono::Duration,
        issued: Arc<AtomicUsize>,
        cached: Option<AuthToken>,
    }

    #[async_trait]
    impl TokenProvider for ShortLivedTokens {
        async fn get_token(&mut self) -> Result<AuthToken, AuthError> {
            if let Some(token) = &self.cached {
                if token.is_valid_at(Utc::now()) {
                    return Ok(token.clone());
                }
            }
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            let token = AuthToken {
                value: format!("token-{}", n),
                expires_at: Utc::now() + self.validity,
            };
            self.cached = Some(token.clone());
            Ok(token)
        }
    }

    /// Reports no tunnel for the first `failures` attempts
    struct FakeDetector {
        failures: usize,
        calls: AtomicUsize,
    }

    impl FakeDetector {
        fn failing(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TunnelDetector for FakeDetector {
        fn detect(&self, _config_path: &Path) -> Result<ConnectionInfo, VpnDetectionError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(VpnDetectionError::NoTunnel);
            }
            Ok(ConnectionInfo {
                gateway_address: "10.13.112.1".to_string(),
                hostname: "london401.privacy.network".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct ApiState {
        ports: Mutex<VecDeque<u16>>,
        expires_at: Mutex<Option<DateTime<Utc>>>,
        signature_calls: AtomicUsize,
        bind_calls: AtomicUsize,
        fail_signature: AtomicBool,
        fail_bind: AtomicBool,
        hang_signature: AtomicBool,
        tokens_seen: Mutex<Vec<(String, bool)>>,
    }

    #[derive(Clone, Default)]
    struct FakeApi {
        state: Arc<ApiState>,
    }

    impl FakeApi {
        fn with_ports(ports: &[u16]) -> Self {
            let api = Self::default();
            api.state.ports.lock().unwrap().extend(ports);
            api
        }

        fn signature_calls(&self) -> usize {
            self.state.signature_calls.load(Ordering::SeqCst)
        }

        fn bind_calls(&self) -> usize {
            self.state.bind_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LeaseApi for FakeApi {
        async fn request_signature(&self, token: &AuthToken) -> Result<PortLease, SignatureError> {
            self.state.signature_calls.fetch_add(1, Ordering::SeqCst);
            self.state
                .tokens_seen
                .lock()
                .unwrap()
                .push((token.value.clone(), token.is_valid_at(Utc::now())));
            if self.state.hang_signature.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.state.fail_signature.load(Ordering::SeqCst) {
                return Err(SignatureError::Rejected("ERROR".to_string()));
            }
            let port = self.state.ports.lock().unwrap().pop_front().unwrap_or(12345);
            let expires_at = self
                .state
                .expires_at
                .lock()
                .unwrap()
                .unwrap_or_else(|| Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
            Ok(PortLease {
                port,
                expires_at,
                payload: format!("payload-{}", port),
                signature: "sig1".to_string(),
            })
        }

        async fn bind_port(&self, _payload: &str, _signature: &str) -> Result<(), BindError> {
            self.state.bind_calls.fetch_add(1, Ordering::SeqCst);
            if self.state.fail_bind.load(Ordering::SeqCst) {
                return Err(BindError::Rejected("signature expired".to_string()));
            }
            Ok(())
        }
    }

    struct FakeConnector {
        api: FakeApi,
    }

    impl LeaseConnector for FakeConnector {
        type Api = FakeApi;

        fn connect(&self, _info: &ConnectionInfo) -> Result<FakeApi, ConnectError> {
            Ok(self.api.clone())
        }
    }

    struct Harness {
        dir: TempDir,
        api: FakeApi,
        launcher: Arc<RecordingLauncher>,
        token_calls: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new(api: FakeApi) -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                api,
                launcher: Arc::new(RecordingLauncher::default()),
                token_calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn output_file(&self) -> PathBuf {
            self.dir.path().join("port")
        }

        fn orchestrator(
            &self,
            tunnel_found: bool,
            token_fails: bool,
        ) -> Orchestrator<FakeTokens, FakeDetector, FakeConnector> {
            let tokens = FakeTokens {
                calls: self.token_calls.clone(),
                fail: token_fails,
            };
            let failures = if tunnel_found { 0 } else { usize::MAX };
            self.orchestrator_with(
                tokens,
                FakeDetector::failing(failures),
                Duration::from_secs(60),
            )
        }

        fn orchestrator_with<T: TokenProvider>(
            &self,
            tokens: T,
            detector: FakeDetector,
            vpn_retry_interval: Duration,
        ) -> Orchestrator<T, FakeDetector, FakeConnector> {
            let runner = AutomationRunner::new(
                AutomationSpec {
                    command_path: PathBuf::from("/usr/local/bin/on-port-change"),
                    synchronous: true,
                    timeout: Duration::from_secs(30),
                },
                self.launcher.clone(),
            );
            Orchestrator::new(
                tokens,
                detector,
                FakeConnector {
                    api: self.api.clone(),
                },
                OrchestratorSettings {
                    openvpn_config: self.dir.path().join("pia.ovpn"),
                    output_file: self.output_file(),
                    refresh_interval: Duration::from_secs(15 * 60),
                    vpn_retry_interval,
                },
            )
            .with_automation(runner)
        }

        fn port_in_file(&self) -> Option<String> {
            std::fs::read_to_string(self.output_file()).ok()
        }

        fn hook_ports(&self) -> Vec<String> {
            self.launcher
                .all_invocations()
                .into_iter()
                .map(|i| i.args[0].clone())
                .collect()
        }
    }

    fn lease(port: u16, expires_at: DateTime<Utc>) -> PortLease {
        PortLease {
            port,
            expires_at,
            payload: format!("payload-{}", port),
            signature: "sig1".to_string(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_port_tracker() {
        let mut tracker = PortTracker::default();
        assert!(tracker.is_change(12345));

        tracker.observe(12345);
        assert!(!tracker.is_change(12345));
        assert!(tracker.is_change(54321));
        assert_eq!(tracker.last(), Some(12345));

        assert!(!PortTracker::with_baseline(80).is_change(80));
    }

    #[test]
    fn test_state_order() {
        use OrchestratorState::*;
        assert!(AcquiringToken < LocatingTunnel);
        assert!(LocatingTunnel < AcquiringLease);
        assert!(Binding < Steady);
        assert!(Steady < ShuttingDown);
        assert_eq!(Steady.to_string(), "steady");
    }

    #[tokio::test]
    async fn test_hook_fires_only_on_port_change() {
        let harness = Harness::new(FakeApi::with_ports(&[12345, 12345, 54321]));
        let mut orch = harness.orchestrator(true, false);
        let cancel = CancellationToken::new();
        let api = harness.api.clone();

        // Every renewed lease is already near expiry, so each tick re-signs
        *api.state.expires_at.lock().unwrap() = Some(now());
        let mut current = lease(12345, now());
        let mut tracker = PortTracker::with_baseline(12345);

        for _ in 0..3 {
            orch.steady_tick(&api, &mut current, &mut tracker, now(), &cancel)
                .await;
        }

        assert_eq!(api.signature_calls(), 3);
        let runs = harness.launcher.runs.lock().unwrap().clone();
        assert_eq!(runs.len(), 1);
        assert_eq!(
            runs[0].args,
            vec![
                "54321".to_string(),
                harness.output_file().display().to_string()
            ]
        );
        assert_eq!(harness.port_in_file().as_deref(), Some("54321"));
        assert_eq!(tracker.last(), Some(54321));
    }

    #[tokio::test]
    async fn test_bind_failure_skips_output_and_hook() {
        let harness = Harness::new(FakeApi::with_ports(&[54321]));
        let mut orch = harness.orchestrator(true, false);
        let api = harness.api.clone();
        let cancel = CancellationToken::new();

        let mut current = lease(12345, now() + chrono::Duration::days(60));
        let mut tracker = PortTracker::default();
        orch.steady_tick(&api, &mut current, &mut tracker, now(), &cancel)
            .await;
        assert_eq!(harness.port_in_file().as_deref(), Some("12345"));
        assert_eq!(harness.hook_ports(), vec!["12345"]);

        // Renewal hands out 54321 but binding it fails
        api.state.fail_bind.store(true, Ordering::SeqCst);
        let near_expiry = current.expires_at - chrono::Duration::hours(1);
        orch.steady_tick(&api, &mut current, &mut tracker, near_expiry, &cancel)
            .await;

        assert_eq!(current.port, 54321);
        assert_eq!(api.bind_calls(), 2);
        assert_eq!(harness.port_in_file().as_deref(), Some("12345"));
        assert_eq!(harness.hook_ports(), vec!["12345"]);
        assert_eq!(tracker.last(), Some(12345));

        // Next tick succeeds
        api.state.fail_bind.store(false, Ordering::SeqCst);
        orch.steady_tick(&api, &mut current, &mut tracker, now(), &cancel)
            .await;
        assert_eq!(harness.port_in_file().as_deref(), Some("54321"));
        assert_eq!(harness.hook_ports(), vec!["12345", "54321"]);
    }

    #[tokio::test]
    async fn test_lease_not_renewed_until_near_expiry() {
        let harness = Harness::new(FakeApi::with_ports(&[54321]));
        let mut orch = harness.orchestrator(true, false);
        let api = harness.api.clone();

        let mut current = lease(12345, now() + chrono::Duration::days(60));
        let mut tracker = PortTracker::with_baseline(12345);
        orch.steady_tick(&api, &mut current, &mut tracker, now(), &CancellationToken::new())
            .await;

        assert_eq!(api.signature_calls(), 0);
        assert_eq!(harness.token_calls.load(Ordering::SeqCst), 0);
        assert_eq!(current.port, 12345);

        let later = current.expires_at - chrono::Duration::hours(1);
        orch.steady_tick(&api, &mut current, &mut tracker, later, &CancellationToken::new())
            .await;

        assert_eq!(api.signature_calls(), 1);
        assert_eq!(current.port, 54321);
        assert_eq!(harness.hook_ports(), vec!["54321"]);
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_lease() {
        let harness = Harness::new(FakeApi::default());
        let mut orch = harness.orchestrator(true, false);
        let api = harness.api.clone();
        api.state.fail_signature.store(true, Ordering::SeqCst);

        let mut current = lease(12345, now());
        let mut tracker = PortTracker::with_baseline(12345);
        orch.steady_tick(&api, &mut current, &mut tracker, now(), &CancellationToken::new())
            .await;

        assert_eq!(api.signature_calls(), 1);
        assert_eq!(current.port, 12345);
        assert_eq!(current.payload, "payload-12345");
        // The old lease is still bound and written
        assert_eq!(api.bind_calls(), 1);
        assert_eq!(harness.port_in_file().as_deref(), Some("12345"));
        assert!(harness.hook_ports().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_skips_hook_and_retries() {
        let harness = Harness::new(FakeApi::default());
        let mut orch = harness.orchestrator(true, false);
        let api = harness.api.clone();

        // A directory where the file should be makes the rename fail
        std::fs::create_dir(harness.output_file()).unwrap();
        std::fs::write(harness.output_file().join("keep"), "").unwrap();

        let mut current = lease(12345, now() + chrono::Duration::days(60));
        let mut tracker = PortTracker::default();
        orch.steady_tick(&api, &mut current, &mut tracker, now(), &CancellationToken::new())
            .await;

        assert!(harness.hook_ports().is_empty());
        assert_eq!(tracker.last(), None);

        std::fs::remove_dir_all(harness.output_file()).unwrap();
        orch.steady_tick(&api, &mut current, &mut tracker, now(), &CancellationToken::new())
            .await;
        assert_eq!(harness.hook_ports(), vec!["12345"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daemon_startup_and_shutdown() {
        let harness = Harness::new(FakeApi::with_ports(&[12345]));
        let cancel = CancellationToken::new();

        let daemon = tokio::spawn(run_daemon(harness.orchestrator(true, false), cancel.clone()));

        // Two refresh intervals
        tokio::time::sleep(Duration::from_secs(31 * 60)).await;
        cancel.cancel();
        daemon.await.unwrap().unwrap();

        assert_eq!(harness.port_in_file().as_deref(), Some("12345"));
        // Startup bind plus one per tick; the hook ran once for the initial port
        assert_eq!(harness.api.bind_calls(), 3);
        assert_eq!(harness.api.signature_calls(), 1);
        assert_eq!(harness.hook_ports(), vec!["12345"]);
    }

    #[tokio::test]
    async fn test_first_lease_refreshes_token_expired_during_detection() {
        let harness = Harness::new(FakeApi::with_ports(&[12345]));
        let issued = Arc::new(AtomicUsize::new(0));
        let tokens = ShortLivedTokens {
            validity: chrono::Duration::milliseconds(50),
            issued: issued.clone(),
            cached: None,
        };
        // Two misses at 100ms each outlive the token
        let orch = harness.orchestrator_with(
            tokens,
            FakeDetector::failing(2),
            Duration::from_millis(100),
        );
        let cancel = CancellationToken::new();
        let (state_tx, mut state_rx) = watch::channel(OrchestratorState::AcquiringToken);
        let task = tokio::spawn(orch.run(cancel.clone(), state_tx));

        state_rx
            .wait_for(|s| *s == OrchestratorState::Steady)
            .await
            .unwrap();
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(issued.load(Ordering::SeqCst), 2);
        let seen = harness.api.state.tokens_seen.lock().unwrap().clone();
        assert_eq!(seen, vec![("token-2".to_string(), true)]);
        assert_eq!(harness.port_in_file().as_deref(), Some("12345"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_daemon_token_failure_is_fatal() {
        let harness = Harness::new(FakeApi::default());
        let result = run_daemon(harness.orchestrator(true, true), CancellationToken::new()).await;

        assert!(matches!(result, Err(DaemonError::Auth(_))));
        assert_eq!(harness.api.signature_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daemon_initial_bind_failure_is_fatal() {
        let harness = Harness::new(FakeApi::default());
        harness.api.state.fail_bind.store(true, Ordering::SeqCst);

        let result = run_daemon(harness.orchestrator(true, false), CancellationToken::new()).await;

        assert!(matches!(result, Err(DaemonError::Bind(_))));
        assert_eq!(harness.port_in_file(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daemon_cancelled_while_locating_tunnel() {
        let harness = Harness::new(FakeApi::default());
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            // Far beyond the startup timeout: detection has no deadline
            tokio::time::sleep(Duration::from_secs(600)).await;
            canceller.cancel();
        });

        let result = run_daemon(harness.orchestrator(false, false), cancel).await;

        assert!(result.is_ok());
        assert_eq!(harness.api.signature_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daemon_startup_timeout() {
        let harness = Harness::new(FakeApi::default());
        harness.api.state.hang_signature.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        let result = run_daemon(harness.orchestrator(true, false), cancel.clone()).await;

        assert!(matches!(result, Err(DaemonError::StartupTimeout(_))));
        assert!(cancel.is_cancelled());
    }
}
