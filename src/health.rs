//! Outbound proxy health monitoring
//!
//! A timer-driven loop samples proxy status and connectivity, scores the
//! result, keeps a bounded history and fans each sample out to subscribers.
//! Fan-out goes through a bounded queue drained by a fixed set of workers;
//! the tick loop never waits on that queue, so a notification that does not
//! fit is dropped.

use crate::config::HealthSettings;
use crate::error::{RelayError, RelayResult};
use crate::proxy::{ProxyLifecycleManager, ProxyMode, ProxyStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const PENALTY_DISCONNECTED: u8 = 50;
pub const PENALTY_HIGH_LATENCY: u8 = 10;
pub const PENALTY_ELEVATED_LATENCY: u8 = 5;
pub const PENALTY_LOW_DOWNLOAD: u8 = 15;
pub const PENALTY_LOW_UPLOAD: u8 = 15;

const HIGH_LATENCY_MS: u64 = 500;
const ELEVATED_LATENCY_MS: u64 = 200;
const MIN_THROUGHPUT_MBPS: f64 = 1.0;

/// Minimum deep-check score for the proxy to count as healthy
pub const HEALTHY_THRESHOLD: u32 = 70;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSample {
    pub timestamp: DateTime<Utc>,
    pub connected: bool,
    pub latency_ms: Option<u64>,
    /// `None` until two samples exist to difference
    pub upload_mbps: Option<f64>,
    pub download_mbps: Option<f64>,
    pub health_score: u8,
    pub issues: Vec<String>,
}

/// Inputs to [`compute_score`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Observation {
    pub connected: bool,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub upload_mbps: Option<f64>,
    pub download_mbps: Option<f64>,
}

/// Score an observation in [0, 100] and list what cost points.
///
/// Unknown latency or throughput is not penalised.
pub fn compute_score(obs: &Observation) -> (u8, Vec<String>) {
    let mut score: u8 = 100;
    let mut issues = Vec::new();

    if !obs.connected {
        score = score.saturating_sub(PENALTY_DISCONNECTED);
        issues.push("proxy client is not connected".to_string());
    } else if !obs.reachable {
        score = score.saturating_sub(PENALTY_DISCONNECTED);
        issues.push("no probe target reachable".to_string());
    }

    match obs.latency_ms {
        Some(ms) if ms > HIGH_LATENCY_MS => {
            score = score.saturating_sub(PENALTY_HIGH_LATENCY);
            issues.push(format!("high latency: {}ms", ms));
        }
        Some(ms) if ms > ELEVATED_LATENCY_MS => {
            score = score.saturating_sub(PENALTY_ELEVATED_LATENCY);
            issues.push(format!("elevated latency: {}ms", ms));
        }
        _ => {}
    }

    if let Some(down) = obs.download_mbps.filter(|d| *d < MIN_THROUGHPUT_MBPS) {
        score = score.saturating_sub(PENALTY_LOW_DOWNLOAD);
        issues.push(format!("low download throughput: {:.2} Mbps", down));
    }
    if let Some(up) = obs.upload_mbps.filter(|u| *u < MIN_THROUGHPUT_MBPS) {
        score = score.saturating_sub(PENALTY_LOW_UPLOAD);
        issues.push(format!("low upload throughput: {:.2} Mbps", up));
    }

    (score, issues)
}

/// Successful reachability probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub target: String,
    pub latency_ms: u64,
}

/// Source of proxy status for sampling
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn sample_status(&self) -> RelayResult<ProxyStatus>;
}

#[async_trait]
impl StatusSource for ProxyLifecycleManager {
    async fn sample_status(&self) -> RelayResult<ProxyStatus> {
        self.status().await
    }
}

/// Reachability and DNS checks
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Request the configured targets in order, through the local proxy on
    /// `proxy_port` if given; the first to answer wins.
    async fn probe(&self, proxy_port: Option<u16>) -> RelayResult<ProbeOutcome>;

    async fn resolve(&self, host: &str) -> RelayResult<Vec<IpAddr>>;
}

/// HTTP probe over the ordered target list
pub struct HttpProbe {
    targets: Vec<String>,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(targets: Vec<String>, timeout: Duration) -> Self {
        Self { targets, timeout }
    }

    fn client(&self, proxy_port: Option<u16>) -> RelayResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(port) = proxy_port {
            builder = builder.proxy(reqwest::Proxy::all(format!("socks5h://127.0.0.1:{}", port))?);
        }
        Ok(builder.build()?)
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self, proxy_port: Option<u16>) -> RelayResult<ProbeOutcome> {
        let client = self.client(proxy_port)?;
        let mut last_error = String::from("no probe targets configured");

        for target in &self.targets {
            let started = Instant::now();
            match tokio::time::timeout(self.timeout, client.get(target).send()).await {
                // Any HTTP answer proves reachability
                Ok(Ok(_)) => {
                    return Ok(ProbeOutcome {
                        target: target.clone(),
                        latency_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Ok(Err(e)) => last_error = format!("{}: {}", target, e),
                Err(_) => last_error = format!("{}: timed out after {:?}", target, self.timeout),
            }
            debug!("Probe failed: {}", last_error);
        }

        Err(RelayError::Network(last_error))
    }

    async fn resolve(&self, host: &str) -> RelayResult<Vec<IpAddr>> {
        let lookup = tokio::net::lookup_host((host, 443));
        let addrs = tokio::time::timeout(self.timeout, lookup)
            .await
            .map_err(|_| RelayError::Network(format!("DNS lookup of {} timed out", host)))?
            .map_err(|e| RelayError::Network(format!("DNS lookup of {} failed: {}", host, e)))?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// One check of [`HealthMonitor::run_health_check`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub duration_ms: u64,
    pub points: u32,
    pub max_points: u32,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub checks: Vec<CheckResult>,
    pub score: u32,
    pub healthy: bool,
}

pub type HealthCallback = Arc<dyn Fn(&HealthSample) + Send + Sync>;

struct Notification {
    sample: Arc<HealthSample>,
    callback: HealthCallback,
}

#[derive(Default)]
struct Counters {
    at: Option<Instant>,
    sent: u64,
    received: u64,
}

struct MonitorState {
    history: VecDeque<HealthSample>,
    counters: Counters,
}

struct Shared {
    settings: HealthSettings,
    source: Arc<dyn StatusSource>,
    probe: Arc<dyn ConnectivityProbe>,
    state: RwLock<MonitorState>,
    subscribers: RwLock<Vec<HealthCallback>>,
    dropped: AtomicU64,
}

struct Tasks {
    shutdown: oneshot::Sender<()>,
    ticker: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

pub struct HealthMonitor {
    shared: Arc<Shared>,
    running: Arc<RwLock<bool>>,
    tasks: Mutex<Option<Tasks>>,
}

impl HealthMonitor {
    pub fn new(
        settings: HealthSettings,
        source: Arc<dyn StatusSource>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        let capacity = settings.history_capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                settings,
                source,
                probe,
                state: RwLock::new(MonitorState {
                    history: VecDeque::with_capacity(capacity.min(1024)),
                    counters: Counters::default(),
                }),
                subscribers: RwLock::new(Vec::new()),
                dropped: AtomicU64::new(0),
            }),
            running: Arc::new(RwLock::new(false)),
            tasks: Mutex::new(None),
        }
    }

    /// Start the tick loop and the notification workers
    pub async fn start(&self) -> RelayResult<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(RelayError::InvalidState("Health monitor already running".to_string()));
        }

        let settings = &self.shared.settings;
        let (tx, rx) = mpsc::channel::<Notification>(settings.queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..settings.workers.max(1))
            .map(|id| tokio::spawn(worker(id, rx.clone())))
            .collect();

        let (shutdown, shutdown_rx) = oneshot::channel();
        let interval = Duration::from_secs(settings.interval_secs.max(1));
        let ticker = tokio::spawn(tick_loop(self.shared.clone(), interval, tx, shutdown_rx));

        *self.tasks.lock().await = Some(Tasks {
            shutdown,
            ticker,
            workers,
        });
        *running = true;

        info!(
            "Health monitor started (interval {:?}, {} workers)",
            interval, settings.workers
        );
        Ok(())
    }

    /// Stop the tick loop; queued notifications are still delivered
    pub async fn stop(&self) -> RelayResult<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Ok(());
        }

        if let Some(tasks) = self.tasks.lock().await.take() {
            let _ = tasks.shutdown.send(());
            if let Err(e) = tasks.ticker.await {
                warn!("Health tick loop ended abnormally: {}", e);
            }
            // The ticker owned the sender, so workers exit once drained
            for handle in tasks.workers {
                let _ = handle.await;
            }
        }

        *running = false;
        info!("Health monitor stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn subscribe(&self, callback: HealthCallback) {
        self.shared.subscribers.write().await.push(callback);
    }

    pub async fn latest(&self) -> Option<HealthSample> {
        self.shared.state.read().await.history.back().cloned()
    }

    /// Up to `limit` most recent samples, oldest first
    pub async fn history(&self, limit: usize) -> Vec<HealthSample> {
        let state = self.shared.state.read().await;
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Notifications dropped because the queue was full
    pub fn dropped_notifications(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Take and record one sample without notifying subscribers
    pub async fn sample_now(&self) -> HealthSample {
        self.shared.sample().await
    }

    /// Deeper on-demand check: install, connection, proxy mode,
    /// reachability and DNS. A failing check only costs its points.
    pub async fn run_health_check(&self) -> HealthReport {
        let mut checks = Vec::with_capacity(5);

        let started = Instant::now();
        let status = self.shared.source.sample_status().await;
        let status_ms = started.elapsed().as_millis() as u64;

        let (installed, connected, mode_ok, port, status_detail) = match &status {
            Ok(s) => (
                s.installed,
                s.connected,
                s.mode == Some(ProxyMode::ProxyOnly) && s.proxy_port.is_some(),
                s.proxy_port,
                format!("mode={:?} port={:?}", s.mode, s.proxy_port),
            ),
            Err(e) => (false, false, false, None, e.to_string()),
        };

        checks.push(check("install", installed, status_ms, 20, if installed {
            "proxy client present".to_string()
        } else {
            status_detail.clone()
        }));
        checks.push(check("connection", connected, status_ms, 30, if connected {
            "connected".to_string()
        } else {
            "not connected".to_string()
        }));
        checks.push(check("proxy_mode", mode_ok, status_ms, 15, status_detail));

        let started = Instant::now();
        let reach = self.shared.probe.probe(port).await;
        let elapsed = started.elapsed().as_millis() as u64;
        checks.push(match reach {
            Ok(p) => check("reachability", true, elapsed, 20, format!("{} in {}ms", p.target, p.latency_ms)),
            Err(e) => check("reachability", false, elapsed, 20, e.to_string()),
        });

        let host = &self.shared.settings.dns_check_host;
        let started = Instant::now();
        let dns = self.shared.probe.resolve(host).await;
        let elapsed = started.elapsed().as_millis() as u64;
        checks.push(match dns {
            Ok(addrs) if !addrs.is_empty() => {
                check("dns", true, elapsed, 15, format!("{} -> {}", host, addrs[0]))
            }
            Ok(_) => check("dns", false, elapsed, 15, format!("{} has no addresses", host)),
            Err(e) => check("dns", false, elapsed, 15, e.to_string()),
        });

        let score = checks.iter().map(|c| c.points).sum();
        HealthReport {
            checks,
            score,
            healthy: score >= HEALTHY_THRESHOLD,
        }
    }
}

fn check(name: &str, passed: bool, duration_ms: u64, max_points: u32, detail: String) -> CheckResult {
    CheckResult {
        name: name.to_string(),
        passed,
        duration_ms,
        points: if passed { max_points } else { 0 },
        max_points,
        detail,
    }
}

impl Shared {
    async fn sample(&self) -> HealthSample {
        let status = match self.source.sample_status().await {
            Ok(status) => status,
            Err(e) => {
                debug!("Status query failed during health sample: {}", e);
                ProxyStatus::default()
            }
        };

        let port = match status.mode {
            Some(ProxyMode::ProxyOnly) => status.proxy_port,
            _ => None,
        };
        let probe = if status.connected {
            self.probe.probe(port).await.ok()
        } else {
            None
        };

        let now = Instant::now();
        let mut state = self.state.write().await;

        let (upload_mbps, download_mbps) = match state.counters.at {
            Some(at) if status.connected => {
                let secs = now.duration_since(at).as_secs_f64();
                (
                    rate_mbps(state.counters.sent, status.bytes_sent, secs),
                    rate_mbps(state.counters.received, status.bytes_received, secs),
                )
            }
            _ => (None, None),
        };
        state.counters = Counters {
            at: Some(now),
            sent: status.bytes_sent,
            received: status.bytes_received,
        };

        let observation = Observation {
            connected: status.connected,
            reachable: probe.is_some(),
            latency_ms: probe.as_ref().map(|p| p.latency_ms),
            upload_mbps,
            download_mbps,
        };
        let (health_score, issues) = compute_score(&observation);

        let sample = HealthSample {
            timestamp: Utc::now(),
            connected: status.connected,
            latency_ms: observation.latency_ms,
            upload_mbps,
            download_mbps,
            health_score,
            issues,
        };

        if state.history.len() >= self.settings.history_capacity.max(1) {
            state.history.pop_front();
        }
        state.history.push_back(sample.clone());

        debug!("Health sample: score={} issues={:?}", sample.health_score, sample.issues);
        sample
    }

    /// Enqueue one notification per subscriber without waiting
    async fn dispatch(&self, sample: HealthSample, tx: &mpsc::Sender<Notification>) {
        let sample = Arc::new(sample);
        for callback in self.subscribers.read().await.iter() {
            let job = Notification {
                sample: sample.clone(),
                callback: callback.clone(),
            };
            match tx.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("Health notification queue full; dropping notification");
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }
}

fn rate_mbps(before: u64, after: u64, secs: f64) -> Option<f64> {
    if secs <= 0.0 || after < before {
        return None;
    }
    Some((after - before) as f64 * 8.0 / secs / 1_000_000.0)
}

async fn tick_loop(
    shared: Arc<Shared>,
    interval: Duration,
    tx: mpsc::Sender<Notification>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let sample = shared.sample().await;
                shared.dispatch(sample, &tx).await;
            }
        }
    }
    debug!("Health tick loop exiting");
}

async fn worker(id: usize, rx: Arc<Mutex<mpsc::Receiver<Notification>>>) {
    loop {
        let job = rx.lock().await.recv().await;
        match job {
            Some(job) => (job.callback)(job.sample.as_ref()),
            None => break,
        }
    }
    debug!("Health worker {} exiting", id);
}
