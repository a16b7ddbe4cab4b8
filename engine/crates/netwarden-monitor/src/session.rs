//! Live monitoring session
//!
//! A session is one coordinator task tied to a capture. It is the only
//! writer of the rolling packet buffer and the finding history; readers get
//! copies through a [`SessionView`].
//!
//! On every tick the coordinator takes the newest `batch_size` packets and
//! hands them to the analyzer on a separate task, so analysis never stalls
//! packet intake. Finished runs are joined and merged: locations onto
//! buffered packets, new findings into the history. A run that panics is
//! logged and skipped. When a run takes longer than the tick period the
//! period doubles (capped) and relaxes back once runs are fast again. Only
//! one analysis runs at a time.
//!
//! The session ends when capture reaches `Stopped`, when the bus closes, or
//! on [`MonitorSession::stop`].

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use netwarden_analysis::SecurityAnalyzer;
use netwarden_common::config::AnalysisSettings;
use netwarden_core::{AnalysisResult, PacketInfo, PortResult, RiskLevel, SecurityFinding};
use netwarden_network::{CaptureState, Subscription};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::state::{DedupPolicy, FindingLog, PacketBuffer};

/// Port results the periodic analysis includes, usually the last scan
pub type SharedPorts = Arc<RwLock<Vec<PortResult>>>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub interval: Duration,
    pub max_interval: Duration,
    pub batch_size: usize,
    pub buffer_capacity: usize,
    pub dedup: DedupPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&AnalysisSettings::default())
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &AnalysisSettings) -> Self {
        let dedup = settings.dedup.parse().unwrap_or_else(|e| {
            warn!("{}; using structured dedup", e);
            DedupPolicy::Structured
        });
        let interval = Duration::from_millis(settings.interval_ms.max(1));

        Self {
            interval,
            max_interval: Duration::from_millis(settings.max_interval_ms).max(interval),
            batch_size: settings.batch_size.max(1),
            buffer_capacity: settings.buffer_capacity.max(settings.batch_size),
            dedup,
        }
    }
}

#[derive(Debug)]
struct SessionState {
    buffer: PacketBuffer,
    findings: FindingLog,
    analyses: u64,
    dropped: u64,
}

/// Read-only handle on a session's state; stays valid after the session ends
#[derive(Debug, Clone)]
pub struct SessionView {
    state: Arc<RwLock<SessionState>>,
}

impl SessionView {
    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Accumulated findings, in discovery order
    pub fn findings(&self) -> Vec<SecurityFinding> {
        self.read().findings.all().to_vec()
    }

    /// Buffered packets, oldest first
    pub fn recent_packets(&self) -> Vec<PacketInfo> {
        self.read().buffer.snapshot()
    }

    pub fn analyses_run(&self) -> u64 {
        self.read().analyses
    }

    /// Packets the session missed by lagging behind capture
    pub fn dropped_packets(&self) -> u64 {
        self.read().dropped
    }
}

/// A running monitoring session
pub struct MonitorSession {
    view: SessionView,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorSession {
    /// Start the coordinator. `packets` should be subscribed before capture
    /// starts so no early packets are missed.
    pub fn spawn(
        config: SessionConfig,
        analyzer: Arc<SecurityAnalyzer>,
        ports: SharedPorts,
        packets: Subscription,
        capture_state: watch::Receiver<CaptureState>,
    ) -> Self {
        let state = Arc::new(RwLock::new(SessionState {
            buffer: PacketBuffer::new(config.buffer_capacity),
            findings: FindingLog::new(config.dedup),
            analyses: 0,
            dropped: 0,
        }));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let coordinator = Coordinator {
            config,
            analyzer,
            ports,
            state: Arc::clone(&state),
            packets,
            capture_state,
            shutdown: shutdown_rx,
        };

        Self {
            view: SessionView { state },
            shutdown,
            task: tokio::spawn(coordinator.run()),
        }
    }

    pub fn view(&self) -> SessionView {
        self.view.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the coordinator and wait for it to exit
    pub async fn stop(self) -> SessionView {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Monitor session task failed: {}", e);
        }
        self.view
    }
}

struct BatchOutcome {
    result: AnalysisResult,
    elapsed: Duration,
}

struct Coordinator {
    config: SessionConfig,
    analyzer: Arc<SecurityAnalyzer>,
    ports: SharedPorts,
    state: Arc<RwLock<SessionState>>,
    packets: Subscription,
    capture_state: watch::Receiver<CaptureState>,
    shutdown: watch::Receiver<bool>,
}

impl Coordinator {
    async fn run(mut self) {
        let mut period = self.config.interval;
        let mut ticker = make_ticker(period);
        let mut in_flight: Option<JoinHandle<BatchOutcome>> = None;

        info!(
            "Monitor session started (every {:?}, batch {})",
            period, self.config.batch_size
        );

        loop {
            if matches!(*self.capture_state.borrow(), CaptureState::Stopped { .. }) {
                break;
            }

            tokio::select! {
                _ = self.shutdown.changed() => break,
                changed = self.capture_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                packet = self.packets.next() => match packet {
                    Some(packet) => {
                        let dropped = self.packets.dropped();
                        let mut state = self.write();
                        state.buffer.push(packet);
                        state.dropped = dropped;
                    }
                    None => break,
                },
                Some(joined) = join_analysis(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    let outcome = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!("Analysis run failed: {}", e);
                            continue;
                        }
                    };
                    self.merge(outcome.result);

                    let next = next_period(period, outcome.elapsed, &self.config);
                    if next != period {
                        debug!("Analysis period {:?} -> {:?}", period, next);
                        period = next;
                        ticker = make_ticker(period);
                    }
                }
                _ = ticker.tick() => {
                    if in_flight.is_some() {
                        continue;
                    }
                    let batch = self.read().buffer.recent(self.config.batch_size);
                    if batch.is_empty() {
                        continue;
                    }

                    let analyzer = Arc::clone(&self.analyzer);
                    let ports = self.ports.read().map(|p| p.clone()).unwrap_or_default();
                    in_flight = Some(tokio::spawn(async move {
                        let started = Instant::now();
                        let result = analyzer.analyze(&ports, &batch).await;
                        BatchOutcome {
                            result,
                            elapsed: started.elapsed(),
                        }
                    }));
                }
            }
        }

        if let Some(task) = in_flight {
            task.abort();
        }
        let state = self.read();
        info!(
            "Monitor session ended: {} analyses, {} findings",
            state.analyses,
            state.findings.len()
        );
    }

    fn merge(&self, result: AnalysisResult) {
        let added = {
            let mut state = self.write();
            state.buffer.merge_enriched(&result.enriched_packets);
            state.analyses += 1;
            state.findings.merge(result.findings)
        };

        for finding in &added {
            if finding.risk >= RiskLevel::High {
                warn!("[{}] {}", finding.risk, finding.summary);
            } else {
                info!("[{}] {}", finding.risk, finding.summary);
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

async fn join_analysis(
    task: &mut Option<JoinHandle<BatchOutcome>>,
) -> Option<Result<BatchOutcome, JoinError>> {
    match task {
        Some(handle) => Some(handle.await),
        None => None,
    }
}

fn make_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Double the period after a slow run, halve it back towards the base after
/// a fast one.
fn next_period(current: Duration, elapsed: Duration, config: &SessionConfig) -> Duration {
    if elapsed > current {
        (current * 2).min(config.max_interval)
    } else if current > config.interval && elapsed * 2 < current {
        (current / 2).max(config.interval)
    } else {
        current
    }
}
