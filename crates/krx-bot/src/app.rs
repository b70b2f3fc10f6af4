//! Main application orchestration.
//!
//! Coordinates all components:
//! - Streaming quote client (one socket, spawned task)
//! - One position monitor per stored session with shares
//! - Optional startup entries from the watchlist
//! - Outcome aggregation from monitor reports
//! - Shutdown (Ctrl-C or token): stop every monitor, then the client

use crate::config::AppConfig;
use crate::error::AppResult;
use krx_core::{Session, Ticker};
use krx_executor::{
    BrokerExitExecutor, BrokerHandle, DynBroker, EntryExecutor, EntryOutcome, FillReconciler,
    SkipReason,
};
use krx_persistence::{DynSessionStore, TradeJournal};
use krx_position::{
    release_monitor_resources, spawn_monitor, DynClock, LockRegistry, MonitorDeps, MonitorHandle,
    MonitorOutcome, MonitorReport,
};
use krx_telemetry::{Alert, AlertKind, Metrics, Notifier};
use krx_ws::{DynApprovalKeyProvider, StreamingClient, WsResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often finished monitor tasks are checked for abnormal exits.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Grace period for the streaming client to close its socket.
const CLIENT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const REPORT_CHANNEL_CAPACITY: usize = 256;

/// External collaborators the application is wired with.
pub struct Services {
    pub broker: DynBroker,
    pub store: DynSessionStore,
    pub approval_keys: DynApprovalKeyProvider,
    pub notifier: Arc<dyn Notifier>,
    pub clock: DynClock,
}

/// What the monitors reported over one run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub started: usize,
    /// Monitor tasks that ended without reporting.
    pub crashed: usize,
    pub reports: Vec<MonitorReport>,
}

impl RunSummary {
    /// Reports with the same outcome kind as `outcome`.
    pub fn count(&self, outcome: MonitorOutcome) -> usize {
        self.reports
            .iter()
            .filter(|r| r.outcome.as_str() == outcome.as_str())
            .count()
    }
}

/// Main application.
pub struct Application {
    config: AppConfig,
    client: Arc<StreamingClient>,
    broker: BrokerHandle,
    store: DynSessionStore,
    entry: EntryExecutor,
    deps: MonitorDeps,
    monitors: HashMap<Ticker, MonitorHandle>,
    reports: mpsc::Receiver<MonitorReport>,
    shutdown: CancellationToken,
    summary: RunSummary,
}

impl Application {
    /// Wire the application. Nothing connects until `run`.
    pub fn new(config: AppConfig, services: Services) -> AppResult<Self> {
        let client = Arc::new(StreamingClient::new(
            config.websocket.clone().into(),
            services.approval_keys,
        ));
        let broker = BrokerHandle::new(services.broker, config.broker.clone());
        let reconciler = FillReconciler::new(broker.clone(), config.reconcile.clone());

        let journal = match &config.persistence.journal_dir {
            Some(dir) => Some(Arc::new(TradeJournal::new(dir.clone())?)),
            None => None,
        };

        let mut exit = BrokerExitExecutor::new(reconciler.clone(), services.store.clone());
        let mut entry =
            EntryExecutor::new(reconciler, services.store.clone(), config.entry.clone());
        if let Some(journal) = journal {
            exit = exit.with_journal(journal.clone());
            entry = entry.with_journal(journal);
        }

        let (reports_tx, reports) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
        let deps = MonitorDeps {
            subscriptions: client.clone(),
            broker: broker.clone(),
            executor: Arc::new(exit),
            store: services.store.clone(),
            locks: Arc::new(LockRegistry::new(Duration::from_millis(
                config.locks.timeout_ms,
            ))),
            notifier: services.notifier,
            clock: services.clock,
            reports: reports_tx,
        };

        Ok(Self {
            config,
            client,
            broker,
            store: services.store,
            entry,
            deps,
            monitors: HashMap::new(),
            reports,
            shutdown: CancellationToken::new(),
            summary: RunSummary::default(),
        })
    }

    /// Token that ends `run` when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn client(&self) -> Arc<StreamingClient> {
        self.client.clone()
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    /// Run until every position is closed or shutdown is requested.
    ///
    /// # Errors
    ///
    /// Store failures while loading sessions, or the streaming client giving
    /// up after its reconnect attempts. Monitors are stopped either way.
    pub async fn run(mut self) -> AppResult<RunSummary> {
        let client = self.client.clone();
        let mut ws_task: JoinHandle<WsResult<()>> = tokio::spawn(async move { client.run().await });
        let mut ws_result = None;

        let started = self.start_stored_sessions().await;
        let result = match started {
            Ok(count) => {
                info!(monitors = count, "Stored sessions loaded");
                self.open_watchlist().await;
                self.event_loop(&mut ws_task, &mut ws_result).await;
                Ok(())
            }
            Err(e) => Err(e),
        };

        self.stop_all().await;
        self.client.shutdown();
        if ws_result.is_none() {
            match tokio::time::timeout(CLIENT_STOP_TIMEOUT, &mut ws_task).await {
                Ok(joined) => ws_result = Some(joined),
                Err(_) => {
                    warn!("Streaming client did not stop in time");
                    ws_task.abort();
                }
            }
        }
        self.broker.close();

        info!(
            started = self.summary.started,
            exited = self.summary.count(MonitorOutcome::Exited),
            already_flat = self.summary.count(MonitorOutcome::AlreadyFlat),
            residual = self.summary.count(MonitorOutcome::ResidualHolding { remaining: 0 }),
            cancelled = self.summary.count(MonitorOutcome::Cancelled),
            crashed = self.summary.crashed,
            "Application stopped"
        );

        result?;
        if let Some(Ok(Err(e))) = ws_result {
            return Err(e.into());
        }
        Ok(self.summary)
    }

    async fn event_loop(
        &mut self,
        ws_task: &mut JoinHandle<WsResult<()>>,
        ws_result: &mut Option<Result<WsResult<()>, tokio::task::JoinError>>,
    ) {
        let mut reap = tokio::time::interval(REAP_INTERVAL);
        let shutdown = self.shutdown.clone();
        loop {
            if self.monitors.is_empty() {
                info!("No positions left to watch");
                return;
            }
            tokio::select! {
                Some(report) = self.reports.recv() => self.on_report(report),
                _ = reap.tick() => self.reap_finished().await,
                joined = &mut *ws_task, if ws_result.is_none() => {
                    match &joined {
                        Ok(Ok(())) => info!("Streaming client stopped"),
                        Ok(Err(e)) => error!(?e, "Streaming client gave up"),
                        Err(e) => error!(?e, "Streaming client task failed"),
                    }
                    *ws_result = Some(joined);
                    return;
                }
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    return;
                }
            }
        }
    }

    /// Start monitors for every stored session with shares.
    async fn start_stored_sessions(&mut self) -> AppResult<usize> {
        let sessions = self.store.list_all().await?;
        let mut started = 0;
        for session in sessions {
            if session.quantity == 0 {
                info!(
                    ticker = %session.ticker,
                    session_id = %session.id,
                    "Session holds no shares, not monitored"
                );
                continue;
            }
            let ticker = session.ticker.clone();
            match self.start_monitor(session).await {
                Ok(()) => started += 1,
                Err(e) => error!(%ticker, ?e, "Failed to start monitor"),
            }
        }
        Ok(started)
    }

    /// Try to open the configured watchlist while slots are free.
    async fn open_watchlist(&mut self) {
        if self.config.watchlist.is_empty() {
            return;
        }
        let now = self.deps.clock.now();
        if !self.config.monitor.exit_rule.window.contains(now) {
            info!(%now, "Outside trading hours, watchlist entries skipped");
            return;
        }

        for item in self.config.watchlist.clone() {
            match self
                .entry
                .enter(&item.ticker, &item.name, item.limit_price, now.date())
                .await
            {
                Ok(EntryOutcome::Opened { session, attempts }) => {
                    info!(
                        ticker = %session.ticker,
                        quantity = session.quantity,
                        legs = attempts.len(),
                        "Entry opened"
                    );
                    if session.quantity > 0 {
                        let ticker = session.ticker.clone();
                        if let Err(e) = self.start_monitor(session).await {
                            error!(%ticker, ?e, "Failed to start monitor for new entry");
                        }
                    }
                }
                Ok(EntryOutcome::Skipped { ticker, reason }) => {
                    info!(%ticker, ?reason, "Entry skipped");
                    if reason == SkipReason::NoFreeSlot {
                        return;
                    }
                }
                Err(e) => {
                    let alert = if e.is_critical() {
                        Alert::critical(AlertKind::EntryFailed, item.ticker.as_str(), e.to_string())
                    } else {
                        Alert::warning(AlertKind::EntryFailed, item.ticker.as_str(), e.to_string())
                    };
                    self.deps.notifier.notify(alert);
                }
            }
        }
    }

    /// Start a monitor for `session`, stopping any previous one for the same
    /// ticker first.
    pub async fn start_monitor(&mut self, session: Session) -> AppResult<()> {
        if let Some(previous) = self.monitors.remove(&session.ticker) {
            info!(ticker = %session.ticker, "Replacing running monitor");
            self.stop_monitor(previous).await;
        }
        let handle = spawn_monitor(
            session,
            self.config.monitor.clone(),
            self.deps.clone(),
            self.shutdown.child_token(),
        )
        .await?;
        self.summary.started += 1;
        self.monitors.insert(handle.ticker.clone(), handle);
        Ok(())
    }

    /// Stop one monitor and wait for it. An in-flight exit finishes first.
    async fn stop_monitor(&mut self, handle: MonitorHandle) {
        handle.stop();
        let ticker = handle.ticker.clone();
        let generation = handle.generation;
        if let Err(e) = handle.wait().await {
            self.teardown_crashed(&ticker, generation, &e.to_string());
        }
    }

    async fn stop_all(&mut self) {
        let handles: Vec<MonitorHandle> = self.monitors.drain().map(|(_, h)| h).collect();
        if !handles.is_empty() {
            info!(count = handles.len(), "Stopping monitors");
        }
        for handle in &handles {
            handle.stop();
        }
        for handle in handles {
            let ticker = handle.ticker.clone();
            let generation = handle.generation;
            if let Err(e) = handle.wait().await {
                self.teardown_crashed(&ticker, generation, &e.to_string());
            }
        }
        while let Ok(report) = self.reports.try_recv() {
            self.on_report(report);
        }
    }

    fn on_report(&mut self, report: MonitorReport) {
        let current = self
            .monitors
            .get(&report.ticker)
            .is_some_and(|h| h.generation == report.generation);
        if current {
            self.monitors.remove(&report.ticker);
        }
        match report.outcome {
            MonitorOutcome::ResidualHolding { remaining } => {
                error!(ticker = %report.ticker, remaining, "Monitor ended with shares left")
            }
            outcome => info!(ticker = %report.ticker, %outcome, "Monitor ended"),
        }
        self.summary.reports.push(report);
    }

    /// Collect finished monitor tasks; tear down after the ones that died.
    async fn reap_finished(&mut self) {
        let finished: Vec<Ticker> = self
            .monitors
            .iter()
            .filter(|(_, h)| h.is_finished())
            .map(|(t, _)| t.clone())
            .collect();
        for ticker in finished {
            let Some(handle) = self.monitors.remove(&ticker) else {
                continue;
            };
            let generation = handle.generation;
            match handle.wait().await {
                Ok(()) => debug!(%ticker, "Monitor task finished"),
                Err(e) => self.teardown_crashed(&ticker, generation, &e.to_string()),
            }
        }
    }

    /// Teardown on behalf of a monitor task that ended abnormally.
    fn teardown_crashed(&mut self, ticker: &Ticker, generation: u64, cause: &str) {
        release_monitor_resources(&self.deps.subscriptions, &self.deps.locks, ticker, generation);
        Metrics::monitor_stopped("crashed");
        self.summary.crashed += 1;
        self.deps.notifier.notify(Alert::critical(
            AlertKind::MonitorCrashed,
            ticker.as_str(),
            format!("monitor task ended abnormally: {cause}"),
        ));
    }
}
