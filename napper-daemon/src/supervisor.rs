//! The control loop.
//!
//! The supervisor owns the authoritative host map and is its only writer.
//! Each tick discovers the current universe of hosts, advances every host's
//! state machine against observed traffic and liveness, and persists the
//! result. External commands (wake, sleep, add, remove, status) enter
//! between tick steps under the same mutex.
//!
//! Locking policy: the map mutex is held only for in-memory reads and
//! transitions. Probes, container commands, and file writes all happen with
//! the lock released.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use napper_protocol::StatusSnapshot;

use crate::clock::SharedClock;
use crate::config::NapperConfig;
use crate::detector::RequestDetector;
use crate::errors::Result;
use crate::health::HealthProbe;
use crate::hostname::is_managed_hostname;
use crate::persistence::StatePersistence;
use crate::runner::Runner;
use crate::state::{AppState, AppStatus};

/// A Stopping app still answering its health check after this long gets
/// force-killed.
const STOP_DEADLINE_SECS: i64 = 30;

/// One in this many per-host passes replays the health probe against
/// tracked state.
const STATE_SYNC_SAMPLE: u32 = 5;

/// Corrupt-snapshot backups kept on disk
const BACKUP_KEEP: usize = 5;

fn sampled() -> bool {
    rand::rng().random_range(0..STATE_SYNC_SAMPLE) == 0
}

pub struct Supervisor {
    config: Arc<NapperConfig>,
    clock: SharedClock,
    detector: RequestDetector,
    health: Arc<dyn HealthProbe>,
    runner: Runner,
    persistence: StatePersistence,
    apps: Mutex<HashMap<String, AppState>>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    sync_sampler: fn() -> bool,
}

impl Supervisor {
    pub fn new(
        config: Arc<NapperConfig>,
        clock: SharedClock,
        detector: RequestDetector,
        health: Arc<dyn HealthProbe>,
        runner: Runner,
        persistence: StatePersistence,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            clock,
            detector,
            health,
            runner,
            persistence,
            apps: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            shutdown_tx,
            sync_sampler: sampled,
        }
    }

    /// Seed the map from the persisted snapshot and bound the backlog of
    /// corrupt-snapshot backups.
    pub fn restore(&self) {
        let restored = self.persistence.load();
        if !restored.is_empty() {
            *self.apps.lock() = restored;
        }
        if let Err(e) = self.persistence.cleanup_backups(BACKUP_KEEP) {
            debug!("Backup cleanup failed: {}", e);
        }
    }

    /// Run ticks until shutdown, then persist once more and return.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(
            "Supervisor started (poll interval {}s, idle timeout {}s)",
            self.config.poll_interval, self.config.idle_timeout
        );

        loop {
            self.tick().await;
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.poll_interval)) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.persist();
        self.running.store(false, Ordering::SeqCst);
        info!("Supervisor stopped");
    }

    /// Ask the loop to finish its current per-host step and exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// One pass: discover, manage every host, persist. Never panics out;
    /// every failure is contained to the host (or step) it came from.
    pub async fn tick(&self) {
        self.discover().await;

        let hosts: Vec<String> = self.apps.lock().keys().cloned().collect();
        for host in hosts {
            if self.is_shutting_down() {
                break;
            }
            if let Err(e) = self.manage_app(&host).await {
                error!("Error managing {}: {}; resetting its state", host, e);
                if let Some(app) = self.apps.lock().get_mut(&host) {
                    app.reset(self.clock.now());
                }
            }
        }

        self.persist();
    }

    /// Union of traffic-derived and runtime-derived hostnames; fresh hosts
    /// get an entry synced against an immediate health probe.
    async fn discover(&self) {
        let mut hosts = self.detector.detected_hostnames().await;
        hosts.extend(self.runner.discover_kamal_apps().await.into_keys());

        let own = self.config.own_hostname.as_deref();
        for host in hosts {
            if !is_managed_hostname(&host, own) {
                continue;
            }
            if self.apps.lock().contains_key(&host) {
                continue;
            }

            let healthy = self.health.healthy(&host).await;
            let now = self.clock.now();
            let mut apps = self.apps.lock();
            let app = apps
                .entry(host.clone())
                .or_insert_with(|| AppState::new(host.clone(), now));
            if healthy && app.status() == AppStatus::Stopped {
                app.force_transition_to(AppStatus::Running, "initial_state_sync", now);
            }
            info!("Discovered app {} ({})", host, app.status());
        }
    }

    async fn manage_app(&self, host: &str) -> Result<()> {
        if (self.sync_sampler)() && self.sync_state(host).await {
            // A correction replaced the tracked state; let it settle until
            // the next tick before advancing.
            return Ok(());
        }
        self.advance(host).await
    }

    /// Reconcile tracked state with observed liveness. Returns whether a
    /// correction was applied.
    async fn sync_state(&self, host: &str) -> bool {
        let healthy = self.health.healthy(host).await;
        let now = self.clock.now();

        let mut apps = self.apps.lock();
        let Some(app) = apps.get_mut(host) else {
            return false;
        };
        if healthy && !app.is_active() {
            warn!(
                "{} is answering health checks but tracked as {}; correcting to running",
                host,
                app.status()
            );
            app.force_transition_to(AppStatus::Running, "state_sync_correction", now);
            true
        } else if !healthy && app.is_active() {
            warn!(
                "{} is not answering health checks but tracked as {}; correcting to stopped",
                host,
                app.status()
            );
            app.force_transition_to(AppStatus::Stopped, "state_sync_correction", now);
            true
        } else {
            false
        }
    }

    async fn advance(&self, host: &str) -> Result<()> {
        let Some(status) = self.apps.lock().get(host).map(|app| app.status()) else {
            return Ok(());
        };
        match status {
            AppStatus::Stopped => self.advance_stopped(host).await,
            AppStatus::Starting => self.advance_starting(host).await,
            AppStatus::Running => self.advance_running(host),
            AppStatus::Idle => self.advance_idle(host).await,
            AppStatus::Stopping => self.advance_stopping(host).await,
        }
    }

    /// Stopped: traffic within the idle window wakes the app.
    async fn advance_stopped(&self, host: &str) -> Result<()> {
        if self.recent_traffic(host) {
            info!("Traffic detected for stopped app {}; waking", host);
            self.begin_start(host).await?;
        }
        Ok(())
    }

    /// Starting: passes health -> Running; exceeds the startup deadline ->
    /// forced back to Stopped. Maintenance mode ends either way.
    async fn advance_starting(&self, host: &str) -> Result<()> {
        let healthy = self.health.healthy(host).await;
        let now = self.clock.now();

        if healthy {
            {
                let mut apps = self.apps.lock();
                if let Some(app) = apps.get_mut(host) {
                    app.transition_to(AppStatus::Running, now)?;
                }
            }
            info!("{} is up", host);
            self.runner.set_maintenance(host, false).await;
            return Ok(());
        }

        let deadline_passed = {
            let apps = self.apps.lock();
            apps.get(host)
                .and_then(|app| app.startup_started_at())
                .is_some_and(|started| {
                    (now - started).num_seconds() >= self.config.startup_timeout as i64
                })
        };
        if deadline_passed {
            warn!(
                "{} did not become healthy within {}s; giving up",
                host, self.config.startup_timeout
            );
            if let Some(app) = self.apps.lock().get_mut(host) {
                app.force_transition_to(AppStatus::Stopped, "startup_timeout", now);
            }
            self.runner.set_maintenance(host, false).await;
        }
        Ok(())
    }

    /// Running: the idle window emptying demotes to Idle.
    fn advance_running(&self, host: &str) -> Result<()> {
        if !self.recent_traffic(host) {
            let now = self.clock.now();
            if let Some(app) = self.apps.lock().get_mut(host) {
                app.transition_to(AppStatus::Idle, now)?;
                debug!("{} is idle", host);
            }
        }
        Ok(())
    }

    /// Idle: fresh traffic promotes back to Running; a full idle timeout in
    /// this state triggers the stop path.
    async fn advance_idle(&self, host: &str) -> Result<()> {
        if self.recent_traffic(host) {
            let now = self.clock.now();
            if let Some(app) = self.apps.lock().get_mut(host) {
                app.transition_to(AppStatus::Running, now)?;
                debug!("{} is busy again", host);
            }
            return Ok(());
        }

        let now = self.clock.now();
        let idled_out = {
            let apps = self.apps.lock();
            apps.get(host).is_some_and(|app| {
                (now - app.state_changed_at()).num_seconds() >= self.config.idle_timeout as i64
            })
        };
        if idled_out {
            info!(
                "{} idle for {}s; stopping",
                host, self.config.idle_timeout
            );
            self.stop_app(host).await?;
        }
        Ok(())
    }

    /// Stopping: the health check going dark confirms the stop; a container
    /// still healthy past the deadline gets killed.
    async fn advance_stopping(&self, host: &str) -> Result<()> {
        let healthy = self.health.healthy(host).await;
        let now = self.clock.now();

        if !healthy {
            if let Some(app) = self.apps.lock().get_mut(host) {
                app.transition_to(AppStatus::Stopped, now)?;
                info!("{} stopped", host);
            }
            return Ok(());
        }

        let overdue = {
            let apps = self.apps.lock();
            apps.get(host).is_some_and(|app| {
                (now - app.state_changed_at()).num_seconds() > STOP_DEADLINE_SECS
            })
        };
        if overdue {
            warn!("{} still healthy {}s after stop; force-killing", host, STOP_DEADLINE_SECS);
            self.runner.force_stop_app_container(host).await;
            if let Some(app) = self.apps.lock().get_mut(host) {
                app.force_transition_to(AppStatus::Stopped, "stop_timeout", now);
            }
        }
        Ok(())
    }

    fn recent_traffic(&self, host: &str) -> bool {
        self.detector
            .recent_requests(host, Duration::from_secs(self.config.idle_timeout))
    }

    /// The Stopped -> Starting side-effect path: maintenance on, container
    /// started, state advanced. Returns whether the app is now Starting.
    /// A start the runtime cannot satisfy leaves the app Stopped with
    /// maintenance off.
    async fn begin_start(&self, host: &str) -> Result<bool> {
        self.runner.set_maintenance(host, true).await;

        match self.runner.start_app_container(host).await {
            Ok(true) => {
                let now = self.clock.now();
                if let Some(app) = self.apps.lock().get_mut(host) {
                    app.transition_to(AppStatus::Starting, now)?;
                }
                Ok(true)
            }
            Ok(false) => {
                warn!("No startable container for {}; leaving it stopped", host);
                self.runner.set_maintenance(host, false).await;
                Ok(false)
            }
            Err(e) => {
                warn!("Failed to start {}: {}", host, e);
                self.runner.set_maintenance(host, false).await;
                if let Some(app) = self.apps.lock().get_mut(host) {
                    app.force_transition_to(AppStatus::Stopped, "start_failed", self.clock.now());
                }
                Ok(false)
            }
        }
    }

    /// The stop side-effect path: container stopped, state advanced to
    /// Stopping. A stop the runtime refuses escalates to a force-kill.
    async fn stop_app(&self, host: &str) -> Result<()> {
        match self.runner.stop_app_container(host).await {
            Ok(_) => {
                let now = self.clock.now();
                if let Some(app) = self.apps.lock().get_mut(host) {
                    app.transition_to(AppStatus::Stopping, now)?;
                }
                Ok(())
            }
            Err(e) => {
                warn!("Failed to stop {}: {}; force-killing", host, e);
                self.runner.force_stop_app_container(host).await;
                if let Some(app) = self.apps.lock().get_mut(host) {
                    app.force_transition_to(AppStatus::Stopped, "stop_failed", self.clock.now());
                }
                Ok(())
            }
        }
    }

    /// Wake a Stopped app on demand. True when the app is now Starting;
    /// idempotently false for anything not Stopped.
    pub async fn wake_app(&self, host: &str) -> bool {
        let status = self.apps.lock().get(host).map(|app| app.status());
        match status {
            Some(AppStatus::Stopped) => match self.begin_start(host).await {
                Ok(started) => started,
                Err(e) => {
                    error!("Wake of {} failed: {}", host, e);
                    false
                }
            },
            Some(status) => {
                debug!("Wake requested for {} but it is {}", host, status);
                false
            }
            None => false,
        }
    }

    /// Force an active app down the stop path. True when the path ran.
    pub async fn sleep_app(&self, host: &str) -> bool {
        let active = self
            .apps
            .lock()
            .get(host)
            .is_some_and(|app| app.is_active());
        if !active {
            return false;
        }
        match self.stop_app(host).await {
            Ok(()) => true,
            Err(e) => {
                error!("Sleep of {} failed: {}", host, e);
                false
            }
        }
    }

    /// Stop every active app; returns how many were acted on.
    pub async fn stop_all_apps(&self) -> usize {
        let hosts: Vec<String> = {
            let apps = self.apps.lock();
            apps.iter()
                .filter(|(_, app)| app.is_active())
                .map(|(host, _)| host.clone())
                .collect()
        };

        let mut stopped = 0;
        for host in &hosts {
            if self.sleep_app(host).await {
                stopped += 1;
            }
        }
        info!("Stopped {} active apps", stopped);
        stopped
    }

    /// Track a host without waiting for discovery. False when the hostname
    /// is unmanageable or already tracked.
    pub fn add_app(&self, host: &str) -> bool {
        if !is_managed_hostname(host, self.config.own_hostname.as_deref()) {
            return false;
        }
        let now = self.clock.now();
        let added = {
            let mut apps = self.apps.lock();
            if apps.contains_key(host) {
                false
            } else {
                apps.insert(host.to_string(), AppState::new(host, now));
                true
            }
        };
        if added {
            info!("Added app {}", host);
            self.persist();
        }
        added
    }

    /// Stop (if active) and forget a host, propagating to the snapshot.
    pub async fn remove_app(&self, host: &str) -> bool {
        if !self.apps.lock().contains_key(host) {
            return false;
        }
        self.sleep_app(host).await;
        self.apps.lock().remove(host);
        info!("Removed app {}", host);
        self.persist();
        true
    }

    /// The supervisor's reading of the current time.
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Deep-copied snapshot, safe to serialize with no lock held.
    pub fn status(&self) -> StatusSnapshot {
        let now = self.clock.now();
        let apps = self.apps.lock();
        StatusSnapshot {
            running: self.running.load(Ordering::SeqCst),
            app_count: apps.len(),
            poll_interval: self.config.poll_interval,
            apps: apps
                .iter()
                .map(|(host, app)| (host.clone(), app.summary(now)))
                .collect(),
        }
    }

    fn persist(&self) {
        let snapshot = self.apps.lock().clone();
        if let Err(e) = self.persistence.save(&snapshot) {
            warn!("Failed to persist state: {}", e);
        }
    }
}

#[cfg(test)]
impl Supervisor {
    pub(crate) fn set_sync_sampler(&mut self, sampler: fn() -> bool) {
        self.sync_sampler = sampler;
    }

    pub(crate) fn seed_app(&self, host: &str, status: AppStatus) {
        let now = self.clock.now();
        let mut app = AppState::new(host, now);
        if status != AppStatus::Stopped {
            app.force_transition_to(status, "seed", now);
        }
        self.apps.lock().insert(host.to_string(), app);
    }

    pub(crate) fn app_status(&self, host: &str) -> Option<AppStatus> {
        self.apps.lock().get(host).map(|app| app.status())
    }

    pub(crate) fn app_transitions(&self, host: &str) -> Vec<(AppStatus, AppStatus, Option<String>)> {
        self.apps
            .lock()
            .get(host)
            .map(|app| {
                app.history()
                    .map(|r| (r.from, r.to, r.reason.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}
