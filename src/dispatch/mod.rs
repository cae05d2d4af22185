//! Per-packet plugin dispatch
//!
//! Dispatches three kinds of kernel events to plugin subscribers: nfqueue
//! packets, conntrack events (new, update, destroy), and netlogger records.
//! Sessions tie a kernel flow to the plugins that still care about it; once
//! none do, the kernel is asked to bypass the flow entirely.

mod cleaner;
mod conntrack;
mod message;
mod netlogger;
mod nfqueue;
mod session;
mod subscription;
mod tuple;

pub use conntrack::{calculate_difference, Conntrack, ConntrackFunc, ConntrackTable};
pub use message::{Icmp4View, Ip4View, Ip6View, NfqueueMessage, TcpView, UdpView};
pub use netlogger::NetloggerFunc;
pub use nfqueue::{NfqueueFunc, NfqueueResult, MAX_ALLOWED_TIME};
pub use session::{Session, SessionSummary, SessionTable};
pub use subscription::{
    ConntrackSubscription, NetloggerSubscription, NfqueueSubscription, SubscriptionHolder,
    SubscriptionRegistry, MAX_PRIORITY,
};
pub use tuple::Tuple;

use crate::config::DispatchConfig;
use crate::dict::Dictionary;
use crate::kernel::{KernelDriver, PlaybackCleanup};
use crate::telemetry::MetricsRegistry;
use crate::Result;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

/// Engine tunables, resolved from the `[dispatch]` config section.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub conntrack_interval: Duration,
    pub session_idle_timeout: Duration,
    pub cleaner_interval: Duration,
    pub plugin_timeout: Duration,
    pub shutdown_wait: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            conntrack_interval: Duration::from_secs(60),
            session_idle_timeout: Duration::from_secs(600),
            cleaner_interval: Duration::from_secs(60),
            plugin_timeout: MAX_ALLOWED_TIME,
            shutdown_wait: Duration::from_secs(10),
        }
    }
}

impl From<&DispatchConfig> for DispatchSettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            conntrack_interval: Duration::from_secs(config.conntrack_interval_secs.into()),
            session_idle_timeout: Duration::from_secs(config.session_idle_secs),
            cleaner_interval: Duration::from_secs(config.cleaner_interval_secs),
            plugin_timeout: Duration::from_secs(config.plugin_timeout_secs),
            shutdown_wait: Duration::from_secs(config.shutdown_wait_secs),
        }
    }
}

/// The dispatch engine: session and conntrack tables, the subscription
/// registry, and the cleaner. One per process, passed around explicitly.
pub struct DispatchEngine {
    settings: DispatchSettings,
    sessions: Arc<SessionTable>,
    conntracks: Arc<ConntrackTable>,
    registry: SubscriptionRegistry,
    dict: Arc<Dictionary>,
    metrics: Arc<MetricsRegistry>,
    session_index: AtomicU64,
    cleaner: Mutex<Option<cleaner::Cleaner>>,
    playback_cleanup: Mutex<Option<PlaybackCleanup>>,
}

impl DispatchEngine {
    /// Creates the engine with empty tables.
    pub fn new(
        settings: DispatchSettings,
        dict: Arc<Dictionary>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        // session-id counter: highest 16 bits zero, middle 32 bits epoch
        // seconds, lowest 16 bits zero. Ids stay increasing across process
        // restarts as long as the average stays under 65k sessions/sec.
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let seed = (epoch & 0xFFFF_FFFF) << 16;

        Self {
            settings,
            sessions: Arc::new(SessionTable::new()),
            conntracks: Arc::new(ConntrackTable::new()),
            registry: SubscriptionRegistry::new(),
            dict,
            metrics,
            session_index: AtomicU64::new(seed),
            cleaner: Mutex::new(None),
            playback_cleanup: Mutex::new(None),
        }
    }

    /// Launches the cleaner task. Must be called inside a tokio runtime.
    pub fn startup(&self) {
        info!("starting dispatch engine");
        let cleaner = cleaner::Cleaner::spawn(
            self.sessions.clone(),
            self.conntracks.clone(),
            self.metrics.clone(),
            self.settings.cleaner_interval,
            self.settings.session_idle_timeout,
        );
        *self.cleaner.lock().unwrap() = Some(cleaner);
    }

    /// Signals the cleaner and waits a bounded time for acknowledgement.
    pub async fn shutdown(&self) -> Result<()> {
        let cleaner = self.cleaner.lock().unwrap().take();
        if let Some(cleaner) = cleaner {
            if let Err(e) = cleaner.shutdown(self.settings.shutdown_wait).await {
                error!("failed to properly shutdown cleaner task");
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.session_index.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Adds a subscription for receiving nfqueue messages.
    ///
    /// Panics on a duplicate owner; subscriptions are a static description
    /// of the pipeline and a duplicate is a programming error.
    pub fn insert_nfqueue_subscription(&self, owner: &str, priority: u8, func: NfqueueFunc) {
        self.registry.insert_nfqueue(owner, priority, func);
    }

    /// Adds a subscription for receiving conntrack events.
    pub fn insert_conntrack_subscription(&self, owner: &str, priority: u8, func: ConntrackFunc) {
        self.registry.insert_conntrack(owner, priority, func);
    }

    /// Adds a subscription for receiving netlogger events.
    pub fn insert_netlogger_subscription(&self, owner: &str, priority: u8, func: NetloggerFunc) {
        self.registry.insert_netlogger(owner, priority, func);
    }

    /// Copies of the current session table rows.
    pub fn session_table(&self) -> Vec<SessionSummary> {
        self.sessions.summaries()
    }

    /// Copies of the current conntrack table rows.
    pub fn conntrack_table(&self) -> Vec<Conntrack> {
        self.conntracks.snapshot()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn dictionary(&self) -> &Arc<Dictionary> {
        &self.dict
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Replays a warehouse capture file through the driver and keeps the
    /// returned cleanup lists for [`handle_warehouse_cleanup`].
    ///
    /// [`handle_warehouse_cleanup`]: DispatchEngine::handle_warehouse_cleanup
    pub async fn handle_warehouse_playback<D: KernelDriver>(
        &self,
        driver: &D,
        path: &Path,
    ) -> Result<()> {
        info!("replaying warehouse capture {}", path.display());
        let cleanup = driver.warehouse_playback_file(path).await?;
        *self.playback_cleanup.lock().unwrap() = Some(cleanup);
        Ok(())
    }

    /// Removes the nfqueue and conntrack entries created by the previous
    /// warehouse playback.
    pub fn handle_warehouse_cleanup(&self) {
        let cleanup = self.playback_cleanup.lock().unwrap().take();
        let Some(cleanup) = cleanup else {
            return;
        };

        for ctid in cleanup.nfqueue_ids {
            debug!("removing playback session for {}", ctid);
            self.dict.flush_session(ctid);
            if self.sessions.remove_by_conntrack_id(ctid).is_some() {
                self.metrics.sessions_removed.inc();
            }
        }
        for ctid in cleanup.conntrack_ids {
            debug!("removing playback conntrack for {}", ctid);
            self.conntracks.remove(ctid);
        }

        self.metrics
            .session_table_size
            .set(self.sessions.len() as u64);
        self.metrics
            .conntrack_table_size
            .set(self.conntracks.len() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> DispatchEngine {
        DispatchEngine::new(
            DispatchSettings::default(),
            Arc::new(Dictionary::new()),
            Arc::new(MetricsRegistry::new()),
        )
    }

    #[test]
    fn test_settings_from_config() {
        let config = DispatchConfig {
            conntrack_interval_secs: 30,
            session_idle_secs: 120,
            cleaner_interval_secs: 15,
            plugin_timeout_secs: 5,
            shutdown_wait_secs: 2,
        };
        let settings = DispatchSettings::from(&config);

        assert_eq!(settings.conntrack_interval, Duration::from_secs(30));
        assert_eq!(settings.session_idle_timeout, Duration::from_secs(120));
        assert_eq!(settings.plugin_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_session_ids_strictly_increasing() {
        let engine = engine();
        let first = engine.next_session_id();
        let second = engine.next_session_id();
        let third = engine.next_session_id();

        assert!(first < second && second < third);
        // middle 32 bits carry the epoch seed
        assert!(first >> 16 > 0);
    }

    #[test]
    fn test_session_id_seed_survives_restart_ordering() {
        // a later engine's seed starts at or above an earlier one's
        let first = engine();
        let id_before = first.next_session_id();
        let second = engine();
        let id_after = second.next_session_id();
        assert!(id_after >= id_before);
    }

    #[tokio::test]
    async fn test_startup_shutdown_acknowledged() {
        let engine = engine();
        engine.startup();
        engine.shutdown().await.expect("cleaner should acknowledge");
        // a second shutdown with no cleaner is a no-op
        engine.shutdown().await.unwrap();
    }
}
