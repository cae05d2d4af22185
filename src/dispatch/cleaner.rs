//! Periodic table sweeper
//!
//! Wakes on a fixed interval and removes idle sessions and conntrack rows.
//! Shutdown is cooperative: a signal on the shutdown channel stops the
//! loop, and the caller waits a bounded time for the task to finish.

use super::conntrack::ConntrackTable;
use super::session::SessionTable;
use crate::telemetry::MetricsRegistry;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Handle to the running cleaner task.
pub(crate) struct Cleaner {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl Cleaner {
    /// Launches the sweeper.
    pub(crate) fn spawn(
        sessions: Arc<SessionTable>,
        conntracks: Arc<ConntrackTable>,
        metrics: Arc<MetricsRegistry>,
        interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // consume the immediate first tick so sweeps start one full
            // interval after startup
            ticker.tick().await;
            let mut counter = 0u64;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("cleaner task shutting down after {} passes", counter);
                        return;
                    }
                    _ = ticker.tick() => {
                        counter += 1;
                        trace!("cleaner pass {}", counter);

                        let stale_sessions = sessions.clean(idle_timeout);
                        let stale_conntracks = conntracks.clean(idle_timeout);
                        if stale_sessions > 0 || stale_conntracks > 0 {
                            debug!(
                                "cleaner removed {} sessions, {} conntrack rows",
                                stale_sessions, stale_conntracks
                            );
                        }

                        metrics.sessions_removed.add(stale_sessions as u64);
                        metrics.cleaner_passes.inc();
                        metrics.session_table_size.set(sessions.len() as u64);
                        metrics.conntrack_table_size.set(conntracks.len() as u64);
                    }
                }
            }
        });

        Self { shutdown, task }
    }

    /// Signals shutdown and waits up to `wait` for the task to acknowledge
    /// by finishing.
    pub(crate) async fn shutdown(self, wait: Duration) -> Result<()> {
        let _ = self.shutdown.send(()).await;
        match tokio::time::timeout(wait, self.task).await {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::ShutdownTimeout(
                "cleaner task did not acknowledge".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_acknowledged() {
        let cleaner = Cleaner::spawn(
            Arc::new(SessionTable::new()),
            Arc::new(ConntrackTable::new()),
            Arc::new(MetricsRegistry::new()),
            Duration::from_millis(10),
            Duration::from_secs(600),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        cleaner
            .shutdown(Duration::from_secs(10))
            .await
            .expect("cleaner should acknowledge shutdown");
    }

    #[tokio::test]
    async fn test_sweeps_idle_sessions() {
        use crate::dispatch::session::Session;
        use crate::dispatch::tuple::Tuple;
        use std::net::{IpAddr, Ipv4Addr};

        let sessions = Arc::new(SessionTable::new());
        let metrics = Arc::new(MetricsRegistry::new());

        let tuple = Tuple {
            protocol: 6,
            client_address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            client_port: 1,
            server_address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            server_port: 2,
        };
        let session = Arc::new(Session::new(1, 100, tuple, 0));
        sessions.insert(session.client_side_tuple().forward(), session);

        let cleaner = Cleaner::spawn(
            sessions.clone(),
            Arc::new(ConntrackTable::new()),
            metrics.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sessions.is_empty());
        assert!(metrics.cleaner_passes.get() > 0);

        cleaner.shutdown(Duration::from_secs(10)).await.unwrap();
    }
}
