//! Health Monitor: one background worker that periodically probes
//! every running replica over HTTP and tracks fall/rise hysteresis so
//! a single flaky response doesn't flap a route in and out of the
//! router table. Uses a single shared `reqwest::Client` for all probes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};

#[derive(Debug, Clone)]
pub struct HealthTarget {
    pub app_name: String,
    pub container_name: String,
    pub addr: SocketAddr,
    pub health_path: String,
}

#[async_trait]
pub trait TargetProvider: Send + Sync {
    async fn health_check_targets(&self) -> Vec<HealthTarget>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Default)]
struct Hysteresis {
    state: Option<HealthState>,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

pub struct HealthMonitorConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub fall: u32,
    pub rise: u32,
    pub max_concurrent_checks: usize,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(5),
            fall: 3,
            rise: 2,
            max_concurrent_checks: 10,
        }
    }
}

pub type HealthChangeCallback = Arc<dyn Fn(String, String, HealthState) + Send + Sync>;

pub struct HealthMonitor {
    client: reqwest::Client,
    provider: Arc<dyn TargetProvider>,
    config: HealthMonitorConfig,
    states: Mutex<HashMap<String, Hysteresis>>,
    on_change: Option<HealthChangeCallback>,
    force_tx: mpsc::UnboundedSender<()>,
    force_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    stop_tx: mpsc::Sender<mpsc::Sender<()>>,
    stop_rx: Mutex<Option<mpsc::Receiver<mpsc::Sender<()>>>>,
}

impl HealthMonitor {
    pub fn new(
        provider: Arc<dyn TargetProvider>,
        config: HealthMonitorConfig,
        on_change: Option<HealthChangeCallback>,
    ) -> Arc<Self> {
        let (force_tx, force_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = mpsc::channel(1);
        Arc::new(Self {
            client: reqwest::Client::builder()
                .timeout(config.timeout)
                .build()
                .expect("reqwest client"),
            provider,
            config,
            states: Mutex::new(HashMap::new()),
            on_change,
            force_tx,
            force_rx: Mutex::new(Some(force_rx)),
            stop_tx,
            stop_rx: Mutex::new(Some(stop_rx)),
        })
    }

    pub fn is_healthy(&self, container_name: &str) -> bool {
        matches!(
            self.states.lock().unwrap().get(container_name).and_then(|h| h.state),
            Some(HealthState::Healthy)
        )
    }

    pub fn force_check(&self) {
        let _ = self.force_tx.send(());
    }

    /// Requests the worker loop stop and waits for it to drain its
    /// in-flight probes before returning.
    pub async fn stop(&self) {
        let (done_tx, mut done_rx) = mpsc::channel(1);
        if self.stop_tx.send(done_tx).await.is_ok() {
            let _ = done_rx.recv().await;
        }
    }

    pub fn spawn(self: Arc<Self>) {
        let mut force_rx = self
            .force_rx
            .try_lock()
            .expect("spawn called twice")
            .take()
            .expect("spawn called twice");
        let mut stop_rx = self
            .stop_rx
            .try_lock()
            .expect("spawn called twice")
            .take()
            .expect("spawn called twice");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_round().await;
                    }
                    Some(()) = force_rx.recv() => {
                        self.run_round().await;
                    }
                    Some(done) = stop_rx.recv() => {
                        let _ = done.send(()).await;
                        return;
                    }
                }
            }
        });
    }

    async fn run_round(&self) {
        let targets = self.provider.health_check_targets().await;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_checks));
        let mut handles = Vec::with_capacity(targets.len());

        for target in targets {
            let semaphore = semaphore.clone();
            let client = self.client.clone();
            let timeout = self.config.timeout;
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                probe_once(&client, &target, timeout).await
            }));
        }

        for handle in handles {
            if let Ok((target, ok)) = handle.await {
                self.record_result(target, ok);
            }
        }
    }

    fn record_result(&self, target: HealthTarget, ok: bool) {
        let mut states = self.states.lock().unwrap();
        let entry = states.entry(target.container_name.clone()).or_default();
        if ok {
            entry.consecutive_successes += 1;
            entry.consecutive_failures = 0;
        } else {
            entry.consecutive_failures += 1;
            entry.consecutive_successes = 0;
        }

        let previous = entry.state;
        let new_state = match previous {
            None if ok && entry.consecutive_successes >= self.config.rise => Some(HealthState::Healthy),
            None if !ok && entry.consecutive_failures >= self.config.fall => Some(HealthState::Unhealthy),
            Some(HealthState::Healthy) if !ok && entry.consecutive_failures >= self.config.fall => {
                Some(HealthState::Unhealthy)
            }
            Some(HealthState::Unhealthy) if ok && entry.consecutive_successes >= self.config.rise => {
                Some(HealthState::Healthy)
            }
            Some(other) => Some(other),
            None => Some(HealthState::Unknown),
        };

        if new_state != previous {
            entry.state = new_state;
            drop(states);
            if let (Some(cb), Some(state)) = (&self.on_change, new_state) {
                cb(target.app_name, target.container_name, state);
            }
        }
    }
}

async fn probe_once(client: &reqwest::Client, target: &HealthTarget, timeout: Duration) -> (HealthTarget, bool) {
    let url = format!("http://{}{}", target.addr, target.health_path);
    let ok = match tokio::time::timeout(timeout, client.get(&url).send()).await {
        Ok(Ok(resp)) => resp.status().is_success(),
        _ => false,
    };
    (target.clone(), ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoTargets;

    #[async_trait]
    impl TargetProvider for NoTargets {
        async fn health_check_targets(&self) -> Vec<HealthTarget> {
            vec![]
        }
    }

    #[test]
    fn hysteresis_requires_rise_count_before_healthy() {
        let monitor = HealthMonitor::new(Arc::new(NoTargets), HealthMonitorConfig { rise: 2, ..Default::default() }, None);
        let target = HealthTarget {
            app_name: "web".into(),
            container_name: "web-1".into(),
            addr: "127.0.0.1:8080".parse().unwrap(),
            health_path: "/".into(),
        };
        monitor.record_result(target.clone(), true);
        assert!(!monitor.is_healthy("web-1"));
        monitor.record_result(target, true);
        assert!(monitor.is_healthy("web-1"));
    }

    #[test]
    fn hysteresis_requires_fall_count_before_unhealthy() {
        let monitor = HealthMonitor::new(Arc::new(NoTargets), HealthMonitorConfig { fall: 3, rise: 1, ..Default::default() }, None);
        let target = HealthTarget {
            app_name: "web".into(),
            container_name: "web-1".into(),
            addr: "127.0.0.1:8080".parse().unwrap(),
            health_path: "/".into(),
        };
        monitor.record_result(target.clone(), true);
        assert!(monitor.is_healthy("web-1"));
        monitor.record_result(target.clone(), false);
        monitor.record_result(target.clone(), false);
        assert!(monitor.is_healthy("web-1"));
        monitor.record_result(target, false);
        assert!(!monitor.is_healthy("web-1"));
    }
}
