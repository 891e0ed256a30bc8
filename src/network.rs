//! Debounced connectivity monitor.
//!
//! Runs the `ReachabilityProbe` on a timer and publishes a `NetworkState` on
//! a watch channel. A flip between online and offline is only published
//! after `required_confirmations` consecutive checks agree, so a flapping
//! link at a festival gate does not trigger a sync pass per blip.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ProbeResult, ReachabilityProbe};
use crate::config::NetworkConfig;
use crate::models::{NetworkQuality, NetworkState};

#[derive(Debug, Default)]
struct Debounce {
    candidate: Option<bool>,
    streak: u32,
}

pub struct NetworkMonitor {
    probe: Arc<dyn ReachabilityProbe>,
    required_confirmations: u32,
    degraded_latency: Duration,
    state: watch::Sender<NetworkState>,
    debounce: Mutex<Debounce>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl NetworkMonitor {
    pub fn new(probe: Arc<dyn ReachabilityProbe>, config: &NetworkConfig) -> Self {
        let (state, _) = watch::channel(NetworkState::default());
        Self {
            probe,
            required_confirmations: config.required_confirmations.max(1),
            degraded_latency: Duration::from_millis(config.degraded_latency_ms),
            state,
            debounce: Mutex::new(Debounce::default()),
            cancel: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.state.subscribe()
    }

    pub fn current(&self) -> NetworkState {
        self.state.borrow().clone()
    }

    /// Start polling. A second call while running is ignored.
    pub fn start(self: &Arc<Self>, poll_interval: Duration) {
        let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            debug!("Network monitor already running");
            return;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        drop(slot);

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                poll_ms = poll_interval.as_millis() as u64,
                confirmations = monitor.required_confirmations,
                "Network monitor started"
            );
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.check_now().await;
                    }
                }
            }
            info!("Network monitor stopped");
        });
    }

    pub fn stop(&self) {
        let token = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Run one probe now and feed it through the debouncer. Returns the
    /// published state afterwards.
    pub async fn check_now(&self) -> NetworkState {
        let result = self.probe.probe().await;
        self.observe(result, Utc::now());
        self.current()
    }

    fn quality_of(&self, result: &ProbeResult) -> NetworkQuality {
        match result.latency {
            Some(latency) if latency <= self.degraded_latency => NetworkQuality::Good,
            Some(_) => NetworkQuality::Degraded,
            None => NetworkQuality::Unknown,
        }
    }

    fn observe(&self, result: ProbeResult, now: DateTime<Utc>) {
        let observed_online = result.reachable;
        let quality = self.quality_of(&result);
        let required = self.required_confirmations;
        let mut debounce = self.debounce.lock().unwrap_or_else(PoisonError::into_inner);

        // `last_checked_at` is refreshed silently; receivers are only woken
        // for a published flip or a quality change.
        self.state.send_if_modified(|state| {
            state.last_checked_at = Some(now);

            if observed_online == state.is_online {
                *debounce = Debounce::default();
                let new_quality = if observed_online {
                    quality
                } else {
                    NetworkQuality::Unknown
                };
                if state.quality != new_quality {
                    debug!(from = ?state.quality, to = ?new_quality, "Network quality changed");
                    state.quality = new_quality;
                    return true;
                }
                return false;
            }

            if debounce.candidate == Some(observed_online) {
                debounce.streak += 1;
            } else {
                debounce.candidate = Some(observed_online);
                debounce.streak = 1;
            }
            if debounce.streak < required {
                debug!(
                    observed_online,
                    streak = debounce.streak,
                    required,
                    "Connectivity change not yet confirmed"
                );
                return false;
            }

            *debounce = Debounce::default();
            state.is_online = observed_online;
            state.quality = if observed_online {
                quality
            } else {
                NetworkQuality::Unknown
            };
            if observed_online {
                info!(quality = ?state.quality, "Network online");
            } else {
                warn!("Network offline");
            }
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProbe;

    fn monitor(probe: Arc<ScriptedProbe>) -> Arc<NetworkMonitor> {
        Arc::new(NetworkMonitor::new(probe, &NetworkConfig::default()))
    }

    #[tokio::test]
    async fn test_starts_offline_and_needs_two_confirmations() {
        let probe = ScriptedProbe::new();
        let monitor = monitor(probe.clone());
        let rx = monitor.subscribe();
        assert!(!rx.borrow().is_online);
        assert_eq!(rx.borrow().quality, NetworkQuality::Unknown);

        probe.push_online();
        probe.push_online();
        assert!(!monitor.check_now().await.is_online);
        let state = monitor.check_now().await;
        assert!(state.is_online);
        assert_eq!(state.quality, NetworkQuality::Good);
        assert!(state.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn test_rapid_flips_publish_nothing() {
        let probe = ScriptedProbe::new();
        let monitor = monitor(probe.clone());
        probe.push_online();
        probe.push_online();
        monitor.check_now().await;
        monitor.check_now().await;

        let mut rx = monitor.subscribe();
        rx.borrow_and_update();
        // online -> offline -> online within two checks
        probe.push_offline();
        probe.push_online();
        probe.push_offline();
        probe.push_online();
        for _ in 0..4 {
            monitor.check_now().await;
        }
        assert!(!rx.has_changed().unwrap(), "no transition published");
        assert!(monitor.current().is_online);
    }

    #[tokio::test]
    async fn test_quality_only_tracks_agreeing_observations() {
        let probe = ScriptedProbe::new();
        let monitor = monitor(probe.clone());
        probe.push(true, 40);
        probe.push(true, 40);
        probe.push(true, 2_400);
        monitor.check_now().await;
        monitor.check_now().await;
        assert_eq!(
            monitor.check_now().await.quality,
            NetworkQuality::Degraded
        );

        // A single failed check neither flips state nor touches quality.
        probe.push_offline();
        let state = monitor.check_now().await;
        assert!(state.is_online);
        assert_eq!(state.quality, NetworkQuality::Degraded);

        probe.push_offline();
        let state = monitor.check_now().await;
        assert!(!state.is_online);
        assert_eq!(state.quality, NetworkQuality::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_polling_and_stop() {
        let probe = ScriptedProbe::new();
        probe.push_online();
        let monitor = monitor(probe.clone());
        let mut rx = monitor.subscribe();

        monitor.start(Duration::from_secs(5));
        monitor.start(Duration::from_secs(5));
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_online);

        monitor.stop();
        probe.push_offline();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(monitor.current().is_online, "no checks after stop");
    }
}
