use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::TelemetryCache;
use crate::metrics::Metrics;
use crate::plug::client::PlugClient;
use crate::plug::{self, SystemInfo};

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

/// Drives one plug forever: discover once, then poll on a fixed cadence and
/// reconnect after any failure. Never gives up and never backs off.
pub struct Poller {
    client: Arc<PlugClient>,
    cache: TelemetryCache,
    metrics: Arc<Metrics>,
    interval: Duration,
}

impl Poller {
    pub fn new(
        client: Arc<PlugClient>,
        cache: TelemetryCache,
        metrics: Arc<Metrics>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            cache,
            metrics,
            interval,
        }
    }

    pub async fn run(self) {
        self.discover().await;

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.cycle().await;
        }
    }

    /// First contact. Failure here is logged and otherwise ignored; the
    /// regular cycle keeps trying.
    pub async fn discover(&self) {
        let endpoint = self.client.endpoint();
        if let Err(e) = self.client.connect().await {
            warn!("Failed to connect to plug at {}: {}", endpoint, e);
            return;
        }
        match self.cache.refresh(&self.client).await {
            Ok(info) => info!(
                "Discovered device {} ({}) at {} with {} outlets",
                info.alias(),
                info.device_id(),
                endpoint,
                info.children().len()
            ),
            Err(e) => warn!("Discovery of plug at {} failed: {}", endpoint, e),
        }
    }

    /// One poll: refresh system info and power readings, publish the error
    /// flag, and reconnect if anything failed.
    pub async fn cycle(&self) -> Health {
        let endpoint = self.client.endpoint();
        match self.poll().await {
            Ok(()) => {
                self.metrics.set_error(endpoint, false);
                Health::Healthy
            }
            Err(e) => {
                warn!("Poll of {} failed ({:?}): {}", endpoint, e.kind(), e);
                self.metrics.set_error(endpoint, true);
                self.recover().await;
                Health::Unhealthy
            }
        }
    }

    async fn poll(&self) -> plug::Result<()> {
        let info = self.cache.refresh(&self.client).await?;
        self.refresh_power(&info).await
    }

    /// Read every outlet's meter. One failing outlet does not stop the
    /// others from being published; the first error is returned.
    async fn refresh_power(&self, info: &SystemInfo) -> plug::Result<()> {
        let endpoint = self.client.endpoint();
        if info.children().is_empty() {
            let reading = self.client.realtime_power(&[]).await?;
            self.metrics.record_power(info.alias(), endpoint, &reading);
            return Ok(());
        }

        let mut first_err = None;
        for child in info.children() {
            match self.client.realtime_power(&[child.id.as_str()]).await {
                Ok(reading) => {
                    debug!("{} on {}: {} mW", child.alias, endpoint, reading.power_mw());
                    self.metrics.record_power(&child.alias, endpoint, &reading);
                }
                Err(e) => {
                    error!("Failed to read power for {} on {}: {}", child.alias, endpoint, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn recover(&self) {
        debug!("Reopening connection to {}", self.client.endpoint());
        if let Err(e) = self.client.connect().await {
            error!("Failed to reopen connection to {}: {}", self.client.endpoint(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::testutil::{
        FakePlug, Reply, is_realtime, is_sysinfo, realtime, refused_endpoint, strip_sysinfo,
    };

    fn poller(client: &Arc<PlugClient>, cache: &TelemetryCache, metrics: &Arc<Metrics>) -> Poller {
        Poller::new(
            Arc::clone(client),
            cache.clone(),
            Arc::clone(metrics),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn failing_cycle_is_unhealthy_then_recovers() {
        // 1 discovery; 2-3 healthy cycle; 4 hangs up mid-cycle; 5-6 after reconnect.
        let plug = FakePlug::start(|n, req| {
            if n == 4 {
                Reply::Hangup
            } else if is_sysinfo(req) {
                Reply::Json(strip_sysinfo("A1", &format!("v{n}"), &[0]))
            } else {
                Reply::Json(realtime(1_000))
            }
        })
        .await;
        let client = Arc::new(PlugClient::new(plug.endpoint()));
        let cache = TelemetryCache::new();
        let metrics = Arc::new(Metrics::new().unwrap());
        let poller = poller(&client, &cache, &metrics);
        let endpoint = plug.endpoint();

        poller.discover().await;
        assert_eq!(cache.get("A1").await.unwrap().alias(), "v1");

        assert_eq!(poller.cycle().await, Health::Healthy);
        assert!(metrics.error_flag(&endpoint).abs() < f64::EPSILON);
        assert_eq!(cache.get("A1").await.unwrap().alias(), "v2");

        assert_eq!(poller.cycle().await, Health::Unhealthy);
        assert!((metrics.error_flag(&endpoint) - 1.0).abs() < f64::EPSILON);
        assert_eq!(cache.get("A1").await.unwrap().alias(), "v2");

        assert_eq!(poller.cycle().await, Health::Healthy);
        assert!(metrics.error_flag(&endpoint).abs() < f64::EPSILON);
        assert_eq!(cache.get("A1").await.unwrap().alias(), "v5");
        assert_eq!(plug.connections(), 2);
    }

    #[tokio::test]
    async fn one_bad_outlet_still_publishes_the_rest() {
        // 1 discovery; 2 sysinfo; 3 outlet 0 (garbage); 4 outlet 1.
        let plug = FakePlug::start(|n, req| match n {
            3 => Reply::Plain(b"garbage".to_vec()),
            _ if is_sysinfo(req) => {
                Reply::Json(strip_sysinfo("A1", &format!("v{n}"), &[1, 0]))
            }
            _ => Reply::Json(realtime(2_000)),
        })
        .await;
        let client = Arc::new(PlugClient::new(plug.endpoint()));
        let cache = TelemetryCache::new();
        let metrics = Arc::new(Metrics::new().unwrap());
        let poller = poller(&client, &cache, &metrics);
        let endpoint = plug.endpoint();

        poller.discover().await;
        assert_eq!(poller.cycle().await, Health::Unhealthy);

        assert_eq!(cache.get("A1").await.unwrap().alias(), "v2");
        assert!((metrics.power_mw("Outlet 1", &endpoint) - 2_000.0).abs() < f64::EPSILON);
        assert!(metrics.power_mw("Outlet 0", &endpoint).abs() < f64::EPSILON);
        assert!((metrics.error_flag(&endpoint) - 1.0).abs() < f64::EPSILON);

        let realtime_requests: Vec<_> = plug.requests().into_iter().filter(is_realtime).collect();
        assert_eq!(
            realtime_requests[0],
            json!({"context": {"child_ids": ["A1_0"]}, "emeter": {"get_realtime": {}}})
        );
        assert_eq!(realtime_requests.len(), 2);
    }

    #[tokio::test]
    async fn single_outlet_plug_is_metered_as_a_whole() {
        let plug = FakePlug::start(|_, req| {
            if is_sysinfo(req) {
                Reply::Json(strip_sysinfo("P1", "Kettle", &[]))
            } else {
                Reply::Json(realtime(1_500_000))
            }
        })
        .await;
        let client = Arc::new(PlugClient::new(plug.endpoint()));
        let cache = TelemetryCache::new();
        let metrics = Arc::new(Metrics::new().unwrap());
        let poller = poller(&client, &cache, &metrics);

        poller.discover().await;
        assert_eq!(poller.cycle().await, Health::Healthy);
        assert!((metrics.power_mw("Kettle", &plug.endpoint()) - 1_500_000.0).abs() < f64::EPSILON);
        assert_eq!(plug.requests().last(), Some(&json!({"emeter": {"get_realtime": {}}})));
    }

    #[tokio::test]
    async fn unreachable_plug_never_enters_cache() {
        let plug = FakePlug::start(|_, req| {
            if is_sysinfo(req) {
                Reply::Json(strip_sysinfo("A1", "Strip", &[0]))
            } else {
                Reply::Json(realtime(0))
            }
        })
        .await;
        let reachable = Arc::new(PlugClient::new(plug.endpoint()));
        let unreachable = Arc::new(PlugClient::new(refused_endpoint().await));
        let cache = TelemetryCache::new();
        let metrics = Arc::new(Metrics::new().unwrap());
        let pollers = [
            poller(&reachable, &cache, &metrics),
            poller(&unreachable, &cache, &metrics),
        ];

        for p in &pollers {
            p.discover().await;
        }
        let health: Vec<Health> =
            futures_util::future::join_all(pollers.iter().map(|p| p.cycle())).await;

        assert_eq!(health, vec![Health::Healthy, Health::Unhealthy]);
        assert_eq!(cache.device_ids().await, vec!["A1".to_string()]);
        assert!(metrics.error_flag(reachable.endpoint()).abs() < f64::EPSILON);
        assert!((metrics.error_flag(unreachable.endpoint()) - 1.0).abs() < f64::EPSILON);
        assert!(cache.client("A1").await.is_some());
    }
}
