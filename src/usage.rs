use crate::error::ErrorKind;
use crate::model::SystemUsageReading;
use crate::store::{PollerHandle, ResourceStore, StoreState};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const GIB: u64 = 1024 * 1024 * 1024;
const DERIVED_TOTAL: u64 = 16 * GIB;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageSource {
    #[default]
    Auto,
    /// Host CPU and memory read from the operating system.
    Host,
    /// Estimated from the number of running containers.
    Derived,
}

impl FromStr for UsageSource {
    type Err = ErrorKind;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "host" => Ok(Self::Host),
            "derived" => Ok(Self::Derived),
            other => Err(ErrorKind::Unsupported(format!("usage source `{other}`"))),
        }
    }
}

/// Heuristic reading for hosts whose metrics cannot be read directly.
pub fn derived_reading(running: usize) -> SystemUsageReading {
    if running == 0 {
        return SystemUsageReading::zero();
    }
    let running = running as f64;
    let used_gib = 6.0 + 0.8 * running;
    let used = ((used_gib * GIB as f64) as u64).min(DERIVED_TOTAL);
    SystemUsageReading::new(8.5 + 3.2 * running, used, DERIVED_TOTAL)
}

pub struct UsageSampler {
    system: Option<System>,
}

impl UsageSampler {
    pub fn new(source: UsageSource) -> Self {
        let system = match source {
            UsageSource::Derived => None,
            UsageSource::Host => Some(host_system()),
            UsageSource::Auto if sysinfo::IS_SUPPORTED_SYSTEM => {
                let system = host_system();
                (system.total_memory() > 0).then_some(system)
            }
            UsageSource::Auto => None,
        };
        info!(
            "usage sampler reading {}",
            if system.is_some() { "host metrics" } else { "derived estimates" }
        );
        Self { system }
    }

    /// Source actually in use once `Auto` has been resolved.
    pub fn source(&self) -> UsageSource {
        if self.system.is_some() {
            UsageSource::Host
        } else {
            UsageSource::Derived
        }
    }

    pub fn sample(&mut self, state: &StoreState) -> SystemUsageReading {
        match self.system.as_mut() {
            Some(system) => {
                system.refresh_cpu_usage();
                system.refresh_memory();
                SystemUsageReading::new(
                    f64::from(system.global_cpu_usage()),
                    system.used_memory(),
                    system.total_memory(),
                )
            }
            None => derived_reading(state.running_containers()),
        }
    }

    /// Publishes a fresh reading into the store on every tick until the
    /// handle is cancelled.
    pub fn spawn(mut self, store: Arc<ResourceStore>, every: Duration) -> PollerHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let reading = self.sample(&store.snapshot());
                        store.record_usage(reading);
                    }
                }
            }
            debug!("usage sampler stopped");
        });

        PollerHandle::new(token, task)
    }
}

fn host_system() -> System {
    let mut system = System::new();
    // CPU usage is a delta between refreshes; prime the first one.
    system.refresh_cpu_usage();
    system.refresh_memory();
    system
}

#[cfg(test)]
mod tests {
    use super::{DERIVED_TOTAL, GIB, UsageSampler, UsageSource, derived_reading};
    use crate::engine::EngineGateway;
    use crate::model::ResourceClass;
    use crate::store::ResourceStore;
    use crate::testing::FakeTransport;
    use crate::transport::Method;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn derived_reading_scales_with_running_containers() {
        let idle = derived_reading(0);
        assert_eq!(idle.cpu_percent, 0.0);
        assert_eq!(idle.memory_total, 0);

        let busy = derived_reading(5);
        assert!((busy.cpu_percent - 24.5).abs() < 1e-9);
        assert_eq!(busy.memory_used, 10 * GIB);
        assert_eq!(busy.memory_total, DERIVED_TOTAL);
        assert!((busy.memory_percent - 62.5).abs() < 1e-9);
    }

    #[test]
    fn derived_reading_stays_in_bounds() {
        let crowded = derived_reading(100);
        assert_eq!(crowded.cpu_percent, 100.0);
        assert_eq!(crowded.memory_used, DERIVED_TOTAL);
        assert_eq!(crowded.memory_percent, 100.0);
    }

    #[test]
    fn source_tokens_parse() {
        assert_eq!("Host".parse::<UsageSource>().unwrap(), UsageSource::Host);
        assert!("guess".parse::<UsageSource>().is_err());
        assert_eq!(UsageSampler::new(UsageSource::Derived).source(), UsageSource::Derived);
    }

    #[tokio::test]
    async fn sampler_publishes_into_store() {
        let fake = FakeTransport::new();
        fake.respond(
            Method::GET,
            "/containers/json",
            200,
            json!([
                {"Id": "a", "Names": ["/a"], "State": "running"},
                {"Id": "b", "Names": ["/b"], "State": "running"},
                {"Id": "c", "Names": ["/c"], "State": "exited"}
            ]),
        );
        let store = ResourceStore::new(EngineGateway::new(fake));
        store.refresh(ResourceClass::Containers).await;
        let mut changes = store.subscribe();

        let handle = UsageSampler::new(UsageSource::Derived)
            .spawn(store.clone(), Duration::from_millis(10));
        tokio::time::timeout(
            Duration::from_secs(2),
            changes.wait_for(|state| state.system_usage.is_some()),
        )
        .await
        .unwrap()
        .unwrap();
        handle.stopped().await;

        let usage = store.snapshot().system_usage.unwrap();
        assert_eq!(usage.memory_total, DERIVED_TOTAL);
        assert!((usage.cpu_percent - 14.9).abs() < 1e-9);
    }
}
