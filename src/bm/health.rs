use crate::bm::asyncutil::tasks;
use crate::bm::events::bm_event;
use crate::bm::service::HealthState;
use crate::bm::spec::HealthCheckSpec;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Outcome of one probe loop iteration, posted to the supervisor inbox.
#[derive(Debug, Clone, Copy)]
pub enum ProbeReport {
    /// Health state changed (or the failure counter moved); display only.
    Changed { health: HealthState, fails: u32 },
    /// The consecutive-failure threshold was reached; supervisor restarts.
    Unhealthy,
}

/// Per-service HTTP prober. Every `interval` ms a GET against `url` with a
/// `timeout` ms deadline: 2xx resets the consecutive-failure counter and
/// marks healthy; anything else (non-2xx, timeout, connect error) counts a
/// failure. Reaching `max_fails` posts `Unhealthy` and resets the counter.
/// Aborting the returned handle cancels the in-flight request and timer.
pub fn start_prober<F>(service: String, hc: HealthCheckSpec, report: F) -> JoinHandle<()>
where
    F: Fn(ProbeReport) + Send + Sync + 'static,
{
    tasks().spawn(async move {
        let client = match reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(hc.timeout))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                bm_event("health", Some(&service), format!("client_error err={e}"));
                return;
            }
        };

        let mut fails: u32 = 0;
        let mut health = HealthState::Unknown;
        loop {
            tokio::time::sleep(Duration::from_millis(hc.interval)).await;

            let ok = match client
                .get(&hc.url)
                .timeout(Duration::from_millis(hc.timeout))
                .send()
                .await
            {
                Ok(resp) => resp.status().is_success(),
                Err(_) => false,
            };

            if ok {
                if fails != 0 || health != HealthState::Healthy {
                    fails = 0;
                    health = HealthState::Healthy;
                    report(ProbeReport::Changed { health, fails });
                }
                continue;
            }

            fails += 1;
            if fails >= hc.max_fails {
                health = HealthState::Unhealthy;
            }
            report(ProbeReport::Changed { health, fails });
            if fails >= hc.max_fails {
                bm_event(
                    "health",
                    Some(&service),
                    format!("unhealthy url={} fails={fails} max_fails={}", hc.url, hc.max_fails),
                );
                report(ProbeReport::Unhealthy);
                fails = 0;
            }
        }
    })
}
