use crate::bm::asyncutil::tasks;
use crate::bm::events::bm_event;
use chrono::{DateTime, Duration as ChronoDuration, Local, TimeZone};
use cron::Schedule;
use std::str::FromStr;
use tokio::task::JoinHandle;

/// Standard 5-field cron (`minute hour day-of-month month day-of-week`) is
/// accepted by prepending a seconds field; 6+ fields pass through unchanged.
pub fn normalize(expr: &str) -> String {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

pub fn parse(expr: &str) -> anyhow::Result<Schedule> {
    let normalized = normalize(expr);
    Schedule::from_str(&normalized)
        .map_err(|e| anyhow::anyhow!("invalid cron expression {expr:?}: {e}"))
}

pub fn validate(expr: &str) -> anyhow::Result<()> {
    parse(expr).map(|_| ())
}

/// Next wall-clock match strictly after `after`, if one exists within a year.
pub fn next_after<Tz: TimeZone>(sched: &Schedule, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let next = sched.after(after).next()?;
    if next.clone() - after.clone() > ChronoDuration::days(366) {
        return None;
    }
    Some(next)
}

/// Whether `t` is in the parsed set (second-granular; 5-field expressions
/// only match at second zero).
pub fn matches<Tz: TimeZone>(sched: &Schedule, t: &DateTime<Tz>) -> bool {
    sched.includes(t.clone())
}

/// Arm the per-service cron loop: sleep to the next match, post `on_fire`,
/// recompute. Matches that land in the past (backward clock jumps) are
/// skipped silently because each iteration recomputes from now.
pub fn arm<F>(service: String, expr: String, on_fire: F) -> JoinHandle<()>
where
    F: Fn() + Send + Sync + 'static,
{
    tasks().spawn(async move {
        let sched = match parse(&expr) {
            Ok(s) => s,
            Err(e) => {
                bm_event("cron", Some(&service), format!("parse_error expr={expr:?} err={e}"));
                return;
            }
        };
        loop {
            let now = Local::now();
            let Some(next) = next_after(&sched, &now) else {
                bm_event(
                    "cron",
                    Some(&service),
                    format!("skip expr={expr:?} reason=no_match_within_a_year"),
                );
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
            // The clock may have moved while we slept; only fire if the match
            // is actually due.
            if Local::now() < next {
                continue;
            }
            on_fire();
        }
    })
}
