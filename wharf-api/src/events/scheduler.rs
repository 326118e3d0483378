//! Event scheduler
//!
//! A background tick at one-second resolution. On every minute boundary
//! it matches the cron quintuples of scheduled rules against UTC and
//! dispatches the hits.

use super::rules::EventTrigger;
use super::EventManager;
use crate::provider::events as store;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub async fn run(manager: Arc<EventManager>, shutdown: CancellationToken) {
    let mut last_minute: Option<i64> = None;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        let now = chrono::Utc::now();
        let minute = now.timestamp() / 60;
        if last_minute == Some(minute) {
            continue;
        }
        last_minute = Some(minute);
        let rules = match store::list_rules(manager.provider_pool(), EventTrigger::Schedule).await
        {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!("scheduler cannot load rules: {}", e);
                continue;
            }
        };
        for rule in rules {
            if !rule.is_enabled() {
                continue;
            }
            let hit = rule
                .conditions
                .schedules
                .iter()
                .any(|s| s.matches_minute(now));
            if hit {
                tracing::info!(rule = %rule.name, "schedule fired");
                manager.run_scheduled_rule(rule);
            }
        }
    }
}
