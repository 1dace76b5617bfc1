use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use tokio::task::JoinHandle;

use crate::ledger::LedgerService;
use crate::ledger::types::RetentionSummary;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetentionConfig {
    pub enabled: bool,
    /// Resolved deposit and withdraw requests older than this are deleted.
    pub retention_days: i64,
    pub run_hour_utc: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 30,
            run_hour_utc: 2,
        }
    }
}

/// Next daily run at `run_hour_utc:00`, strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, run_hour_utc: u32) -> DateTime<Utc> {
    let run_time = NaiveTime::from_hms_opt(run_hour_utc.min(23), 0, 0).unwrap_or_default();
    let today = now.date_naive().and_time(run_time).and_utc();
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

pub async fn run_once(
    service: &LedgerService,
    config: &RetentionConfig,
    now: DateTime<Utc>,
) -> Option<RetentionSummary> {
    match service
        .purge_resolved_requests(config.retention_days, now)
        .await
    {
        Ok(summary) => {
            tracing::info!(
                cutoff = %summary.cutoff,
                deposits_deleted = summary.deposits_deleted,
                withdrawals_deleted = summary.withdrawals_deleted,
                "ledger retention sweep completed"
            );
            Some(summary)
        }
        Err(error) => {
            tracing::warn!(reason = %error, "ledger retention sweep failed");
            None
        }
    }
}

pub fn spawn_retention_worker(
    service: LedgerService,
    config: RetentionConfig,
) -> Option<JoinHandle<()>> {
    if !config.enabled {
        tracing::info!("ledger retention worker disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let next = next_run_after(now, config.run_hour_utc);
            tracing::debug!(next_run = %next, "ledger retention sweep scheduled");
            let wait = (next - now).to_std().unwrap_or(StdDuration::from_secs(60));
            tokio::time::sleep(wait).await;
            run_once(&service, &config, Utc::now()).await;
        }
    }))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::next_run_after;

    #[test]
    fn next_run_is_later_today_before_the_hour() {
        let now = Utc
            .with_ymd_and_hms(2026, 3, 14, 1, 30, 0)
            .single()
            .expect("valid timestamp");
        let next = next_run_after(now, 2);
        assert_eq!(
            next,
            Utc.with_ymd_and_hms(2026, 3, 14, 2, 0, 0)
                .single()
                .expect("valid timestamp")
        );
    }

    #[test]
    fn next_run_rolls_to_tomorrow_at_or_after_the_hour() {
        let at_hour = Utc
            .with_ymd_and_hms(2026, 3, 14, 2, 0, 0)
            .single()
            .expect("valid timestamp");
        let tomorrow = Utc
            .with_ymd_and_hms(2026, 3, 15, 2, 0, 0)
            .single()
            .expect("valid timestamp");
        assert_eq!(next_run_after(at_hour, 2), tomorrow);

        let evening = Utc
            .with_ymd_and_hms(2026, 3, 14, 23, 59, 59)
            .single()
            .expect("valid timestamp");
        assert_eq!(next_run_after(evening, 2), tomorrow);
    }

    #[test]
    fn next_run_handles_month_boundary() {
        let now = Utc
            .with_ymd_and_hms(2026, 1, 31, 12, 0, 0)
            .single()
            .expect("valid timestamp");
        assert_eq!(
            next_run_after(now, 0),
            Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0)
                .single()
                .expect("valid timestamp")
        );
    }
}
