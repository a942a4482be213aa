use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, today_utc};
use crate::model::GenerationStatus;

/// Background task that materializes upcoming bookings for every rule in
/// the workspace on a fixed cadence. Sweeps are idempotent — a pass that
/// finds nothing new to create is a no-op — and strictly sequential per
/// rule, so a sweep never races a manual generate call for the same rule.
pub async fn run_generator(engine: Arc<Engine>, horizon_weeks: u32, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let today = today_utc();
        for (rule_id, result) in engine.generate_all(horizon_weeks, today).await {
            match result {
                Ok(outcome) => match outcome.status {
                    GenerationStatus::Completed if !outcome.created.is_empty() => {
                        info!(
                            "sweep generated {} bookings for rule {rule_id}",
                            outcome.created_count()
                        );
                    }
                    GenerationStatus::Completed => {}
                    GenerationStatus::Inactive | GenerationStatus::Paused => {
                        debug!("sweep skip {rule_id}: inactive or paused");
                    }
                },
                // Keep sweeping — one broken rule must not starve the rest
                Err(e) => warn!("sweep failed for rule {rule_id}: {e}"),
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("compacted WAL after {appends} appends"),
                Err(e) => warn!("WAL compaction failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Frequency, Recurrence};
    use crate::notify::NotifyHub;
    use chrono::{NaiveDate, NaiveTime, Weekday};
    use rust_decimal::Decimal;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("cadence_test_scheduler");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn seed_rule(engine: &Engine) -> Ulid {
        let service_id = Ulid::new();
        engine
            .create_service(service_id, "Standard Clean".into(), Decimal::new(12000, 2), 120)
            .await
            .unwrap();
        let rule_id = Ulid::new();
        engine
            .create_rule(
                rule_id,
                Ulid::new(),
                Ulid::new(),
                service_id,
                Recurrence {
                    frequency: Frequency::Weekly,
                    interval: 1,
                    day_of_week: Some(Weekday::Mon),
                    day_of_month: None,
                },
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                // A Monday far enough back that the sweep's real clock
                // always clamps to today
                NaiveDate::from_ymd_opt(2020, 1, 6).unwrap(),
                None,
            )
            .await
            .unwrap();
        rule_id
    }

    #[tokio::test]
    async fn generator_sweep_materializes_bookings() {
        let path = test_wal_path("sweep.wal");
        let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap());
        let rule_id = seed_rule(&engine).await;

        let sweeper = tokio::spawn(run_generator(
            engine.clone(),
            4,
            Duration::from_millis(50),
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;
        sweeper.abort();

        let bookings = engine.get_bookings(rule_id).await.unwrap();
        assert_eq!(bookings.len(), 4);
        // A second sweep ran during the sleep and created nothing new
        assert!(bookings.windows(2).all(|w| w[0].date < w[1].date));
    }

    #[tokio::test]
    async fn compactor_rewrites_wal_past_threshold() {
        let path = test_wal_path("compact.wal");
        let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap());
        let rule_id = seed_rule(&engine).await;
        let date = NaiveDate::from_ymd_opt(2027, 1, 4).unwrap();
        for i in 0..20 {
            let d = date + chrono::Duration::weeks(i);
            engine.add_skip_date(rule_id, d, None).await.unwrap();
            engine.remove_skip_date(rule_id, d).await.unwrap();
        }
        assert!(engine.wal_appends_since_compact().await >= 40);

        let compactor = tokio::spawn(run_compactor(
            engine.clone(),
            10,
            Duration::from_millis(50),
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;
        compactor.abort();

        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
