//! Small shared helpers

use std::time::Duration;

use tokio::time::{sleep, Instant};

/// Sleep `total` in steps of at most `slice`, checking `keep_going` before
/// each step. Returns false as soon as the check fails.
pub async fn sleep_while<F>(total: Duration, slice: Duration, keep_going: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + total;
    loop {
        if !keep_going() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        sleep((deadline - now).min(slice)).await;
    }
}

/// `1h 02m 03s`, `4m 05s` or `6s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

/// A value already in percent, one decimal: `50.0%`
pub fn format_percent(percent: f64) -> String {
    format!("{percent:.1}%")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::types::{SessionMode, SimulationSession, VisitOutcome, VisitReport};

    #[tokio::test(start_paused = true)]
    async fn test_sleep_while_completes() {
        let started = Instant::now();
        assert!(sleep_while(Duration::from_millis(3500), Duration::from_secs(1), || true).await);
        assert_eq!(started.elapsed(), Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_while_interrupted_within_a_slice() {
        let checks = AtomicUsize::new(0);
        let started = Instant::now();
        let finished = sleep_while(Duration::from_secs(60), Duration::from_secs(1), || {
            checks.fetch_add(1, Ordering::SeqCst) < 3
        })
        .await;
        assert!(!finished);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn test_sleep_while_zero_total() {
        assert!(tokio_test::block_on(sleep_while(Duration::ZERO, Duration::from_secs(1), || true)));
        assert!(!tokio_test::block_on(sleep_while(Duration::ZERO, Duration::from_secs(1), || false)));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(6)), "6s");
        assert_eq!(format_duration(Duration::from_secs(245)), "4m 05s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 02m 03s");
    }

    #[test]
    fn test_format_session_success_rate() {
        let mut session =
            SimulationSession::new("https://example.com", SessionMode::Immediate, 3, None);
        assert_eq!(format_percent(session.success_rate()), "0.0%");

        let report = VisitReport {
            status_code: 200,
            success: true,
            latency: Duration::from_millis(10),
        };
        session.record_visit(VisitOutcome::from_report(&report, "1.1.1.1"));
        session.record_visit(VisitOutcome::failed("1.1.1.1", Duration::from_secs(120), "timed out"));
        assert_eq!(format_percent(session.success_rate()), "50.0%");

        session.record_visit(VisitOutcome::from_report(&report, "1.1.1.1"));
        assert_eq!(format_percent(session.success_rate()), "66.7%");
    }
}
