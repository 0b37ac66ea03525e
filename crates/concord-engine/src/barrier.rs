//! Barrier resolution.

use chrono::{DateTime, Duration, Utc};
use concord_flow::Barrier;

/// Result of checking a reachable barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierOutcome {
  /// Every target member published the gating step.
  Released,
  /// Some members are still missing and the deadline has not passed.
  Waiting { pending: Vec<String> },
  /// The deadline passed with members still missing.
  TimedOut { pending: Vec<String> },
}

/// Deadline for a barrier that just became reachable.
pub fn deadline_for(barrier: &Barrier, reachable_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
  let secs = i64::try_from(barrier.timeout_secs?).unwrap_or(i64::MAX);
  let timeout = Duration::try_seconds(secs).unwrap_or(Duration::MAX);
  Some(
    reachable_at
      .checked_add_signed(timeout)
      .unwrap_or(DateTime::<Utc>::MAX_UTC),
  )
}

/// Check a reachable barrier. An empty member set is trivially released.
pub fn evaluate<F>(
  members: &[String],
  is_published: F,
  deadline: Option<DateTime<Utc>>,
  now: DateTime<Utc>,
) -> BarrierOutcome
where
  F: Fn(&str) -> bool,
{
  let pending: Vec<String> = members
    .iter()
    .filter(|m| !is_published(m.as_str()))
    .cloned()
    .collect();

  if pending.is_empty() {
    return BarrierOutcome::Released;
  }
  if deadline.is_some_and(|d| now >= d) {
    return BarrierOutcome::TimedOut { pending };
  }
  BarrierOutcome::Waiting { pending }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn members() -> Vec<String> {
    vec!["a@x.org".to_string(), "b@x.org".to_string()]
  }

  fn barrier(timeout_secs: Option<u64>) -> Barrier {
    Barrier {
      wait_for: "share".to_string(),
      targets: vec!["pair".to_string()],
      timeout_secs,
    }
  }

  #[test]
  fn test_released_when_all_published() {
    let outcome = evaluate(&members(), |_| true, None, Utc::now());
    assert_eq!(outcome, BarrierOutcome::Released);
  }

  #[test]
  fn test_waiting_before_deadline() {
    let now = Utc::now();
    let deadline = deadline_for(&barrier(Some(300)), now);
    let outcome = evaluate(&members(), |m| m == "a@x.org", deadline, now + Duration::seconds(299));
    assert_eq!(
      outcome,
      BarrierOutcome::Waiting {
        pending: vec!["b@x.org".to_string()]
      }
    );
  }

  #[test]
  fn test_times_out_at_deadline() {
    let now = Utc::now();
    let deadline = deadline_for(&barrier(Some(300)), now);
    let outcome = evaluate(&members(), |m| m == "a@x.org", deadline, now + Duration::seconds(300));
    assert!(matches!(outcome, BarrierOutcome::TimedOut { pending } if pending == vec!["b@x.org"]));
  }

  #[test]
  fn test_no_timeout_waits_forever() {
    let now = Utc::now();
    assert!(deadline_for(&barrier(None), now).is_none());
    let outcome = evaluate(&members(), |_| false, None, now + Duration::days(365));
    assert!(matches!(outcome, BarrierOutcome::Waiting { .. }));
  }

  #[test]
  fn test_empty_member_set_is_released() {
    assert_eq!(
      evaluate(&[], |_| false, None, Utc::now()),
      BarrierOutcome::Released
    );
  }
}
