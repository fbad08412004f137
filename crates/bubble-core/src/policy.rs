//! Restriction policy engine.
//!
//! The decision is a pure function of the bubble state, today's tasks and the
//! clock. Side effects (enforcement calls and session log writes) happen only
//! on an edge of that decision, so any trigger may re-evaluate as often as it
//! likes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::bubble::BubbleState;
use crate::enforcement::{EnforcementSink, RestrictionTargets};
use crate::error::Result;
use crate::storage::{DailySnapshot, SessionKind, SessionLogEntry, Storage};
use crate::tasks::{local_day, Task, TaskSource};

/// Whether today's tasks call for restriction, ignoring presence.
///
/// 1. No tasks due today: no.
/// 2. No incomplete tasks: no.
/// 3. Some incomplete task has an explicit time: yes iff one of those is due.
/// 4. Otherwise (only date-only tasks left): yes.
#[must_use]
pub fn should_restrict(tasks: &[Task], now: DateTime<Utc>) -> bool {
    let mut incomplete = tasks.iter().filter(|task| !task.is_completed).peekable();
    if incomplete.peek().is_none() {
        return false;
    }

    let mut timed = incomplete.filter(|task| task.has_explicit_time).peekable();
    if timed.peek().is_none() {
        return true;
    }
    timed.any(|task| task.due <= now)
}

/// Id of the first task still outstanding.
fn first_incomplete(tasks: &[Task]) -> Option<String> {
    tasks
        .iter()
        .find(|task| !task.is_completed)
        .map(|task| task.id.clone())
}

/// What caused an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Engine start-up.
    Startup,
    /// A debounced bubble transition.
    BubbleSettled,
    /// Periodic foreground timer.
    ForegroundTick,
    /// Periodic background timer.
    BackgroundTick,
    /// The task store reported a change.
    TasksChanged,
    /// A task was completed.
    TaskCompleted,
}

/// An edge of the restriction decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionChange {
    /// New decision.
    pub enabled: bool,
    /// When it took effect.
    pub at: DateTime<Utc>,
    /// What caused it.
    pub trigger: Trigger,
}

/// Owner of the restriction decision and of both session logs.
pub struct RestrictionEngine {
    tasks: Arc<dyn TaskSource>,
    enforcement: Arc<dyn EnforcementSink>,
    storage: Storage,
    targets: RestrictionTargets,
    tz: Tz,
    enabled: bool,
    restriction_started: Option<DateTime<Utc>>,
    outside_started: Option<DateTime<Utc>>,
    last_snapshot: Option<DailySnapshot>,
    active_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for RestrictionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestrictionEngine")
            .field("enabled", &self.enabled)
            .field("restriction_started", &self.restriction_started)
            .field("outside_started", &self.outside_started)
            .field("targets", &self.targets)
            .finish_non_exhaustive()
    }
}

impl RestrictionEngine {
    /// Create an engine with restriction off.
    pub fn new(
        tasks: Arc<dyn TaskSource>,
        enforcement: Arc<dyn EnforcementSink>,
        storage: Storage,
        targets: RestrictionTargets,
        tz: Tz,
    ) -> Self {
        if targets.is_empty() {
            warn!("Restriction target set is empty; restriction will stay disabled");
        }
        let (active_tx, _) = watch::channel(false);
        Self {
            tasks,
            enforcement,
            storage,
            targets,
            tz,
            enabled: false,
            restriction_started: None,
            outside_started: None,
            last_snapshot: None,
            active_tx,
        }
    }

    /// Current decision.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Start of the open restriction interval, if any.
    #[must_use]
    pub const fn restriction_started(&self) -> Option<DateTime<Utc>> {
        self.restriction_started
    }

    /// Observe the decision.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.active_tx.subscribe()
    }

    /// Recompute the decision and act on an edge.
    ///
    /// # Errors
    ///
    /// Returns an error when the task source cannot be read or the
    /// enforcement call fails. In both cases the previous decision stands and
    /// the next trigger tries again.
    pub fn evaluate(
        &mut self,
        bubble: BubbleState,
        now: DateTime<Utc>,
        trigger: Trigger,
    ) -> Result<Option<DecisionChange>> {
        let tasks = self.tasks.tasks_due_today(now)?;
        self.record_snapshot(&tasks, now);

        let desired =
            bubble == BubbleState::Inside && should_restrict(&tasks, now) && !self.targets.is_empty();
        debug!(?bubble, ?trigger, desired, enabled = self.enabled, "Evaluated restriction");

        if desired == self.enabled {
            return Ok(None);
        }
        self.commit(desired, &tasks, now, trigger).map(Some)
    }

    /// Act on a debounced bubble transition: maintain the bubble-outside log,
    /// then re-evaluate.
    ///
    /// # Errors
    ///
    /// See [`Self::evaluate`].
    pub fn on_bubble_settled(
        &mut self,
        state: BubbleState,
        now: DateTime<Utc>,
    ) -> Result<Option<DecisionChange>> {
        match state {
            BubbleState::Outside => {
                if self.outside_started.is_none() {
                    self.outside_started = Some(now);
                }
            }
            BubbleState::Inside => {
                if let Some(start) = self.outside_started.take() {
                    let related = self
                        .tasks
                        .tasks_due_today(now)
                        .ok()
                        .and_then(|tasks| first_incomplete(&tasks));
                    self.log_session(SessionKind::BubbleOutside, start, now, related);
                }
            }
        }
        self.evaluate(state, now, Trigger::BubbleSettled)
    }

    /// Re-check after a task completion: disable if nothing is left today.
    ///
    /// # Errors
    ///
    /// See [`Self::evaluate`].
    pub fn on_task_completed(&mut self, now: DateTime<Utc>) -> Result<Option<DecisionChange>> {
        let tasks = self.tasks.tasks_due_today(now)?;
        self.record_snapshot(&tasks, now);

        if !self.enabled || tasks.iter().any(|task| !task.is_completed) {
            return Ok(None);
        }
        info!("All of today's tasks are complete");
        self.commit(false, &tasks, now, Trigger::TaskCompleted)
            .map(Some)
    }

    /// Close any open intervals, e.g. at shutdown. Enforcement is left as is.
    pub fn flush(&mut self, now: DateTime<Utc>) {
        let related = self
            .tasks
            .tasks_due_today(now)
            .ok()
            .and_then(|tasks| first_incomplete(&tasks));
        if let Some(start) = self.outside_started.take() {
            self.log_session(SessionKind::BubbleOutside, start, now, related.clone());
        }
        if let Some(start) = self.restriction_started.take() {
            self.log_session(SessionKind::Restriction, start, now, related);
        }
    }

    fn commit(
        &mut self,
        enabled: bool,
        tasks: &[Task],
        now: DateTime<Utc>,
        trigger: Trigger,
    ) -> Result<DecisionChange> {
        if enabled {
            if let Err(e) = self.enforcement.apply_restriction(&self.targets) {
                error!(error = %e, "Failed to apply restriction");
                return Err(e);
            }
            self.restriction_started = Some(now);
        } else {
            if let Err(e) = self.enforcement.clear_all_restrictions() {
                error!(error = %e, "Failed to clear restrictions");
                return Err(e);
            }
            if let Some(start) = self.restriction_started.take() {
                self.log_session(SessionKind::Restriction, start, now, first_incomplete(tasks));
            }
        }

        self.enabled = enabled;
        self.active_tx.send_replace(enabled);
        info!(decision = enabled, ?trigger, "Restriction decision changed");
        Ok(DecisionChange {
            enabled,
            at: now,
            trigger,
        })
    }

    fn log_session(
        &self,
        kind: SessionKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        related_task_id: Option<String>,
    ) {
        let entry = SessionLogEntry::new(start, end, related_task_id);
        if let Err(e) = self.storage.append_session(kind, entry, end) {
            error!(?kind, error = %e, "Failed to write session log");
        }
    }

    fn record_snapshot(&mut self, tasks: &[Task], now: DateTime<Utc>) {
        let today = local_day(now, self.tz);
        let snapshot = DailySnapshot {
            date: today,
            total_tasks: u32::try_from(tasks.len()).unwrap_or(u32::MAX),
            completed_tasks: u32::try_from(tasks.iter().filter(|t| t.is_completed).count())
                .unwrap_or(u32::MAX),
        };
        if self.last_snapshot.as_ref() == Some(&snapshot) {
            return;
        }
        match self.storage.upsert_snapshot(snapshot.clone(), today) {
            Ok(_) => self.last_snapshot = Some(snapshot),
            Err(e) => error!(error = %e, "Failed to write daily snapshot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BubbleError;
    use crate::tasks::InMemoryTaskSource;
    use chrono::{Duration, TimeZone};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct RecordingSink {
        calls: Mutex<Vec<&'static str>>,
        fail: Mutex<bool>,
    }

    impl RecordingSink {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl EnforcementSink for RecordingSink {
        fn apply_restriction(&self, _targets: &RestrictionTargets) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(BubbleError::EnforcementFailed("shield offline".into()));
            }
            self.calls.lock().unwrap().push("apply");
            Ok(())
        }

        fn clear_all_restrictions(&self) -> Result<()> {
            self.calls.lock().unwrap().push("clear");
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        storage: Storage,
        tasks: Arc<InMemoryTaskSource>,
        sink: Arc<RecordingSink>,
        engine: RestrictionEngine,
    }

    fn targets() -> RestrictionTargets {
        RestrictionTargets {
            apps: vec!["com.example.feed".to_string()],
            ..RestrictionTargets::default()
        }
    }

    fn fixture_with(tasks: Vec<Task>, targets: RestrictionTargets) -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let source = Arc::new(InMemoryTaskSource::new(tasks, chrono_tz::UTC));
        let sink = Arc::new(RecordingSink::default());
        let engine = RestrictionEngine::new(
            source.clone(),
            sink.clone(),
            storage.clone(),
            targets,
            chrono_tz::UTC,
        );
        Fixture {
            _dir: dir,
            storage,
            tasks: source,
            sink,
            engine,
        }
    }

    fn fixture(tasks: Vec<Task>) -> Fixture {
        fixture_with(tasks, targets())
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, hour, minute, 0).unwrap()
    }

    fn timed(id: &str, hour: u32, minute: u32) -> Task {
        Task {
            id: id.to_string(),
            is_completed: false,
            has_explicit_time: true,
            due: at(hour, minute),
        }
    }

    fn date_only(id: &str) -> Task {
        Task {
            id: id.to_string(),
            is_completed: false,
            has_explicit_time: false,
            due: at(0, 0),
        }
    }

    #[test]
    fn test_should_restrict_rules() {
        let now = at(12, 0);
        assert!(!should_restrict(&[], now));

        let mut done = timed("a", 9, 0);
        done.is_completed = true;
        assert!(!should_restrict(&[done.clone()], now));

        assert!(should_restrict(&[timed("a", 11, 0)], now));
        assert!(!should_restrict(&[timed("a", 13, 0)], now));

        // Date-only tasks are ignored once any timed task is outstanding.
        assert!(!should_restrict(&[date_only("d"), timed("a", 13, 0)], now));
        assert!(should_restrict(&[date_only("d"), done], now));
    }

    #[test]
    fn test_scenario_time_gate() {
        let mut f = fixture(vec![timed("t1", 14, 0)]);

        assert!(!should_restrict(&f.tasks.tasks_due_today(at(13, 59)).unwrap(), at(13, 59)));
        let change = f
            .engine
            .evaluate(BubbleState::Outside, at(13, 59), Trigger::ForegroundTick)
            .unwrap();
        assert!(change.is_none());

        let change = f
            .engine
            .evaluate(BubbleState::Inside, at(14, 0), Trigger::ForegroundTick)
            .unwrap()
            .unwrap();
        assert!(change.enabled);
        assert_eq!(f.sink.calls(), vec!["apply"]);
    }

    #[test]
    fn test_scenario_date_only_task_restricts_immediately() {
        let mut f = fixture(vec![date_only("d1")]);
        let change = f
            .engine
            .evaluate(BubbleState::Inside, at(7, 30), Trigger::BubbleSettled)
            .unwrap();
        assert!(change.is_some_and(|c| c.enabled));
        assert!(f.engine.is_enabled());
    }

    #[test]
    fn test_repeated_ticks_have_no_side_effects() {
        let mut f = fixture(vec![date_only("d1")]);
        for minute in 0..5 {
            f.engine
                .evaluate(BubbleState::Inside, at(9, minute), Trigger::ForegroundTick)
                .unwrap();
        }
        for minute in 5..10 {
            f.engine
                .evaluate(BubbleState::Outside, at(9, minute), Trigger::ForegroundTick)
                .unwrap();
        }
        assert_eq!(f.sink.calls(), vec!["apply", "clear"]);
        assert_eq!(f.storage.load_sessions(SessionKind::Restriction).unwrap().len(), 1);
    }

    #[test]
    fn test_scenario_completion_disables_and_logs_once() {
        let mut f = fixture(vec![timed("t1", 8, 0), date_only("d1")]);
        f.engine
            .evaluate(BubbleState::Inside, at(9, 0), Trigger::ForegroundTick)
            .unwrap();
        assert!(f.engine.is_enabled());

        f.tasks.complete("t1");
        f.tasks.complete("d1");
        let change = f.engine.on_task_completed(at(9, 45)).unwrap().unwrap();
        assert!(!change.enabled);
        assert_eq!(change.trigger, Trigger::TaskCompleted);

        f.engine
            .evaluate(BubbleState::Inside, at(9, 46), Trigger::ForegroundTick)
            .unwrap();

        let sessions = f.storage.load_sessions(SessionKind::Restriction).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].start_time, at(9, 0));
        assert_eq!(sessions[0].end_time, at(9, 45));
        assert!((sessions[0].duration_seconds - 45.0 * 60.0).abs() < 1e-6);
        assert_eq!(sessions[0].related_task_id, None);
    }

    #[test]
    fn test_task_completed_keeps_restriction_while_work_remains() {
        let mut f = fixture(vec![date_only("a"), date_only("b")]);
        f.engine
            .evaluate(BubbleState::Inside, at(9, 0), Trigger::ForegroundTick)
            .unwrap();
        f.tasks.complete("a");
        assert!(f.engine.on_task_completed(at(9, 10)).unwrap().is_none());
        assert!(f.engine.is_enabled());
    }

    #[test]
    fn test_leaving_bubble_logs_related_task() {
        let mut f = fixture(vec![date_only("d1")]);
        f.engine
            .evaluate(BubbleState::Inside, at(9, 0), Trigger::BubbleSettled)
            .unwrap();
        f.engine
            .on_bubble_settled(BubbleState::Outside, at(9, 30))
            .unwrap();

        let sessions = f.storage.load_sessions(SessionKind::Restriction).unwrap();
        assert_eq!(sessions[0].related_task_id.as_deref(), Some("d1"));
    }

    #[test]
    fn test_bubble_outside_interval_is_logged_on_return() {
        let mut f = fixture(Vec::new());
        f.engine
            .on_bubble_settled(BubbleState::Outside, at(10, 0))
            .unwrap();
        f.engine
            .on_bubble_settled(BubbleState::Outside, at(10, 5))
            .unwrap();
        f.engine
            .on_bubble_settled(BubbleState::Inside, at(10, 20))
            .unwrap();

        let sessions = f.storage.load_sessions(SessionKind::BubbleOutside).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].end_time - sessions[0].start_time, Duration::minutes(20));
    }

    #[test]
    fn test_empty_targets_never_enable() {
        let mut f = fixture_with(vec![date_only("d1")], RestrictionTargets::default());
        let change = f
            .engine
            .evaluate(BubbleState::Inside, at(9, 0), Trigger::BubbleSettled)
            .unwrap();
        assert!(change.is_none());
        assert!(f.sink.calls().is_empty());
    }

    #[test]
    fn test_failed_enforcement_is_retried_on_next_trigger() {
        let mut f = fixture(vec![date_only("d1")]);
        *f.sink.fail.lock().unwrap() = true;
        assert!(f
            .engine
            .evaluate(BubbleState::Inside, at(9, 0), Trigger::BubbleSettled)
            .is_err());
        assert!(!f.engine.is_enabled());

        *f.sink.fail.lock().unwrap() = false;
        let change = f
            .engine
            .evaluate(BubbleState::Inside, at(9, 1), Trigger::ForegroundTick)
            .unwrap();
        assert!(change.is_some_and(|c| c.enabled));
        assert_eq!(f.engine.restriction_started(), Some(at(9, 1)));
    }

    #[test]
    fn test_decision_is_published() {
        let mut f = fixture(vec![date_only("d1")]);
        let rx = f.engine.subscribe();
        f.engine
            .evaluate(BubbleState::Inside, at(9, 0), Trigger::BubbleSettled)
            .unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn test_snapshot_tracks_completion() {
        let mut f = fixture(vec![date_only("a"), date_only("b")]);
        f.engine
            .evaluate(BubbleState::Outside, at(9, 0), Trigger::Startup)
            .unwrap();
        f.tasks.complete("a");
        f.engine
            .evaluate(BubbleState::Outside, at(9, 1), Trigger::TasksChanged)
            .unwrap();

        let snapshots = f.storage.load_snapshots().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].total_tasks, 2);
        assert_eq!(snapshots[0].completed_tasks, 1);
    }
}
