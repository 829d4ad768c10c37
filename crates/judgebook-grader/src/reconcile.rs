//! Per-user reconciliation: contest credit first, then practice credit net of
//! it, with every decision (failures included) written to an event sink.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::Utc;
use judgebook_adapters::{AdapterError, ContestAdapter, PracticeAdapter};
use judgebook_core::{Contest, ContestSolvedMap, EventType, GradingEvent, GradingWindow, PracticeSolved, User};
use judgebook_storage::{EventLog, EventLogError};
use tracing::{debug, error, info, warn};

/// Where grading events go. Failing to record is fatal to the run.
#[async_trait]
pub trait EventSink: Send {
    async fn record(&mut self, event: GradingEvent) -> Result<(), EventLogError>;
}

#[async_trait]
impl EventSink for EventLog {
    async fn record(&mut self, event: GradingEvent) -> Result<(), EventLogError> {
        self.append(&event).await
    }
}

#[async_trait]
impl EventSink for Vec<GradingEvent> {
    async fn record(&mut self, event: GradingEvent) -> Result<(), EventLogError> {
        self.push(event);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserPhase {
    Init,
    ContestPass,
    PracticePass,
    Done,
}

/// What one user was credited with during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct UserLedger {
    pub uni: String,
    pub phase: UserPhase,
    /// Platform -> contest id -> solved set.
    pub contest: BTreeMap<String, ContestSolvedMap>,
    pub practice: BTreeMap<String, PracticeSolved>,
    /// Platform -> contests whose grading failed. Practice credit under these
    /// contests is withheld.
    pub failed_contests: BTreeMap<String, BTreeSet<String>>,
    pub events: usize,
    pub exceptions: usize,
}

impl UserLedger {
    fn new(uni: &str) -> Self {
        Self {
            uni: uni.to_string(),
            phase: UserPhase::Init,
            contest: BTreeMap::new(),
            practice: BTreeMap::new(),
            failed_contests: BTreeMap::new(),
            events: 0,
            exceptions: 0,
        }
    }

    fn advance(&mut self, next: UserPhase) {
        debug!(uni = %self.uni, from = ?self.phase, to = ?next, "reconcile phase");
        self.phase = next;
    }

    pub fn contest_points(&self) -> usize {
        self.contest
            .values()
            .flat_map(|by_contest| by_contest.values())
            .map(|solved| solved.len())
            .sum()
    }

    pub fn practice_points(&self) -> usize {
        self.practice.values().map(PracticeSolved::count).sum()
    }
}

/// A contest platform's adapter and the outcome of listing its contests for
/// the window. Listing happens once per run.
pub struct ListedPlatform {
    pub adapter: Box<dyn ContestAdapter>,
    pub contests: Result<Vec<Contest>, String>,
}

impl ListedPlatform {
    pub fn platform(&self) -> &'static str {
        self.adapter.platform()
    }
}

pub struct Reconciler {
    window: GradingWindow,
    contest_platforms: Vec<ListedPlatform>,
    practice_adapters: Vec<Box<dyn PracticeAdapter>>,
}

impl Reconciler {
    /// Lists every contest platform's contests for `window`. A listing failure
    /// is kept and turned into flagged events for each user.
    pub async fn prepare(
        window: GradingWindow,
        contest_adapters: Vec<Box<dyn ContestAdapter>>,
        practice_adapters: Vec<Box<dyn PracticeAdapter>>,
    ) -> Self {
        let mut contest_platforms = Vec::with_capacity(contest_adapters.len());
        for adapter in contest_adapters {
            let contests = match adapter.list_contests(&window).await {
                Ok(contests) => {
                    info!(
                        platform = adapter.platform(),
                        contests = ?contests.iter().map(|c| c.contest_id.as_str()).collect::<Vec<_>>(),
                        "contests in window"
                    );
                    Ok(contests)
                }
                Err(err) => {
                    error!(platform = adapter.platform(), error = %err, "listing contests failed");
                    Err(err.to_string())
                }
            };
            contest_platforms.push(ListedPlatform { adapter, contests });
        }
        Self {
            window,
            contest_platforms,
            practice_adapters,
        }
    }

    pub fn window(&self) -> &GradingWindow {
        &self.window
    }

    pub fn contest_platforms(&self) -> &[ListedPlatform] {
        &self.contest_platforms
    }

    /// Fails if a platform that needs pre-processing is missing data for any
    /// listed contest.
    pub async fn verify_preprocessed(&self) -> Result<(), AdapterError> {
        for listed in &self.contest_platforms {
            if !listed.adapter.requires_preprocessing() {
                continue;
            }
            if let Ok(contests) = &listed.contests {
                listed.adapter.verify_preprocessed(&self.window, contests).await?;
            }
        }
        Ok(())
    }

    /// Runs both passes for one user. Only a sink failure is an error; adapter
    /// failures become flagged zero-point events.
    pub async fn grade_user<S>(&self, user: &User, sink: &mut S) -> Result<UserLedger, EventLogError>
    where
        S: EventSink + ?Sized,
    {
        let mut ledger = UserLedger::new(&user.primary_id);

        ledger.advance(UserPhase::ContestPass);
        for listed in &self.contest_platforms {
            let platform = listed.platform();
            let contests = match &listed.contests {
                Ok(contests) => contests,
                Err(reason) => {
                    error!(uni = %user.primary_id, platform, reason = %reason, "no contest list, flagging");
                    self.record_exception(sink, &mut ledger, platform, EventType::Contest, "").await?;
                    continue;
                }
            };
            if contests.is_empty() {
                // graded, nothing to credit; keeps the platform's cell computed
                let event = GradingEvent::solved(
                    Utc::now(),
                    &self.window,
                    &user.primary_id,
                    platform,
                    EventType::Contest,
                    "",
                    0,
                );
                sink.record(event).await?;
                ledger.events += 1;
                continue;
            }
            let by_contest = ledger.contest.entry(platform.to_string()).or_default();
            for contest in contests {
                match listed.adapter.solved_problems(&self.window, contest, user).await {
                    Ok(solved) => {
                        info!(
                            uni = %user.primary_id,
                            platform,
                            contest = %contest.contest_id,
                            points = solved.len(),
                            "contest credit"
                        );
                        let event = GradingEvent::solved(
                            Utc::now(),
                            &self.window,
                            &user.primary_id,
                            platform,
                            EventType::Contest,
                            &contest.contest_id,
                            solved.len(),
                        );
                        by_contest.insert(contest.contest_id.clone(), solved);
                        sink.record(event).await?;
                        ledger.events += 1;
                    }
                    Err(err) => {
                        error!(
                            uni = %user.primary_id,
                            platform,
                            contest = %contest.contest_id,
                            error = %err,
                            "contest grading failed"
                        );
                        let event = GradingEvent::exception(
                            Utc::now(),
                            &self.window,
                            &user.primary_id,
                            platform,
                            EventType::Contest,
                            &contest.contest_id,
                        );
                        sink.record(event).await?;
                        ledger.events += 1;
                        ledger.exceptions += 1;
                        ledger
                            .failed_contests
                            .entry(platform.to_string())
                            .or_default()
                            .insert(contest.contest_id.clone());
                    }
                }
            }
        }

        ledger.advance(UserPhase::PracticePass);
        let no_contests = ContestSolvedMap::new();
        for adapter in &self.practice_adapters {
            let platform = adapter.platform();
            let credited = ledger.contest.get(platform).unwrap_or(&no_contests);
            match adapter.solved_problems(&self.window, user, credited).await {
                Ok(mut practice) => {
                    for contest_id in ledger.failed_contests.get(platform).into_iter().flatten() {
                        if let Some(withheld) = practice.by_contest.remove(contest_id) {
                            warn!(
                                uni = %user.primary_id,
                                platform,
                                contest = %contest_id,
                                problems = ?withheld,
                                "contest was flagged, its practice solves are left for manual review"
                            );
                        }
                    }
                    info!(
                        uni = %user.primary_id,
                        platform,
                        points = practice.count(),
                        problems = ?practice.problems(),
                        "practice credit"
                    );
                    let event = GradingEvent::solved(
                        Utc::now(),
                        &self.window,
                        &user.primary_id,
                        platform,
                        EventType::Practice,
                        "",
                        practice.count(),
                    );
                    ledger.practice.insert(platform.to_string(), practice);
                    sink.record(event).await?;
                    ledger.events += 1;
                }
                Err(err) => {
                    error!(uni = %user.primary_id, platform, error = %err, "practice grading failed");
                    self.record_exception(sink, &mut ledger, platform, EventType::Practice, "")
                        .await?;
                }
            }
        }

        ledger.advance(UserPhase::Done);
        info!(
            uni = %user.primary_id,
            contest = ledger.contest_points(),
            practice = ledger.practice_points(),
            exceptions = ledger.exceptions,
            "user graded"
        );
        Ok(ledger)
    }

    async fn record_exception<S>(
        &self,
        sink: &mut S,
        ledger: &mut UserLedger,
        platform: &str,
        event_type: EventType,
        event_name: &str,
    ) -> Result<(), EventLogError>
    where
        S: EventSink + ?Sized,
    {
        let event = GradingEvent::exception(Utc::now(), &self.window, &ledger.uni, platform, event_type, event_name);
        sink.record(event).await?;
        ledger.events += 1;
        ledger.exceptions += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use judgebook_core::{CourseCalendar, SolvedSet};

    fn window() -> GradingWindow {
        let start = DateTime::parse_from_rfc3339("2022-01-15T00:00:00-05:00").expect("ts");
        CourseCalendar::new(start, 14).expect("calendar").week(1).expect("week")
    }

    struct FixedContests {
        listing_fails: bool,
        failing_contest: Option<&'static str>,
    }

    #[async_trait]
    impl ContestAdapter for FixedContests {
        fn platform(&self) -> &'static str {
            "Judge"
        }

        async fn list_contests(&self, _window: &GradingWindow) -> Result<Vec<Contest>, AdapterError> {
            if self.listing_fails {
                return Err(AdapterError::Message("listing down".into()));
            }
            Ok(vec![Contest::new("Judge", "c1"), Contest::new("Judge", "c2")])
        }

        async fn solved_problems(
            &self,
            _window: &GradingWindow,
            contest: &Contest,
            _user: &User,
        ) -> Result<SolvedSet, AdapterError> {
            if self.failing_contest == Some(contest.contest_id.as_str()) {
                return Err(AdapterError::Message("standings unavailable".into()));
            }
            Ok(match contest.contest_id.as_str() {
                "c1" => SolvedSet::from(["P1".to_string(), "P2".to_string()]),
                _ => SolvedSet::new(),
            })
        }
    }

    struct NettingPractice;

    #[async_trait]
    impl PracticeAdapter for NettingPractice {
        fn platform(&self) -> &'static str {
            "Judge"
        }

        async fn solved_problems(
            &self,
            _window: &GradingWindow,
            _user: &User,
            already_credited: &ContestSolvedMap,
        ) -> Result<PracticeSolved, AdapterError> {
            let mut practice = PracticeSolved::default();
            practice.insert(Some("c1"), "P1");
            practice.insert(None, "P1");
            Ok(practice.net_of(already_credited))
        }
    }

    fn user() -> User {
        User::new("Ada", "abc123").with_handle("Judge", "ada")
    }

    #[tokio::test]
    async fn contest_then_practice_without_double_counting() {
        let reconciler = Reconciler::prepare(
            window(),
            vec![Box::new(FixedContests {
                listing_fails: false,
                failing_contest: None,
            }) as Box<dyn ContestAdapter>],
            vec![Box::new(NettingPractice) as Box<dyn PracticeAdapter>],
        )
        .await;
        let mut events = Vec::new();
        let ledger = reconciler.grade_user(&user(), &mut events).await.expect("graded");

        assert_eq!(ledger.phase, UserPhase::Done);
        assert_eq!(ledger.contest_points(), 2);
        assert_eq!(ledger.practice_points(), 1);
        let summary: Vec<_> = events
            .iter()
            .map(|e| (e.event_type, e.event_name.as_str(), e.points, e.is_exception))
            .collect();
        assert_eq!(
            summary,
            vec![
                (EventType::Contest, "c1", 2, false),
                (EventType::Contest, "c2", 0, false),
                (EventType::Practice, "", 1, false),
            ]
        );
    }

    #[tokio::test]
    async fn failing_contest_is_flagged_and_grading_continues() {
        let reconciler = Reconciler::prepare(
            window(),
            vec![Box::new(FixedContests {
                listing_fails: false,
                failing_contest: Some("c1"),
            }) as Box<dyn ContestAdapter>],
            vec![Box::new(NettingPractice) as Box<dyn PracticeAdapter>],
        )
        .await;
        let mut events = Vec::new();
        let ledger = reconciler.grade_user(&user(), &mut events).await.expect("graded");

        assert_eq!(ledger.exceptions, 1);
        assert_eq!(events.len(), 3);
        assert!(events[0].is_exception);
        assert_eq!(events[0].points, 0);
        assert_eq!(events[0].event_name, "c1");
        // c1's bucket is withheld; only the standalone solve counts
        assert_eq!(events[2].points, 1);
        assert_eq!(ledger.failed_contests["Judge"], BTreeSet::from(["c1".to_string()]));
        assert!(ledger.practice["Judge"].contest_bucket("c1").is_none());
    }

    struct QuietWeek;

    #[async_trait]
    impl ContestAdapter for QuietWeek {
        fn platform(&self) -> &'static str {
            "Quiet"
        }

        async fn list_contests(&self, _window: &GradingWindow) -> Result<Vec<Contest>, AdapterError> {
            Ok(Vec::new())
        }

        async fn solved_problems(
            &self,
            _window: &GradingWindow,
            _contest: &Contest,
            _user: &User,
        ) -> Result<SolvedSet, AdapterError> {
            Ok(SolvedSet::new())
        }
    }

    #[tokio::test]
    async fn platform_without_contests_still_records_a_zero() {
        let reconciler =
            Reconciler::prepare(window(), vec![Box::new(QuietWeek) as Box<dyn ContestAdapter>], Vec::new()).await;
        let mut events = Vec::new();
        reconciler.grade_user(&user(), &mut events).await.expect("graded");

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(
            (event.platform_name.as_str(), event.event_type, event.event_name.as_str(), event.points, event.is_exception),
            ("Quiet", EventType::Contest, "", 0, false)
        );
    }

    #[tokio::test]
    async fn failed_listing_flags_one_contest_event_per_user() {
        let reconciler = Reconciler::prepare(
            window(),
            vec![Box::new(FixedContests {
                listing_fails: true,
                failing_contest: None,
            }) as Box<dyn ContestAdapter>],
            Vec::new(),
        )
        .await;
        let mut events = Vec::new();
        reconciler.grade_user(&user(), &mut events).await.expect("graded");
        reconciler
            .grade_user(&User::new("Bo", "bo2"), &mut events)
            .await
            .expect("graded");

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.is_exception && e.event_name.is_empty()));
        assert_eq!(events[1].uni, "bo2");
    }
}
