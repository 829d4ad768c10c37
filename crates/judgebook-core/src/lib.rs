//! Core domain model for judgebook: course calendar, grading windows, users,
//! contests, solved sets and grading events.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "judgebook-core";

/// Distinct problem identifiers credited in one context.
pub type SolvedSet = BTreeSet<String>;

/// Contest id -> problems credited in that contest, for one (user, platform).
pub type ContestSolvedMap = BTreeMap<String, SolvedSet>;

const SECONDS_PER_WEEK: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalendarError {
    #[error("course must span at least one week")]
    EmptyCourse,
    #[error("week {week_num} is outside the course (valid weeks: 1..={num_weeks})")]
    WeekOutOfRange { week_num: u32, num_weeks: u32 },
    #[error("{at} is outside the course [{start}, {end}]")]
    OutsideCourse {
        at: DateTime<Utc>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Fixed table of week boundaries, anchored at the first week's start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseCalendar {
    first_week_start: DateTime<FixedOffset>,
    num_weeks: u32,
}

impl CourseCalendar {
    pub fn new(first_week_start: DateTime<FixedOffset>, num_weeks: u32) -> Result<Self, CalendarError> {
        if num_weeks == 0 {
            return Err(CalendarError::EmptyCourse);
        }
        Ok(Self {
            first_week_start,
            num_weeks,
        })
    }

    pub fn first_week_start(&self) -> DateTime<FixedOffset> {
        self.first_week_start
    }

    pub fn num_weeks(&self) -> u32 {
        self.num_weeks
    }

    fn boundary(&self, index: u32) -> DateTime<Utc> {
        (self.first_week_start + Duration::days(7 * i64::from(index))).with_timezone(&Utc)
    }

    /// Window for a 1-indexed week number.
    pub fn week(&self, week_num: u32) -> Result<GradingWindow, CalendarError> {
        if week_num == 0 || week_num > self.num_weeks {
            return Err(CalendarError::WeekOutOfRange {
                week_num,
                num_weeks: self.num_weeks,
            });
        }
        Ok(GradingWindow {
            week_num,
            start: self.boundary(week_num - 1),
            end: self.boundary(week_num) - Duration::seconds(1),
        })
    }

    pub fn week_containing(&self, at: DateTime<Utc>) -> Result<GradingWindow, CalendarError> {
        let start = self.boundary(0);
        let end = self.boundary(self.num_weeks) - Duration::seconds(1);
        if at < start || at > end {
            return Err(CalendarError::OutsideCourse { at, start, end });
        }
        let index = (at - start).num_seconds() / SECONDS_PER_WEEK;
        self.week(index as u32 + 1)
    }

    pub fn weeks(&self) -> impl Iterator<Item = GradingWindow> + '_ {
        (1..=self.num_weeks).filter_map(|week_num| self.week(week_num).ok())
    }
}

/// One grading week. Both ends are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradingWindow {
    pub week_num: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl GradingWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }

    /// Closed-interval overlap with `[start, end]`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start <= self.end && end >= self.start
    }
}

impl fmt::Display for GradingWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "week {} [{} .. {}]", self.week_num, self.start, self.end)
    }
}

/// Which grading week(s) a contest is credited to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContestCreditPolicy {
    /// Every week the contest's active range overlaps.
    #[default]
    Overlap,
    /// Only the week containing the contest start.
    StartInWindow,
    /// Only the week containing the contest end.
    EndInWindow,
}

impl ContestCreditPolicy {
    /// A contest with unknown end is treated as instantaneous at its start.
    pub fn admits(self, window: &GradingWindow, start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> bool {
        let end = end.unwrap_or(start).max(start);
        match self {
            Self::Overlap => window.overlaps(start, end),
            Self::StartInWindow => window.contains(start),
            Self::EndInWindow => window.contains(end),
        }
    }

    pub fn admits_contest(self, window: &GradingWindow, contest: &Contest) -> bool {
        match contest.start {
            Some(start) => self.admits(window, start, contest.end),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub display_name: String,
    pub primary_id: String,
    #[serde(default)]
    pub handles: BTreeMap<String, String>,
}

impl User {
    pub fn new(display_name: impl Into<String>, primary_id: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            primary_id: primary_id.into(),
            handles: BTreeMap::new(),
        }
    }

    pub fn with_handle(mut self, platform: impl Into<String>, handle: impl Into<String>) -> Self {
        self.handles.insert(platform.into(), handle.into());
        self
    }

    pub fn handle(&self, platform: &str) -> Option<&str> {
        self.handles.get(platform).map(String::as_str)
    }
}

/// Identity is `(platform, contest_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contest {
    pub platform: String,
    pub contest_id: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Contest {
    pub fn new(platform: impl Into<String>, contest_id: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            contest_id: contest_id.into(),
            start: None,
            end: None,
        }
    }

    pub fn with_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    /// Inclusive on both ends; unknown bounds do not restrict.
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| at >= start) && self.end.map_or(true, |end| at <= end)
    }
}

/// Normalized submission shape every adapter reduces upstream payloads to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub problem_id: String,
    pub contest_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub accepted: bool,
}

/// Problems credited to `contest`: accepted, tagged with the contest, and inside
/// both the grading window and the contest's active range.
pub fn contest_solved<'a, I>(window: &GradingWindow, contest: &Contest, submissions: I) -> SolvedSet
where
    I: IntoIterator<Item = &'a Submission>,
{
    submissions
        .into_iter()
        .filter(|s| s.accepted)
        .filter(|s| s.contest_id.as_deref() == Some(contest.contest_id.as_str()))
        .filter(|s| window.contains(s.submitted_at) && contest.is_active_at(s.submitted_at))
        .map(|s| s.problem_id.clone())
        .collect()
}

/// [`contest_solved`] for scoreboards that report solve times instead of
/// submissions. A solve with no known time counts only when the whole contest
/// lies inside the window.
pub fn timed_contest_solved<I, P>(window: &GradingWindow, contest: &Contest, solves: I) -> SolvedSet
where
    I: IntoIterator<Item = (P, Option<DateTime<Utc>>)>,
    P: Into<String>,
{
    let wholly_inside = matches!(
        (contest.start, contest.end),
        (Some(start), Some(end)) if window.contains(start) && window.contains(end)
    );
    solves
        .into_iter()
        .filter(|(_, at)| match at {
            Some(at) => window.contains(*at) && contest.is_active_at(*at),
            None => wholly_inside,
        })
        .map(|(problem, _)| problem.into())
        .collect()
}

/// Accepted in-window submissions bucketed by contest. Not yet net of contest credit.
pub fn practice_solved<'a, I>(window: &GradingWindow, submissions: I) -> PracticeSolved
where
    I: IntoIterator<Item = &'a Submission>,
{
    let mut solved = PracticeSolved::default();
    for submission in submissions {
        if submission.accepted && window.contains(submission.submitted_at) {
            solved.insert(submission.contest_id.as_deref(), submission.problem_id.clone());
        }
    }
    solved
}

/// Practice credit for one (user, platform), kept in per-contest buckets so it
/// can be netted against contest credit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PracticeSolved {
    pub standalone: SolvedSet,
    pub by_contest: BTreeMap<String, SolvedSet>,
}

impl PracticeSolved {
    pub fn insert(&mut self, contest_id: Option<&str>, problem_id: impl Into<String>) {
        match contest_id {
            Some(contest_id) => {
                self.by_contest
                    .entry(contest_id.to_string())
                    .or_default()
                    .insert(problem_id.into());
            }
            None => {
                self.standalone.insert(problem_id.into());
            }
        }
    }

    /// Drops every problem already credited to the same contest.
    pub fn net_of(mut self, credited: &ContestSolvedMap) -> Self {
        for (contest_id, problems) in self.by_contest.iter_mut() {
            if let Some(done) = credited.get(contest_id) {
                problems.retain(|problem| !done.contains(problem));
            }
        }
        self.by_contest.retain(|_, problems| !problems.is_empty());
        self
    }

    pub fn count(&self) -> usize {
        self.standalone.len() + self.by_contest.values().map(BTreeSet::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn contest_bucket(&self, contest_id: &str) -> Option<&SolvedSet> {
        self.by_contest.get(contest_id)
    }

    /// Flattened view; contest problems are qualified as `contest_id/problem`.
    pub fn problems(&self) -> SolvedSet {
        let mut out = self.standalone.clone();
        for (contest_id, problems) in &self.by_contest {
            out.extend(problems.iter().map(|p| format!("{contest_id}/{p}")));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Contest,
    Practice,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contest => "contest",
            Self::Practice => "practice",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only points decision. `points` is the raw solved count; multipliers
/// are applied when the log is aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradingEvent {
    pub curr_dt: DateTime<Utc>,
    pub week_num: u32,
    pub uni: String,
    pub platform_name: String,
    pub is_exception: bool,
    pub points: u32,
    pub event_type: EventType,
    #[serde(default)]
    pub event_name: String,
}

impl GradingEvent {
    pub fn solved(
        curr_dt: DateTime<Utc>,
        window: &GradingWindow,
        uni: &str,
        platform_name: &str,
        event_type: EventType,
        event_name: &str,
        solved_count: usize,
    ) -> Self {
        Self {
            curr_dt,
            week_num: window.week_num,
            uni: uni.to_string(),
            platform_name: platform_name.to_string(),
            is_exception: false,
            points: u32::try_from(solved_count).unwrap_or(u32::MAX),
            event_type,
            event_name: event_name.to_string(),
        }
    }

    pub fn exception(
        curr_dt: DateTime<Utc>,
        window: &GradingWindow,
        uni: &str,
        platform_name: &str,
        event_type: EventType,
        event_name: &str,
    ) -> Self {
        Self {
            curr_dt,
            week_num: window.week_num,
            uni: uni.to_string(),
            platform_name: platform_name.to_string(),
            is_exception: true,
            points: 0,
            event_type,
            event_name: event_name.to_string(),
        }
    }
}
