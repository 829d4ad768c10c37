//! DMOJ via its v2 API. Contest details include the full rankings, so one
//! fetch per contest serves every user.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use judgebook_core::{timed_contest_solved, Contest, ContestCreditPolicy, GradingWindow, SolvedSet, User};
use judgebook_storage::RateLimitedFetcher;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{past_window, require_handle, AdapterDeps, AdapterError, ContestAdapter, ResponseCache};

pub const PLATFORM: &str = "Dmoj";

const API_ROOT: &str = "https://dmoj.ca/api/v2";

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub(crate) struct Envelope<T> {
    #[serde(default)]
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ObjectPage<T> {
    objects: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SingleObject<T> {
    object: T,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DmojContest {
    key: String,
    start_time: DateTime<FixedOffset>,
    #[serde(default)]
    end_time: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContestDetail {
    #[serde(default)]
    start_time: Option<DateTime<FixedOffset>>,
    problems: Vec<DmojProblem>,
    rankings: Vec<DmojRanking>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DmojProblem {
    code: String,
    points: f64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DmojRanking {
    user: String,
    /// Participation start; differs from the contest start in windowed contests.
    #[serde(default)]
    start_time: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    is_disqualified: bool,
    #[serde(default)]
    solutions: Vec<Option<DmojSolution>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DmojSolution {
    /// Seconds from the participation start.
    #[serde(default)]
    time: Option<f64>,
    points: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartialCredit {
    pub problem: String,
    pub points: f64,
    pub out_of: f64,
}

/// One participant's row of a contest scoreboard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Standing {
    /// Fully solved problems and when they were solved, if known.
    pub solved: BTreeMap<String, Option<DateTime<Utc>>>,
    pub partial: Vec<PartialCredit>,
    pub disqualified: bool,
}

/// Full points on a problem counts as solved; partial points are kept for logging only.
pub(crate) fn standings(detail: &ContestDetail, contest_start: Option<DateTime<Utc>>) -> HashMap<String, Standing> {
    let default_start = detail.start_time.map(|t| t.with_timezone(&Utc)).or(contest_start);
    let mut out = HashMap::with_capacity(detail.rankings.len());
    for row in &detail.rankings {
        let started = row.start_time.map(|t| t.with_timezone(&Utc)).or(default_start);
        let mut standing = Standing {
            disqualified: row.is_disqualified,
            ..Standing::default()
        };
        for (problem, solution) in detail.problems.iter().zip(&row.solutions) {
            let Some(solution) = solution else {
                continue;
            };
            if solution.points >= problem.points {
                let at = started
                    .zip(solution.time)
                    .map(|(start, secs)| start + Duration::milliseconds((secs * 1000.0) as i64));
                standing.solved.insert(problem.code.clone(), at);
            } else if solution.points > 0.0 {
                standing.partial.push(PartialCredit {
                    problem: problem.code.clone(),
                    points: solution.points,
                    out_of: problem.points,
                });
            }
        }
        out.insert(row.user.clone(), standing);
    }
    out
}

/// The list is oldest first; walk it newest first and stop once contests
/// start before the window.
pub(crate) fn contests_in_window(
    mut contests: Vec<DmojContest>,
    window: &GradingWindow,
    policy: ContestCreditPolicy,
) -> Vec<Contest> {
    contests.reverse();
    let mut admitted = Vec::new();
    for raw in contests {
        let start = raw.start_time.with_timezone(&Utc);
        let end = raw.end_time.map(|t| t.with_timezone(&Utc));
        if policy.admits(window, start, end) {
            let mut contest = Contest::new(PLATFORM, raw.key);
            contest.start = Some(start);
            contest.end = end;
            admitted.push(contest);
        }
        if end.map_or(true, |end| end < window.start) && past_window(window, Some(start)) {
            debug!(before = %start, "remaining dmoj contests predate the window");
            break;
        }
    }
    admitted
}

pub struct DmojContests {
    fetcher: Arc<RateLimitedFetcher>,
    policy: ContestCreditPolicy,
    standings: ResponseCache<HashMap<String, Standing>>,
}

impl DmojContests {
    pub fn new(deps: &AdapterDeps) -> Self {
        Self {
            fetcher: Arc::clone(&deps.fetcher),
            policy: deps.policy,
            standings: ResponseCache::new(),
        }
    }
}

#[async_trait]
impl ContestAdapter for DmojContests {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    async fn list_contests(&self, window: &GradingWindow) -> Result<Vec<Contest>, AdapterError> {
        let mut all = Vec::new();
        let mut page = 1;
        loop {
            let url = format!("{API_ROOT}/contests?is_rated=True&page={page}");
            let envelope: Envelope<ObjectPage<DmojContest>> = self.fetcher.get_json(&url).await?;
            let data = envelope
                .data
                .ok_or_else(|| AdapterError::shape(&url, "missing data"))?;
            all.extend(data.objects);
            if !data.has_more {
                break;
            }
            page += 1;
        }
        if all.is_empty() {
            return Err(AdapterError::shape(format!("{API_ROOT}/contests"), "no rated contests"));
        }
        let contests = contests_in_window(all, window, self.policy);
        debug!(count = contests.len(), "dmoj contests in window");
        Ok(contests)
    }

    async fn solved_problems(
        &self,
        window: &GradingWindow,
        contest: &Contest,
        user: &User,
    ) -> Result<SolvedSet, AdapterError> {
        let handle = require_handle(user, PLATFORM)?;
        let url = format!("{API_ROOT}/contest/{}", contest.contest_id);
        let standings = self
            .standings
            .get_or_fetch(&url, || async {
                let envelope: Envelope<SingleObject<ContestDetail>> = self.fetcher.get_json(&url).await?;
                let detail = envelope
                    .data
                    .ok_or_else(|| AdapterError::shape(&url, "missing contest object"))?
                    .object;
                let table = standings(&detail, contest.start);
                info!(contest = %contest.contest_id, participants = table.len(), "cached dmoj standings");
                Ok::<_, AdapterError>(table)
            })
            .await?;

        let Some(standing) = standings.get(handle) else {
            debug!(handle, contest = %contest.contest_id, "not in dmoj rankings");
            return Ok(SolvedSet::new());
        };
        if standing.disqualified {
            warn!(handle, contest = %contest.contest_id, "disqualified on dmoj, no credit");
            return Ok(SolvedSet::new());
        }
        if !standing.partial.is_empty() {
            warn!(
                handle,
                contest = %contest.contest_id,
                partial = ?standing.partial,
                "partial credit on dmoj is not counted"
            );
        }
        let solved = timed_contest_solved(
            window,
            contest,
            standing.solved.iter().map(|(problem, at)| (problem.as_str(), *at)),
        );
        if solved.len() < standing.solved.len() {
            debug!(
                handle,
                contest = %contest.contest_id,
                credited = solved.len(),
                scored = standing.solved.len(),
                "dmoj solves outside the window are not counted"
            );
        }
        Ok(solved)
    }
}
