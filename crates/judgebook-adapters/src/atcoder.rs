//! AtCoder through the kenkoooo AtCoder Problems API
//! (`https://github.com/kenkoooo/AtCoderProblems/blob/master/doc/api.md`).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use judgebook_core::{
    contest_solved, practice_solved, Contest, ContestCreditPolicy, ContestSolvedMap, GradingWindow, PracticeSolved,
    SolvedSet, Submission, User,
};
use judgebook_storage::RateLimitedFetcher;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{from_epoch_seconds, require_handle, AdapterDeps, AdapterError, ContestAdapter, PracticeAdapter, ResponseCache};

pub const PLATFORM: &str = "Atcoder";

const CONTESTS_URL: &str = "https://kenkoooo.com/atcoder/resources/contests.json";
const SUBMISSIONS_ROOT: &str = "https://kenkoooo.com/atcoder/atcoder-api/v3/user/submissions";
/// The submissions endpoint returns at most this many rows per call.
const SUBMISSIONS_PAGE_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub(crate) struct KenkooooContest {
    id: String,
    start_epoch_second: i64,
    duration_second: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct KenkooooSubmission {
    id: u64,
    epoch_second: i64,
    problem_id: String,
    contest_id: String,
    result: String,
}

fn submissions_url(handle: &str, from_second: i64) -> String {
    format!("{SUBMISSIONS_ROOT}?user={handle}&from_second={from_second}")
}

pub(crate) fn contests_in_window(
    contests: Vec<KenkooooContest>,
    window: &GradingWindow,
    policy: ContestCreditPolicy,
) -> Result<Vec<Contest>, AdapterError> {
    let mut admitted = Vec::new();
    for raw in contests {
        let start = from_epoch_seconds(CONTESTS_URL, raw.start_epoch_second)?;
        let end = start + Duration::seconds(raw.duration_second);
        if policy.admits(window, start, Some(end)) {
            admitted.push(Contest::new(PLATFORM, raw.id).with_range(start, end));
        }
    }
    Ok(admitted)
}

fn to_submission(url: &str, raw: KenkooooSubmission) -> Result<Submission, AdapterError> {
    Ok(Submission {
        submitted_at: from_epoch_seconds(url, raw.epoch_second)?,
        accepted: raw.result == "AC",
        problem_id: raw.problem_id,
        contest_id: Some(raw.contest_id),
    })
}

/// Every submission since the window start, following the endpoint's row
/// limit forward in time. A full page resumes from its last second, so rows
/// sharing that second are fetched again and dropped by id. Cached under the
/// first page's URL.
async fn submissions_since(
    fetcher: &RateLimitedFetcher,
    cache: &ResponseCache<Vec<Submission>>,
    handle: &str,
    window: &GradingWindow,
) -> Result<Arc<Vec<Submission>>, AdapterError> {
    let first_url = submissions_url(handle, window.start.timestamp());
    cache
        .get_or_fetch(&first_url, || async {
            let mut out = Vec::new();
            let mut seen = HashSet::new();
            let mut from_second = window.start.timestamp();
            loop {
                let url = submissions_url(handle, from_second);
                let page: Vec<KenkooooSubmission> = fetcher.get_json(&url).await?;
                let full_page = page.len() >= SUBMISSIONS_PAGE_LIMIT;
                let last_second = page.iter().map(|s| s.epoch_second).max();
                for raw in page {
                    if seen.insert(raw.id) {
                        out.push(to_submission(&url, raw)?);
                    }
                }
                match last_second {
                    Some(last) if full_page && last < window.end.timestamp() => {
                        from_second = if last > from_second {
                            last
                        } else {
                            warn!(handle, second = last, "a full page within one second, skipping past it");
                            last + 1
                        };
                    }
                    _ => break,
                }
            }
            debug!(handle, count = out.len(), "atcoder submissions fetched");
            Ok::<_, AdapterError>(out)
        })
        .await
}

pub struct AtcoderContests {
    fetcher: Arc<RateLimitedFetcher>,
    policy: ContestCreditPolicy,
    submissions: ResponseCache<Vec<Submission>>,
}

impl AtcoderContests {
    pub fn new(deps: &AdapterDeps) -> Self {
        Self {
            fetcher: Arc::clone(&deps.fetcher),
            policy: deps.policy,
            submissions: ResponseCache::new(),
        }
    }
}

#[async_trait]
impl ContestAdapter for AtcoderContests {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    async fn list_contests(&self, window: &GradingWindow) -> Result<Vec<Contest>, AdapterError> {
        let raw: Vec<KenkooooContest> = self.fetcher.get_json(CONTESTS_URL).await?;
        if raw.is_empty() {
            return Err(AdapterError::shape(CONTESTS_URL, "empty contest list"));
        }
        let contests = contests_in_window(raw, window, self.policy)?;
        debug!(count = contests.len(), "atcoder contests in window");
        Ok(contests)
    }

    /// Submissions after the contest ends are still tagged with it, so both the
    /// window and the contest range apply.
    async fn solved_problems(
        &self,
        window: &GradingWindow,
        contest: &Contest,
        user: &User,
    ) -> Result<SolvedSet, AdapterError> {
        let handle = require_handle(user, PLATFORM)?;
        let submissions = submissions_since(&self.fetcher, &self.submissions, handle, window).await?;
        let solved = contest_solved(window, contest, submissions.iter());
        debug!(handle, contest = %contest.contest_id, ?solved, "atcoder contest solved set");
        Ok(solved)
    }
}

pub struct AtcoderPractice {
    fetcher: Arc<RateLimitedFetcher>,
    submissions: ResponseCache<Vec<Submission>>,
}

impl AtcoderPractice {
    pub fn new(deps: &AdapterDeps) -> Self {
        Self {
            fetcher: Arc::clone(&deps.fetcher),
            submissions: ResponseCache::new(),
        }
    }
}

#[async_trait]
impl PracticeAdapter for AtcoderPractice {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    async fn solved_problems(
        &self,
        window: &GradingWindow,
        user: &User,
        already_credited: &ContestSolvedMap,
    ) -> Result<PracticeSolved, AdapterError> {
        let handle = require_handle(user, PLATFORM)?;
        let submissions = submissions_since(&self.fetcher, &self.submissions, handle, window).await?;
        let practice = practice_solved(window, submissions.iter()).net_of(already_credited);
        info!(handle, practice = practice.count(), "atcoder practice solved");
        Ok(practice)
    }
}
