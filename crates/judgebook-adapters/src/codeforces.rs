//! Codeforces via its public JSON API (`https://codeforces.com/apiHelp`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use judgebook_core::{
    contest_solved, practice_solved, Contest, ContestCreditPolicy, ContestSolvedMap, GradingWindow, PracticeSolved,
    SolvedSet, Submission, User,
};
use judgebook_storage::RateLimitedFetcher;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    from_epoch_seconds, past_window, require_handle, AdapterDeps, AdapterError, ContestAdapter, PracticeAdapter,
};

pub const PLATFORM: &str = "Codeforces";

const API_ROOT: &str = "https://codeforces.com/api";
const PAGE_SIZE: usize = 50;

#[derive(Debug, Deserialize)]
pub(crate) struct ApiEnvelope<T> {
    status: String,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    result: Option<T>,
}

impl<T> ApiEnvelope<T> {
    fn into_result(self, url: &str) -> Result<T, AdapterError> {
        if self.status != "OK" {
            return Err(AdapterError::shape(
                url,
                format!("status {} ({})", self.status, self.comment.unwrap_or_default()),
            ));
        }
        self.result
            .ok_or_else(|| AdapterError::shape(url, "missing result"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CfContest {
    id: i64,
    #[serde(default)]
    start_time_seconds: Option<i64>,
    #[serde(default)]
    duration_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CfSubmission {
    #[serde(default)]
    contest_id: Option<i64>,
    creation_time_seconds: i64,
    problem: CfProblem,
    #[serde(default)]
    verdict: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CfProblem {
    #[serde(default)]
    contest_id: Option<i64>,
    index: String,
}

pub(crate) fn contests_in_window(
    url: &str,
    contests: Vec<CfContest>,
    window: &GradingWindow,
    policy: ContestCreditPolicy,
) -> Result<Vec<Contest>, AdapterError> {
    let mut admitted = Vec::new();
    for raw in contests {
        let Some(start_secs) = raw.start_time_seconds else {
            continue;
        };
        let start = from_epoch_seconds(url, start_secs)?;
        let end = start + Duration::seconds(raw.duration_seconds.unwrap_or(0));
        if policy.admits(window, start, Some(end)) {
            admitted.push(Contest::new(PLATFORM, raw.id.to_string()).with_range(start, end));
        }
    }
    Ok(admitted)
}

pub(crate) fn to_submission(url: &str, raw: &CfSubmission) -> Result<Submission, AdapterError> {
    let owner = raw.problem.contest_id.or(raw.contest_id);
    let problem_id = match owner {
        Some(contest_id) => format!("{contest_id}{}", raw.problem.index),
        None => raw.problem.index.clone(),
    };
    Ok(Submission {
        problem_id,
        contest_id: raw.contest_id.map(|id| id.to_string()),
        submitted_at: from_epoch_seconds(url, raw.creation_time_seconds)?,
        accepted: raw.verdict.as_deref() == Some("OK"),
    })
}

pub struct CodeforcesContests {
    fetcher: Arc<RateLimitedFetcher>,
    policy: ContestCreditPolicy,
}

impl CodeforcesContests {
    pub fn new(deps: &AdapterDeps) -> Self {
        Self {
            fetcher: Arc::clone(&deps.fetcher),
            policy: deps.policy,
        }
    }
}

#[async_trait]
impl ContestAdapter for CodeforcesContests {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    async fn list_contests(&self, window: &GradingWindow) -> Result<Vec<Contest>, AdapterError> {
        let url = format!("{API_ROOT}/contest.list");
        let envelope: ApiEnvelope<Vec<CfContest>> = self.fetcher.get_json(&url).await?;
        let contests = contests_in_window(&url, envelope.into_result(&url)?, window, self.policy)?;
        debug!(count = contests.len(), "codeforces contests in window");
        Ok(contests)
    }

    async fn solved_problems(
        &self,
        window: &GradingWindow,
        contest: &Contest,
        user: &User,
    ) -> Result<SolvedSet, AdapterError> {
        let handle = require_handle(user, PLATFORM)?;
        let url = format!(
            "{API_ROOT}/contest.status?contestId={}&handle={handle}",
            contest.contest_id
        );
        let envelope: ApiEnvelope<Vec<CfSubmission>> = self.fetcher.get_json(&url).await?;
        let submissions = envelope
            .into_result(&url)?
            .iter()
            .map(|raw| to_submission(&url, raw))
            .collect::<Result<Vec<_>, _>>()?;
        let solved = contest_solved(window, contest, &submissions);
        debug!(handle, contest = %contest.contest_id, ?solved, "codeforces contest solved set");
        Ok(solved)
    }
}

pub struct CodeforcesPractice {
    fetcher: Arc<RateLimitedFetcher>,
}

impl CodeforcesPractice {
    pub fn new(deps: &AdapterDeps) -> Self {
        Self {
            fetcher: Arc::clone(&deps.fetcher),
        }
    }
}

#[async_trait]
impl PracticeAdapter for CodeforcesPractice {
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
        let mut submissions = Vec::new();
        let mut from = 1;

        // user.status is newest first
        loop {
            let url = format!("{API_ROOT}/user.status?handle={handle}&from={from}&count={PAGE_SIZE}");
            let envelope: ApiEnvelope<Vec<CfSubmission>> = self.fetcher.get_json(&url).await?;
            let page = envelope
                .into_result(&url)?
                .iter()
                .map(|raw| to_submission(&url, raw))
                .collect::<Result<Vec<_>, _>>()?;

            let newest = page.iter().map(|s| s.submitted_at).max();
            let short_page = page.len() < PAGE_SIZE;
            submissions.extend(page);
            if short_page || past_window(window, newest) {
                break;
            }
            from += PAGE_SIZE;
        }

        let practice = practice_solved(window, &submissions).net_of(already_credited);
        info!(handle, practice = practice.count(), "codeforces practice solved");
        Ok(practice)
    }
}
