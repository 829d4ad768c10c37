//! UVa Online Judge practice through the uHunt API
//! (`https://uhunt.onlinejudge.org/api`).

use std::sync::Arc;

use async_trait::async_trait;
use judgebook_core::{practice_solved, ContestSolvedMap, GradingWindow, PracticeSolved, Submission, User};
use judgebook_storage::RateLimitedFetcher;
use serde::Deserialize;
use tracing::info;

use crate::{from_epoch_seconds, require_handle, AdapterDeps, AdapterError, PracticeAdapter};

pub const PLATFORM: &str = "Uva";

const API_ROOT: &str = "https://uhunt.onlinejudge.org/api";
const VERDICT_ACCEPTED: i64 = 90;

#[derive(Debug, Deserialize)]
pub(crate) struct UserSubmissions {
    /// `[submission id, problem id, verdict, runtime, submit time, language, rank]`
    subs: Vec<Vec<i64>>,
}

pub(crate) fn parse_user_id(url: &str, body: &str) -> Result<u64, AdapterError> {
    let uid: u64 = body
        .trim()
        .parse()
        .map_err(|_| AdapterError::shape(url, format!("not a user id: {:?}", body.trim())))?;
    if uid == 0 {
        return Err(AdapterError::shape(url, "unknown uhunt user"));
    }
    Ok(uid)
}

pub(crate) fn to_submissions(url: &str, raw: UserSubmissions) -> Result<Vec<Submission>, AdapterError> {
    raw.subs
        .into_iter()
        .map(|row| {
            let [_, problem, verdict, _, submitted, ..] = row.as_slice() else {
                return Err(AdapterError::shape(url, format!("short submission row {row:?}")));
            };
            Ok(Submission {
                problem_id: problem.to_string(),
                contest_id: None,
                submitted_at: from_epoch_seconds(url, *submitted)?,
                accepted: *verdict == VERDICT_ACCEPTED,
            })
        })
        .collect()
}

pub struct UvaPractice {
    fetcher: Arc<RateLimitedFetcher>,
}

impl UvaPractice {
    pub fn new(deps: &AdapterDeps) -> Self {
        Self {
            fetcher: Arc::clone(&deps.fetcher),
        }
    }
}

#[async_trait]
impl PracticeAdapter for UvaPractice {
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
        let uid_url = format!("{API_ROOT}/uname2uid/{handle}");
        let uid = parse_user_id(&uid_url, &self.fetcher.get_text(&uid_url).await?)?;

        let subs_url = format!("{API_ROOT}/subs-user/{uid}");
        let raw: UserSubmissions = self.fetcher.get_json(&subs_url).await?;
        let submissions = to_submissions(&subs_url, raw)?;
        let practice = practice_solved(window, &submissions).net_of(already_credited);
        info!(handle, uid, practice = practice.count(), "uva practice solved");
        Ok(practice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{deps_with, week, ScriptedTransport};
    use judgebook_core::SolvedSet;

    // week 1 is 1642222800 ..= 1642827599
    const SUBS: &str = r#"{"name":"Felix","uname":"felix","subs":[
        [1001,36,90,12,1642300000,5,-1],
        [1002,37,70,0,1642300100,5,-1],
        [1003,38,90,44,1642000000,5,-1],
        [1004,36,90,10,1642400000,5,-1],
        [1005,1724,90,10,1642800000,3,-1]
    ]}"#;

    #[test]
    fn zero_uid_is_an_unknown_user() {
        assert!(parse_user_id("u", "0").is_err());
        assert!(parse_user_id("u", "<html>").is_err());
        assert_eq!(parse_user_id("u", "46232\n").expect("uid"), 46232);
    }

    #[tokio::test]
    async fn counts_distinct_accepted_problems_in_window() {
        let transport = ScriptedTransport::new()
            .route("https://uhunt.onlinejudge.org/api/uname2uid/felix", "46232")
            .route("https://uhunt.onlinejudge.org/api/subs-user/46232", SUBS);
        let adapter = UvaPractice::new(&deps_with(transport));
        let user = User::new("Felix", "fx1").with_handle(PLATFORM, "felix");

        let practice = adapter
            .solved_problems(&week(1), &user, &ContestSolvedMap::new())
            .await
            .expect("practice");
        assert_eq!(practice.standalone, SolvedSet::from(["1724".to_string(), "36".to_string()]));
    }

    #[tokio::test]
    async fn unknown_handle_fails() {
        let transport = ScriptedTransport::new().route("https://uhunt.onlinejudge.org/api/uname2uid/ghost", "0");
        let adapter = UvaPractice::new(&deps_with(transport));
        let user = User::new("Ghost", "g1").with_handle(PLATFORM, "ghost");
        let err = adapter
            .solved_problems(&week(1), &user, &ContestSolvedMap::new())
            .await
            .expect_err("unknown");
        assert!(matches!(err, AdapterError::UnexpectedShape { .. }));
    }
}
