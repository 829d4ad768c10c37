//! LeetCode contests. The ranking API cannot be searched by user, so whole
//! rankings are dumped to the ranking cache by `preprocess` and grading reads
//! those dumps.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use judgebook_core::{timed_contest_solved, Contest, ContestCreditPolicy, GradingWindow, SolvedSet, User};
use judgebook_storage::{CacheError, RankingCacheStore, RateLimitedFetcher};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::{
    from_epoch_seconds, require_handle, AdapterDeps, AdapterError, ContestAdapter, PreprocessSummary,
    PreprocessedContest, ResponseCache,
};

pub const PLATFORM: &str = "Leetcode";

const GRAPHQL_URL: &str = "https://leetcode.com/graphql";
const RANKINGS_PER_PAGE: u64 = 25;

/// An accepted contest submission as kept in a ranking dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedSolve {
    pub question_id: String,
    /// Epoch seconds of the accepted submission.
    pub date: i64,
}

/// username -> questions solved during the contest.
pub type RankingDump = BTreeMap<String, Vec<RankedSolve>>;

#[derive(Debug, Deserialize)]
pub(crate) struct GraphQlResponse {
    #[serde(default)]
    data: Option<AllContests>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AllContests {
    #[serde(rename = "allContests", default)]
    all_contests: Vec<LeetcodeContest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LeetcodeContest {
    title_slug: String,
    start_time: i64,
    duration: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RankingPage {
    #[serde(default)]
    user_num: u64,
    #[serde(default)]
    total_rank: Vec<RankEntry>,
    /// Parallel to `total_rank`: question id -> accepted submission.
    #[serde(default)]
    submissions: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RankEntry {
    username: String,
}

fn ranking_url(slug: &str, page: u64) -> String {
    format!("https://leetcode.com/contest/api/ranking/{slug}/?pagination={page}&region=global")
}

fn contests_query() -> JsonValue {
    json!({
        "operationName": null,
        "variables": {},
        "query": "{ allContests { title titleSlug startTime duration } }"
    })
}

/// Adds one ranking page to `dump`. Rankings are ordered by score, so the
/// first participant with no accepted submission ends the useful part.
pub(crate) fn absorb_page(dump: &mut RankingDump, page: &RankingPage) -> bool {
    for (idx, entry) in page.total_rank.iter().enumerate() {
        let solved: Vec<RankedSolve> = match page.submissions.get(idx) {
            Some(JsonValue::Object(by_question)) => by_question
                .iter()
                .filter_map(|(question_id, submission)| {
                    let date = submission.get("date").and_then(JsonValue::as_i64);
                    if date.is_none() {
                        warn!(user = %entry.username, %question_id, "ranking submission without a date");
                    }
                    Some(RankedSolve {
                        question_id: question_id.clone(),
                        date: date?,
                    })
                })
                .collect(),
            _ => Vec::new(),
        };
        let exhausted = solved.is_empty();
        dump.insert(entry.username.clone(), solved);
        if exhausted {
            return false;
        }
    }
    true
}

pub struct LeetcodeContests {
    fetcher: Arc<RateLimitedFetcher>,
    policy: ContestCreditPolicy,
    cache: RankingCacheStore,
    dumps: ResponseCache<RankingDump>,
}

impl LeetcodeContests {
    pub fn new(deps: &AdapterDeps) -> Self {
        Self {
            fetcher: Arc::clone(&deps.fetcher),
            policy: deps.policy,
            cache: deps.cache.clone(),
            dumps: ResponseCache::new(),
        }
    }

    async fn download_ranking(&self, slug: &str) -> Result<RankingDump, AdapterError> {
        let mut dump = RankingDump::new();
        let mut page = 1;
        let mut total_pages: Option<u64> = None;

        while total_pages.map_or(true, |total| page <= total) {
            let url = ranking_url(slug, page);
            let ranking: RankingPage = self.fetcher.get_json(&url).await?;
            if ranking.total_rank.is_empty() || ranking.submissions.is_empty() {
                debug!(%url, "empty ranking page");
                break;
            }
            let total = *total_pages.get_or_insert(ranking.user_num.div_ceil(RANKINGS_PER_PAGE));
            debug!(slug, page, total, "leetcode ranking page");
            if !absorb_page(&mut dump, &ranking) {
                break;
            }
            page += 1;
        }
        Ok(dump)
    }

    fn missing(&self, week_num: u32, contest_id: &str) -> AdapterError {
        AdapterError::MissingPreprocessed {
            platform: PLATFORM.to_string(),
            contest_id: contest_id.to_string(),
            path: self.cache.path_for(PLATFORM, week_num, contest_id),
        }
    }
}

#[async_trait]
impl ContestAdapter for LeetcodeContests {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    async fn list_contests(&self, window: &GradingWindow) -> Result<Vec<Contest>, AdapterError> {
        let response: GraphQlResponse = self.fetcher.post_json(GRAPHQL_URL, &contests_query()).await?;
        let raw = response
            .data
            .map(|d| d.all_contests)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AdapterError::shape(GRAPHQL_URL, "no contests in allContests"))?;

        let mut contests = Vec::new();
        for contest in raw {
            let start = from_epoch_seconds(GRAPHQL_URL, contest.start_time)?;
            let end = start + Duration::seconds(contest.duration);
            if self.policy.admits(window, start, Some(end)) {
                contests.push(Contest::new(PLATFORM, contest.title_slug).with_range(start, end));
            }
        }
        debug!(count = contests.len(), "leetcode contests in window");
        Ok(contests)
    }

    async fn solved_problems(
        &self,
        window: &GradingWindow,
        contest: &Contest,
        user: &User,
    ) -> Result<SolvedSet, AdapterError> {
        let handle = require_handle(user, PLATFORM)?;
        let path = self.cache.path_for(PLATFORM, window.week_num, &contest.contest_id);
        let dump = self
            .dumps
            .get_or_fetch(&path.to_string_lossy(), || async {
                match self
                    .cache
                    .load::<RankingDump>(PLATFORM, window.week_num, &contest.contest_id)
                    .await
                {
                    Ok(dump) => Ok(dump),
                    Err(CacheError::Missing { .. }) => Err(self.missing(window.week_num, &contest.contest_id)),
                    Err(other) => Err(other.into()),
                }
            })
            .await?;

        match dump.get(handle) {
            Some(solved) => {
                let mut timed = Vec::with_capacity(solved.len());
                for solve in solved {
                    let at = from_epoch_seconds(&path.to_string_lossy(), solve.date)?;
                    timed.push((solve.question_id.as_str(), Some(at)));
                }
                Ok(timed_contest_solved(window, contest, timed))
            }
            None => {
                debug!(handle, contest = %contest.contest_id, "not in leetcode ranking dump");
                Ok(SolvedSet::new())
            }
        }
    }

    fn requires_preprocessing(&self) -> bool {
        true
    }

    async fn preprocess(&self, window: &GradingWindow) -> Result<PreprocessSummary, AdapterError> {
        let mut summary = PreprocessSummary::empty(PLATFORM, window.week_num);
        for contest in self.list_contests(window).await? {
            let id = contest.contest_id;
            if self.cache.exists(PLATFORM, window.week_num, &id).await? {
                info!(contest = %id, week = window.week_num, "ranking already cached, skipping");
                summary.contests.push(PreprocessedContest {
                    path: self.cache.path_for(PLATFORM, window.week_num, &id),
                    contest_id: id,
                    users: 0,
                    skipped: true,
                });
                continue;
            }

            info!(contest = %id, "pre-processing leetcode ranking");
            let dump = self.download_ranking(&id).await?;
            let stored = self.cache.store_json(PLATFORM, window.week_num, &id, &dump).await?;
            info!(
                contest = %id,
                users = dump.len(),
                path = %stored.path.display(),
                sha256 = %stored.content_hash,
                "cached leetcode ranking"
            );
            summary.contests.push(PreprocessedContest {
                contest_id: id,
                path: stored.path,
                users: dump.len(),
                skipped: stored.deduplicated,
            });
        }
        Ok(summary)
    }

    async fn verify_preprocessed(&self, window: &GradingWindow, contests: &[Contest]) -> Result<(), AdapterError> {
        for contest in contests {
            if !self.cache.exists(PLATFORM, window.week_num, &contest.contest_id).await? {
                return Err(self.missing(window.week_num, &contest.contest_id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{deps_with_cache, week, ScriptedTransport};
    use tempfile::tempdir;

    const CONTESTS: &str = r#"{"data":{"allContests":[
        {"containsPremium":false,"title":"Weekly Contest 278","titleSlug":"weekly-contest-278","startTime":1643509800,"duration":5400,"isVirtual":false},
        {"containsPremium":false,"title":"Weekly Contest 276","titleSlug":"weekly-contest-276","startTime":1642300200,"duration":5400,"isVirtual":false},
        {"containsPremium":false,"title":"Weekly Contest 275","titleSlug":"weekly-contest-275","startTime":1641695400,"duration":5400,"isVirtual":false}
    ]}}"#;

    fn ranking_page(users: &[(&str, &[&str])], user_num: u64) -> String {
        let ranks: Vec<String> = users
            .iter()
            .map(|(name, _)| format!(r#"{{"username":"{name}","score":3}}"#))
            .collect();
        let subs: Vec<String> = users
            .iter()
            .map(|(_, solved)| {
                let entries: Vec<String> = solved
                    .iter()
                    .map(|q| format!(r#""{q}":{{"question_id":{q},"status":10,"date":1642301000}}"#))
                    .collect();
                format!("{{{}}}", entries.join(","))
            })
            .collect();
        format!(
            r#"{{"is_past":true,"user_num":{user_num},"total_rank":[{}],"submissions":[{}],"questions":[]}}"#,
            ranks.join(","),
            subs.join(",")
        )
    }

    fn first_page() -> String {
        let names: Vec<String> = (0..25).map(|i| format!("user{i}")).collect();
        let users: Vec<(&str, &[&str])> = names.iter().map(|n| (n.as_str(), &["2261"][..])).collect();
        ranking_page(&users, 30)
    }

    fn transport() -> Arc<ScriptedTransport> {
        ScriptedTransport::new()
            .route(GRAPHQL_URL, CONTESTS)
            .route(&ranking_url("weekly-contest-276", 1), first_page())
            .route(
                &ranking_url("weekly-contest-276", 2),
                ranking_page(
                    &[("lee215", &["2261", "2274"][..]), ("idle", &[][..]), ("never", &["1"][..])],
                    30,
                ),
            )
    }

    #[tokio::test]
    async fn preprocess_dumps_ranking_then_grading_reads_it() {
        let dir = tempdir().expect("tempdir");
        let transport = transport();
        let adapter = LeetcodeContests::new(&deps_with_cache(transport.clone(), dir.path()));
        let window = week(1);

        let summary = adapter.preprocess(&window).await.expect("preprocess");
        assert_eq!(summary.contests.len(), 1);
        let done = &summary.contests[0];
        assert_eq!(done.contest_id, "weekly-contest-276");
        assert!(!done.skipped);
        // 25 + lee215 + idle; "never" is past the first empty participant
        assert_eq!(done.users, 27);
        assert!(done.path.ends_with("Leetcode_1_weekly-contest-276.json"));

        let contests = adapter.list_contests(&window).await.expect("contests");
        adapter.verify_preprocessed(&window, &contests).await.expect("verified");
        let user = User::new("Lee", "lee1").with_handle(PLATFORM, "lee215");
        let solved = adapter.solved_problems(&window, &contests[0], &user).await.expect("solved");
        assert_eq!(solved, SolvedSet::from(["2261".to_string(), "2274".to_string()]));

        let stranger = User::new("S", "s1").with_handle(PLATFORM, "never");
        assert!(adapter
            .solved_problems(&window, &contests[0], &stranger)
            .await
            .expect("absent")
            .is_empty());
    }

    #[tokio::test]
    async fn second_preprocess_leaves_existing_dump() {
        let dir = tempdir().expect("tempdir");
        let transport = transport();
        let adapter = LeetcodeContests::new(&deps_with_cache(transport.clone(), dir.path()));
        let window = week(1);

        adapter.preprocess(&window).await.expect("first");
        let again = adapter.preprocess(&window).await.expect("second");
        assert!(again.contests[0].skipped);
        assert_eq!(transport.calls_to(&ranking_url("weekly-contest-276", 1)), 1);
    }

    #[tokio::test]
    async fn grading_without_dump_is_a_missing_preprocess_error() {
        let dir = tempdir().expect("tempdir");
        let adapter = LeetcodeContests::new(&deps_with_cache(transport(), dir.path()));
        let window = week(1);
        let contests = adapter.list_contests(&window).await.expect("contests");

        let err = adapter
            .verify_preprocessed(&window, &contests)
            .await
            .expect_err("nothing cached");
        assert!(matches!(err, AdapterError::MissingPreprocessed { .. }));

        let user = User::new("Lee", "lee1").with_handle(PLATFORM, "lee215");
        let err = adapter
            .solved_problems(&window, &contests[0], &user)
            .await
            .expect_err("nothing cached");
        assert!(matches!(err, AdapterError::MissingPreprocessed { .. }));
    }

    #[test]
    fn absorb_stops_at_first_participant_without_submissions() {
        let page: RankingPage = serde_json::from_str(&ranking_page(&[("a", &["1"][..]), ("b", &[][..]), ("c", &["2"][..])], 3))
            .expect("page");
        let mut dump = RankingDump::new();
        assert!(!absorb_page(&mut dump, &page));
        assert_eq!(dump.len(), 2);
        assert!(dump["b"].is_empty());
        assert_eq!(
            dump["a"],
            vec![RankedSolve {
                question_id: "1".to_string(),
                date: 1642301000
            }]
        );
    }

    #[tokio::test]
    async fn dumped_solves_outside_the_window_are_not_credited() {
        let dir = tempdir().expect("tempdir");
        let deps = deps_with_cache(ScriptedTransport::new(), dir.path());
        let adapter = LeetcodeContests::new(&deps);
        // a contest running across the end of week 1 (2022-01-22T04:59:59Z)
        let start = from_epoch_seconds("t", 1642820400).expect("start");
        let contest = Contest::new(PLATFORM, "late-night").with_range(start, start + Duration::hours(3));
        let mut dump = RankingDump::new();
        dump.insert(
            "lee215".to_string(),
            vec![
                RankedSolve {
                    question_id: "1".to_string(),
                    date: 1642820400 + 600,
                },
                RankedSolve {
                    question_id: "2".to_string(),
                    date: 1642820400 + 7200,
                },
            ],
        );
        deps.cache
            .store_json(PLATFORM, 1, "late-night", &dump)
            .await
            .expect("store week 1");
        deps.cache
            .store_json(PLATFORM, 2, "late-night", &dump)
            .await
            .expect("store week 2");

        let user = User::new("Lee", "lee1").with_handle(PLATFORM, "lee215");
        let week1 = adapter.solved_problems(&week(1), &contest, &user).await.expect("week 1");
        let week2 = adapter.solved_problems(&week(2), &contest, &user).await.expect("week 2");
        assert_eq!(week1, SolvedSet::from(["1".to_string()]));
        assert_eq!(week2, SolvedSet::from(["2".to_string()]));
    }
}
