//! Platform adapter contracts and the judge-specific implementations.
//!
//! Contest adapters enumerate a week's contests and report what a user solved
//! inside each one. Practice adapters report everything else a user solved in
//! the week, net of what was already credited through contests.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use judgebook_core::{
    Contest, ContestCreditPolicy, ContestSolvedMap, GradingWindow, PracticeSolved, SolvedSet, User,
};
use judgebook_storage::{CacheError, FetchError, RankingCacheStore, RateLimitedFetcher};
use thiserror::Error;

pub mod atcoder;
mod cache;
pub mod codechef;
pub mod codeforces;
pub mod dmoj;
mod html;
pub mod leetcode;
pub mod spoj;
pub mod uva;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::ResponseCache;

pub const CRATE_NAME: &str = "judgebook-adapters";

/// Platforms with a contest adapter, in grading order.
pub const CONTEST_PLATFORMS: &[&str] = &[
    codeforces::PLATFORM,
    atcoder::PLATFORM,
    dmoj::PLATFORM,
    leetcode::PLATFORM,
    codechef::PLATFORM,
];

/// Platforms with a practice adapter, in grading order.
pub const PRACTICE_PLATFORMS: &[&str] = &[
    codeforces::PLATFORM,
    atcoder::PLATFORM,
    codechef::PLATFORM,
    spoj::PLATFORM,
    uva::PLATFORM,
];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("user {user} has no {platform} handle")]
    MissingHandle { platform: String, user: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected response from {url}: {detail}")]
    UnexpectedShape { url: String, detail: String },
    #[error("{platform} contest {contest_id} has not been pre-processed (expected {})", .path.display())]
    MissingPreprocessed {
        platform: String,
        contest_id: String,
        path: PathBuf,
    },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub(crate) fn shape(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::UnexpectedShape {
            url: url.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessedContest {
    pub contest_id: String,
    pub path: PathBuf,
    pub users: usize,
    /// A dump already existed and was left untouched.
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessSummary {
    pub platform: String,
    pub week_num: u32,
    pub contests: Vec<PreprocessedContest>,
}

impl PreprocessSummary {
    pub fn empty(platform: &str, week_num: u32) -> Self {
        Self {
            platform: platform.to_string(),
            week_num,
            contests: Vec::new(),
        }
    }
}

#[async_trait]
pub trait ContestAdapter: Send + Sync {
    fn platform(&self) -> &'static str;

    /// Contests admitted to `window` by the configured credit policy.
    async fn list_contests(&self, window: &GradingWindow) -> Result<Vec<Contest>, AdapterError>;

    async fn solved_problems(
        &self,
        window: &GradingWindow,
        contest: &Contest,
        user: &User,
    ) -> Result<SolvedSet, AdapterError>;

    fn requires_preprocessing(&self) -> bool {
        false
    }

    async fn preprocess(&self, window: &GradingWindow) -> Result<PreprocessSummary, AdapterError> {
        Ok(PreprocessSummary::empty(self.platform(), window.week_num))
    }

    /// Fails if any of `contests` lacks the data `preprocess` would have written.
    async fn verify_preprocessed(
        &self,
        _window: &GradingWindow,
        _contests: &[Contest],
    ) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[async_trait]
pub trait PracticeAdapter: Send + Sync {
    fn platform(&self) -> &'static str;

    async fn solved_problems(
        &self,
        window: &GradingWindow,
        user: &User,
        already_credited: &ContestSolvedMap,
    ) -> Result<PracticeSolved, AdapterError>;
}

/// What an adapter needs from the run: the platform's fetcher (shared by its
/// contest and practice adapters), the credit policy and the ranking cache.
#[derive(Debug, Clone)]
pub struct AdapterDeps {
    pub fetcher: Arc<RateLimitedFetcher>,
    pub policy: ContestCreditPolicy,
    pub cache: RankingCacheStore,
}

pub fn contest_adapter_for(platform: &str, deps: &AdapterDeps) -> Option<Box<dyn ContestAdapter>> {
    match platform {
        codeforces::PLATFORM => Some(Box::new(codeforces::CodeforcesContests::new(deps))),
        atcoder::PLATFORM => Some(Box::new(atcoder::AtcoderContests::new(deps))),
        dmoj::PLATFORM => Some(Box::new(dmoj::DmojContests::new(deps))),
        leetcode::PLATFORM => Some(Box::new(leetcode::LeetcodeContests::new(deps))),
        codechef::PLATFORM => Some(Box::new(codechef::CodechefContests::new(deps))),
        _ => None,
    }
}

pub fn practice_adapter_for(platform: &str, deps: &AdapterDeps) -> Option<Box<dyn PracticeAdapter>> {
    match platform {
        codeforces::PLATFORM => Some(Box::new(codeforces::CodeforcesPractice::new(deps))),
        atcoder::PLATFORM => Some(Box::new(atcoder::AtcoderPractice::new(deps))),
        codechef::PLATFORM => Some(Box::new(codechef::CodechefPractice::new(deps))),
        spoj::PLATFORM => Some(Box::new(spoj::SpojPractice::new(deps))),
        uva::PLATFORM => Some(Box::new(uva::UvaPractice::new(deps))),
        _ => None,
    }
}

/// Every platform name with at least one adapter, sorted.
pub fn known_platforms() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = CONTEST_PLATFORMS
        .iter()
        .chain(PRACTICE_PLATFORMS)
        .copied()
        .collect();
    names.sort_unstable();
    names.dedup();
    names
}

pub(crate) fn require_handle<'a>(user: &'a User, platform: &str) -> Result<&'a str, AdapterError> {
    user.handle(platform)
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| AdapterError::MissingHandle {
            platform: platform.to_string(),
            user: user.primary_id.clone(),
        })
}

pub(crate) fn from_epoch_seconds(url: &str, secs: i64) -> Result<DateTime<Utc>, AdapterError> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| AdapterError::shape(url, format!("timestamp {secs} out of range")))
}

/// Newest-first listings: once a page's newest item predates the window,
/// later pages cannot contain anything in it.
pub(crate) fn past_window(window: &GradingWindow, newest_on_page: Option<DateTime<Utc>>) -> bool {
    newest_on_page.map_or(true, |newest| newest < window.start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{deps_with, ScriptedTransport};

    #[test]
    fn contest_and_practice_adapters_share_platform_names() {
        let deps = deps_with(ScriptedTransport::new());
        for name in CONTEST_PLATFORMS {
            let adapter = contest_adapter_for(name, &deps).expect("contest adapter registered");
            assert_eq!(adapter.platform(), *name);
            if let Some(practice) = practice_adapter_for(name, &deps) {
                assert_eq!(practice.platform(), adapter.platform());
            }
        }
        for name in PRACTICE_PLATFORMS {
            let adapter = practice_adapter_for(name, &deps).expect("practice adapter registered");
            assert_eq!(adapter.platform(), *name);
        }
        assert!(contest_adapter_for("Topcoder", &deps).is_none());
        assert!(practice_adapter_for("codeforces", &deps).is_none());
    }

    #[test]
    fn known_platforms_are_deduplicated() {
        assert_eq!(
            known_platforms(),
            vec!["Atcoder", "Codechef", "Codeforces", "Dmoj", "Leetcode", "Spoj", "Uva"]
        );
    }

    #[test]
    fn only_leetcode_needs_preprocessing() {
        let deps = deps_with(ScriptedTransport::new());
        let needing: Vec<_> = CONTEST_PLATFORMS
            .iter()
            .filter(|name| {
                contest_adapter_for(name, &deps)
                    .map(|a| a.requires_preprocessing())
                    .unwrap_or(false)
            })
            .collect();
        assert_eq!(needing, vec![&leetcode::PLATFORM]);
    }

    #[test]
    fn blank_handles_are_missing() {
        let user = User::new("Ada", "abc123").with_handle("Spoj", "  ");
        assert!(matches!(
            require_handle(&user, "Spoj"),
            Err(AdapterError::MissingHandle { .. })
        ));
        assert!(require_handle(&user, "Uva").is_err());
    }
}
