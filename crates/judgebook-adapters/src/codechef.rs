//! CodeChef through the undocumented endpoints its own site uses. Contest
//! standings and recent submissions arrive as HTML and are scraped.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone, Utc};
use judgebook_core::{
    practice_solved, timed_contest_solved, Contest, ContestCreditPolicy, ContestSolvedMap, GradingWindow,
    PracticeSolved, SolvedSet, Submission, User,
};
use judgebook_storage::RateLimitedFetcher;
use scraper::{ElementRef, Html};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::html::{first_attr, first_text, selector, text_of};
use crate::{past_window, require_handle, AdapterDeps, AdapterError, ContestAdapter, PracticeAdapter};

pub const PLATFORM: &str = "Codechef";

const SITE: &str = "https://www.codechef.com";
const CONTESTS_PER_PAGE: usize = 20;
/// Rank, user, score and penalty come before the per-problem columns.
const FIRST_PROBLEM_COLUMN: usize = 4;

#[derive(Debug, Deserialize)]
pub(crate) struct PastContests {
    status: String,
    #[serde(default)]
    contests: Vec<CodechefContest>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CodechefContest {
    contest_code: String,
    contest_start_date_iso: DateTime<FixedOffset>,
    #[serde(default)]
    contest_end_date_iso: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RecentSubmissions {
    max_page: u32,
    content: String,
}

fn past_contests_url(offset: usize) -> String {
    format!("{SITE}/api/list/contests/past?sort_by=START&sorting_order=desc&offset={offset}&mode=premium")
}

/// Division codes of a parent contest; the parent itself when it has none.
pub(crate) fn child_contest_codes(parent: &str, detail: &JsonValue) -> Vec<String> {
    let codes: Vec<String> = match detail.get("child_contests") {
        Some(JsonValue::Object(children)) => children
            .values()
            .filter_map(|child| child.get("contest_code").and_then(JsonValue::as_str))
            .map(ToString::to_string)
            .collect(),
        _ => Vec::new(),
    };
    if codes.is_empty() {
        vec![parent.to_string()]
    } else {
        codes
    }
}

/// Elapsed contest time shown on a solve, `H:MM` or `H:MM:SS`.
pub(crate) fn parse_elapsed(text: &str) -> Option<Duration> {
    let token = text.split_whitespace().find(|t| t.contains(':'))?;
    let parts: Vec<i64> = token.split(':').map(str::parse).collect::<Result<_, _>>().ok()?;
    match parts.as_slice() {
        [h, m] => Some(Duration::hours(*h) + Duration::minutes(*m)),
        [h, m, s] => Some(Duration::hours(*h) + Duration::minutes(*m) + Duration::seconds(*s)),
        _ => None,
    }
}

/// Solved problems in one user's row of a contest ranking table, with the
/// elapsed time of each solve when the cell shows one. A problem cell holding
/// a submission link is a solve.
pub(crate) fn parse_ranking(
    url: &str,
    html: &str,
    handle: &str,
) -> Result<Vec<(String, Option<Duration>)>, AdapterError> {
    let document = Html::parse_document(html);
    let header_sel = selector("table.dataTable > thead > tr > th")?;
    let row_sel = selector("table.dataTable > tbody > tr")?;
    let cell_sel = selector("td")?;
    let code_sel = selector("a > div:nth-child(2)")?;
    let solved_sel = selector("div > a")?;

    let problems: Vec<String> = document
        .select(&header_sel)
        .skip(FIRST_PROBLEM_COLUMN)
        .map(|th| first_text(th, &code_sel).unwrap_or_else(|| text_of(th)))
        .collect();

    let rows: Vec<ElementRef<'_>> = document.select(&row_sel).collect();
    let row = match rows.as_slice() {
        [] => return Ok(Vec::new()),
        [only] => *only,
        many => many
            .iter()
            .copied()
            .find(|row| {
                row.select(&cell_sel)
                    .any(|td| text_of(td).split_whitespace().any(|w| w.eq_ignore_ascii_case(handle)))
            })
            .ok_or_else(|| AdapterError::shape(url, format!("{} ranking rows, none for {handle}", many.len())))?,
    };

    Ok(row
        .select(&cell_sel)
        .skip(FIRST_PROBLEM_COLUMN)
        .zip(&problems)
        .filter_map(|(cell, problem)| {
            let link = cell.select(&solved_sel).next()?;
            Some((problem.clone(), parse_elapsed(&text_of(link))))
        })
        .collect())
}

/// "5 min ago" style times are relative to `now`; older ones are
/// `%I:%M %p %d/%m/%y` in IST.
pub(crate) fn parse_submission_time(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lower = text.to_ascii_lowercase();
    let amount = || -> Option<i64> {
        lower
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(char::is_ascii_digit)
            .collect::<String>()
            .parse()
            .ok()
    };
    if lower.contains("sec") {
        return Some(now - Duration::seconds(amount()?));
    }
    if lower.contains("min") {
        return Some(now - Duration::minutes(amount()?));
    }
    if lower.contains("hour") {
        return Some(now - Duration::hours(amount()?));
    }

    let ist = FixedOffset::east_opt(5 * 3600 + 30 * 60)?;
    let naive = NaiveDateTime::parse_from_str(text.trim(), "%I:%M %p %d/%m/%y").ok()?;
    ist.from_local_datetime(&naive)
        .single()
        .map(|t| t.with_timezone(&Utc))
}

/// `/problems/X` or `/CONTEST/problems/X` -> (problem, contest).
pub(crate) fn split_problem_link(href: &str) -> Option<(String, Option<String>)> {
    let path = href.split('?').next().unwrap_or(href);
    let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
    match parts.as_slice() {
        ["problems", problem] => Some((problem.to_string(), None)),
        [contest, "problems", problem] => Some((problem.to_string(), Some(contest.to_string()))),
        _ => None,
    }
}

pub(crate) fn parse_recent_table(url: &str, html: &str, now: DateTime<Utc>) -> Result<Vec<Submission>, AdapterError> {
    let fragment = Html::parse_fragment(html);
    let row_sel = selector("table.dataTable > tbody > tr")?;
    let cell_sel = selector("td")?;
    let link_sel = selector("a")?;
    let status_sel = selector("span")?;

    let mut out = Vec::new();
    for row in fragment.select(&row_sel) {
        let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
        let [time_cell, problem_cell, status_cell, ..] = cells.as_slice() else {
            return Err(AdapterError::shape(url, format!("recent row with {} cells", cells.len())));
        };
        let time_text = time_cell
            .value()
            .attr("title")
            .map(str::trim)
            .unwrap_or_default();
        let submitted_at = parse_submission_time(time_text, now)
            .ok_or_else(|| AdapterError::shape(url, format!("unparseable time {time_text:?}")))?;
        let href = first_attr(*problem_cell, &link_sel, "href")
            .ok_or_else(|| AdapterError::shape(url, "recent row without problem link"))?;
        let (problem_id, contest_id) = split_problem_link(&href)
            .ok_or_else(|| AdapterError::shape(url, format!("unexpected problem link {href}")))?;
        let status = first_attr(*status_cell, &status_sel, "title").unwrap_or_default();

        out.push(Submission {
            problem_id,
            contest_id,
            submitted_at,
            accepted: status.eq_ignore_ascii_case("accepted"),
        });
    }
    Ok(out)
}

pub struct CodechefContests {
    fetcher: Arc<RateLimitedFetcher>,
    policy: ContestCreditPolicy,
}

impl CodechefContests {
    pub fn new(deps: &AdapterDeps) -> Self {
        Self {
            fetcher: Arc::clone(&deps.fetcher),
            policy: deps.policy,
        }
    }

    async fn parent_contests(&self, window: &GradingWindow) -> Result<Vec<CodechefContest>, AdapterError> {
        let mut parents = Vec::new();
        let mut offset = 0;
        loop {
            let url = past_contests_url(offset);
            let page: PastContests = self.fetcher.get_json(&url).await?;
            if page.status != "success" {
                return Err(AdapterError::shape(&url, format!("status {}", page.status)));
            }
            let newest = page
                .contests
                .iter()
                .map(|c| c.contest_start_date_iso.with_timezone(&Utc))
                .max();
            let short_page = page.contests.len() < CONTESTS_PER_PAGE;
            for contest in page.contests {
                let start = contest.contest_start_date_iso.with_timezone(&Utc);
                let end = contest.contest_end_date_iso.map(|t| t.with_timezone(&Utc));
                if self.policy.admits(window, start, end) {
                    parents.push(contest);
                }
            }
            if short_page || past_window(window, newest) {
                break;
            }
            offset += CONTESTS_PER_PAGE;
        }
        Ok(parents)
    }
}

#[async_trait]
impl ContestAdapter for CodechefContests {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    async fn list_contests(&self, window: &GradingWindow) -> Result<Vec<Contest>, AdapterError> {
        let mut contests = Vec::new();
        for parent in self.parent_contests(window).await? {
            let url = format!("{SITE}/api/contests/{}", parent.contest_code);
            let detail: JsonValue = self.fetcher.get_json(&url).await?;
            if detail.get("status").and_then(JsonValue::as_str) != Some("success") {
                return Err(AdapterError::shape(&url, "child contest lookup failed"));
            }
            for code in child_contest_codes(&parent.contest_code, &detail) {
                debug!(parent = %parent.contest_code, child = %code, "codechef division");
                let mut contest = Contest::new(PLATFORM, code);
                contest.start = Some(parent.contest_start_date_iso.with_timezone(&Utc));
                contest.end = parent.contest_end_date_iso.map(|t| t.with_timezone(&Utc));
                contests.push(contest);
            }
        }
        debug!(count = contests.len(), "codechef contests in window");
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
            "{SITE}/rankings/{}?order=asc&search={handle}&sortBy=rank",
            contest.contest_id
        );
        let html = self.fetcher.get_text(&url).await?;
        let ranked = parse_ranking(&url, &html, handle)?;
        let timed = ranked.iter().map(|(problem, elapsed)| {
            let at = contest.start.zip(*elapsed).map(|(start, elapsed)| start + elapsed);
            (problem.as_str(), at)
        });
        let solved = timed_contest_solved(window, contest, timed);
        debug!(handle, contest = %contest.contest_id, ?solved, "codechef contest solved set");
        Ok(solved)
    }
}

pub struct CodechefPractice {
    fetcher: Arc<RateLimitedFetcher>,
}

impl CodechefPractice {
    pub fn new(deps: &AdapterDeps) -> Self {
        Self {
            fetcher: Arc::clone(&deps.fetcher),
        }
    }
}

#[async_trait]
impl PracticeAdapter for CodechefPractice {
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
        let mut page = 0;
        let mut max_page = None;

        while max_page.map_or(true, |max| page < max) {
            let url = format!("{SITE}/recent/user?page={page}&user_handle={handle}");
            let recent: RecentSubmissions = self.fetcher.get_json(&url).await?;
            max_page.get_or_insert(recent.max_page);
            let rows = parse_recent_table(&url, &recent.content, Utc::now())?;
            let newest = rows.iter().map(|s| s.submitted_at).max();
            submissions.extend(rows);
            if past_window(window, newest) {
                break;
            }
            page += 1;
        }

        let practice = practice_solved(window, &submissions).net_of(already_credited);
        info!(handle, practice = practice.count(), "codechef practice solved");
        Ok(practice)
    }
}
