//! SPOJ practice, scraped from the public status pages. SPOJ has no contest
//! grouping worth crediting, so everything is standalone.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use judgebook_core::{practice_solved, ContestSolvedMap, GradingWindow, PracticeSolved, Submission, User};
use judgebook_storage::RateLimitedFetcher;
use scraper::{ElementRef, Html};
use tracing::{debug, info};

use crate::html::{first_attr, first_text, selector};
use crate::{past_window, require_handle, AdapterDeps, AdapterError, PracticeAdapter};

pub const PLATFORM: &str = "Spoj";

const STATUS_ROOT: &str = "https://www.spoj.com/status";
const ROWS_PER_PAGE: usize = 20;
/// Real status rows have seven cells; wider rows mean SPOJ served some other
/// table (it does this past the last page).
const STATUS_COLUMNS: usize = 7;
/// `status` attribute SPOJ puts on accepted result cells.
const ACCEPTED_STATUS: &str = "15";

fn status_url(handle: &str, start: usize) -> String {
    format!("{STATUS_ROOT}/{handle}/all/start={start}")
}

#[derive(Debug, PartialEq)]
pub(crate) enum StatusPage {
    Rows(Vec<Submission>),
    /// Not a status table; nothing further to read.
    Bogus,
}

pub(crate) fn parse_status_page(url: &str, html: &str) -> Result<StatusPage, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = selector("table > tbody > tr")?;
    let cell_sel = selector("td")?;
    let date_sel = selector("span")?;
    let link_sel = selector("a")?;

    let mut out = Vec::new();
    for row in document.select(&row_sel) {
        let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
        if cells.len() > STATUS_COLUMNS {
            debug!(url, cells = cells.len(), "not a spoj status table");
            return Ok(StatusPage::Bogus);
        }
        let [_, date_cell, problem_cell, result_cell, ..] = cells.as_slice() else {
            return Err(AdapterError::shape(url, format!("status row with {} cells", cells.len())));
        };
        let date = first_text(*date_cell, &date_sel)
            .ok_or_else(|| AdapterError::shape(url, "status row without a date"))?;
        let submitted_at = NaiveDateTime::parse_from_str(&date, "%Y-%m-%d %H:%M:%S")
            .map_err(|e| AdapterError::shape(url, format!("bad date {date:?}: {e}")))?
            .and_utc();
        let problem_id = first_attr(*problem_cell, &link_sel, "title")
            .ok_or_else(|| AdapterError::shape(url, "status row without a problem"))?;

        out.push(Submission {
            problem_id,
            contest_id: None,
            submitted_at,
            accepted: result_cell.value().attr("status") == Some(ACCEPTED_STATUS),
        });
    }
    Ok(StatusPage::Rows(out))
}

pub struct SpojPractice {
    fetcher: Arc<RateLimitedFetcher>,
}

impl SpojPractice {
    pub fn new(deps: &AdapterDeps) -> Self {
        Self {
            fetcher: Arc::clone(&deps.fetcher),
        }
    }
}

#[async_trait]
impl PracticeAdapter for SpojPractice {
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
        let mut start = 0;
        loop {
            let url = status_url(handle, start);
            let html = self.fetcher.get_text(&url).await?;
            let StatusPage::Rows(rows) = parse_status_page(&url, &html)? else {
                break;
            };
            let short_page = rows.len() < ROWS_PER_PAGE;
            let newest = rows.iter().map(|s| s.submitted_at).max();
            submissions.extend(rows);
            if short_page || past_window(window, newest) {
                break;
            }
            start += ROWS_PER_PAGE;
        }

        let practice = practice_solved(window, &submissions).net_of(already_credited);
        info!(handle, practice = practice.count(), scanned = submissions.len(), "spoj practice solved");
        Ok(practice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{deps_with, week, ScriptedTransport};
    use judgebook_core::SolvedSet;

    fn status_html(rows: &[(&str, &str, &str)]) -> String {
        let body: String = rows
            .iter()
            .enumerate()
            .map(|(i, (date, problem, status))| {
                format!(
                    r#"<tr><td>{i}</td><td><span>{date}</span></td><td><a href="/problems/{problem}" title="{problem}">x</a></td><td status="{status}">r</td><td>0.01</td><td>5M</td><td>C++</td></tr>"#
                )
            })
            .collect();
        format!("<html><body><table class='problems table newstatus'><tbody>{body}</tbody></table></body></html>")
    }

    #[test]
    fn parses_accepted_rows() {
        let html = status_html(&[
            ("2022-01-20 10:00:00", "TEST", "15"),
            ("2022-01-19 09:00:00", "PRIME1", "14"),
        ]);
        let StatusPage::Rows(rows) = parse_status_page("u", &html).expect("parse") else {
            panic!("expected rows");
        };
        assert_eq!(rows.len(), 2);
        assert!(rows[0].accepted);
        assert_eq!(rows[0].problem_id, "TEST");
        assert_eq!(rows[0].submitted_at.to_rfc3339(), "2022-01-20T10:00:00+00:00");
        assert!(!rows[1].accepted);
    }

    #[test]
    fn wide_rows_are_not_status_pages() {
        let html = "<table><tbody><tr><td>1</td><td>2</td><td>3</td><td>4</td><td>5</td><td>6</td><td>7</td><td>8</td></tr></tbody></table>";
        assert_eq!(parse_status_page("u", html).expect("parse"), StatusPage::Bogus);
    }

    #[tokio::test]
    async fn follows_full_pages_until_the_window_is_passed() {
        let mut first: Vec<(&str, &str, &str)> = vec![("2022-01-21 12:00:00", "TEST", "15"); ROWS_PER_PAGE - 1];
        first.push(("2022-01-18 12:00:00", "ONP", "15"));
        let second = [
            ("2022-01-16 12:00:00", "PRIME1", "15"),
            ("2022-01-10 12:00:00", "ARITH", "15"),
        ];
        let transport = ScriptedTransport::new()
            .route(&status_url("ada", 0), status_html(&first))
            .route(&status_url("ada", 20), status_html(&second));
        let adapter = SpojPractice::new(&deps_with(transport.clone()));
        let user = User::new("Ada", "abc123").with_handle(PLATFORM, "ada");

        let practice = adapter
            .solved_problems(&week(1), &user, &ContestSolvedMap::new())
            .await
            .expect("practice");
        assert_eq!(
            practice.standalone,
            SolvedSet::from(["ONP".to_string(), "PRIME1".to_string(), "TEST".to_string()])
        );
        assert_eq!(transport.calls().len(), 2);
    }
}
