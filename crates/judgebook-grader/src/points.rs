//! Replays a week's grading events into the wide points sheet.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use judgebook_core::{EventType, GradingEvent};
use tracing::{info, warn};

use crate::config::Multipliers;
use crate::roster::Roster;
use crate::GraderError;

/// Restricts aggregation to one user and/or one platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointsFilter {
    pub user: Option<String>,
    pub platform: Option<String>,
}

impl PointsFilter {
    pub(crate) fn admits(&self, event: &GradingEvent) -> bool {
        self.user.as_deref().map_or(true, |u| u == event.uni)
            && self.platform.as_deref().map_or(true, |p| p == event.platform_name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointsRow {
    pub uni: String,
    pub name: Option<String>,
    /// Platform -> raw solved count. A platform with no events for this user
    /// was not graded and has no entry.
    pub contest: BTreeMap<String, u32>,
    pub practice: BTreeMap<String, u32>,
    pub contest_points: f64,
    pub practice_points: f64,
    pub total_points: f64,
    pub exceptions: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointsSheet {
    pub contest_platforms: Vec<String>,
    pub practice_platforms: Vec<String>,
    pub manual_columns: Vec<String>,
    pub sentinel: String,
    pub with_names: bool,
    pub rows: Vec<PointsRow>,
}

impl PointsSheet {
    pub fn headers(&self) -> Vec<String> {
        let mut headers = vec!["uni".to_string()];
        if self.with_names {
            headers.push("name".to_string());
        }
        headers.extend(self.contest_platforms.iter().map(|p| format!("{p}_contest")));
        headers.extend(self.practice_platforms.iter().map(|p| format!("{p}_practice")));
        headers.extend(self.manual_columns.iter().cloned());
        headers.extend(
            ["contest_points", "practice_points", "total_points", "exceptions"]
                .into_iter()
                .map(String::from),
        );
        headers
    }

    pub fn record(&self, row: &PointsRow) -> Vec<String> {
        let mut out = vec![row.uni.clone()];
        if self.with_names {
            out.push(row.name.clone().unwrap_or_default());
        }
        let cell = |counts: &BTreeMap<String, u32>, platform: &String| {
            counts
                .get(platform)
                .map_or_else(|| self.sentinel.clone(), u32::to_string)
        };
        out.extend(self.contest_platforms.iter().map(|p| cell(&row.contest, p)));
        out.extend(self.practice_platforms.iter().map(|p| cell(&row.practice, p)));
        out.extend(self.manual_columns.iter().map(|_| self.sentinel.clone()));
        out.push(row.contest_points.to_string());
        out.push(row.practice_points.to_string());
        out.push(row.total_points.to_string());
        out.push(row.exceptions.to_string());
        out
    }

    pub fn row(&self, uni: &str) -> Option<&PointsRow> {
        self.rows.iter().find(|r| r.uni == uni)
    }
}

#[derive(Debug, Clone)]
pub struct PointsAggregator {
    multipliers: Multipliers,
    contest_platforms: Vec<String>,
    practice_platforms: Vec<String>,
    manual_columns: Vec<String>,
    sentinel: String,
}

#[derive(Default)]
struct Tally {
    contest: BTreeMap<String, u32>,
    practice: BTreeMap<String, u32>,
    exceptions: u32,
}

impl PointsAggregator {
    pub fn new(multipliers: Multipliers) -> Self {
        Self {
            multipliers,
            contest_platforms: Vec::new(),
            practice_platforms: Vec::new(),
            manual_columns: Vec::new(),
            sentinel: "MANUAL".to_string(),
        }
    }

    /// Platforms that always get a column, even with no events.
    pub fn with_platforms(
        mut self,
        contest: impl IntoIterator<Item = String>,
        practice: impl IntoIterator<Item = String>,
    ) -> Self {
        self.contest_platforms = contest.into_iter().collect();
        self.practice_platforms = practice.into_iter().collect();
        self
    }

    pub fn with_manual_columns(mut self, columns: Vec<String>, sentinel: impl Into<String>) -> Self {
        self.manual_columns = columns;
        self.sentinel = sentinel.into();
        self
    }

    pub fn aggregate(&self, events: &[GradingEvent], roster: Option<&Roster>, filter: &PointsFilter) -> PointsSheet {
        let mut contest_platforms: BTreeSet<String> = self.contest_platforms.iter().cloned().collect();
        let mut practice_platforms: BTreeSet<String> = self.practice_platforms.iter().cloned().collect();
        if let Some(platform) = &filter.platform {
            contest_platforms.retain(|p| p == platform);
            practice_platforms.retain(|p| p == platform);
        }

        let mut first_seen = Vec::new();
        let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();
        let mut flagged = Vec::new();
        for event in events.iter().filter(|e| filter.admits(e)) {
            let tally = tallies.entry(event.uni.clone()).or_insert_with(|| {
                first_seen.push(event.uni.clone());
                Tally::default()
            });
            if event.is_exception {
                tally.exceptions += 1;
                flagged.push(format!(
                    "{}/{}/{}/{}",
                    event.uni, event.platform_name, event.event_type, event.event_name
                ));
            }
            let (bucket, platforms) = match event.event_type {
                EventType::Contest => (&mut tally.contest, &mut contest_platforms),
                EventType::Practice => (&mut tally.practice, &mut practice_platforms),
            };
            *bucket.entry(event.platform_name.clone()).or_default() += event.points;
            platforms.insert(event.platform_name.clone());
        }

        if !flagged.is_empty() {
            warn!(count = flagged.len(), units = ?flagged, "grade log has exception events, review them manually");
        }

        let order = self.row_order(first_seen, roster);
        let rows = order
            .into_iter()
            .filter_map(|uni| {
                let tally = tallies.remove(&uni)?;
                let name = roster.and_then(|r| r.get(&uni)).map(|u| u.display_name.clone());
                Some(self.row(uni, name, tally))
            })
            .collect::<Vec<_>>();
        info!(rows = rows.len(), exceptions = flagged.len(), "points aggregated");

        PointsSheet {
            contest_platforms: contest_platforms.into_iter().collect(),
            practice_platforms: practice_platforms.into_iter().collect(),
            manual_columns: self.manual_columns.clone(),
            sentinel: self.sentinel.clone(),
            with_names: roster.is_some(),
            rows,
        }
    }

    /// Roster order first, then anyone the roster does not know in log order.
    fn row_order(&self, first_seen: Vec<String>, roster: Option<&Roster>) -> Vec<String> {
        let Some(roster) = roster else {
            return first_seen;
        };
        let (mut known, unknown): (Vec<String>, Vec<String>) =
            first_seen.into_iter().partition(|uni| roster.get(uni).is_some());
        known.sort_by_key(|uni| roster.position(uni));
        for uni in &unknown {
            warn!(uni = %uni, "graded user is not on the roster");
        }
        known.extend(unknown);
        known
    }

    fn row(&self, uni: String, name: Option<String>, tally: Tally) -> PointsRow {
        let contest_points = self.multipliers.contest * f64::from(tally.contest.values().sum::<u32>());
        let practice_points = self.multipliers.practice * f64::from(tally.practice.values().sum::<u32>());
        PointsRow {
            uni,
            name,
            contest: tally.contest,
            practice: tally.practice,
            contest_points,
            practice_points,
            total_points: contest_points + practice_points,
            exceptions: tally.exceptions,
        }
    }
}

/// Writes `sheet` as CSV. An existing file is only replaced when `overwrite`.
pub fn write_points_sheet(path: &Path, sheet: &PointsSheet, overwrite: bool) -> Result<(), GraderError> {
    if path.exists() && !overwrite {
        return Err(GraderError::OutputExists {
            path: path.to_path_buf(),
        });
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| GraderError::Config(format!("creating {}: {e}", parent.display())))?;
    }
    let csv_err = |source| GraderError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    writer.write_record(sheet.headers()).map_err(csv_err)?;
    for row in &sheet.rows {
        writer.write_record(sheet.record(row)).map_err(csv_err)?;
    }
    writer
        .flush()
        .map_err(|e| GraderError::Config(format!("flushing {}: {e}", path.display())))?;
    info!(path = %path.display(), rows = sheet.rows.len(), "points sheet written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use judgebook_core::User;

    fn event(uni: &str, platform: &str, event_type: EventType, points: u32, is_exception: bool) -> GradingEvent {
        GradingEvent {
            curr_dt: DateTime::parse_from_rfc3339("2022-01-23T05:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            week_num: 1,
            uni: uni.to_string(),
            platform_name: platform.to_string(),
            is_exception,
            points,
            event_type,
            event_name: String::new(),
        }
    }

    fn events() -> Vec<GradingEvent> {
        vec![
            event("zz999", "Codeforces", EventType::Contest, 1, false),
            event("abc123", "Codeforces", EventType::Contest, 2, false),
            event("abc123", "Atcoder", EventType::Contest, 0, true),
            event("abc123", "Codeforces", EventType::Practice, 1, false),
            event("abc123", "Spoj", EventType::Practice, 3, false),
        ]
    }

    fn aggregator() -> PointsAggregator {
        PointsAggregator::new(Multipliers {
            contest: 2.0,
            practice: 0.5,
        })
        .with_platforms(["Codeforces".to_string(), "Dmoj".to_string()], ["Codeforces".to_string()])
        .with_manual_columns(vec!["Topcoder_contest".to_string()], "MANUAL")
    }

    #[test]
    fn totals_are_contest_plus_practice_with_multipliers() {
        let sheet = aggregator().aggregate(&events(), None, &PointsFilter::default());
        let row = sheet.row("abc123").expect("row");
        assert_eq!(row.contest_points, 4.0);
        assert_eq!(row.practice_points, 2.0);
        assert_eq!(row.total_points, row.contest_points + row.practice_points);
        assert_eq!(row.exceptions, 1);
        assert_eq!(sheet.contest_platforms, vec!["Atcoder", "Codeforces", "Dmoj"]);
        assert_eq!(sheet.practice_platforms, vec!["Codeforces", "Spoj"]);
        assert_eq!(
            sheet.headers(),
            vec![
                "uni",
                "Atcoder_contest",
                "Codeforces_contest",
                "Dmoj_contest",
                "Codeforces_practice",
                "Spoj_practice",
                "Topcoder_contest",
                "contest_points",
                "practice_points",
                "total_points",
                "exceptions"
            ]
        );
        assert_eq!(
            sheet.record(row),
            vec!["abc123", "0", "2", "MANUAL", "1", "3", "MANUAL", "4", "2", "6", "1"]
        );
    }

    #[test]
    fn ungraded_cells_hold_the_sentinel_not_zero() {
        let mut events = events();
        // a week with no Dmoj contests is still a graded zero
        events.push(event("abc123", "Dmoj", EventType::Contest, 0, false));
        let sheet = aggregator().aggregate(&events, None, &PointsFilter::default());

        let graded = sheet.record(sheet.row("abc123").expect("abc123"));
        assert_eq!(&graded[1..6], ["0", "2", "0", "1", "3"]);
        // zz999 only has a Codeforces contest event
        let partial = sheet.record(sheet.row("zz999").expect("zz999"));
        assert_eq!(&partial[1..6], ["MANUAL", "1", "MANUAL", "MANUAL", "MANUAL"]);
    }

    #[test]
    fn roster_order_then_unknown_users() {
        let roster = Roster::new(vec![
            User::new("Nobody", "nn000"),
            User::new("Ada Lovelace", "abc123"),
        ]);
        let sheet = aggregator().aggregate(&events(), Some(&roster), &PointsFilter::default());
        let unis: Vec<_> = sheet.rows.iter().map(|r| r.uni.as_str()).collect();
        assert_eq!(unis, vec!["abc123", "zz999"]);
        assert_eq!(sheet.rows[0].name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(sheet.headers()[1], "name");
    }

    #[test]
    fn filters_by_user_and_platform() {
        let filter = PointsFilter {
            user: Some("abc123".into()),
            platform: Some("Codeforces".into()),
        };
        let sheet = aggregator().aggregate(&events(), None, &filter);
        assert_eq!(sheet.rows.len(), 1);
        assert_eq!(sheet.rows[0].total_points, 2.0 * 2.0 + 0.5);
        assert_eq!(sheet.contest_platforms, vec!["Codeforces"]);
        assert_eq!(sheet.practice_platforms, vec!["Codeforces"]);
    }

    #[test]
    fn refuses_to_overwrite_unless_forced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("grades_1.csv");
        let sheet = aggregator().aggregate(&events(), None, &PointsFilter::default());

        write_points_sheet(&path, &sheet, false).expect("first write");
        let err = write_points_sheet(&path, &sheet, false).expect_err("exists");
        assert!(matches!(err, GraderError::OutputExists { .. }));
        write_points_sheet(&path, &sheet, true).expect("forced");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.starts_with("uni,Atcoder_contest,Codeforces_contest"));
        assert_eq!(text.lines().count(), 3);
    }
}
