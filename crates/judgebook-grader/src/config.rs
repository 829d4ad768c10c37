use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use judgebook_core::{ContestCreditPolicy, CourseCalendar};
use judgebook_storage::{HttpClientConfig, RateLimit};
use serde::{Deserialize, Serialize};

use crate::GraderError;

pub const DEFAULT_CONFIG_PATH: &str = "judgebook.yaml";

/// Everything a grading run is parameterized by, read from `judgebook.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct GraderConfig {
    pub course: CourseConfig,
    #[serde(default)]
    pub contest_credit: ContestCreditPolicy,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    pub roster: RosterConfig,
    #[serde(default)]
    pub http: HttpConfig,
    pub platforms: Vec<PlatformConfig>,
    #[serde(default)]
    pub multipliers: Multipliers,
    #[serde(default = "default_manual_columns")]
    pub manual_columns: Vec<String>,
    #[serde(default = "default_sentinel")]
    pub sentinel: String,
    #[serde(default)]
    pub gradebook: GradebookColumns,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CourseConfig {
    /// Start of week 1, with the course's UTC offset.
    pub first_week_start: DateTime<FixedOffset>,
    pub num_weeks: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RosterConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub columns: RosterColumns,
    #[serde(default = "default_missing_handle_values")]
    pub missing_handle_values: Vec<String>,
    #[serde(default = "default_registered_values")]
    pub registered_values: Vec<String>,
    #[serde(default = "default_unregistered_values")]
    pub unregistered_values: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RosterColumns {
    /// Rows are all treated as registered when this is unset.
    pub registration: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub user_id: String,
    /// Platform name -> column holding that platform's handle.
    pub handles: BTreeMap<String, String>,
}

impl Default for RosterColumns {
    fn default() -> Self {
        Self {
            registration: Some("Registered".to_string()),
            first_name: "First Name".to_string(),
            last_name: "Last Name".to_string(),
            user_id: "UNI".to_string(),
            handles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: "judgebook/0.1".to_string(),
            timeout_secs: 20,
        }
    }
}

impl HttpConfig {
    pub fn client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    pub name: String,
    #[serde(default)]
    pub contest: bool,
    #[serde(default)]
    pub practice: bool,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default)]
    pub jitter_ms: u64,
}

impl PlatformConfig {
    pub fn rate_limit(&self) -> RateLimit {
        RateLimit::from_millis(self.min_interval_ms, self.jitter_ms)
    }
}

/// Points per solved problem, applied when the log is aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Multipliers {
    pub contest: f64,
    pub practice: f64,
}

impl Default for Multipliers {
    fn default() -> Self {
        Self {
            contest: 1.0,
            practice: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GradebookColumns {
    pub id_column: String,
    /// `{week}` is replaced by the week number; the header must contain the result.
    pub week_column: String,
}

impl Default for GradebookColumns {
    fn default() -> Self {
        Self {
            id_column: "SIS User ID".to_string(),
            week_column: "Week #{week}".to_string(),
        }
    }
}

impl GradebookColumns {
    pub fn week_marker(&self, week_num: u32) -> String {
        self.week_column.replace("{week}", &week_num.to_string())
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_manual_columns() -> Vec<String> {
    ["Topcoder_contest", "Topcoder_practice", "Leetcode_practice", "Kattis_practice"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_sentinel() -> String {
    "MANUAL".to_string()
}

fn default_missing_handle_values() -> Vec<String> {
    ["", "NA", "N/A", "-", "none"].into_iter().map(String::from).collect()
}

fn default_registered_values() -> Vec<String> {
    ["yes", "y", "true", "registered"].into_iter().map(String::from).collect()
}

fn default_unregistered_values() -> Vec<String> {
    ["no", "n", "false", "unregistered", "dropped"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_min_interval_ms() -> u64 {
    1_000
}

impl GraderConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, GraderError> {
        serde_yaml::from_str(text).map_err(|e| GraderError::Config(e.to_string()))
    }

    pub async fn load(path: &Path) -> Result<Self, GraderError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(GraderError::MissingFile {
                path: path.to_path_buf(),
            });
        }
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GraderError::Config(format!("reading {}: {e}", path.display())))?;
        serde_yaml::from_str(&text).map_err(|e| GraderError::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Reads the file named by `JUDGEBOOK_CONFIG` (default `judgebook.yaml`)
    /// and applies the remaining `JUDGEBOOK_*` overrides.
    pub async fn from_env() -> Result<Self, GraderError> {
        let path = std::env::var("JUDGEBOOK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::load(&path).await?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("JUDGEBOOK_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(roster) = var("JUDGEBOOK_ROSTER") {
            self.roster.path = PathBuf::from(roster);
        }
        if let Some(agent) = var("JUDGEBOOK_USER_AGENT") {
            self.http.user_agent = agent;
        }
    }

    pub fn calendar(&self) -> Result<CourseCalendar, GraderError> {
        Ok(CourseCalendar::new(self.course.first_week_start, self.course.num_weeks)?)
    }

    pub fn platform(&self, name: &str) -> Option<&PlatformConfig> {
        self.platforms.iter().find(|p| p.name == name)
    }

    pub fn contest_platforms(&self) -> impl Iterator<Item = &PlatformConfig> {
        self.platforms.iter().filter(|p| p.contest)
    }

    pub fn practice_platforms(&self) -> impl Iterator<Item = &PlatformConfig> {
        self.platforms.iter().filter(|p| p.practice)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn points_sheet_path(&self, week_num: u32) -> PathBuf {
        self.data_dir.join(format!("grades_{week_num}.csv"))
    }

    pub fn gradebook_output_path(&self, week_num: u32) -> PathBuf {
        self.data_dir.join(format!("gradebook_{week_num}.csv"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
course:
  first_week_start: "2022-01-15T00:00:00-05:00"
  num_weeks: 14
roster:
  path: roster.csv
  columns:
    handles:
      Codeforces: Codeforces Handle
platforms:
  - name: Codeforces
    contest: true
    practice: true
    min_interval_ms: 2000
  - name: Spoj
    practice: true
"#;

    #[test]
    fn defaults_fill_in_optional_sections() {
        let config = GraderConfig::from_yaml_str(MINIMAL).expect("config");
        assert_eq!(config.contest_credit, ContestCreditPolicy::Overlap);
        assert_eq!(config.sentinel, "MANUAL");
        assert_eq!(config.manual_columns.len(), 4);
        assert_eq!(config.multipliers, Multipliers::default());
        assert_eq!(config.roster.columns.user_id, "UNI");
        assert_eq!(config.roster.columns.handles["Codeforces"], "Codeforces Handle");
        assert!(config.roster.missing_handle_values.iter().any(|v| v == "N/A"));
        assert_eq!(config.gradebook.week_marker(3), "Week #3");
        assert_eq!(config.http.timeout_secs, 20);

        let contest: Vec<_> = config.contest_platforms().map(|p| p.name.as_str()).collect();
        let practice: Vec<_> = config.practice_platforms().map(|p| p.name.as_str()).collect();
        assert_eq!(contest, vec!["Codeforces"]);
        assert_eq!(practice, vec!["Codeforces", "Spoj"]);
        assert_eq!(
            config.platform("Codeforces").expect("cf").rate_limit(),
            RateLimit::from_millis(2000, 0)
        );
        assert_eq!(config.platform("Spoj").expect("spoj").min_interval_ms, 1_000);
    }

    #[test]
    fn env_overrides_replace_paths_and_agent() {
        let mut config = GraderConfig::from_yaml_str(MINIMAL).expect("config");
        config.apply_env_overrides(|key| match key {
            "JUDGEBOOK_DATA_DIR" => Some("/tmp/jb".to_string()),
            "JUDGEBOOK_USER_AGENT" => Some("grader-bot".to_string()),
            _ => None,
        });
        assert_eq!(config.data_dir, PathBuf::from("/tmp/jb"));
        assert_eq!(config.roster.path, PathBuf::from("roster.csv"));
        assert_eq!(config.http.user_agent, "grader-bot");
        assert_eq!(config.points_sheet_path(2), PathBuf::from("/tmp/jb/grades_2.csv"));
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/jb/cache"));
    }

    #[test]
    fn calendar_comes_from_course_section() {
        let config = GraderConfig::from_yaml_str(MINIMAL).expect("config");
        let calendar = config.calendar().expect("calendar");
        assert_eq!(calendar.num_weeks(), 14);
        assert_eq!(
            calendar.week(1).expect("week").start.to_rfc3339(),
            "2022-01-15T05:00:00+00:00"
        );
    }

    #[test]
    fn missing_course_is_a_config_error() {
        let err = GraderConfig::from_yaml_str("platforms: []").expect_err("no course");
        assert!(matches!(err, GraderError::Config(_)));
    }
}
