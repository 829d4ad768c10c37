//! Grading run orchestration: configuration, roster, reconciliation, points
//! and gradebook population.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use judgebook_adapters::{
    contest_adapter_for, known_platforms, practice_adapter_for, AdapterDeps, AdapterError, ContestAdapter,
    PracticeAdapter, PreprocessSummary,
};
use judgebook_core::{CalendarError, CourseCalendar, GradingWindow, User};
use judgebook_storage::{
    log_path, read_events, EventLog, EventLogError, HttpTransport, RankingCacheStore, RateLimitedFetcher,
    RegradePolicy, Transport,
};
use serde::Serialize;
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod gradebook;
pub mod points;
pub mod reconcile;
pub mod roster;

pub use config::{GraderConfig, Multipliers, PlatformConfig};
pub use gradebook::{populate_gradebook, GradebookSummary};
pub use points::{write_points_sheet, PointsAggregator, PointsFilter, PointsRow, PointsSheet};
pub use reconcile::{EventSink, Reconciler, UserLedger, UserPhase};
pub use roster::Roster;

pub const CRATE_NAME: &str = "judgebook-grader";

#[derive(Debug, Error)]
pub enum GraderError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Calendar(#[from] CalendarError),
    #[error(
        "unknown platform {name}{}",
        .suggestion.as_deref().map(|s| format!(" (did you mean {s}?)")).unwrap_or_default()
    )]
    UnknownPlatform { name: String, suggestion: Option<String> },
    #[error("user {0} is not on the roster")]
    UnknownUser(String),
    #[error("{} does not exist", .path.display())]
    MissingFile { path: PathBuf },
    #[error("{} already exists; pass --force to replace it", .path.display())]
    OutputExists { path: PathBuf },
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("csv error in {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("gradebook: {0}")]
    Gradebook(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Closest candidate by Jaro-Winkler similarity, if any is reasonably close.
pub fn suggest<'a>(name: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<String> {
    candidates
        .into_iter()
        .map(|c| (jaro_winkler(&name.to_ascii_lowercase(), &c.to_ascii_lowercase()), c))
        .filter(|(score, _)| *score >= 0.7)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, c)| c.to_string())
}

/// Builds fresh adapters for a run. The registry-backed source is used in
/// production; tests substitute scripted adapters.
pub trait AdapterSource: Send + Sync {
    fn contest(&self, platform: &str) -> Option<Box<dyn ContestAdapter>>;
    fn practice(&self, platform: &str) -> Option<Box<dyn PracticeAdapter>>;
}

/// Registry adapters over one rate-limited fetcher per configured platform.
pub struct RegistryAdapters {
    deps: BTreeMap<String, AdapterDeps>,
}

impl RegistryAdapters {
    pub fn new(config: &GraderConfig, transport: Arc<dyn Transport>) -> Result<Self, GraderError> {
        let known = known_platforms();
        let cache = RankingCacheStore::new(config.cache_dir());
        let mut deps = BTreeMap::new();
        for platform in &config.platforms {
            if !known.contains(&platform.name.as_str()) {
                return Err(GraderError::UnknownPlatform {
                    name: platform.name.clone(),
                    suggestion: suggest(&platform.name, known.iter().copied()),
                });
            }
            let fetcher = RateLimitedFetcher::new(platform.name.clone(), Arc::clone(&transport), platform.rate_limit());
            deps.insert(
                platform.name.clone(),
                AdapterDeps {
                    fetcher: Arc::new(fetcher),
                    policy: config.contest_credit,
                    cache: cache.clone(),
                },
            );
        }
        Ok(Self { deps })
    }

    pub fn from_config(config: &GraderConfig) -> Result<Self, GraderError> {
        let transport = HttpTransport::new(&config.http.client_config())?;
        Self::new(config, Arc::new(transport))
    }
}

impl AdapterSource for RegistryAdapters {
    fn contest(&self, platform: &str) -> Option<Box<dyn ContestAdapter>> {
        contest_adapter_for(platform, self.deps.get(platform)?)
    }

    fn practice(&self, platform: &str) -> Option<Box<dyn PracticeAdapter>> {
        practice_adapter_for(platform, self.deps.get(platform)?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GradeOptions {
    /// Archive an existing log instead of refusing to run.
    pub force: bool,
    pub user: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GradeRunSummary {
    pub run_id: Uuid,
    pub week_num: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub log_path: PathBuf,
    pub users: usize,
    pub events: usize,
    /// Events kept from the replaced log because this run's filter did not cover them.
    pub carried_over: usize,
    pub exceptions: usize,
}

pub struct Grader {
    config: GraderConfig,
    calendar: CourseCalendar,
    adapters: Box<dyn AdapterSource>,
}

impl Grader {
    pub fn new(config: GraderConfig) -> Result<Self, GraderError> {
        let adapters = RegistryAdapters::from_config(&config)?;
        Self::with_adapters(config, Box::new(adapters))
    }

    pub fn with_adapters(config: GraderConfig, adapters: Box<dyn AdapterSource>) -> Result<Self, GraderError> {
        let calendar = config.calendar()?;
        Ok(Self {
            config,
            calendar,
            adapters,
        })
    }

    pub fn config(&self) -> &GraderConfig {
        &self.config
    }

    pub fn window(&self, week_num: u32) -> Result<GradingWindow, GraderError> {
        Ok(self.calendar.week(week_num)?)
    }

    pub fn load_roster(&self) -> Result<Roster, GraderError> {
        Roster::load(&self.config.roster.path, &self.config.roster)
    }

    pub fn log_path(&self, week_num: u32) -> PathBuf {
        log_path(&self.config.data_dir, week_num)
    }

    fn check_platform(&self, name: &str) -> Result<(), GraderError> {
        if self.config.platform(name).is_some() {
            return Ok(());
        }
        Err(GraderError::UnknownPlatform {
            name: name.to_string(),
            suggestion: suggest(name, self.config.platforms.iter().map(|p| p.name.as_str())),
        })
    }

    fn build_adapters(
        &self,
        only: Option<&str>,
    ) -> Result<(Vec<Box<dyn ContestAdapter>>, Vec<Box<dyn PracticeAdapter>>), GraderError> {
        let selected = |name: &str| only.map_or(true, |only| only == name);
        let mut contest = Vec::new();
        for platform in self.config.contest_platforms().filter(|p| selected(&p.name)) {
            contest.push(self.adapters.contest(&platform.name).ok_or_else(|| {
                GraderError::Config(format!("{} has no contest adapter", platform.name))
            })?);
        }
        let mut practice = Vec::new();
        for platform in self.config.practice_platforms().filter(|p| selected(&p.name)) {
            practice.push(self.adapters.practice(&platform.name).ok_or_else(|| {
                GraderError::Config(format!("{} has no practice adapter", platform.name))
            })?);
        }
        Ok((contest, practice))
    }

    /// Users to grade: the whole roster, or the one named in `user`.
    fn select_users(roster: &Roster, user: Option<&str>) -> Result<Vec<User>, GraderError> {
        match user {
            None => Ok(roster.users().to_vec()),
            Some(id) => roster
                .get(id)
                .cloned()
                .map(|u| vec![u])
                .ok_or_else(|| GraderError::UnknownUser(id.to_string())),
        }
    }

    /// Dumps rankings for every contest platform that grades from
    /// pre-processed data.
    pub async fn preprocess(&self, week_num: u32) -> Result<Vec<PreprocessSummary>, GraderError> {
        let window = self.window(week_num)?;
        let (contest, _) = self.build_adapters(None)?;
        let mut summaries = Vec::new();
        for adapter in contest.iter().filter(|a| a.requires_preprocessing()) {
            let summary = adapter.preprocess(&window).await?;
            info!(
                platform = adapter.platform(),
                contests = summary.contests.len(),
                skipped = summary.contests.iter().filter(|c| c.skipped).count(),
                "pre-processed"
            );
            summaries.push(summary);
        }
        Ok(summaries)
    }

    pub async fn grade(&self, week_num: u32, options: &GradeOptions) -> Result<GradeRunSummary, GraderError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("grade_run", %run_id, week = week_num);
        self.grade_inner(run_id, week_num, options).instrument(span).await
    }

    async fn grade_inner(
        &self,
        run_id: Uuid,
        week_num: u32,
        options: &GradeOptions,
    ) -> Result<GradeRunSummary, GraderError> {
        let started_at = Utc::now();
        let window = self.window(week_num)?;
        if let Some(platform) = &options.platform {
            self.check_platform(platform)?;
        }
        let roster = self.load_roster()?;
        let users = Self::select_users(&roster, options.user.as_deref())?;
        let (contest, practice) = self.build_adapters(options.platform.as_deref())?;
        info!(%window, users = users.len(), contest_platforms = contest.len(), practice_platforms = practice.len(), "grading");

        let path = self.log_path(week_num);
        if !options.force && path.exists() {
            return Err(EventLogError::AlreadyExists { path }.into());
        }

        let reconciler = Reconciler::prepare(window, contest, practice).await;
        reconciler.verify_preprocessed().await?;

        let regraded = PointsFilter {
            user: options.user.clone(),
            platform: options.platform.clone(),
        };
        let carried = if options.force && regraded != PointsFilter::default() && path.exists() {
            let previous = read_events(&path).await?;
            previous.into_iter().filter(|e| !regraded.admits(e)).collect()
        } else {
            Vec::new()
        };

        let policy = if options.force {
            RegradePolicy::Archive
        } else {
            RegradePolicy::Refuse
        };
        let mut log = EventLog::open_fresh(&path, policy).await?;
        for event in &carried {
            log.append(event).await?;
        }
        if !carried.is_empty() {
            info!(carried = carried.len(), "kept events outside this run's filter");
        }
        let mut exceptions = 0;
        for user in &users {
            let ledger = reconciler.grade_user(user, &mut log).await?;
            exceptions += ledger.exceptions;
        }
        if exceptions > 0 {
            warn!(exceptions, "some units could not be graded; see flagged events");
        }

        let summary = GradeRunSummary {
            run_id,
            week_num,
            started_at,
            finished_at: Utc::now(),
            log_path: path,
            users: users.len(),
            events: log.appended() - carried.len(),
            carried_over: carried.len(),
            exceptions,
        };
        info!(events = summary.events, exceptions, "grading run complete");
        Ok(summary)
    }

    /// Replays the week's log into a points sheet and writes it to
    /// `grades_{week}.csv`.
    pub async fn points(
        &self,
        week_num: u32,
        filter: &PointsFilter,
        overwrite: bool,
    ) -> Result<(PathBuf, PointsSheet), GraderError> {
        self.window(week_num)?;
        if let Some(platform) = &filter.platform {
            self.check_platform(platform)?;
        }
        let events = read_events(&self.log_path(week_num)).await?;
        let roster = match self.load_roster() {
            Ok(roster) => Some(roster),
            Err(GraderError::MissingFile { path }) => {
                warn!(path = %path.display(), "no roster, rows follow log order");
                None
            }
            Err(err) => return Err(err),
        };
        if let (Some(user), Some(roster)) = (&filter.user, &roster) {
            if roster.get(user).is_none() && !events.iter().any(|e| &e.uni == user) {
                return Err(GraderError::UnknownUser(user.clone()));
            }
        }

        let aggregator = PointsAggregator::new(self.config.multipliers)
            .with_platforms(
                self.config.contest_platforms().map(|p| p.name.clone()),
                self.config.practice_platforms().map(|p| p.name.clone()),
            )
            .with_manual_columns(self.config.manual_columns.clone(), self.config.sentinel.clone());
        let sheet = aggregator.aggregate(&events, roster.as_ref(), filter);
        let path = self.config.points_sheet_path(week_num);
        write_points_sheet(&path, &sheet, overwrite)?;
        Ok((path, sheet))
    }

    pub fn populate_gradebook(&self, week_num: u32, gradebook_path: &Path) -> Result<GradebookSummary, GraderError> {
        self.window(week_num)?;
        populate_gradebook(
            &self.config.points_sheet_path(week_num),
            gradebook_path,
            &self.config.gradebook_output_path(week_num),
            week_num,
            &self.config.gradebook,
            &self.config.sentinel,
        )
    }
}
