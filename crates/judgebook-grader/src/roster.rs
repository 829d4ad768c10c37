use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use csv::StringRecord;
use judgebook_core::User;
use tracing::{debug, error, info, warn};

use crate::config::RosterConfig;
use crate::GraderError;

/// Registered users in file order.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    users: Vec<User>,
}

impl Roster {
    pub fn new(users: Vec<User>) -> Self {
        Self { users }
    }

    pub fn load(path: &Path, config: &RosterConfig) -> Result<Self, GraderError> {
        if !path.exists() {
            return Err(GraderError::MissingFile {
                path: path.to_path_buf(),
            });
        }
        let file = std::fs::File::open(path).map_err(|e| GraderError::Config(format!("opening {}: {e}", path.display())))?;
        let roster = Self::from_reader(file, config).map_err(|e| match e {
            GraderError::Csv { source, .. } => GraderError::Csv {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        info!(path = %path.display(), users = roster.len(), "roster loaded");
        Ok(roster)
    }

    pub fn from_reader<R: Read>(reader: R, config: &RosterConfig) -> Result<Self, GraderError> {
        let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = csv.headers().map_err(csv_error)?.clone();
        let columns = ColumnIndex::resolve(&headers, config)?;

        let mut users = Vec::new();
        let mut seen = HashSet::new();
        for (index, record) in csv.records().enumerate() {
            let record = record.map_err(csv_error)?;
            // header is line 1
            let line = index + 2;

            let id = field(&record, Some(columns.user_id));
            if id.is_empty() {
                error!(line, "roster row without a user id, dropped");
                continue;
            }
            if !columns.is_registered(&record, config, id, line) {
                debug!(user = id, "not registered, skipped");
                continue;
            }
            if !seen.insert(id.to_string()) {
                error!(user = id, line, "duplicate user id in roster, later row dropped");
                continue;
            }

            let display_name = format!(
                "{} {}",
                field(&record, columns.first_name),
                field(&record, columns.last_name)
            )
            .trim()
            .to_string();
            let mut user = User::new(display_name, id);
            for (platform, column) in &columns.handles {
                let handle = field(&record, Some(*column));
                if is_missing_handle(handle, config) {
                    continue;
                }
                user = user.with_handle(platform.clone(), handle);
            }
            users.push(user);
        }
        Ok(Self { users })
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn get(&self, primary_id: &str) -> Option<&User> {
        self.users.iter().find(|u| u.primary_id == primary_id)
    }

    /// Position of `primary_id` in roster order.
    pub fn position(&self, primary_id: &str) -> Option<usize> {
        self.users.iter().position(|u| u.primary_id == primary_id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

struct ColumnIndex {
    registration: Option<usize>,
    first_name: Option<usize>,
    last_name: Option<usize>,
    user_id: usize,
    handles: Vec<(String, usize)>,
}

impl ColumnIndex {
    fn resolve(headers: &StringRecord, config: &RosterConfig) -> Result<Self, GraderError> {
        let find = |name: &str| headers.iter().position(|h| h == name);
        let columns = &config.columns;

        let user_id = find(&columns.user_id)
            .ok_or_else(|| GraderError::Config(format!("roster has no user id column {:?}", columns.user_id)))?;
        let registration = match &columns.registration {
            Some(name) => {
                let index = find(name);
                if index.is_none() {
                    warn!(column = %name, "roster has no registration column, treating everyone as registered");
                }
                index
            }
            None => None,
        };
        let mut handles = Vec::new();
        for (platform, column) in &columns.handles {
            match find(column) {
                Some(index) => handles.push((platform.clone(), index)),
                None => warn!(platform = %platform, column = %column, "roster has no handle column"),
            }
        }

        Ok(Self {
            registration,
            first_name: find(&columns.first_name),
            last_name: find(&columns.last_name),
            user_id,
            handles,
        })
    }

    fn is_registered(&self, record: &StringRecord, config: &RosterConfig, id: &str, line: usize) -> bool {
        let Some(index) = self.registration else {
            return true;
        };
        let value = field(record, Some(index));
        let matches = |values: &[String]| values.iter().any(|v| v.eq_ignore_ascii_case(value));
        if matches(&config.unregistered_values) {
            return false;
        }
        if !matches(&config.registered_values) {
            warn!(user = id, line, value, "unknown registration value, treating as registered");
        }
        true
    }
}

fn field(record: &StringRecord, index: Option<usize>) -> &str {
    index.and_then(|i| record.get(i)).unwrap_or_default()
}

fn is_missing_handle(handle: &str, config: &RosterConfig) -> bool {
    handle.is_empty()
        || config
            .missing_handle_values
            .iter()
            .any(|v| v.eq_ignore_ascii_case(handle))
}

fn csv_error(source: csv::Error) -> GraderError {
    GraderError::Csv {
        path: Default::default(),
        source,
    }
}
