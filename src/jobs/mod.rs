//! Job control table
//!
//! Maps the small integer ids users type (`%1`, `fg 2`) to engine jobs. The
//! table only holds ids; the jobs themselves live in the engine's arena.

use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::job::{JobId, JobState};

/// Snapshot of one table entry
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub id: usize,
    pub command: String,
    pub state: JobState,
    pub status: Option<i32>,
    pub foreground: bool,
}

#[derive(Debug, Clone)]
struct Entry {
    job: JobId,
    command: String,
    state: JobState,
    status: Option<i32>,
    /// Registration order; ids get reused so they say nothing about age
    seq: u64,
}

/// What the engine has to do after a state update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableChange {
    Updated,
    /// The foreground job stopped: give the terminal back and resume the console
    ForegroundStopped,
    Removed,
    Unknown,
}

#[derive(Debug, Default)]
pub struct JobTable {
    entries: BTreeMap<usize, Entry>,
    foreground: Option<usize>,
    next_seq: u64,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job under the lowest unused id (ids start at 1)
    pub fn add(&mut self, job: JobId, command: String, foreground: bool) -> usize {
        let id = (1..)
            .find(|id| !self.entries.contains_key(id))
            .unwrap_or(usize::MAX);
        self.entries.insert(
            id,
            Entry {
                job,
                command,
                state: JobState::Unstarted,
                status: None,
                seq: self.next_seq,
            },
        );
        self.next_seq += 1;
        if foreground {
            self.foreground = Some(id);
        }
        id
    }

    pub fn get(&self, id: usize) -> Option<JobInfo> {
        self.entries.get(&id).map(|e| self.info(id, e))
    }

    pub fn job_of(&self, id: usize) -> Option<JobId> {
        self.entries.get(&id).map(|e| e.job)
    }

    pub fn foreground(&self) -> Option<usize> {
        self.foreground
    }

    pub fn set_foreground(&mut self, id: Option<usize>) {
        self.foreground = id.filter(|id| self.entries.contains_key(id));
    }

    /// Record a state change. Terminated and Failed entries are dropped.
    pub fn update(&mut self, id: usize, state: JobState, status: Option<i32>) -> TableChange {
        let Some(entry) = self.entries.get_mut(&id) else {
            return TableChange::Unknown;
        };
        entry.state = state;
        entry.status = status;

        match state {
            JobState::Terminated | JobState::Failed => {
                self.entries.remove(&id);
                if self.foreground == Some(id) {
                    self.foreground = None;
                }
                TableChange::Removed
            }
            JobState::Stopped if self.foreground == Some(id) => {
                self.foreground = None;
                TableChange::ForegroundStopped
            }
            _ => TableChange::Updated,
        }
    }

    pub fn remove(&mut self, id: usize) -> Option<JobInfo> {
        let info = self.get(id)?;
        self.entries.remove(&id);
        if self.foreground == Some(id) {
            self.foreground = None;
        }
        Some(info)
    }

    /// All entries, sorted by id
    pub fn list(&self) -> Vec<JobInfo> {
        self.entries
            .iter()
            .map(|(id, e)| self.info(*id, e))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most recently registered job (for %+ or %%)
    pub fn current(&self) -> Option<usize> {
        self.by_age().next()
    }

    /// The job registered before the current one (for %-)
    pub fn previous(&self) -> Option<usize> {
        self.by_age().nth(1)
    }

    /// Ids from newest to oldest
    fn by_age(&self) -> impl Iterator<Item = usize> {
        let mut ids: Vec<(u64, usize)> = self.entries.iter().map(|(id, e)| (e.seq, *id)).collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.into_iter().map(|(_, id)| id)
    }

    /// Resolve a job specification:
    /// - %n: job number n
    /// - %% or %+: current job (most recent)
    /// - %-: previous job (second most recent)
    /// - %string: job whose command begins with string
    /// - %?string: job whose command contains string
    /// - n (without %): job number n
    pub fn parse_job_spec(&self, spec: &str) -> Result<usize, EngineError> {
        let Some(rest) = spec.strip_prefix('%') else {
            return match spec.parse::<usize>() {
                Ok(id) => self.existing(id),
                Err(_) => Err(EngineError::InvalidJobSpec(spec.to_string())),
            };
        };

        match rest {
            "" | "%" | "+" => self
                .current()
                .ok_or_else(|| EngineError::InvalidJobSpec(spec.to_string())),
            "-" => self
                .previous()
                .ok_or_else(|| EngineError::InvalidJobSpec(spec.to_string())),
            _ => {
                if let Some(needle) = rest.strip_prefix('?') {
                    if needle.is_empty() {
                        return Err(EngineError::InvalidJobSpec(spec.to_string()));
                    }
                    return self.find_unique(spec, |command| command.contains(needle));
                }

                if let Ok(id) = rest.parse::<usize>() {
                    return self.existing(id);
                }

                self.find_unique(spec, |command| command.starts_with(rest))
            }
        }
    }

    fn existing(&self, id: usize) -> Result<usize, EngineError> {
        if self.entries.contains_key(&id) {
            Ok(id)
        } else {
            Err(EngineError::UnknownJob(id))
        }
    }

    // zero or several matches are both errors
    fn find_unique<F>(&self, spec: &str, pred: F) -> Result<usize, EngineError>
    where
        F: Fn(&str) -> bool,
    {
        let matching: Vec<usize> = self
            .entries
            .iter()
            .filter(|(_, e)| pred(&e.command))
            .map(|(id, _)| *id)
            .collect();

        match matching.as_slice() {
            [id] => Ok(*id),
            _ => Err(EngineError::InvalidJobSpec(spec.to_string())),
        }
    }

    fn info(&self, id: usize, entry: &Entry) -> JobInfo {
        JobInfo {
            id,
            command: entry.command.clone(),
            state: entry.state,
            status: entry.status,
            foreground: self.foreground == Some(id),
        }
    }
}

/// `jobs` listing with POSIX +/- markers
pub fn format_listing(table: &JobTable) -> String {
    let current = table.current();
    let previous = table.previous();
    let mut output = String::new();

    for job in table.list() {
        let indicator = if Some(job.id) == current {
            "+"
        } else if Some(job.id) == previous {
            "-"
        } else {
            " "
        };
        let suffix = if job.state == JobState::Running && !job.foreground {
            " &"
        } else {
            ""
        };
        output.push_str(&format!(
            "[{}]{}  {}\t{}{}\n",
            job.id,
            indicator,
            job.state.as_str(),
            job.command,
            suffix
        ));
    }

    output
}
