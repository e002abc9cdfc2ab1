//! Executors and the registry that routes jobs to them.

use crate::error::{JobError, JobResult};
use crate::job::{JobContext, RepeatableJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Processes jobs addressed to it by name.
///
/// Executors must tolerate being invoked more than once for the same job:
/// a job is retried after a failure and may be re-run after a crash.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Registry key. Jobs reference their executor by this name.
    fn name(&self) -> &str;

    /// Handles one job's instructions.
    async fn process(&self, ctx: &JobContext, instructions: &[u8]) -> JobResult<()>;
}

/// An executor that also produces its own recurring jobs.
pub trait RepeatableExecutor: Executor {
    /// Builds the next occurrence, scheduled strictly in the future.
    fn generate_job(&self) -> JobResult<RepeatableJob>;

    /// Next run time strictly after `now`.
    fn reschedule_job(&self, now: DateTime<Utc>) -> JobResult<DateTime<Utc>>;
}

/// A registered executor.
#[derive(Clone)]
pub enum ExecutorEntry {
    OneOff(Arc<dyn Executor>),
    Repeatable(Arc<dyn RepeatableExecutor>),
}

impl ExecutorEntry {
    pub fn name(&self) -> &str {
        match self {
            ExecutorEntry::OneOff(executor) => executor.name(),
            ExecutorEntry::Repeatable(executor) => executor.name(),
        }
    }

    /// Runs the executor on `instructions`.
    pub async fn process(&self, ctx: &JobContext, instructions: &[u8]) -> JobResult<()> {
        match self {
            ExecutorEntry::OneOff(executor) => executor.process(ctx, instructions).await,
            ExecutorEntry::Repeatable(executor) => executor.process(ctx, instructions).await,
        }
    }

    /// Returns the repeatable executor, if this is one.
    pub fn as_repeatable(&self) -> Option<&Arc<dyn RepeatableExecutor>> {
        match self {
            ExecutorEntry::Repeatable(executor) => Some(executor),
            ExecutorEntry::OneOff(_) => None,
        }
    }
}

impl fmt::Debug for ExecutorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ExecutorEntry::OneOff(_) => "OneOff",
            ExecutorEntry::Repeatable(_) => "Repeatable",
        };
        f.debug_tuple(kind).field(&self.name()).finish()
    }
}

/// Name-keyed executor registry.
///
/// Built before the worker starts and read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, ExecutorEntry>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a one-off executor.
    pub fn register(&mut self, executor: Arc<dyn Executor>) -> JobResult<()> {
        self.insert(ExecutorEntry::OneOff(executor))
    }

    /// Registers a repeatable executor.
    pub fn register_repeatable(&mut self, executor: Arc<dyn RepeatableExecutor>) -> JobResult<()> {
        self.insert(ExecutorEntry::Repeatable(executor))
    }

    fn insert(&mut self, entry: ExecutorEntry) -> JobResult<()> {
        let name = entry.name().to_string();
        if name.trim().is_empty() {
            return Err(JobError::Configuration("Executor name is empty".to_string()));
        }
        if self.executors.contains_key(&name) {
            return Err(JobError::Configuration(format!(
                "Executor '{}' is already registered",
                name
            )));
        }

        info!(
            executor = %name,
            repeatable = entry.as_repeatable().is_some(),
            "Registered executor"
        );
        self.executors.insert(name, entry);
        Ok(())
    }

    /// Looks up an executor by name.
    pub fn get(&self, name: &str) -> Option<&ExecutorEntry> {
        self.executors.get(name)
    }

    /// Returns true if an executor with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// All repeatable executors.
    pub fn repeatables(&self) -> impl Iterator<Item = &Arc<dyn RepeatableExecutor>> {
        self.executors.values().filter_map(ExecutorEntry::as_repeatable)
    }

    /// Registered executor names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
