//! In-memory [`LogStorage`] with a hot tier for running executions and an
//! archive tier for finished ones.

use async_trait::async_trait;
use parking_lot::RwLock;
use runnel_core::Result;
use runnel_core::ids::JobExecutionId;
use runnel_core::model::LogLine;
use runnel_core::ports::LogStorage;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

type Streams = BTreeMap<String, Vec<LogLine>>;

#[derive(Default)]
pub struct MemoryLogStorage {
    hot: RwLock<HashMap<JobExecutionId, Streams>>,
    archived: RwLock<HashMap<JobExecutionId, Streams>>,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_archived(&self, job_execution_id: JobExecutionId) -> bool {
        self.archived.read().contains_key(&job_execution_id)
    }

    /// Names of every stream recorded for an execution.
    pub fn stream_names(&self, job_execution_id: JobExecutionId) -> Vec<String> {
        let hot = self.hot.read();
        let archived = self.archived.read();
        let mut names: Vec<String> = hot
            .get(&job_execution_id)
            .into_iter()
            .chain(archived.get(&job_execution_id))
            .flat_map(|streams| streams.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[async_trait]
impl LogStorage for MemoryLogStorage {
    async fn append(
        &self,
        job_execution_id: JobExecutionId,
        name: &str,
        lines: Vec<LogLine>,
    ) -> Result<()> {
        let mut hot = self.hot.write();
        hot.entry(job_execution_id)
            .or_default()
            .entry(name.to_string())
            .or_default()
            .extend(lines);
        Ok(())
    }

    async fn get_lines(
        &self,
        job_execution_id: JobExecutionId,
        name: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<LogLine>> {
        let lookup = |tier: &HashMap<JobExecutionId, Streams>| {
            tier.get(&job_execution_id)
                .and_then(|streams| streams.get(name))
                .map(|lines| {
                    lines
                        .iter()
                        .filter(|l| l.number >= offset)
                        .take(limit)
                        .cloned()
                        .collect::<Vec<_>>()
                })
        };
        if let Some(lines) = lookup(&self.hot.read()) {
            return Ok(lines);
        }
        Ok(lookup(&self.archived.read()).unwrap_or_default())
    }

    async fn archive(&self, job_execution_id: JobExecutionId) -> Result<()> {
        let Some(streams) = self.hot.write().remove(&job_execution_id) else {
            return Ok(());
        };
        debug!(job_execution_id = %job_execution_id, streams = streams.len(), "Archiving logs");
        let mut archived = self.archived.write();
        let slot = archived.entry(job_execution_id).or_default();
        for (name, lines) in streams {
            slot.entry(name).or_default().extend(lines);
        }
        Ok(())
    }
}
