use super::{sort_node_states, RunStore};
use crate::{NodeId, NodeState, Run, RunId, RunUpdate, StoreError, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// On-disk layout of one run.
#[derive(Debug, Serialize, Deserialize)]
struct RunDocument {
    run: Run,
    #[serde(default)]
    nodes: BTreeMap<NodeId, NodeState>,
}

/// Store keeping one JSON document per run in a directory.
///
/// Every write serializes the whole document to a temporary file and renames
/// it over the previous one, so a crash leaves the last committed version.
pub struct JsonFileRunStore {
    dir: PathBuf,
    locks: DashMap<RunId, Arc<Mutex<()>>>,
}

impl JsonFileRunStore {
    pub async fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        tracing::info!("Opened run store at {}", dir.display());
        Ok(Self {
            dir,
            locks: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: RunId) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    fn lock_for(&self, run_id: RunId) -> Arc<Mutex<()>> {
        self.locks
            .entry(run_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read(&self, run_id: RunId) -> StoreResult<RunDocument> {
        match tokio::fs::read(self.path_for(run_id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::RunNotFound(run_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, doc: &RunDocument) -> StoreResult<()> {
        let path = self.path_for(doc.run.run_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(doc)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for JsonFileRunStore {
    async fn create_run(&self, run: Run) -> StoreResult<()> {
        let lock = self.lock_for(run.run_id);
        let _guard = lock.lock().await;
        self.write(&RunDocument {
            run,
            nodes: BTreeMap::new(),
        })
        .await
    }

    async fn get_run(&self, run_id: RunId) -> StoreResult<Run> {
        Ok(self.read(run_id).await?.run)
    }

    async fn update_run_status(&self, run_id: RunId, update: RunUpdate) -> StoreResult<Run> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;
        let mut doc = self.read(run_id).await?;
        if doc.run.status.is_terminal() {
            return Err(StoreError::TerminalRun(run_id));
        }
        doc.run.apply(update);
        self.write(&doc).await?;
        Ok(doc.run)
    }

    async fn set_node_state(&self, state: NodeState) -> StoreResult<()> {
        let lock = self.lock_for(state.run_id);
        let _guard = lock.lock().await;
        let mut doc = self.read(state.run_id).await?;
        if doc.run.status.is_terminal() {
            return Err(StoreError::TerminalRun(state.run_id));
        }
        doc.nodes.insert(state.node_id.clone(), state);
        self.write(&doc).await
    }

    async fn get_node_state(
        &self,
        run_id: RunId,
        node_id: &NodeId,
    ) -> StoreResult<Option<NodeState>> {
        Ok(self.read(run_id).await?.nodes.remove(node_id))
    }

    async fn list_node_states(&self, run_id: RunId) -> StoreResult<Vec<NodeState>> {
        let mut states: Vec<NodeState> = self.read(run_id).await?.nodes.into_values().collect();
        sort_node_states(&mut states);
        Ok(states)
    }

    async fn list_runs(&self) -> StoreResult<Vec<Run>> {
        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<RunDocument>(&bytes) {
                Ok(doc) => runs.push(doc.run),
                Err(e) => {
                    tracing::warn!("Skipping unreadable run file {}: {}", path.display(), e);
                }
            }
        }
        runs.sort_by_key(|run| run.created_at);
        Ok(runs)
    }
}
