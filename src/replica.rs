//! Multi-GPU replica placement for a single model: round-robin load
//! balancing across the GPUs a model is loaded on, skipping any replica
//! that is busy or has failed.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStatus {
    Available,
    Busy,
    Failed,
}

struct Replica {
    gpu_id: i32,
    status: ReplicaStatus,
}

#[derive(Default)]
struct ModelReplicas {
    replicas: Vec<Replica>,
    next_index: usize,
}

#[derive(Default)]
pub struct ReplicaManager {
    models: Mutex<HashMap<String, ModelReplicas>>,
}

impl ReplicaManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if `gpu_id` was already registered for this model.
    pub fn add_replica(&self, model_name: &str, gpu_id: i32) -> bool {
        let mut models = self.models.lock().unwrap();
        let model = models.entry(model_name.to_string()).or_default();
        if model.replicas.iter().any(|r| r.gpu_id == gpu_id) {
            return false;
        }
        model.replicas.push(Replica {
            gpu_id,
            status: ReplicaStatus::Available,
        });
        true
    }

    pub fn remove_replica(&self, model_name: &str, gpu_id: i32) -> bool {
        let mut models = self.models.lock().unwrap();
        let Some(model) = models.get_mut(model_name) else {
            return false;
        };
        let Some(pos) = model.replicas.iter().position(|r| r.gpu_id == gpu_id) else {
            return false;
        };
        model.replicas.remove(pos);
        if model.next_index >= model.replicas.len() {
            model.next_index = 0;
        }
        true
    }

    pub fn replica_count(&self, model_name: &str) -> usize {
        self.models
            .lock()
            .unwrap()
            .get(model_name)
            .map(|m| m.replicas.len())
            .unwrap_or(0)
    }

    pub fn replica_status(&self, model_name: &str, gpu_id: i32) -> Option<ReplicaStatus> {
        self.models
            .lock()
            .unwrap()
            .get(model_name)?
            .replicas
            .iter()
            .find(|r| r.gpu_id == gpu_id)
            .map(|r| r.status)
    }

    pub fn set_replica_status(&self, model_name: &str, gpu_id: i32, status: ReplicaStatus) {
        if let Some(model) = self.models.lock().unwrap().get_mut(model_name) {
            if let Some(replica) = model.replicas.iter_mut().find(|r| r.gpu_id == gpu_id) {
                replica.status = status;
            }
        }
    }

    /// Scans forward from the model's cursor for an `Available` replica,
    /// advancing the cursor past whichever one is chosen. Returns `None`
    /// if the model has no replicas or none are available.
    pub fn select_next_replica(&self, model_name: &str) -> Option<i32> {
        let mut models = self.models.lock().unwrap();
        let model = models.get_mut(model_name)?;
        let count = model.replicas.len();
        if count == 0 {
            return None;
        }

        for attempt in 0..count {
            let index = (model.next_index + attempt) % count;
            if model.replicas[index].status == ReplicaStatus::Available {
                model.next_index = (index + 1) % count;
                return Some(model.replicas[index].gpu_id);
            }
        }
        None
    }

    pub fn available_gpus(&self, model_name: &str) -> BTreeSet<i32> {
        self.models
            .lock()
            .unwrap()
            .get(model_name)
            .map(|m| {
                m.replicas
                    .iter()
                    .filter(|r| r.status == ReplicaStatus::Available)
                    .map(|r| r.gpu_id)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_replica_rejects_duplicate_gpu() {
        let mgr = ReplicaManager::new();
        assert!(mgr.add_replica("qwen", 0));
        assert!(!mgr.add_replica("qwen", 0));
        assert_eq!(mgr.replica_count("qwen"), 1);
    }

    #[test]
    fn round_robin_cycles_through_available_replicas() {
        let mgr = ReplicaManager::new();
        mgr.add_replica("qwen", 0);
        mgr.add_replica("qwen", 1);

        assert_eq!(mgr.select_next_replica("qwen"), Some(0));
        assert_eq!(mgr.select_next_replica("qwen"), Some(1));
        assert_eq!(mgr.select_next_replica("qwen"), Some(0));
    }

    #[test]
    fn round_robin_skips_busy_and_failed_replicas() {
        let mgr = ReplicaManager::new();
        mgr.add_replica("qwen", 0);
        mgr.add_replica("qwen", 1);
        mgr.add_replica("qwen", 2);
        mgr.set_replica_status("qwen", 0, ReplicaStatus::Busy);
        mgr.set_replica_status("qwen", 1, ReplicaStatus::Failed);

        assert_eq!(mgr.select_next_replica("qwen"), Some(2));
        assert_eq!(mgr.select_next_replica("qwen"), Some(2));
    }

    #[test]
    fn select_returns_none_when_no_replica_available() {
        let mgr = ReplicaManager::new();
        mgr.add_replica("qwen", 0);
        mgr.set_replica_status("qwen", 0, ReplicaStatus::Failed);
        assert_eq!(mgr.select_next_replica("qwen"), None);
        assert_eq!(mgr.select_next_replica("missing-model"), None);
    }

    #[test]
    fn removing_a_replica_clamps_the_cursor() {
        let mgr = ReplicaManager::new();
        mgr.add_replica("qwen", 0);
        mgr.add_replica("qwen", 1);
        mgr.select_next_replica("qwen");
        mgr.select_next_replica("qwen");
        mgr.remove_replica("qwen", 1);
        // cursor was at index 0 (len 2, wrapped); after removal len is 1
        assert_eq!(mgr.select_next_replica("qwen"), Some(0));
    }

    #[test]
    fn available_gpus_excludes_non_available_status() {
        let mgr = ReplicaManager::new();
        mgr.add_replica("qwen", 0);
        mgr.add_replica("qwen", 1);
        mgr.set_replica_status("qwen", 1, ReplicaStatus::Busy);
        let available = mgr.available_gpus("qwen");
        assert_eq!(available, BTreeSet::from([0]));
    }
}
