//! In-memory [`StateStore`], grounded on `InMemoryWorkflowEventStore`: a
//! `parking_lot::RwLock`-guarded map, used for unit/integration tests and
//! the CLI demo so the full suite runs without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::model::{Instance, InstanceStatus, StepExecutionRecord};

use super::store::{StateStore, StoreError};

#[derive(Default)]
struct Inner {
    instances: HashMap<Uuid, Instance>,
    step_executions: HashMap<Uuid, StepExecutionRecord>,
}

/// In-memory state store. Not durable across process restarts; intended for
/// tests and the CLI demo, since the port is
/// implementation-neutral.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn create_instance(&self, instance: Instance) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.instances.insert(instance.id, instance);
        Ok(())
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<Instance>, StoreError> {
        Ok(self.inner.read().instances.get(&id).cloned())
    }

    async fn save_instance(&self, instance: Instance) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let stored_version = inner
            .instances
            .get(&instance.id)
            .map(|existing| existing.version)
            .ok_or(StoreError::InstanceNotFound(instance.id))?;

        if stored_version != instance.version - 1 {
            return Err(StoreError::ConcurrencyConflict {
                id: instance.id,
                expected: instance.version - 1,
                actual: stored_version,
            });
        }

        inner.instances.insert(instance.id, instance);
        Ok(())
    }

    async fn append_step_execution(&self, record: StepExecutionRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.step_executions.insert(record.id, record);
        Ok(())
    }

    async fn update_step_execution(&self, record: StepExecutionRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.step_executions.contains_key(&record.id) {
            return Err(StoreError::StepExecutionNotFound(record.id));
        }
        inner.step_executions.insert(record.id, record);
        Ok(())
    }

    async fn list_step_executions(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<StepExecutionRecord>, StoreError> {
        let inner = self.inner.read();
        let mut records: Vec<StepExecutionRecord> = inner
            .step_executions
            .values()
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.step_id.clone(), r.attempt));
        Ok(records)
    }

    async fn list_by_status(&self, status: InstanceStatus) -> Result<Vec<Instance>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .instances
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn create_then_load_round_trips() {
        let store = InMemoryStore::new();
        let instance = Instance::new(Uuid::now_v7(), "demo", Utc::now());
        let id = instance.id;

        store.create_instance(instance.clone()).await.unwrap();
        let loaded = store.load_instance(id).await.unwrap().unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.version, 0);
    }

    #[tokio::test]
    async fn save_instance_enforces_optimistic_concurrency() {
        let store = InMemoryStore::new();
        let mut instance = Instance::new(Uuid::now_v7(), "demo", Utc::now());
        store.create_instance(instance.clone()).await.unwrap();

        instance.version = 1;
        store.save_instance(instance.clone()).await.unwrap();

        // Stale write: version should have been bumped to 2 by the caller,
        // not re-sent as 1 again.
        let stale = instance.clone();
        let err = store.save_instance(stale).await.unwrap_err();
        assert!(matches!(err, StoreError::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let store = InMemoryStore::new();
        let mut running = Instance::new(Uuid::now_v7(), "demo", Utc::now());
        running.status = InstanceStatus::Running;
        let pending = Instance::new(Uuid::now_v7(), "demo", Utc::now());

        store.create_instance(running.clone()).await.unwrap();
        store.create_instance(pending).await.unwrap();

        let found = store.list_by_status(InstanceStatus::Running).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, running.id);
    }

    #[tokio::test]
    async fn list_step_executions_filters_by_instance_and_sorts() {
        let store = InMemoryStore::new();
        let instance_id = Uuid::now_v7();
        let other_id = Uuid::now_v7();

        let rec_b1 = StepExecutionRecord::new(instance_id, "b", 1, serde_json::Value::Null, Utc::now());
        let rec_a1 = StepExecutionRecord::new(instance_id, "a", 1, serde_json::Value::Null, Utc::now());
        let rec_other = StepExecutionRecord::new(other_id, "a", 1, serde_json::Value::Null, Utc::now());

        store.append_step_execution(rec_b1).await.unwrap();
        store.append_step_execution(rec_a1).await.unwrap();
        store.append_step_execution(rec_other).await.unwrap();

        let records = store.list_step_executions(instance_id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].step_id, "a");
        assert_eq!(records[1].step_id, "b");
    }
}
