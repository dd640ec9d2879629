use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::broker::{Broker, BrokerCore};
use crate::config;
use crate::errors::BrokerError;
use crate::task::{
    NewTask, Outcome, OutputChunk, Task, TaskFilter, TaskId, TaskStatus, TaskUpdate,
};

#[derive(Default)]
struct MemoryState {
    tasks: BTreeMap<TaskId, Task>,
    output: Vec<OutputChunk>,
}

/// Broker en memoria del proceso. Es el que usan los tests y el que el
/// master expone por HTTP.
pub struct MemoryBroker {
    core: BrokerCore,
    state: Mutex<MemoryState>,
    // Lock propio para asignar ids.
    next_id: Mutex<TaskId>,
    lease_timeout: Duration,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Self::with_lease_timeout(config::lease_timeout())
    }

    pub fn with_lease_timeout(lease_timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<MemoryBroker>| {
            let this: Weak<dyn Broker> = weak.clone();
            MemoryBroker {
                core: BrokerCore::new(this),
                state: Mutex::new(MemoryState::default()),
                next_id: Mutex::new(0),
                lease_timeout,
            }
        })
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    fn lease_expired(&self, last_active: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_active {
            None => true,
            Some(at) => (now - at)
                .to_std()
                .map(|age| age > self.lease_timeout)
                .unwrap_or(false),
        }
    }

    /// Limpia los leases de tareas pending cuyo último heartbeat venció, para
    /// que otro worker pueda tomarlas. Devuelve los ids liberados.
    pub fn reclaim_stale_leases(&self) -> Result<Vec<TaskId>, BrokerError> {
        let now = Utc::now();
        let mut state = self.state.lock()?;
        let mut reclaimed = Vec::new();
        for task in state.tasks.values_mut() {
            if task.status == TaskStatus::Pending
                && task.last_active.is_some()
                && self.lease_expired(task.last_active, now)
            {
                task.last_active = None;
                reclaimed.push(task.id);
            }
        }
        Ok(reclaimed)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn core(&self) -> &BrokerCore {
        &self.core
    }

    fn url(&self) -> String {
        config::DEFAULT_BROKER.to_string()
    }

    fn can_fork(&self) -> bool {
        false
    }

    async fn create(&self, tasks: Vec<NewTask>) -> Result<Vec<TaskId>, BrokerError> {
        let now = Utc::now();
        let ids: Vec<TaskId> = {
            let mut next = self.next_id.lock()?;
            let first = *next + 1;
            *next += tasks.len() as TaskId;
            (first..=*next).collect()
        };

        let mut state = self.state.lock()?;
        for (id, new) in ids.iter().zip(tasks) {
            state.tasks.insert(*id, Task::from_new(*id, new, now));
        }
        Ok(ids)
    }

    async fn fetch(&self, ids: &[TaskId]) -> Result<HashMap<TaskId, Task>, BrokerError> {
        let state = self.state.lock()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.tasks.get(id).map(|t| (*id, t.clone())))
            .collect())
    }

    async fn delete(&self, ids: &[TaskId]) -> Result<(), BrokerError> {
        let mut state = self.state.lock()?;
        for id in ids {
            state.tasks.remove(id);
        }
        state.output.retain(|chunk| !ids.contains(&chunk.task_id));
        Ok(())
    }

    async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<(), BrokerError> {
        let mut state = self.state.lock()?;
        let task = state.tasks.get_mut(&id).ok_or(BrokerError::NotFound(id))?;
        task.apply_update(&update);
        Ok(())
    }

    async fn set_status(
        &self,
        ids: &[TaskId],
        status: TaskStatus,
        outcome: Option<Outcome>,
    ) -> Result<Vec<TaskId>, BrokerError> {
        let mut state = self.state.lock()?;
        let mut changed = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(task) = state.tasks.get_mut(id) else {
                continue;
            };
            if !task.status.can_move_to(status) {
                continue;
            }
            task.status = status;
            changed.push(*id);
            match &outcome {
                Some(Outcome::Success(value)) => {
                    task.result = Some(value.clone());
                    task.exception = None;
                }
                Some(Outcome::Error(failure)) => {
                    task.result = None;
                    task.exception = Some(failure.clone());
                }
                None if status == TaskStatus::Pending => {
                    task.result = None;
                    task.exception = None;
                }
                None => {}
            }
        }
        Ok(changed)
    }

    async fn search(&self, filter: &TaskFilter) -> Result<Vec<Task>, BrokerError> {
        let state = self.state.lock()?;
        Ok(state
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn try_acquire(&self, id: TaskId) -> Result<bool, BrokerError> {
        let now = Utc::now();
        let mut state = self.state.lock()?;
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Pending || !self.lease_expired(task.last_active, now) {
            return Ok(false);
        }
        task.first_active.get_or_insert(now);
        task.last_active = Some(now);
        Ok(true)
    }

    async fn refresh_leases(&self, ids: &[TaskId]) -> Result<(), BrokerError> {
        let now = Utc::now();
        let mut state = self.state.lock()?;
        for id in ids {
            if let Some(task) = state.tasks.get_mut(id) {
                task.last_active = Some(now);
            }
        }
        Ok(())
    }

    async fn clear_lease(&self, id: TaskId) -> Result<(), BrokerError> {
        let mut state = self.state.lock()?;
        if let Some(task) = state.tasks.get_mut(&id) {
            task.last_active = None;
        }
        Ok(())
    }

    async fn append_output(&self, chunk: OutputChunk) -> Result<(), BrokerError> {
        self.state.lock()?.output.push(chunk);
        Ok(())
    }

    async fn get_output(&self, ids: &[TaskId]) -> Result<Vec<OutputChunk>, BrokerError> {
        let state = self.state.lock()?;
        let mut chunks: Vec<OutputChunk> = state
            .output
            .iter()
            .filter(|c| ids.contains(&c.task_id))
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.ctime);
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;
    use serde_json::json;

    #[tokio::test]
    async fn ids_crecientes_y_estado_creating() {
        let broker = MemoryBroker::new();
        let a = broker
            .create(vec![
                TaskSpec::call("str", vec![json!(1)]).normalize(vec![], vec![]),
                TaskSpec::call("str", vec![json!(2)]).normalize(vec![], vec![]),
            ])
            .await
            .unwrap();
        let b = broker
            .create(vec![TaskSpec::default().normalize(vec![], vec![])])
            .await
            .unwrap();
        assert_eq!(a, vec![1, 2]);
        assert_eq!(b, vec![3]);

        let tasks = broker.fetch(&[1, 2, 3, 99]).await.unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.values().all(|t| t.status == TaskStatus::Creating));
    }

    #[tokio::test]
    async fn ida_y_vuelta_de_campos() {
        let broker = MemoryBroker::new();
        let spec = TaskSpec::call("add", vec![json!(1), json!(2)])
            .with_name("suma")
            .with_priority(5)
            .with_cpus(0.5)
            .with_memory(1024)
            .with_host("node-*")
            .with_kwarg("k", json!("v"))
            .with_io_paths(vec!["/tmp".into()]);
        let new = spec.normalize(vec![], vec![]);
        let ids = broker.create(vec![new.clone()]).await.unwrap();
        broker.mark_pending(&ids).await.unwrap();

        let task = broker.fetch(&ids).await.unwrap().remove(&ids[0]).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.name.as_deref(), Some("suma"));
        assert_eq!(task.func.as_deref(), Some("add"));
        assert_eq!(task.args, new.args);
        assert_eq!(task.kwargs, new.kwargs);
        assert_eq!(task.priority, 5);
        assert_eq!(task.cpus, Some(0.5));
        assert_eq!(task.memory, Some(1024));
        assert_eq!(task.host.as_deref(), Some("node-*"));
        assert_eq!(task.user, new.user);
        assert_eq!(task.cwd, new.cwd);
        assert_eq!(task.io_paths, vec!["/tmp".to_string()]);
    }

    #[tokio::test]
    async fn lease_vencido_se_puede_retomar() {
        let broker = MemoryBroker::with_lease_timeout(Duration::from_millis(20));
        let ids = broker
            .create(vec![TaskSpec::default().normalize(vec![], vec![])])
            .await
            .unwrap();
        let id = ids[0];

        // creating: no se puede tomar
        assert!(!broker.try_acquire(id).await.unwrap());
        broker.mark_pending(&ids).await.unwrap();

        assert!(broker.try_acquire(id).await.unwrap());
        assert!(!broker.try_acquire(id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.reclaim_stale_leases().unwrap(), vec![id]);
        assert!(broker.try_acquire(id).await.unwrap());

        let task = broker.fetch(&ids).await.unwrap().remove(&id).unwrap();
        assert!(task.first_active.unwrap() <= task.last_active.unwrap());
    }

    #[tokio::test]
    async fn salida_ordenada_y_borrada_con_la_tarea() {
        let broker = MemoryBroker::new();
        let ids = broker
            .create(vec![
                TaskSpec::default().normalize(vec![], vec![]),
                TaskSpec::default().normalize(vec![], vec![]),
            ])
            .await
            .unwrap();

        broker.log_output(ids[0], 1, 0, b"uno\n".to_vec()).await.unwrap();
        broker.log_output(ids[1], 2, 0, b"otro\n".to_vec()).await.unwrap();
        broker.log_output(ids[0], 1, 4, b"dos\n".to_vec()).await.unwrap();

        let out = broker.get_output(&[ids[0]]).await.unwrap();
        let offsets: Vec<u64> = out.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 4]);

        broker.delete(&[ids[0]]).await.unwrap();
        assert!(broker.get_output(&[ids[0]]).await.unwrap().is_empty());
        assert_eq!(broker.get_output(&[ids[1]]).await.unwrap().len(), 1);
        assert!(broker.fetch(&[ids[0]]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_limpia_resultado() {
        let broker = MemoryBroker::new();
        let ids = broker
            .create(vec![TaskSpec::default().normalize(vec![], vec![])])
            .await
            .unwrap();
        broker.mark_pending(&ids).await.unwrap();
        broker
            .mark_error(ids[0], crate::errors::TaskFailure::raised("ValueError", "x"))
            .await
            .unwrap();
        broker.mark_pending(&ids).await.unwrap();

        let task = broker.fetch(&ids).await.unwrap().remove(&ids[0]).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.exception.is_none());
        let pending = broker.search(&TaskFilter::status(TaskStatus::Pending)).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn update_de_tarea_inexistente() {
        let broker = MemoryBroker::new();
        let err = broker.update(42, TaskUpdate::default()).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(42)));
    }

    #[tokio::test]
    async fn set_status_devuelve_solo_los_que_cambian() {
        let broker = MemoryBroker::new();
        let ids = broker
            .create(vec![
                TaskSpec::default().normalize(vec![], vec![]),
                TaskSpec::default().normalize(vec![], vec![]),
            ])
            .await
            .unwrap();
        broker.mark_pending(&ids).await.unwrap();
        broker.mark_killed(&ids[..1]).await.unwrap();

        let changed = broker
            .set_status(&[ids[0], ids[1], 999], TaskStatus::Paused, None)
            .await
            .unwrap();
        assert_eq!(changed, vec![ids[1]]);

        let changed = broker
            .set_status(&ids, TaskStatus::Pending, None)
            .await
            .unwrap();
        assert_eq!(changed, ids);
    }
}
