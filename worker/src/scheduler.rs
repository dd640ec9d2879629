use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use common::broker::Broker;
use common::errors::{BrokerError, TaskFailure};
use common::task::{Task, TaskFilter, TaskId, TaskStatus};
use tracing::{info, warn};

use crate::priority::{calculate_priority, MountTable, PriorityKey};

/// Recorrido de las tareas pendientes listas para correr, en orden de
/// prioridad.
///
/// Cada llamada a `next` saca la mejor candidata todavía no considerada y
/// mira sus dependencias: si falta alguna o alguna terminó mal, la tarea se
/// marca con error y se saltea; si alguna sigue pendiente, esa dependencia
/// pasa a ser candidata. Sólo se devuelven tareas con todas sus
/// dependencias en success.
pub struct OpenTasks {
    broker: Arc<dyn Broker>,
    mounts: Arc<MountTable>,
    candidates: Vec<Task>,
    cache: HashMap<TaskId, Task>,
    priorities: HashMap<TaskId, PriorityKey>,
    considered: HashSet<TaskId>,
}

impl OpenTasks {
    pub async fn start(
        broker: Arc<dyn Broker>,
        mounts: Arc<MountTable>,
    ) -> Result<Self, BrokerError> {
        let candidates = broker
            .search(&TaskFilter::status(TaskStatus::Pending))
            .await?;
        let cache = candidates.iter().map(|t| (t.id, t.clone())).collect();
        Ok(Self {
            broker,
            mounts,
            candidates,
            cache,
            priorities: HashMap::new(),
            considered: HashSet::new(),
        })
    }

    pub async fn next(&mut self) -> Result<Option<Task>, BrokerError> {
        loop {
            let considered = &self.considered;
            self.candidates
                .retain(|t| t.status == TaskStatus::Pending && !considered.contains(&t.id));
            if self.candidates.is_empty() {
                return Ok(None);
            }

            for task in &self.candidates {
                if !self.priorities.contains_key(&task.id) {
                    let key = calculate_priority(task, &self.mounts);
                    self.priorities.insert(task.id, key);
                }
            }

            let best = self
                .candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, t)| self.priorities.get(&t.id).copied())
                .map(|(i, _)| i);
            let Some(best) = best else {
                return Ok(None);
            };
            let task = self.candidates.swap_remove(best);
            self.considered.insert(task.id);

            let uncached: Vec<TaskId> = task
                .dependencies
                .iter()
                .copied()
                .filter(|id| !self.cache.contains_key(id))
                .collect();
            if !uncached.is_empty() {
                let fetched = self.broker.fetch(&uncached).await?;
                self.cache.extend(fetched);
            }

            if !self.dependencies_ready(&task).await? {
                continue;
            }

            // Releer: puede haber cambiado mientras tanto.
            let fresh = self.broker.fetch(&[task.id]).await?.remove(&task.id);
            match fresh {
                Some(fresh) if fresh.status == TaskStatus::Pending => return Ok(Some(fresh)),
                _ => continue,
            }
        }
    }

    /// `false` si la tarea no puede correr todavía (o nunca).
    async fn dependencies_ready(&mut self, task: &Task) -> Result<bool, BrokerError> {
        let mut ready = true;
        for dep_id in &task.dependencies {
            let Some(dep) = self.cache.get(dep_id) else {
                warn!("tarea {} depende de {} que no existe", task.id, dep_id);
                self.broker
                    .mark_error(task.id, TaskFailure::dependency_resolution(*dep_id))
                    .await?;
                return Ok(false);
            };

            match dep.status {
                TaskStatus::Success => {}
                TaskStatus::Pending => {
                    ready = false;
                    let queued = self.candidates.iter().any(|t| t.id == dep.id);
                    if !queued && !self.considered.contains(&dep.id) {
                        self.candidates.push(dep.clone());
                    }
                }
                TaskStatus::Paused | TaskStatus::Creating => ready = false,
                status @ (TaskStatus::Error | TaskStatus::Killed) => {
                    info!("tarea {} tiene la dependencia {} en {}", task.id, dep_id, status);
                    self.broker
                        .mark_error(task.id, TaskFailure::dependency_failed(*dep_id, status))
                        .await?;
                    return Ok(false);
                }
            }
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::brokers::MemoryBroker;
    use common::dag::PrototypeGraph;
    use common::errors::FailureKind;
    use common::queue::Queue;
    use common::task::TaskSpec;

    async fn drain(broker: &Arc<dyn Broker>) -> Vec<TaskId> {
        let mut open = OpenTasks::start(broker.clone(), Arc::new(MountTable::default()))
            .await
            .unwrap();
        let mut ids = Vec::new();
        while let Some(task) = open.next().await.unwrap() {
            ids.push(task.id);
        }
        ids
    }

    #[tokio::test]
    async fn dependencias_abren_en_orden() {
        let broker: Arc<dyn Broker> = MemoryBroker::new();
        let queue = Queue::new(broker.clone());

        let mut g = PrototypeGraph::new();
        let a = g.add(TaskSpec::default());
        let b = g.add(TaskSpec::default());
        let c = g.add(TaskSpec::default());
        g.depend_on(a, b).unwrap();
        g.depend_on(a, c).unwrap();
        let futures = queue.submit_many(&g, &[a]).await.unwrap();
        let (fa, fb, fc) = (futures[&a].id(), futures[&b].id(), futures[&c].id());

        assert_eq!(drain(&broker).await, vec![fb, fc]);

        broker.mark_success(fb, serde_json::Value::Null).await.unwrap();
        assert_eq!(drain(&broker).await, vec![fc]);

        broker.mark_success(fc, serde_json::Value::Null).await.unwrap();
        assert_eq!(drain(&broker).await, vec![fa]);
    }

    #[tokio::test]
    async fn prioridad_manda() {
        let broker: Arc<dyn Broker> = MemoryBroker::new();
        let queue = Queue::new(broker.clone());
        let low = queue.submit(TaskSpec::default().with_priority(1)).await.unwrap();
        let high = queue.submit(TaskSpec::default().with_priority(5000)).await.unwrap();
        let normal = queue.submit(TaskSpec::default()).await.unwrap();

        assert_eq!(drain(&broker).await, vec![high.id(), normal.id(), low.id()]);
    }

    #[tokio::test]
    async fn dependencia_faltante_o_fallida_marca_error() {
        let broker: Arc<dyn Broker> = MemoryBroker::new();
        let queue = Queue::new(broker.clone());

        let mut g = PrototypeGraph::new();
        let orphan = g.add(TaskSpec::default());
        g.depend(orphan, common::dag::Dep::Id(123456)).unwrap();
        let orphan = queue.submit_graph(&g, orphan).await.unwrap();

        let failed = queue.submit(TaskSpec::default()).await.unwrap();
        broker
            .mark_error(failed.id(), TaskFailure::raised("ValueError", "x"))
            .await
            .unwrap();
        let mut g = PrototypeGraph::new();
        let child = g.add(TaskSpec::default());
        g.depend(child, failed.clone().into()).unwrap();
        let child = queue.submit_graph(&g, child).await.unwrap();

        assert!(drain(&broker).await.is_empty());

        let err = orphan.result().await.unwrap_err();
        assert_eq!(err.failure().unwrap().kind, FailureKind::DependencyResolution);
        let err = child.result().await.unwrap_err();
        assert_eq!(err.failure().unwrap().kind, FailureKind::DependencyFailed);
    }

    #[tokio::test]
    async fn dependencia_killed_marca_error() {
        let broker: Arc<dyn Broker> = MemoryBroker::new();
        let queue = Queue::new(broker.clone());
        let dep = queue.submit(TaskSpec::default()).await.unwrap();
        broker.mark_killed(&[dep.id()]).await.unwrap();

        let mut g = PrototypeGraph::new();
        let child = g.add(TaskSpec::default());
        g.depend(child, dep.clone().into()).unwrap();
        let child = queue.submit_graph(&g, child).await.unwrap();

        assert!(drain(&broker).await.is_empty());
        let err = child.result().await.unwrap_err();
        let failure = err.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::DependencyFailed);
        assert!(failure.message.contains(&dep.id().to_string()));
    }

    #[tokio::test]
    async fn dependencia_pausada_bloquea_sin_error() {
        let broker: Arc<dyn Broker> = MemoryBroker::new();
        let queue = Queue::new(broker.clone());
        let dep = queue.submit(TaskSpec::default()).await.unwrap();
        broker.mark_paused(&[dep.id()]).await.unwrap();

        let mut g = PrototypeGraph::new();
        let child = g.add(TaskSpec::default());
        g.depend(child, dep.into()).unwrap();
        let child = queue.submit_graph(&g, child).await.unwrap();

        assert!(drain(&broker).await.is_empty());
        assert_eq!(child.status().await.unwrap(), TaskStatus::Pending);
    }
}
