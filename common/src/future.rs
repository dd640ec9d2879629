use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::Broker;
use crate::errors::{BrokerError, FutureError, TaskFailure};
use crate::task::{Outcome, Task, TaskId, TaskStatus};

/// Cada cuánto `wait` vuelve a mirar el broker aunque no llegue evento.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Handle del lado del cliente sobre una tarea. Se obtiene con
/// `Broker::get_future`, que devuelve siempre la misma instancia para el
/// mismo id.
pub struct TaskFuture {
    id: TaskId,
    broker: Arc<dyn Broker>,
    outcome: OnceLock<Outcome>,
    changed: Notify,
}

impl fmt::Debug for TaskFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture")
            .field("id", &self.id)
            .field("outcome", &self.outcome.get())
            .finish()
    }
}

impl TaskFuture {
    pub(crate) fn new(id: TaskId, broker: Arc<dyn Broker>) -> Self {
        Self {
            id,
            broker,
            outcome: OnceLock::new(),
            changed: Notify::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Sólo el primer resultado cuenta.
    pub(crate) fn fulfil(&self, outcome: Outcome) {
        let _ = self.outcome.set(outcome);
        self.changed.notify_waiters();
    }

    pub(crate) fn wake(&self) {
        self.changed.notify_waiters();
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome.get().is_some()
    }

    pub async fn task(&self) -> Result<Task, FutureError> {
        let mut tasks = self.broker.fetch(&[self.id]).await?;
        tasks
            .remove(&self.id)
            .ok_or(FutureError::Broker(BrokerError::NotFound(self.id)))
    }

    pub async fn status(&self) -> Result<TaskStatus, FutureError> {
        Ok(self.task().await?.status)
    }

    /// Futures de las dependencias directas.
    pub async fn dependencies(&self) -> Result<Vec<Arc<TaskFuture>>, FutureError> {
        let task = self.task().await?;
        task.dependencies
            .iter()
            .map(|id| self.broker.get_future(*id).map_err(FutureError::from))
            .collect()
    }

    /// Resultado sin esperar: si la tarea no terminó devuelve
    /// `FutureError::Incomplete`.
    pub async fn result(&self) -> Result<Value, FutureError> {
        if let Some(outcome) = self.outcome.get() {
            return self.unpack(outcome);
        }

        let task = self.task().await?;
        let outcome = match task.status {
            TaskStatus::Success => Outcome::Success(task.result.unwrap_or(Value::Null)),
            TaskStatus::Error => Outcome::Error(
                task.exception
                    .unwrap_or_else(|| TaskFailure::raised("Error", "task failed without a stored error")),
            ),
            TaskStatus::Killed => return Err(FutureError::Killed(self.id)),
            status => {
                return Err(FutureError::Incomplete {
                    id: self.id,
                    status,
                })
            }
        };

        let _ = self.outcome.set(outcome);
        match self.outcome.get() {
            Some(outcome) => self.unpack(outcome),
            None => Err(FutureError::Broker(BrokerError::NotFound(self.id))),
        }
    }

    /// Espera a que la tarea termine. Se despierta con cada evento de status
    /// de la tarea y, por si se pierde alguno, revisa el broker cada segundo.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Value, FutureError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self.result().await {
                Err(FutureError::Incomplete { .. }) => {}
                other => return other,
            }

            let mut pause = POLL_INTERVAL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(FutureError::Timeout(self.id));
                }
                pause = pause.min(deadline - now);
            }

            tokio::select! {
                _ = &mut changed => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    fn unpack(&self, outcome: &Outcome) -> Result<Value, FutureError> {
        match outcome {
            Outcome::Success(value) => Ok(value.clone()),
            Outcome::Error(failure) => Err(FutureError::Failed {
                id: self.id,
                failure: failure.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::memory::MemoryBroker;
    use crate::errors::FailureKind;
    use crate::task::TaskSpec;
    use serde_json::json;

    async fn pending(broker: &Arc<MemoryBroker>) -> TaskId {
        let ids = broker
            .create(vec![TaskSpec::call("str", vec![json!(1)]).normalize(vec![], vec![])])
            .await
            .unwrap();
        broker.mark_pending(&ids).await.unwrap();
        ids[0]
    }

    #[tokio::test]
    async fn pendiente_da_incomplete_sin_bloquear() {
        let broker = MemoryBroker::new();
        let id = pending(&broker).await;
        let future = broker.get_future(id).unwrap();
        match future.result().await {
            Err(FutureError::Incomplete { status, .. }) => assert_eq!(status, TaskStatus::Pending),
            other => panic!("esperaba Incomplete, vino {:?}", other),
        }
    }

    #[tokio::test]
    async fn wait_con_timeout() {
        let broker = MemoryBroker::new();
        let id = pending(&broker).await;
        let future = broker.get_future(id).unwrap();
        let err = future
            .wait(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, FutureError::Timeout(t) if t == id));
    }

    #[tokio::test]
    async fn wait_despierta_con_mark_success() {
        let broker = MemoryBroker::new();
        let id = pending(&broker).await;
        let future = broker.get_future(id).unwrap();

        let b = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            b.mark_success(id, json!("listo")).await.unwrap();
        });

        let value = future.wait(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(value, json!("listo"));
    }

    #[tokio::test]
    async fn error_guardado_se_devuelve_igual() {
        let broker = MemoryBroker::new();
        let id = pending(&broker).await;
        broker
            .mark_error(id, TaskFailure::raised("ValueError", "not an int"))
            .await
            .unwrap();

        // future nuevo: resuelve leyendo el broker
        let future = broker.get_future(id).unwrap();
        let err = future.result().await.unwrap_err();
        let failure = err.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Raised("ValueError".into()));
        assert_eq!(failure.message, "not an int");
    }

    #[tokio::test]
    async fn killed_no_se_cachea() {
        let broker = MemoryBroker::new();
        let id = pending(&broker).await;
        let future = broker.get_future(id).unwrap();
        broker.mark_killed(&[id]).await.unwrap();
        assert!(matches!(future.result().await, Err(FutureError::Killed(_))));
        assert!(!future.is_resolved());
    }
}
