//! Contrato del broker: persistencia de tareas, leases, log de salida y
//! eventos. Cada backend implementa las operaciones crudas; las transiciones
//! con notificación, los leases con heartbeat y el dispatch local viven en
//! los métodos provistos del trait y en [`BrokerCore`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config;
use crate::errors::{BrokerError, TaskFailure};
use crate::eventloop::{EventLoop, Selection, TimerId};
use crate::events::{
    output_event, status_event, status_event_for_task, BindingId, Callback, EventHub,
    EventPayload,
};
use crate::future::TaskFuture;
use crate::task::{
    NewTask, Outcome, OutputChunk, Task, TaskFilter, TaskId, TaskStatus, TaskUpdate,
};

#[async_trait]
pub trait Broker: Send + Sync {
    /// Estado compartido por todos los backends.
    fn core(&self) -> &BrokerCore;

    /// URL con la que otro proceso se conecta a este mismo broker.
    fn url(&self) -> String;

    /// Si es seguro usar el broker desde un proceso hijo.
    fn can_fork(&self) -> bool;

    /* --------- operaciones crudas de cada backend --------- */

    /// Asigna ids (en orden) y guarda las filas en estado `creating`.
    async fn create(&self, tasks: Vec<NewTask>) -> Result<Vec<TaskId>, BrokerError>;

    /// Los ids que no existen simplemente no aparecen en el mapa.
    async fn fetch(&self, ids: &[TaskId]) -> Result<HashMap<TaskId, Task>, BrokerError>;

    async fn delete(&self, ids: &[TaskId]) -> Result<(), BrokerError>;

    /// Cambia campos sin notificar a nadie.
    async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<(), BrokerError>;

    /// Transición cruda; `outcome` rellena result o exception. Las que no
    /// respetan [`TaskStatus::can_move_to`] se ignoran; devuelve los ids que
    /// cambiaron.
    async fn set_status(
        &self,
        ids: &[TaskId],
        status: TaskStatus,
        outcome: Option<Outcome>,
    ) -> Result<Vec<TaskId>, BrokerError>;

    async fn search(&self, filter: &TaskFilter) -> Result<Vec<Task>, BrokerError>;

    /// Check-and-set atómico: la tarea sigue pending y nadie la tiene (o su
    /// último heartbeat es más viejo que el timeout del lease).
    async fn try_acquire(&self, id: TaskId) -> Result<bool, BrokerError>;

    async fn refresh_leases(&self, ids: &[TaskId]) -> Result<(), BrokerError>;

    async fn clear_lease(&self, id: TaskId) -> Result<(), BrokerError>;

    async fn append_output(&self, chunk: OutputChunk) -> Result<(), BrokerError>;

    /// Salida de las tareas ordenada por tiempo.
    async fn get_output(&self, ids: &[TaskId]) -> Result<Vec<OutputChunk>, BrokerError>;

    /// Propaga eventos a otros procesos. Los backends sin pub/sub no hacen nada.
    async fn send_remote_events(
        &self,
        _events: &[String],
        _payload: &EventPayload,
    ) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Se llama cuando aparece un binding o un future que necesita eventos
    /// de otros procesos.
    fn listen(&self) {}

    /* --------- provistos --------- */

    fn get_future(&self, id: TaskId) -> Result<Arc<TaskFuture>, BrokerError> {
        let future = self.core().future(id)?;
        self.listen();
        Ok(future)
    }

    async fn mark_pending(&self, ids: &[TaskId]) -> Result<(), BrokerError> {
        self.transition(ids, TaskStatus::Pending, None).await
    }

    async fn mark_paused(&self, ids: &[TaskId]) -> Result<(), BrokerError> {
        self.transition(ids, TaskStatus::Paused, None).await
    }

    async fn mark_killed(&self, ids: &[TaskId]) -> Result<(), BrokerError> {
        self.transition(ids, TaskStatus::Killed, None).await
    }

    async fn mark_success(&self, id: TaskId, result: Value) -> Result<(), BrokerError> {
        self.transition(&[id], TaskStatus::Success, Some(Outcome::Success(result)))
            .await
    }

    async fn mark_error(&self, id: TaskId, failure: TaskFailure) -> Result<(), BrokerError> {
        self.transition(&[id], TaskStatus::Error, Some(Outcome::Error(failure)))
            .await
    }

    /// Transición + resolución de futures locales + notificación.
    async fn transition(
        &self,
        ids: &[TaskId],
        status: TaskStatus,
        outcome: Option<Outcome>,
    ) -> Result<(), BrokerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let changed = self.set_status(ids, status, outcome.clone()).await?;
        if changed.len() < ids.len() {
            debug!(
                "{} de {} tareas no pasan a {}",
                ids.len() - changed.len(),
                ids.len(),
                status
            );
        }
        if changed.is_empty() {
            return Ok(());
        }

        if let Some(outcome) = outcome {
            for id in &changed {
                self.core().fulfil(*id, outcome.clone());
            }
        }

        let mut events: Vec<String> = changed.iter().map(|id| status_event_for_task(*id)).collect();
        events.push(status_event(status));
        self.trigger(
            &events,
            EventPayload::Status {
                ids: changed,
                status,
            },
        )
        .await;
        Ok(())
    }

    fn bind(&self, event: &str, callback: Callback) -> BindingId {
        let binding = self.core().events().bind(event, callback);
        self.listen();
        binding
    }

    fn unbind(&self, event: &str, binding: BindingId) -> bool {
        self.core().events().unbind(event, binding)
    }

    /// Dispatch local (aislado por callback) y luego propagación remota
    /// best-effort.
    async fn trigger(&self, events: &[String], payload: EventPayload) {
        self.core().dispatch_local(events, &payload);
        if let Err(e) = self.send_remote_events(events, &payload).await {
            warn!("no se pudieron propagar eventos {:?}: {}", events, e);
        }
    }

    /// `false` si otro la tiene o ya no está pending; no es un error.
    async fn acquire(&self, id: TaskId) -> Result<bool, BrokerError> {
        if self.core().is_held(id) {
            return Ok(false);
        }
        if self.try_acquire(id).await? {
            self.core().hold(id);
            debug!("lease tomado sobre tarea {}", id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Liberar una tarea que no tenemos no hace nada.
    async fn release(&self, id: TaskId) -> Result<(), BrokerError> {
        if self.core().unhold(id) {
            self.clear_lease(id).await?;
            debug!("lease liberado sobre tarea {}", id);
        }
        Ok(())
    }

    async fn log_output(
        &self,
        id: TaskId,
        fd: i32,
        offset: u64,
        content: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.append_output(OutputChunk {
            task_id: id,
            ctime: Utc::now(),
            fd,
            offset,
            content: content.clone(),
        })
        .await?;
        self.trigger(
            &[output_event(id)],
            EventPayload::Output {
                id,
                fd,
                offset,
                data: content,
            },
        )
        .await;
        Ok(())
    }
}

/// Estado compartido de un broker: hub de eventos, loop de eventos, cache
/// de futures y leases tomados por este proceso.
pub struct BrokerCore {
    this: Weak<dyn Broker>,
    events: EventHub,
    event_loop: EventLoop,
    futures: Mutex<HashMap<TaskId, Weak<TaskFuture>>>,
    held: Mutex<HashSet<TaskId>>,
    heartbeat: Mutex<Option<TimerId>>,
    heartbeat_interval: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl BrokerCore {
    /// `this` apunta al broker dueño; se arma con `Arc::new_cyclic`.
    pub fn new(this: Weak<dyn Broker>) -> Self {
        Self::with_heartbeat(this, config::heartbeat_interval())
    }

    pub fn with_heartbeat(this: Weak<dyn Broker>, heartbeat_interval: Duration) -> Self {
        Self {
            this,
            events: EventHub::new(),
            event_loop: EventLoop::new(),
            futures: Mutex::new(HashMap::new()),
            held: Mutex::new(HashSet::new()),
            heartbeat: Mutex::new(None),
            heartbeat_interval,
        }
    }

    pub fn broker(&self) -> Option<Arc<dyn Broker>> {
        self.this.upgrade()
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /* --------- futures --------- */

    /// Mismo id, misma instancia mientras alguien la tenga.
    pub fn future(&self, id: TaskId) -> Result<Arc<TaskFuture>, BrokerError> {
        let mut futures = lock(&self.futures);
        if let Some(existing) = futures.get(&id).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let broker = self.broker().ok_or(BrokerError::Closed)?;
        let future = Arc::new(TaskFuture::new(id, broker));
        futures.insert(id, Arc::downgrade(&future));
        Ok(future)
    }

    fn cached_future(&self, id: TaskId) -> Option<Arc<TaskFuture>> {
        lock(&self.futures).get(&id).and_then(Weak::upgrade)
    }

    fn fulfil(&self, id: TaskId, outcome: Outcome) {
        if let Some(future) = self.cached_future(id) {
            future.fulfil(outcome);
        }
    }

    /// Hay futures vivos todavía sin resolver.
    pub fn has_pending_futures(&self) -> bool {
        let mut futures = lock(&self.futures);
        futures.retain(|_, weak| weak.strong_count() > 0);
        futures
            .values()
            .filter_map(Weak::upgrade)
            .any(|f| !f.is_resolved())
    }

    /// Algo en este proceso espera eventos de otros procesos.
    pub fn wants_events(&self) -> bool {
        self.events.has_bindings() || self.has_pending_futures() || !lock(&self.held).is_empty()
    }

    /// Callbacks locales y despertar los futures de las tareas afectadas.
    pub fn dispatch_local(&self, events: &[String], payload: &EventPayload) {
        self.events.dispatch(events, payload);
        if let EventPayload::Status { ids, .. } = payload {
            for id in ids {
                if let Some(future) = self.cached_future(*id) {
                    future.wake();
                }
            }
        }
    }

    /* --------- leases --------- */

    pub fn held_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = lock(&self.held).iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_held(&self, id: TaskId) -> bool {
        lock(&self.held).contains(&id)
    }

    fn hold(&self, id: TaskId) {
        lock(&self.held).insert(id);

        let mut heartbeat = lock(&self.heartbeat);
        if heartbeat.is_none() {
            let this = self.this.clone();
            let timer = self.event_loop.add_timer(
                self.heartbeat_interval,
                Box::new(move || {
                    let this = this.clone();
                    async move { heartbeat_tick(this).await }.boxed()
                }),
            );
            *heartbeat = Some(timer);
            drop(heartbeat);
            self.event_loop.start_thread();
        }
    }

    fn unhold(&self, id: TaskId) -> bool {
        lock(&self.held).remove(&id)
    }
}

async fn heartbeat_tick(this: Weak<dyn Broker>) -> Selection {
    let Some(broker) = this.upgrade() else {
        return Selection::Stop;
    };

    let ids = {
        let core = broker.core();
        let mut heartbeat = lock(&core.heartbeat);
        let ids = core.held_ids();
        if ids.is_empty() {
            *heartbeat = None;
            return Selection::Stop;
        }
        ids
    };

    if let Err(e) = broker.refresh_leases(&ids).await {
        warn!("heartbeat de {} leases falló: {}", ids.len(), e);
    }
    Selection::Continue
}
