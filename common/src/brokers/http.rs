use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::broker::{Broker, BrokerCore};
use crate::errors::BrokerError;
use crate::eventloop::{Selection, TimerId};
use crate::events::EventPayload;
use crate::task::{
    NewTask, Outcome, OutputChunk, Task, TaskFilter, TaskId, TaskStatus, TaskUpdate,
};
use crate::{
    AcquireResponse, CreateTasksRequest, CreateTasksResponse, EventsResponse, OkResponse,
    OutputResponse, PublishRequest, SetStatusRequest, SetStatusResponse, TaskIdsRequest,
    TasksResponse,
};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Cliente del broker que expone `dagq-master`.
///
/// Los eventos propios se publican con POST; los de otros procesos se leen
/// con un timer de poll sobre el loop de eventos del broker, que sólo corre
/// mientras haya bindings, futures sin resolver o leases tomados.
pub struct HttpBroker {
    core: BrokerCore,
    me: Weak<HttpBroker>,
    client: Client,
    base: Url,
    origin: String,
    cursor: Mutex<Option<u64>>,
    poller: Mutex<Option<TimerId>>,
}

impl HttpBroker {
    /// Arma el cliente y toma la cabeza actual del log de eventos del master
    /// para no reprocesar eventos viejos.
    pub async fn connect(base: Url) -> Arc<Self> {
        let broker = Self::new(base);
        match broker.events_since(None).await {
            Ok(head) => *lock(&broker.cursor) = Some(head.next),
            Err(e) => warn!("no se pudo leer el log de eventos de {}: {}", broker.base, e),
        }
        info!("conectado al broker {}", broker.base);
        broker
    }

    pub fn new(base: Url) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<HttpBroker>| {
            let this: Weak<dyn Broker> = weak.clone();
            HttpBroker {
                core: BrokerCore::new(this),
                me: weak.clone(),
                client: Client::new(),
                base,
                origin: Uuid::new_v4().to_string(),
                cursor: Mutex::new(None),
                poller: Mutex::new(None),
            }
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn endpoint(&self, path: &str) -> Result<Url, BrokerError> {
        self.base.join(path).map_err(|e| BrokerError::InvalidUrl {
            url: format!("{}{}", self.base, path),
            reason: e.to_string(),
        })
    }

    async fn check(resp: Response) -> Result<Response, BrokerError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BrokerError::Remote {
            status: status.as_u16(),
            body,
        })
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, BrokerError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let resp = self.client.post(self.endpoint(path)?).json(body).send().await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }

    async fn events_since(&self, since: Option<u64>) -> Result<EventsResponse, BrokerError> {
        let mut url = self.endpoint("/api/v1/events")?;
        if let Some(since) = since {
            url.query_pairs_mut().append_pair("since", &since.to_string());
        }
        let resp = Self::check(self.client.get(url).send().await?).await?;
        Ok(resp.json().await?)
    }

    /// Lee los eventos nuevos del master y los despacha localmente,
    /// salteando los que publicó este mismo proceso.
    pub async fn poll_events(&self) -> Result<usize, BrokerError> {
        let since = *lock(&self.cursor);
        let page = self.events_since(since).await?;

        let mut dispatched = 0;
        if since.is_some() {
            for event in page.events.iter().filter(|e| e.origin != self.origin) {
                self.core.dispatch_local(&event.events, &event.payload);
                dispatched += 1;
            }
        }
        *lock(&self.cursor) = Some(page.next);
        Ok(dispatched)
    }
}

async fn poll_tick(me: Weak<HttpBroker>) -> Selection {
    let Some(broker) = me.upgrade() else {
        return Selection::Stop;
    };

    {
        let mut poller = lock(&broker.poller);
        if !broker.core.wants_events() {
            debug!("nadie espera eventos; se detiene el poll");
            *poller = None;
            return Selection::Stop;
        }
    }

    if let Err(e) = broker.poll_events().await {
        debug!("poll de eventos falló: {}", e);
    }
    Selection::Continue
}

#[async_trait]
impl Broker for HttpBroker {
    fn core(&self) -> &BrokerCore {
        &self.core
    }

    fn url(&self) -> String {
        self.base.to_string()
    }

    fn can_fork(&self) -> bool {
        true
    }

    fn listen(&self) {
        {
            let mut poller = lock(&self.poller);
            if poller.is_none() {
                let me = self.me.clone();
                let timer = self.core.event_loop().add_timer(
                    POLL_INTERVAL,
                    Box::new(move || {
                        let me = me.clone();
                        async move { poll_tick(me).await }.boxed()
                    }),
                );
                *poller = Some(timer);
            }
        }
        self.core.event_loop().start_thread();
    }

    async fn create(&self, tasks: Vec<NewTask>) -> Result<Vec<TaskId>, BrokerError> {
        let resp: CreateTasksResponse = self
            .post("/api/v1/tasks", &CreateTasksRequest { tasks })
            .await?;
        Ok(resp.ids)
    }

    async fn fetch(&self, ids: &[TaskId]) -> Result<HashMap<TaskId, Task>, BrokerError> {
        let resp: TasksResponse = self
            .post("/api/v1/tasks/fetch", &TaskIdsRequest { ids: ids.to_vec() })
            .await?;
        Ok(resp.tasks.into_iter().map(|t| (t.id, t)).collect())
    }

    async fn delete(&self, ids: &[TaskId]) -> Result<(), BrokerError> {
        let _: OkResponse = self
            .post("/api/v1/tasks/delete", &TaskIdsRequest { ids: ids.to_vec() })
            .await?;
        Ok(())
    }

    async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<(), BrokerError> {
        let url = self.endpoint(&format!("/api/v1/tasks/{}", id))?;
        let resp = self.client.patch(url).json(&update).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BrokerError::NotFound(id));
        }
        Self::check(resp).await?;
        Ok(())
    }

    async fn set_status(
        &self,
        ids: &[TaskId],
        status: TaskStatus,
        outcome: Option<Outcome>,
    ) -> Result<Vec<TaskId>, BrokerError> {
        let resp: SetStatusResponse = self
            .post(
                "/api/v1/tasks/status",
                &SetStatusRequest {
                    ids: ids.to_vec(),
                    status,
                    outcome,
                },
            )
            .await?;
        Ok(resp.changed)
    }

    async fn search(&self, filter: &TaskFilter) -> Result<Vec<Task>, BrokerError> {
        let resp: TasksResponse = self.post("/api/v1/tasks/search", filter).await?;
        Ok(resp.tasks)
    }

    async fn try_acquire(&self, id: TaskId) -> Result<bool, BrokerError> {
        let resp: AcquireResponse = self
            .post(&format!("/api/v1/tasks/{}/acquire", id), &())
            .await?;
        Ok(resp.acquired)
    }

    async fn refresh_leases(&self, ids: &[TaskId]) -> Result<(), BrokerError> {
        let _: OkResponse = self
            .post("/api/v1/tasks/heartbeat", &TaskIdsRequest { ids: ids.to_vec() })
            .await?;
        Ok(())
    }

    async fn clear_lease(&self, id: TaskId) -> Result<(), BrokerError> {
        let _: OkResponse = self
            .post(&format!("/api/v1/tasks/{}/release", id), &())
            .await?;
        Ok(())
    }

    async fn append_output(&self, chunk: OutputChunk) -> Result<(), BrokerError> {
        let _: OkResponse = self
            .post(&format!("/api/v1/tasks/{}/output", chunk.task_id), &chunk)
            .await?;
        Ok(())
    }

    async fn get_output(&self, ids: &[TaskId]) -> Result<Vec<OutputChunk>, BrokerError> {
        let resp: OutputResponse = self
            .post("/api/v1/output", &TaskIdsRequest { ids: ids.to_vec() })
            .await?;
        Ok(resp.chunks)
    }

    async fn send_remote_events(
        &self,
        events: &[String],
        payload: &EventPayload,
    ) -> Result<(), BrokerError> {
        let _: OkResponse = self
            .post(
                "/api/v1/events",
                &PublishRequest {
                    origin: self.origin.clone(),
                    events: events.to_vec(),
                    payload: payload.clone(),
                },
            )
            .await?;
        Ok(())
    }
}
