use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::broker::Broker;
use common::errors::TaskFailure;
use common::eventloop::{EventLoop, SourceId};
use common::events::{status_event, BindingId, Event};
use common::patterns::{Registry, TaskContext};
use common::task::{Task, TaskId, TaskStatus};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::job::{ExecutionStrategy, ProcessJob, ThreadJob};
use crate::priority::MountTable;
use crate::resources::{
    can_currently_satisfy, can_ever_satisfy, requested_cpus, requested_memory, HostInfo,
};
use crate::scheduler::OpenTasks;

/// Espera con jobs activos antes de volver a mirar la cola.
const ACTIVE_WAIT: Duration = Duration::from_secs(15);
/// Espera sin trabajo en `run_forever`.
const IDLE_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Tope de cpus; `None` usa todas las del host.
    pub max_cpus: Option<f64>,
    /// `None` elige según `Broker::can_fork`.
    pub strategy: Option<ExecutionStrategy>,
    /// Binario que se relanza con `exec-task`; por defecto el ejecutable actual.
    pub exec_program: Option<PathBuf>,
}

/// Para el worker desde otra tarea (o desde el handler de SIGHUP). Los jobs
/// en curso terminan antes de que `run_*` retorne.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    event_loop: EventLoop,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.event_loop.interrupt();
    }
}

struct ActiveJob {
    task_id: TaskId,
    cpus: f64,
    memory: u64,
}

pub struct Worker {
    broker: Arc<dyn Broker>,
    registry: Arc<Registry>,
    host: HostInfo,
    mounts: Arc<MountTable>,
    strategy: ExecutionStrategy,
    exec_program: PathBuf,
    active: HashMap<SourceId, ActiveJob>,
    stopper: Arc<AtomicBool>,
    pending_binding: BindingId,
}

impl Worker {
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<Registry>, config: WorkerConfig) -> Self {
        let host = HostInfo::detect().with_max_cpus(config.max_cpus);

        let strategy = match config.strategy {
            Some(ExecutionStrategy::Process) if !broker.can_fork() => {
                warn!("el broker {} no sirve entre procesos; se usan hilos", broker.url());
                ExecutionStrategy::Thread
            }
            Some(strategy) => strategy,
            None => ExecutionStrategy::for_broker(broker.as_ref()),
        };

        let exec_program = config
            .exec_program
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from("dagq-worker"));

        // Una tarea nueva en pending corta la espera del loop.
        let event_loop = broker.core().event_loop().clone();
        let pending_binding = broker.bind(
            &status_event(TaskStatus::Pending),
            Arc::new(move |_: &Event| {
                event_loop.interrupt();
                Ok(())
            }),
        );

        info!(
            "worker en {} con {} cpus, {} bytes, estrategia {:?}, broker {}",
            host.hostname,
            host.cpus,
            host.memory,
            strategy,
            broker.url()
        );

        Self {
            broker,
            registry,
            host,
            mounts: Arc::new(MountTable::load()),
            strategy,
            exec_program,
            active: HashMap::new(),
            stopper: Arc::new(AtomicBool::new(false)),
            pending_binding,
        }
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: self.stopper.clone(),
            event_loop: self.broker.core().event_loop().clone(),
        }
    }

    pub fn active_task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.active.values().map(|j| j.task_id).collect();
        ids.sort_unstable();
        ids
    }

    /// Tareas pendientes listas para correr, en orden de prioridad.
    pub async fn iter_open_tasks(&self) -> Result<OpenTasks> {
        Ok(OpenTasks::start(self.broker.clone(), self.mounts.clone()).await?)
    }

    /// Toma una sola tarea, la corre y vuelve.
    pub async fn run_one(&mut self) -> Result<()> {
        self.run(Some(1), false).await
    }

    /// Corre hasta que no queda nada que este worker pueda hacer.
    pub async fn run_to_end(&mut self) -> Result<()> {
        self.run(None, false).await
    }

    /// Corre hasta `StopHandle::stop`.
    pub async fn run_forever(&mut self) -> Result<()> {
        self.run(None, true).await
    }

    async fn run(&mut self, mut count: Option<usize>, wait_for_more: bool) -> Result<()> {
        self.stopper.store(false, Ordering::SeqCst);
        let event_loop = self.broker.core().event_loop().clone();
        event_loop.stop_thread().await;

        let result = async {
            while !self.stopper.load(Ordering::SeqCst) {
                if !self.run_inner(&mut count, wait_for_more).await? {
                    break;
                }
            }
            // Terminar lo que está en curso.
            while !self.active.is_empty() {
                self.run_inner(&mut Some(0), false).await?;
            }
            Ok(())
        }
        .await;

        debug!("el worker se detiene");
        event_loop.resume_thread();
        result
    }

    /// Una vuelta: lanzar, esperar, cosechar. `false` cuando ya no hay nada
    /// que hacer y no hay que esperar más trabajo.
    async fn run_inner(&mut self, count: &mut Option<usize>, wait_for_more: bool) -> Result<bool> {
        let progressed = self.spawn_jobs(count).await?;
        let event_loop = self.broker.core().event_loop().clone();

        if !self.active.is_empty() {
            info!(
                "{} jobs activos: {:?}",
                self.active.len(),
                self.active_task_ids()
            );
            event_loop.process(Some(ACTIVE_WAIT)).await;
        }

        let mut just_finished = false;
        for (id, mut source) in event_loop.take_stopped() {
            source.close().await;
            let Some(job) = self.active.remove(&id) else {
                continue;
            };
            if let Err(e) = self.broker.release(job.task_id).await {
                warn!("no se pudo liberar la tarea {}: {}", job.task_id, e);
            }
            just_finished = true;
        }

        if !just_finished && !progressed && self.active.is_empty() {
            if wait_for_more {
                info!("esperando más trabajo...");
                event_loop.process(Some(IDLE_WAIT)).await;
            } else {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn resources_left(&self) -> (f64, i128) {
        let cpus = self.host.cpus - self.active.values().map(|j| j.cpus).sum::<f64>();
        let memory =
            self.host.memory as i128 - self.active.values().map(|j| j.memory as i128).sum::<i128>();
        (cpus, memory)
    }

    /// Lanza todo lo que entra. Devuelve `true` si se cerró algún nodo de
    /// agrupación, que puede destrabar a otras tareas.
    async fn spawn_jobs(&mut self, count: &mut Option<usize>) -> Result<bool> {
        let mut progressed = false;
        let (mut cpus, mut memory) = self.resources_left();
        let mut open: Option<OpenTasks> = None;

        while count.map_or(true, |c| c > 0) && cpus > 0.0 && memory > 0 {
            if open.is_none() {
                open = Some(self.iter_open_tasks().await?);
            }
            let Some(tasks) = open.as_mut() else {
                break;
            };
            let Some(task) = tasks.next().await? else {
                break;
            };

            if task.pattern.is_none() {
                debug!("tarea {} es de agrupación", task.id);
                self.broker.mark_success(task.id, Value::Null).await?;
                progressed = true;
                continue;
            }

            if self.active.values().any(|j| j.task_id == task.id) {
                continue;
            }

            if let Err(reason) = can_ever_satisfy(&task, &self.host, self.strategy) {
                debug!("descartando {}: {}", task.id, reason);
                continue;
            }
            let memory_left = memory.max(0) as u64;
            if !can_currently_satisfy(&task, self.host.cpus, cpus, memory_left) {
                continue;
            }

            if !self.broker.acquire(task.id).await? {
                continue;
            }

            self.start_job(task).await?;

            (cpus, memory) = self.resources_left();
            if let Some(c) = count.as_mut() {
                *c -= 1;
            }
        }
        Ok(progressed)
    }

    async fn start_job(&mut self, task: Task) -> Result<()> {
        let event_loop = self.broker.core().event_loop().clone();
        let notifier = event_loop.register();
        let id = notifier.id();
        let active = ActiveJob {
            task_id: task.id,
            cpus: requested_cpus(&task, self.host.cpus),
            memory: requested_memory(&task),
        };

        info!("iniciando tarea {} ({})", task.id, task.display_name());
        match self.strategy {
            ExecutionStrategy::Thread => {
                let ctx = TaskContext {
                    task,
                    broker: self.broker.clone(),
                    registry: self.registry.clone(),
                };
                event_loop.add(id, Box::new(ThreadJob::start(ctx, notifier)));
            }
            ExecutionStrategy::Process => {
                match ProcessJob::start(&task, self.broker.clone(), &self.exec_program, notifier)
                    .await
                {
                    Ok(job) => event_loop.add(id, Box::new(job)),
                    Err(e) => {
                        warn!("no se pudo lanzar la tarea {}: {:#}", task.id, e);
                        event_loop.remove(id);
                        self.broker
                            .mark_error(task.id, TaskFailure::raised("SpawnError", format!("{:#}", e)))
                            .await?;
                        self.broker.release(task.id).await?;
                        return Ok(());
                    }
                }
            }
        }
        self.active.insert(id, active);
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stopper.store(true, Ordering::SeqCst);
        self.broker
            .unbind(&status_event(TaskStatus::Pending), self.pending_binding);
    }
}
