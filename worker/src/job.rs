//! Ejecución de una tarea ya tomada por el worker.
//!
//! Dos tipos de job, según la `ExecutionStrategy` del worker:
//! - `ThreadJob`: corre el pattern en una tarea de tokio del mismo proceso.
//! - `ProcessJob`: relanza el binario del worker (`exec-task`) con la tarea
//!   por stdin, en su propio grupo de procesos, y reenvía su stdout/stderr
//!   al log de salida del broker.
//!
//! Ambos avisan al loop de eventos del broker con `Readiness` y devuelven
//! `Selection::Stop` cuando el trabajo terminó.

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use common::broker::Broker;
use common::errors::{BrokerError, TaskFailure};
use common::eventloop::{Notifier, Readiness, Selection, Source};
use common::events::{signal_event, BindingId, Event, EventPayload};
use common::patterns::TaskContext;
use common::task::{Task, TaskId, TaskStatus};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{Group, Pid, User};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::sandbox::SandboxPackage;

const READ_CHUNK: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// Tarea de tokio en el mismo proceso.
    Thread,
    /// Proceso hijo aislado.
    Process,
}

impl ExecutionStrategy {
    /// Procesos sólo si el broker se puede usar desde otro proceso.
    pub fn for_broker(broker: &dyn Broker) -> Self {
        if broker.can_fork() {
            ExecutionStrategy::Process
        } else {
            ExecutionStrategy::Thread
        }
    }
}

/// Resuelve el pattern, lo corre y concilia el resultado:
/// - sin pattern: nodo de agrupación, success con null
/// - pattern desconocido: `PatternMissing`
/// - error del pattern: se guarda como error de la tarea
/// - el pattern volvió sin marcar nada: `PatternIncomplete`
pub async fn execute(ctx: TaskContext) -> Result<(), BrokerError> {
    let id = ctx.task.id;

    let pattern = match ctx.task.pattern.as_deref() {
        None => return ctx.success(Value::Null).await,
        Some(name) => match ctx.registry.resolve_pattern(name) {
            Ok(pattern) => pattern,
            Err(failure) => {
                warn!("tarea {}: {}", id, failure);
                return ctx.error(failure).await;
            }
        },
    };

    match pattern.run(&ctx).await {
        Err(e) => {
            let failure = TaskFailure::from_handler_error(&e);
            info!("tarea {} falló: {}", id, failure);
            ctx.error(failure).await
        }
        Ok(()) => {
            let status = ctx
                .broker
                .fetch(&[id])
                .await?
                .get(&id)
                .map(|t| t.status);
            if status == Some(TaskStatus::Pending) {
                warn!("tarea {}: el pattern no marcó success ni error", id);
                ctx.error(TaskFailure::pattern_incomplete(TaskStatus::Pending))
                    .await
            } else {
                Ok(())
            }
        }
    }
}

/* --------- ThreadJob --------- */

pub struct ThreadJob {
    id: TaskId,
}

impl ThreadJob {
    pub fn start(ctx: TaskContext, notifier: Notifier) -> Self {
        let id = ctx.task.id;
        tokio::spawn(async move {
            // Tarea interna para que un panic también avise al loop.
            match tokio::spawn(execute(ctx)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("tarea {}: no se pudo reportar el resultado: {}", id, e),
                Err(e) => error!("tarea {} hizo panic: {}", id, e),
            }
            notifier.notify(Readiness::Finished);
        });
        Self { id }
    }
}

#[async_trait]
impl Source for ThreadJob {
    async fn on_ready(&mut self, ready: Readiness) -> Selection {
        match ready {
            Readiness::Finished => {
                debug!("hilo de la tarea {} terminó", self.id);
                Selection::Stop
            }
            _ => Selection::Continue,
        }
    }
}

/* --------- ProcessJob --------- */

pub struct ProcessJob {
    id: TaskId,
    pid: i32,
    broker: Arc<dyn Broker>,
    open_fds: HashSet<i32>,
    offsets: [u64; 3],
    exit: Option<Option<i32>>,
    alive: Arc<AtomicBool>,
    binding: Option<BindingId>,
}

fn spawn_reader<R>(mut reader: R, fd: i32, notifier: Notifier)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if !notifier.notify(Readiness::Output {
                        fd,
                        data: buf[..n].to_vec(),
                    }) {
                        return;
                    }
                }
                Err(e) => {
                    debug!("error leyendo fd {}: {}", fd, e);
                    break;
                }
            }
        }
        notifier.notify(Readiness::Closed { fd });
    });
}

/// uid/gid del usuario de la tarea. El grupo cae al grupo primario del
/// usuario si no existe.
fn task_credentials(task: &Task) -> anyhow::Result<(u32, u32)> {
    let user = User::from_name(&task.user)?
        .with_context(|| format!("usuario desconocido {:?}", task.user))?;
    let gid = match Group::from_name(&task.group)? {
        Some(group) => group.gid,
        None => user.gid,
    };
    Ok((user.uid.as_raw(), gid.as_raw()))
}

impl ProcessJob {
    pub async fn start(
        task: &Task,
        broker: Arc<dyn Broker>,
        program: &Path,
        notifier: Notifier,
    ) -> anyhow::Result<Self> {
        let package = SandboxPackage {
            broker_url: broker.url(),
            task: task.clone(),
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.arg("exec-task")
            // para que `ps` muestre algo útil
            .arg(task.id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .envs(&task.environ)
            .env("DAGQ_TID", task.id.to_string());
        if let Some(cwd) = &task.cwd {
            cmd.current_dir(cwd);
        }
        if nix::unistd::geteuid().is_root() {
            let (uid, gid) = task_credentials(task)?;
            cmd.uid(uid).gid(gid);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("no se pudo lanzar {:?}", program))?;
        let pid = child.id().context("el proceso hijo ya terminó")? as i32;

        if let Some(mut stdin) = child.stdin.take() {
            let encoded = serde_json::to_vec(&package)?;
            stdin.write_all(&encoded).await?;
            stdin.shutdown().await?;
        }

        let stdout = child.stdout.take().context("sin stdout del hijo")?;
        let stderr = child.stderr.take().context("sin stderr del hijo")?;
        spawn_reader(stdout, 1, notifier.clone());
        spawn_reader(stderr, 2, notifier.clone());

        let alive = Arc::new(AtomicBool::new(true));
        let waiter = notifier.clone();
        let waiter_alive = alive.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("error esperando al proceso {}: {}", pid, e);
                    None
                }
            };
            waiter_alive.store(false, Ordering::SeqCst);
            waiter.notify(Readiness::Exited { code });
        });

        // `kill` publica signal_task.<id>; se reenvía a todo el grupo.
        let id = task.id;
        let signal_alive = alive.clone();
        let binding = broker.bind(
            &signal_event(id),
            Arc::new(move |event: &Event| {
                let EventPayload::Signal { signal, .. } = &event.payload else {
                    return Ok(());
                };
                if !signal_alive.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let signal = Signal::try_from(*signal)?;
                killpg(Pid::from_raw(pid), signal)?;
                info!("tarea {} recibió la señal {}", id, signal);
                Ok(())
            }),
        );

        debug!("proceso {} de la tarea {} iniciado", pid, task.id);
        Ok(Self {
            id: task.id,
            pid,
            broker,
            open_fds: HashSet::from([1, 2]),
            offsets: [0; 3],
            exit: None,
            alive,
            binding: Some(binding),
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Si el hijo salió sin marcar la tarea, queda como error.
    async fn reconcile(&self) {
        let status = match self.broker.fetch(&[self.id]).await {
            Ok(mut tasks) => tasks.remove(&self.id).map(|t| t.status),
            Err(e) => {
                warn!("no se pudo releer la tarea {}: {}", self.id, e);
                return;
            }
        };
        if status == Some(TaskStatus::Pending) {
            let code = self.exit.flatten();
            let failure = TaskFailure::raised(
                "ProcessExited",
                format!("process {} exited with code {:?} without a result", self.pid, code),
            );
            if let Err(e) = self.broker.mark_error(self.id, failure).await {
                warn!("no se pudo marcar la tarea {}: {}", self.id, e);
            }
        }
    }
}

#[async_trait]
impl Source for ProcessJob {
    async fn on_ready(&mut self, ready: Readiness) -> Selection {
        match ready {
            Readiness::Output { fd, data } => {
                let slot = fd.clamp(0, 2) as usize;
                let offset = self.offsets[slot];
                self.offsets[slot] += data.len() as u64;
                if let Err(e) = self.broker.log_output(self.id, fd, offset, data).await {
                    warn!("no se pudo guardar la salida de {}: {}", self.id, e);
                }
            }
            Readiness::Closed { fd } => {
                self.open_fds.remove(&fd);
            }
            Readiness::Exited { code } => {
                self.exit = Some(code);
            }
            Readiness::Finished => {}
        }

        if self.open_fds.is_empty() && self.exit.is_some() {
            debug!("proceso {} de la tarea {} terminó", self.pid, self.id);
            self.reconcile().await;
            Selection::Stop
        } else {
            Selection::Continue
        }
    }

    async fn close(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(binding) = self.binding.take() {
            self.broker.unbind(&signal_event(self.id), binding);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::brokers::MemoryBroker;
    use common::errors::FailureKind;
    use common::patterns::{Pattern, Registry};
    use common::queue::Queue;
    use common::task::TaskSpec;
    use serde_json::json;

    struct Lazy;

    #[async_trait]
    impl Pattern for Lazy {
        async fn run(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn context(spec: TaskSpec, registry: Registry) -> (TaskContext, Arc<common::TaskFuture>) {
        let broker: Arc<dyn Broker> = MemoryBroker::new();
        let future = Queue::new(broker.clone()).submit(spec).await.unwrap();
        let task = future.task().await.unwrap();
        (
            TaskContext {
                task,
                broker,
                registry: Arc::new(registry),
            },
            future,
        )
    }

    #[tokio::test]
    async fn generic_llama_a_la_funcion() {
        let (ctx, future) =
            context(TaskSpec::call("str", vec![json!(123)]), Registry::with_builtins()).await;
        execute(ctx).await.unwrap();
        assert_eq!(future.result().await.unwrap(), json!("123"));
    }

    #[tokio::test]
    async fn pattern_desconocido() {
        let (ctx, future) = context(
            TaskSpec::default().with_pattern("no-existe"),
            Registry::with_builtins(),
        )
        .await;
        execute(ctx).await.unwrap();
        let err = future.result().await.unwrap_err();
        assert_eq!(err.failure().unwrap().kind, FailureKind::PatternMissing);
    }

    #[tokio::test]
    async fn pattern_que_no_marca_nada() {
        let mut registry = Registry::new();
        registry.register_pattern("lazy", Lazy);
        let (ctx, future) = context(TaskSpec::default().with_pattern("lazy"), registry).await;
        execute(ctx).await.unwrap();
        let err = future.result().await.unwrap_err();
        assert_eq!(err.failure().unwrap().kind, FailureKind::PatternIncomplete);
    }

    #[tokio::test]
    async fn grupo_es_success_null() {
        let (ctx, future) = context(TaskSpec::group(), Registry::new()).await;
        execute(ctx).await.unwrap();
        assert_eq!(future.result().await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn shell_con_salida_distinta_de_cero() {
        let (ctx, future) = context(
            TaskSpec::shell(["sh", "-c", "exit 3"]),
            Registry::with_builtins(),
        )
        .await;
        execute(ctx).await.unwrap();
        let err = future.result().await.unwrap_err();
        assert_eq!(
            err.failure().unwrap().kind,
            FailureKind::Raised("CalledProcessError".into())
        );
    }

    #[tokio::test]
    async fn thread_job_avisa_al_loop() {
        let (ctx, future) =
            context(TaskSpec::call("identity", vec![json!(7)]), Registry::with_builtins()).await;
        let lp = ctx.broker.core().event_loop().clone();
        let notifier = lp.register();
        let id = notifier.id();
        lp.add(id, Box::new(ThreadJob::start(ctx, notifier)));

        while lp.is_active(id) {
            lp.process(Some(std::time::Duration::from_secs(5))).await;
        }
        assert_eq!(lp.take_stopped().len(), 1);
        assert_eq!(future.result().await.unwrap(), json!(7));
    }

    #[test]
    fn estrategia_segun_broker() {
        let broker = MemoryBroker::new();
        assert_eq!(
            ExecutionStrategy::for_broker(broker.as_ref()),
            ExecutionStrategy::Thread
        );
    }
}
