//! Loop de eventos de un solo hilo lógico.
//!
//! Las fuentes (jobs) no exponen file descriptors: cada una recibe un
//! [`Notifier`] y publica su [`Readiness`] por un canal; `process` espera el
//! primer aviso (o el timer más cercano, o un `interrupt`), dispara los
//! timers vencidos y luego despacha los avisos a sus fuentes.
//!
//! El loop puede correrlo quien lo llama (`process` en un ciclo) o una tarea
//! de fondo (`start_thread` / `stop_thread` / `resume_thread`) sin perder
//! fuentes ni timers registrados.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

pub type SourceId = u64;
pub type TimerId = u64;

/// Aviso que una fuente manda al loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Bytes leídos de un pipe (1 = stdout, 2 = stderr).
    Output { fd: i32, data: Vec<u8> },
    /// El pipe llegó a EOF.
    Closed { fd: i32 },
    /// El proceso hijo terminó.
    Exited { code: Option<i32> },
    /// El hilo de la tarea terminó.
    Finished,
}

/// Lo que devuelve una fuente o un timer: seguir registrado o salir.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Continue,
    Stop,
}

#[async_trait]
pub trait Source: Send {
    async fn on_ready(&mut self, ready: Readiness) -> Selection;

    /// Se llama cuando el dueño saca la fuente de `take_stopped`.
    async fn close(&mut self) {}
}

pub type TimerCallback = Box<dyn FnMut() -> BoxFuture<'static, Selection> + Send>;

type Message = (SourceId, Readiness);

/// Canal de una fuente hacia el loop.
#[derive(Clone)]
pub struct Notifier {
    id: SourceId,
    tx: mpsc::UnboundedSender<Message>,
}

impl Notifier {
    pub fn id(&self) -> SourceId {
        self.id
    }

    /// Devuelve false si el loop ya no existe.
    pub fn notify(&self, ready: Readiness) -> bool {
        self.tx.send((self.id, ready)).is_ok()
    }
}

struct Timer {
    id: TimerId,
    interval: Duration,
    next_due: Instant,
    // None mientras el callback se está ejecutando.
    callback: Option<TimerCallback>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    sources: HashMap<SourceId, Box<dyn Source>>,
    reserved: HashSet<SourceId>,
    removed: HashSet<SourceId>,
    deferred: Vec<Message>,
    stopped: Vec<(SourceId, Box<dyn Source>)>,
    timers: Vec<Timer>,
    thread_should_stop: bool,
    thread_running: bool,
}

struct Inner {
    state: Mutex<State>,
    tx: mpsc::UnboundedSender<Message>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    interrupt: Notify,
    thread_stopped: Notify,
}

#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                tx,
                rx: tokio::sync::Mutex::new(rx),
                interrupt: Notify::new(),
                thread_stopped: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /* --------- fuentes --------- */

    /// Reserva un id y devuelve el canal que la fuente usará. Los avisos que
    /// lleguen antes de `add` se guardan hasta que la fuente se registre.
    pub fn register(&self) -> Notifier {
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;
        state.reserved.insert(id);
        Notifier {
            id,
            tx: self.inner.tx.clone(),
        }
    }

    pub fn add(&self, id: SourceId, source: Box<dyn Source>) {
        {
            let mut state = self.state();
            state.reserved.remove(&id);
            state.removed.remove(&id);
            state.sources.insert(id, source);

            let (mine, rest): (Vec<Message>, Vec<Message>) =
                state.deferred.drain(..).partition(|(sid, _)| *sid == id);
            state.deferred = rest;
            for msg in mine {
                let _ = self.inner.tx.send(msg);
            }
        }
        self.interrupt();
    }

    /// Saca una fuente (activa o detenida) sin llamar a `close`.
    pub fn remove(&self, id: SourceId) -> Option<Box<dyn Source>> {
        let removed = {
            let mut state = self.state();
            state.reserved.remove(&id);
            if let Some(source) = state.sources.remove(&id) {
                Some(source)
            } else if let Some(pos) = state.stopped.iter().position(|(sid, _)| *sid == id) {
                Some(state.stopped.remove(pos).1)
            } else {
                // Puede estar despachándose ahora mismo.
                state.removed.insert(id);
                None
            }
        };
        self.interrupt();
        removed
    }

    pub fn is_active(&self, id: SourceId) -> bool {
        let state = self.state();
        state.sources.contains_key(&id) || state.reserved.contains(&id)
    }

    pub fn active_count(&self) -> usize {
        let state = self.state();
        state.sources.len() + state.reserved.len()
    }

    /// Fuentes que devolvieron `Selection::Stop` desde la última llamada.
    pub fn take_stopped(&self) -> Vec<(SourceId, Box<dyn Source>)> {
        std::mem::take(&mut self.state().stopped)
    }

    /* --------- timers --------- */

    pub fn add_timer(&self, interval: Duration, callback: TimerCallback) -> TimerId {
        let id = {
            let mut state = self.state();
            state.next_id += 1;
            let id = state.next_id;
            state.timers.push(Timer {
                id,
                interval,
                next_due: Instant::now() + interval,
                callback: Some(callback),
            });
            id
        };
        self.interrupt();
        id
    }

    pub fn remove_timer(&self, id: TimerId) -> bool {
        let removed = {
            let mut state = self.state();
            let before = state.timers.len();
            state.timers.retain(|t| t.id != id);
            state.timers.len() != before
        };
        self.interrupt();
        removed
    }

    pub fn timer_count(&self) -> usize {
        self.state().timers.len()
    }

    /// Despierta un `process` bloqueado (o el próximo que se llame).
    pub fn interrupt(&self) {
        self.inner.interrupt.notify_one();
    }

    /* --------- un tick --------- */

    /// Espera avisos hasta `timeout` (o hasta el timer más cercano), dispara
    /// los timers vencidos y despacha los avisos. Devuelve cuántos avisos se
    /// despacharon. Sin fuentes, timers ni timeout vuelve de inmediato.
    pub async fn process(&self, timeout: Option<Duration>) -> usize {
        let now = Instant::now();
        let (next_timer, empty) = {
            let state = self.state();
            let next = state.timers.iter().map(|t| t.next_due).min();
            let empty = state.sources.is_empty()
                && state.reserved.is_empty()
                && state.timers.is_empty();
            (next, empty)
        };

        if empty && timeout.is_none() {
            return 0;
        }

        let deadline = match (timeout.map(|t| now + t), next_timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let mut batch = Vec::new();
        {
            let mut rx = self.inner.rx.lock().await;
            let sleep = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                msg = rx.recv() => {
                    if let Some(msg) = msg {
                        batch.push(msg);
                    }
                }
                _ = self.inner.interrupt.notified() => {}
                _ = sleep => {}
            }

            while let Ok(msg) = rx.try_recv() {
                batch.push(msg);
            }
        }

        self.fire_due_timers().await;

        let count = batch.len();
        for (id, ready) in batch {
            self.dispatch(id, ready).await;
        }
        count
    }

    async fn fire_due_timers(&self) {
        let now = Instant::now();
        let due: Vec<(TimerId, TimerCallback)> = {
            let mut state = self.state();
            state
                .timers
                .iter_mut()
                .filter(|t| t.next_due <= now && t.callback.is_some())
                .filter_map(|t| {
                    // Una sola vez por tick aunque hayan pasado varios intervalos.
                    t.next_due = now + t.interval;
                    t.callback.take().map(|cb| (t.id, cb))
                })
                .collect()
        };

        for (id, mut callback) in due {
            let selection = callback().await;
            let mut state = self.state();
            match selection {
                Selection::Stop => state.timers.retain(|t| t.id != id),
                Selection::Continue => {
                    if let Some(timer) = state.timers.iter_mut().find(|t| t.id == id) {
                        timer.callback = Some(callback);
                    }
                }
            }
        }
    }

    async fn dispatch(&self, id: SourceId, ready: Readiness) {
        let source = {
            let mut state = self.state();
            match state.sources.remove(&id) {
                Some(source) => source,
                None => {
                    if state.reserved.contains(&id) {
                        state.deferred.push((id, ready));
                    } else {
                        trace!("aviso para fuente {} que ya no está registrada", id);
                    }
                    return;
                }
            }
        };

        let mut source = source;
        let selection = source.on_ready(ready).await;

        let mut state = self.state();
        if state.removed.remove(&id) {
            return;
        }
        match selection {
            Selection::Continue => {
                state.sources.insert(id, source);
            }
            Selection::Stop => {
                debug!("fuente {} terminó", id);
                state.stopped.push((id, source));
            }
        }
    }

    /* --------- tarea de fondo --------- */

    /// Arranca la tarea de fondo si no está corriendo y no fue detenida
    /// explícitamente con `stop_thread`. La tarea sale sola cuando el loop
    /// queda sin fuentes ni timers.
    pub fn start_thread(&self) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!("sin runtime de tokio; el loop no corre en segundo plano");
                return;
            }
        };

        {
            let mut state = self.state();
            if state.thread_running || state.thread_should_stop {
                return;
            }
            state.thread_running = true;
        }

        let this = self.clone();
        handle.spawn(async move { this.thread_target().await });
    }

    /// Detiene la tarea de fondo y espera a que salga (si corría).
    pub async fn stop_thread(&self) {
        let stopped = self.inner.thread_stopped.notified();
        tokio::pin!(stopped);
        stopped.as_mut().enable();

        let was_running = {
            let mut state = self.state();
            state.thread_should_stop = true;
            state.thread_running
        };
        self.interrupt();

        if was_running {
            stopped.await;
        }
    }

    /// Vuelve a arrancar la tarea de fondo sólo si había sido detenida.
    pub fn resume_thread(&self) {
        let should_start = {
            let mut state = self.state();
            let was_stopped = state.thread_should_stop;
            state.thread_should_stop = false;
            was_stopped
        };
        if should_start {
            self.start_thread();
        }
    }

    pub fn is_thread_running(&self) -> bool {
        self.state().thread_running
    }

    async fn thread_target(self) {
        debug!("loop de eventos en segundo plano iniciado");
        loop {
            {
                // Sin fuentes ni timers no hay nada que escuchar: la tarea
                // sale y `start_thread` la vuelve a lanzar cuando haga falta.
                let mut state = self.state();
                let idle = state.sources.is_empty()
                    && state.reserved.is_empty()
                    && state.timers.is_empty();
                if state.thread_should_stop || idle {
                    state.thread_running = false;
                    break;
                }
            }
            self.process(Some(Duration::from_secs(60))).await;
        }
        self.inner.thread_stopped.notify_waiters();
        debug!("loop de eventos en segundo plano detenido");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    struct Counter {
        seen: Arc<Mutex<Vec<Readiness>>>,
        stop_on_finish: bool,
    }

    #[async_trait]
    impl Source for Counter {
        async fn on_ready(&mut self, ready: Readiness) -> Selection {
            let finished = ready == Readiness::Finished;
            self.seen.lock().unwrap().push(ready);
            if finished && self.stop_on_finish {
                Selection::Stop
            } else {
                Selection::Continue
            }
        }
    }

    fn push_timer(res: &Arc<Mutex<Vec<u32>>>, value: u32, selection: Selection) -> TimerCallback {
        let res = res.clone();
        Box::new(move || {
            res.lock().unwrap().push(value);
            futures::future::ready(selection).boxed()
        })
    }

    // `add_timer` deja un interrupt pendiente: se procesa hasta ver `len`.
    async fn tick_until(lp: &EventLoop, res: &Arc<Mutex<Vec<u32>>>, len: usize) {
        for _ in 0..10 {
            if res.lock().unwrap().len() >= len {
                return;
            }
            lp.process(Some(Duration::from_secs(1))).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timers_disparan_en_orden_y_stop_los_quita() {
        let res = Arc::new(Mutex::new(Vec::new()));
        let lp = EventLoop::new();

        let one = lp.add_timer(Duration::from_millis(100), push_timer(&res, 1, Selection::Continue));
        lp.add_timer(Duration::from_millis(100), push_timer(&res, 3, Selection::Stop));
        lp.add_timer(Duration::from_millis(150), push_timer(&res, 2, Selection::Continue));

        tick_until(&lp, &res, 2).await;
        assert_eq!(*res.lock().unwrap(), vec![1, 3]);
        assert_eq!(lp.timer_count(), 2);

        tick_until(&lp, &res, 3).await;
        assert_eq!(*res.lock().unwrap(), vec![1, 3, 2]);

        tick_until(&lp, &res, 4).await;
        assert_eq!(*res.lock().unwrap(), vec![1, 3, 2, 1]);

        assert!(lp.remove_timer(one));
        tick_until(&lp, &res, 5).await;
        assert_eq!(*res.lock().unwrap(), vec![1, 3, 2, 1, 2]);
    }

    #[tokio::test]
    async fn fuente_recibe_avisos_y_se_detiene() {
        let lp = EventLoop::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let notifier = lp.register();
        // aviso antes de registrar la fuente: se difiere
        notifier.notify(Readiness::Output { fd: 1, data: b"hola".to_vec() });
        lp.process(Some(Duration::from_millis(50))).await;

        lp.add(
            notifier.id(),
            Box::new(Counter {
                seen: seen.clone(),
                stop_on_finish: true,
            }),
        );
        notifier.notify(Readiness::Finished);

        while lp.active_count() > 0 {
            lp.process(Some(Duration::from_secs(1))).await;
        }

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Readiness::Output { fd: 1, data: b"hola".to_vec() },
                Readiness::Finished
            ]
        );
        let stopped = lp.take_stopped();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].0, notifier.id());
        assert!(lp.take_stopped().is_empty());
    }

    #[tokio::test]
    async fn process_sin_nada_vuelve_de_inmediato() {
        let lp = EventLoop::new();
        assert_eq!(lp.process(None).await, 0);
    }

    #[tokio::test]
    async fn interrupt_despierta_process() {
        let lp = EventLoop::new();
        lp.interrupt();
        let start = std::time::Instant::now();
        lp.process(Some(Duration::from_secs(5))).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn hilo_de_fondo_arranca_para_y_se_reanuda() {
        let res = Arc::new(Mutex::new(Vec::new()));
        let lp = EventLoop::new();
        lp.add_timer(Duration::from_millis(20), push_timer(&res, 1, Selection::Continue));

        lp.start_thread();
        assert!(lp.is_thread_running());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!res.lock().unwrap().is_empty());

        lp.stop_thread().await;
        assert!(!lp.is_thread_running());

        // detenido explícitamente: start_thread no lo arranca
        lp.start_thread();
        assert!(!lp.is_thread_running());

        lp.resume_thread();
        assert!(lp.is_thread_running());
        assert_eq!(lp.timer_count(), 1);
        lp.stop_thread().await;
    }

    #[tokio::test]
    async fn hilo_de_fondo_sale_si_no_hay_nada() {
        let lp = EventLoop::new();
        lp.start_thread();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!lp.is_thread_running());
    }
}
