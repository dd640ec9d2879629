use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{error, trace};

use crate::task::{TaskId, TaskStatus};

/// Datos que viajan con un evento.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    Status {
        ids: Vec<TaskId>,
        status: TaskStatus,
    },
    Output {
        id: TaskId,
        fd: i32,
        offset: u64,
        data: Vec<u8>,
    },
    Signal {
        ids: Vec<TaskId>,
        signal: i32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub payload: EventPayload,
}

/* --------- nombres de eventos --------- */

pub fn status_event_for_task(id: TaskId) -> String {
    format!("task_status.{}", id)
}

pub fn status_event(status: TaskStatus) -> String {
    format!("task_status.{}", status)
}

pub fn output_event(id: TaskId) -> String {
    format!("output_log.{}", id)
}

pub fn signal_event(id: TaskId) -> String {
    format!("signal_task.{}", id)
}

pub type Callback = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(u64);

/// Registro local de callbacks por nombre de evento.
#[derive(Default)]
pub struct EventHub {
    next_id: AtomicU64,
    bindings: Mutex<HashMap<String, Vec<(BindingId, Callback)>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, event: &str, callback: Callback) -> BindingId {
        let id = BindingId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut bindings = self.bindings.lock().unwrap_or_else(|p| p.into_inner());
        bindings
            .entry(event.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    /// Devuelve true si el binding existía.
    pub fn unbind(&self, event: &str, binding: BindingId) -> bool {
        let mut bindings = self.bindings.lock().unwrap_or_else(|p| p.into_inner());
        let Some(list) = bindings.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != binding);
        let removed = list.len() != before;
        if list.is_empty() {
            bindings.remove(event);
        }
        removed
    }

    pub fn has_bindings(&self) -> bool {
        let bindings = self.bindings.lock().unwrap_or_else(|p| p.into_inner());
        !bindings.is_empty()
    }

    pub fn is_bound(&self, event: &str) -> bool {
        let bindings = self.bindings.lock().unwrap_or_else(|p| p.into_inner());
        bindings.contains_key(event)
    }

    /// Llama a cada callback registrado para cada evento. Un callback que
    /// falla (o hace panic) se loguea y no impide llamar a los demás.
    pub fn dispatch(&self, events: &[String], payload: &EventPayload) {
        for name in events {
            let callbacks: Vec<Callback> = {
                let bindings = self.bindings.lock().unwrap_or_else(|p| p.into_inner());
                match bindings.get(name) {
                    Some(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
                    None => continue,
                }
            };

            trace!("dispatch de {} a {} callbacks", name, callbacks.len());

            let event = Event {
                name: name.clone(),
                payload: payload.clone(),
            };
            for cb in callbacks {
                match catch_unwind(AssertUnwindSafe(|| cb(&event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("callback de {} falló: {:#}", name, e),
                    Err(_) => error!("callback de {} hizo panic", name),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_payload() -> EventPayload {
        EventPayload::Status {
            ids: vec![1],
            status: TaskStatus::Success,
        }
    }

    #[test]
    fn un_callback_que_falla_no_bloquea_a_los_otros() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        hub.bind("x", Arc::new(|_: &Event| anyhow::bail!("falla")));
        hub.bind("x", Arc::new(|_: &Event| panic!("panic en callback")));
        let s = seen.clone();
        hub.bind(
            "x",
            Arc::new(move |e: &Event| {
                s.lock().unwrap().push(e.name.clone());
                Ok(())
            }),
        );

        hub.dispatch(&["x".to_string()], &status_payload());
        assert_eq!(*seen.lock().unwrap(), vec!["x".to_string()]);
    }

    #[test]
    fn unbind_quita_solo_ese_callback() {
        let hub = EventHub::new();
        let count = Arc::new(AtomicU64::new(0));

        let c1 = count.clone();
        let a = hub.bind(
            "y",
            Arc::new(move |_: &Event| {
                c1.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let c2 = count.clone();
        hub.bind(
            "y",
            Arc::new(move |_: &Event| {
                c2.fetch_add(10, Ordering::SeqCst);
                Ok(())
            }),
        );

        assert!(hub.unbind("y", a));
        assert!(!hub.unbind("y", a));
        hub.dispatch(&["y".to_string()], &status_payload());
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert!(hub.is_bound("y"));
    }

    #[test]
    fn nombres_de_eventos() {
        assert_eq!(status_event_for_task(7), "task_status.7");
        assert_eq!(status_event(TaskStatus::Pending), "task_status.pending");
        assert_eq!(output_event(7), "output_log.7");
        assert_eq!(signal_event(7), "signal_task.7");
    }
}
