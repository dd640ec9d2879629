// master/src/state.rs

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use common::brokers::MemoryBroker;
use common::{EventPayload, RemoteEvent};

/// Eventos que se guardan para los pollers remotos.
pub const EVENT_LOG_CAPACITY: usize = 10_000;

#[derive(Clone)]
pub struct AppState {
    /// Tabla de tareas y salida; los handlers sólo usan las operaciones
    /// crudas, las transiciones las arma el cliente.
    pub broker: Arc<MemoryBroker>,
    pub events: Arc<Mutex<EventLog>>,
}

impl AppState {
    pub fn new() -> Self {
        Self::with_broker(MemoryBroker::new())
    }

    pub fn with_broker(broker: Arc<MemoryBroker>) -> Self {
        Self {
            broker,
            events: Arc::new(Mutex::new(EventLog::new(EVENT_LOG_CAPACITY))),
        }
    }

    pub fn events(&self) -> MutexGuard<'_, EventLog> {
        self.events.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Log circular de eventos publicados, numerados desde 0.
#[derive(Debug)]
pub struct EventLog {
    entries: VecDeque<RemoteEvent>,
    next_seq: u64,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 0,
            capacity: capacity.max(1),
        }
    }

    /// Número que va a tener el próximo evento.
    pub fn head(&self) -> u64 {
        self.next_seq
    }

    pub fn publish(&mut self, origin: String, events: Vec<String>, payload: EventPayload) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(RemoteEvent {
            seq,
            origin,
            events,
            payload,
        });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        seq
    }

    /// Eventos con `seq >= since` que sigan en el log.
    pub fn since(&self, since: u64) -> Vec<RemoteEvent> {
        self.entries
            .iter()
            .filter(|e| e.seq >= since)
            .cloned()
            .collect()
    }
}
