use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::state::AppState;

/// Cada cuánto se barren los leases vencidos.
pub const FAILOVER_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Loop de tolerancia a fallos: un worker que dejó de mandar heartbeats
/// pierde sus tareas, que quedan libres para otro.
pub async fn run_failover_loop(state: AppState) {
    loop {
        sleep(FAILOVER_SWEEP_INTERVAL).await;
        sweep_once(&state);
    }
}

/// Una pasada; devuelve cuántas tareas se liberaron.
pub fn sweep_once(state: &AppState) -> usize {
    match state.broker.reclaim_stale_leases() {
        Ok(ids) => {
            for id in &ids {
                info!(
                    "liberando tarea {}: sin heartbeat hace más de {:?}",
                    id,
                    state.broker.lease_timeout()
                );
            }
            ids.len()
        }
        Err(e) => {
            warn!("error en failover sweep: {}", e);
            0
        }
    }
}
