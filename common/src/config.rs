use std::env;
use std::time::Duration;

pub const DEFAULT_BROKER: &str = "memory:";
pub const DEFAULT_MASTER_ADDR: &str = "0.0.0.0:8080";

/// Un lease sin heartbeat por más de esto se puede volver a tomar.
pub const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 15;

/// Epsilon al comparar cpus fraccionales contra lo disponible.
pub const CPU_EPSILON: f64 = 0.1;

/// URL del broker.
/// - DAGQ_BROKER=http://master:8080 para el broker HTTP
/// - Si no está definida, usa el broker en memoria
pub fn broker_url() -> String {
    env::var("DAGQ_BROKER").unwrap_or_else(|_| DEFAULT_BROKER.to_string())
}

/// Dirección donde escucha el master.
pub fn master_addr() -> String {
    env::var("DAGQ_MASTER_ADDR").unwrap_or_else(|_| DEFAULT_MASTER_ADDR.to_string())
}

/// Tope de cpus del worker (DAGQ_CPUS), si se configuró.
pub fn max_cpus() -> Option<f64> {
    env::var("DAGQ_CPUS").ok().and_then(|v| v.trim().parse().ok())
}

pub fn lease_timeout() -> Duration {
    Duration::from_secs(env_secs("DAGQ_LEASE_TIMEOUT_SECS", DEFAULT_LEASE_TIMEOUT_SECS))
}

pub fn heartbeat_interval() -> Duration {
    Duration::from_secs(env_secs("DAGQ_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS))
}

fn env_secs(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(default)
}
