use std::fmt;

use common::config::CPU_EPSILON;
use common::task::{current_login, Task};
use sysinfo::{System, SystemExt};

use crate::job::ExecutionStrategy;

/// Lo que sabemos del host donde corre el worker.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub cpus: f64,
    /// Bytes.
    pub memory: u64,
    /// En minúsculas.
    pub hostname: String,
    pub platform: String,
    pub user: String,
    pub is_root: bool,
    pub cwd: Option<String>,
}

impl HostInfo {
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();

        let hostname = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_lowercase();

        Self {
            cpus: sys.cpus().len().max(1) as f64,
            memory: sys.total_memory(),
            hostname,
            platform: std::env::consts::OS.to_string(),
            user: current_login().user,
            is_root: nix::unistd::geteuid().is_root(),
            cwd: std::env::current_dir()
                .ok()
                .map(|p| p.to_string_lossy().to_string()),
        }
    }

    /// Aplica el tope de cpus configurado (`--cpus` / DAGQ_CPUS).
    pub fn with_max_cpus(mut self, max_cpus: Option<f64>) -> Self {
        if let Some(max) = max_cpus.filter(|m| *m > 0.0) {
            self.cpus = max;
        }
        self
    }
}

/// Cpus que pide la tarea. Sin valor es 1; un valor negativo `-n` es
/// "el total del host dividido n".
pub fn requested_cpus(task: &Task, host_cpus: f64) -> f64 {
    match task.cpus {
        None => 1.0,
        Some(cpus) if cpus < 0.0 => host_cpus / -cpus,
        Some(cpus) => cpus,
    }
}

pub fn requested_memory(task: &Task) -> u64 {
    task.memory.unwrap_or(0)
}

/// Cabe en lo que queda libre ahora mismo.
pub fn can_currently_satisfy(task: &Task, host_cpus: f64, cpus_left: f64, memory_left: u64) -> bool {
    requested_cpus(task, host_cpus) <= cpus_left + CPU_EPSILON
        && requested_memory(task) <= memory_left
}

/// Motivo por el que este worker nunca podría correr una tarea.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Host(String),
    User(String),
    Cwd(String),
    UnknownUser(String),
    Platform(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Host(h) => write!(f, "host no coincide con {:?}", h),
            Rejection::User(u) => write!(f, "no podemos correr tareas de {:?}", u),
            Rejection::Cwd(c) => write!(f, "cwd distinto ({:?})", c),
            Rejection::UnknownUser(u) => write!(f, "usuario desconocido {:?}", u),
            Rejection::Platform(p) => write!(f, "plataforma distinta ({:?})", p),
        }
    }
}

/// Globs separados por coma contra el hostname; `!` niega. El primer patrón
/// que coincide decide; si ninguno coincide la tarea no es para este host.
pub fn host_matches(patterns: &str, hostname: &str) -> bool {
    for raw in patterns.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (negate, pattern) = match raw.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let matched = glob::Pattern::new(&pattern.to_lowercase())
            .map(|p| p.matches(hostname))
            .unwrap_or(false);
        if matched {
            return !negate;
        }
    }
    false
}

pub fn can_ever_satisfy(
    task: &Task,
    host: &HostInfo,
    strategy: ExecutionStrategy,
) -> Result<(), Rejection> {
    if let Some(patterns) = task.host.as_deref().filter(|h| !h.trim().is_empty()) {
        if !host_matches(patterns, &host.hostname) {
            return Err(Rejection::Host(patterns.to_string()));
        }
    }

    // Sólo root corriendo en procesos aparte puede cambiar de usuario.
    let can_switch_user = host.is_root && strategy == ExecutionStrategy::Process;
    if !can_switch_user && host.user != task.user {
        return Err(Rejection::User(task.user.clone()));
    }

    // En hilos no hay chdir posible.
    if strategy == ExecutionStrategy::Thread && host.cwd != task.cwd {
        return Err(Rejection::Cwd(task.cwd.clone().unwrap_or_default()));
    }

    if !matches!(nix::unistd::User::from_name(&task.user), Ok(Some(_))) {
        return Err(Rejection::UnknownUser(task.user.clone()));
    }

    if let Some(platform) = &task.platform {
        if platform.to_lowercase() != host.platform.to_lowercase() {
            return Err(Rejection::Platform(platform.clone()));
        }
    }

    Ok(())
}
