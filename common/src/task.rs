use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::TaskFailure;

pub type TaskId = u64;

pub const DEFAULT_PRIORITY: i64 = 1000;
pub const DEFAULT_PATTERN: &str = "generic";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Creating,
    Pending,
    Paused,
    Success,
    Error,
    Killed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Creating => "creating",
            TaskStatus::Pending => "pending",
            TaskStatus::Paused => "paused",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
            TaskStatus::Killed => "killed",
        }
    }

    /// success, error o killed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Error | TaskStatus::Killed
        )
    }

    /// El estado sólo avanza: un terminal únicamente vuelve a `pending`
    /// (retry explícito).
    pub fn can_move_to(&self, next: TaskStatus) -> bool {
        match next {
            TaskStatus::Pending => true,
            TaskStatus::Creating => *self == TaskStatus::Creating,
            _ => !self.is_terminal(),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(TaskStatus::Creating),
            "pending" => Ok(TaskStatus::Pending),
            "paused" => Ok(TaskStatus::Paused),
            "success" => Ok(TaskStatus::Success),
            "error" => Ok(TaskStatus::Error),
            "killed" => Ok(TaskStatus::Killed),
            other => Err(format!("unknown status {:?}", other)),
        }
    }
}

/// Resultado terminal de una tarea, tal como lo escribe el broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Success(Value),
    Error(TaskFailure),
}

/// Tarea persistida en el broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub name: Option<String>,

    /// `None` = nodo de agrupación (se marca success sin ejecutar nada).
    pub pattern: Option<String>,
    pub func: Option<String>,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,

    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub children: Vec<TaskId>,

    pub priority: i64,
    pub cpus: Option<f64>,
    pub memory: Option<u64>,
    pub host: Option<String>,
    pub platform: Option<String>,
    pub user: String,
    pub group: String,
    pub cwd: Option<String>,
    #[serde(default)]
    pub environ: BTreeMap<String, String>,

    /// Pistas para la prioridad dinámica.
    #[serde(default)]
    pub io_paths: Vec<String>,
    pub duration: Option<u64>,

    pub result: Option<Value>,
    pub exception: Option<TaskFailure>,

    pub creation_time: DateTime<Utc>,
    pub first_active: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
}

impl Task {
    /// Fila inicial (status `creating`) a partir de un prototipo normalizado.
    pub fn from_new(id: TaskId, new: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: TaskStatus::Creating,
            name: new.name,
            pattern: new.pattern,
            func: new.func,
            args: new.args,
            kwargs: new.kwargs,
            dependencies: new.dependencies,
            children: new.children,
            priority: new.priority,
            cpus: new.cpus,
            memory: new.memory,
            host: new.host,
            platform: new.platform,
            user: new.user,
            group: new.group,
            cwd: new.cwd,
            environ: new.environ,
            io_paths: new.io_paths,
            duration: new.duration,
            result: None,
            exception: None,
            creation_time: now,
            first_active: None,
            last_active: None,
        }
    }

    /// Nombre para mostrar: el nombre, o la función, o el pattern.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return format!("{:?}", name);
        }
        let func = self.func.as_deref().unwrap_or("");
        let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        match self.pattern.as_deref() {
            Some("shell") => args
                .iter()
                .map(|a| a.trim_matches('"').to_string())
                .collect::<Vec<_>>()
                .join(" "),
            _ => format!("{}({})", func, args.join(", ")),
        }
    }

    pub fn apply_update(&mut self, update: &TaskUpdate) {
        if let Some(name) = &update.name {
            self.name = Some(name.clone());
        }
        if let Some(priority) = update.priority {
            self.priority = priority;
        }
        if let Some(cpus) = update.cpus {
            self.cpus = Some(cpus);
        }
        if let Some(memory) = update.memory {
            self.memory = Some(memory);
        }
        if let Some(host) = &update.host {
            self.host = Some(host.clone());
        }
        if let Some(platform) = &update.platform {
            self.platform = Some(platform.clone());
        }
        if let Some(io_paths) = &update.io_paths {
            self.io_paths = io_paths.clone();
        }
        if let Some(duration) = update.duration {
            self.duration = Some(duration);
        }
    }
}

/// Prototipo normalizado y con dependencias ya resueltas a ids; es lo que
/// recibe `Broker::create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub name: Option<String>,
    pub pattern: Option<String>,
    pub func: Option<String>,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub children: Vec<TaskId>,
    pub priority: i64,
    pub cpus: Option<f64>,
    pub memory: Option<u64>,
    pub host: Option<String>,
    pub platform: Option<String>,
    pub user: String,
    pub group: String,
    pub cwd: Option<String>,
    #[serde(default)]
    pub environ: BTreeMap<String, String>,
    #[serde(default)]
    pub io_paths: Vec<String>,
    pub duration: Option<u64>,
}

/// Descripción de una tarea del lado del cliente (antes de normalizar).
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub name: Option<String>,
    pub pattern: Option<String>,
    pub func: Option<String>,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub priority: Option<i64>,
    pub cpus: Option<f64>,
    pub memory: Option<u64>,
    pub host: Option<String>,
    pub platform: Option<String>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub cwd: Option<String>,
    pub environ: BTreeMap<String, String>,
    pub io_paths: Vec<String>,
    pub duration: Option<u64>,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            name: None,
            pattern: Some(DEFAULT_PATTERN.to_string()),
            func: None,
            args: Vec::new(),
            kwargs: Map::new(),
            priority: None,
            cpus: None,
            memory: None,
            host: None,
            platform: None,
            user: None,
            group: None,
            cwd: None,
            environ: BTreeMap::new(),
            io_paths: Vec::new(),
            duration: None,
        }
    }
}

impl TaskSpec {
    /// Llamada "generic" a una función registrada.
    pub fn call(func: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            func: Some(func.into()),
            args,
            ..Self::default()
        }
    }

    /// Comando de shell (pattern "shell").
    pub fn shell<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pattern: Some("shell".to_string()),
            args: argv.into_iter().map(|s| Value::String(s.into())).collect(),
            ..Self::default()
        }
    }

    /// Nodo de agrupación: sin pattern.
    pub fn group() -> Self {
        Self {
            pattern: None,
            ..Self::default()
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_cpus(mut self, cpus: f64) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory = Some(bytes);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn with_io_paths(mut self, paths: Vec<String>) -> Self {
        self.io_paths = paths;
        self
    }

    /// Rellena defaults (prioridad, usuario, grupo, cwd) y fija las
    /// dependencias ya resueltas.
    pub fn normalize(&self, dependencies: Vec<TaskId>, children: Vec<TaskId>) -> NewTask {
        let login = current_login();
        NewTask {
            name: self.name.clone(),
            pattern: self.pattern.clone(),
            func: self.func.clone(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            dependencies,
            children,
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
            cpus: self.cpus,
            memory: self.memory,
            host: self.host.clone(),
            platform: self.platform.clone(),
            user: self.user.clone().unwrap_or_else(|| login.user.clone()),
            group: self.group.clone().unwrap_or(login.group),
            cwd: self.cwd.clone().or_else(|| {
                std::env::current_dir()
                    .ok()
                    .map(|p| p.to_string_lossy().to_string())
            }),
            environ: self.environ.clone(),
            io_paths: self.io_paths.clone(),
            duration: self.duration,
        }
    }
}

/// Campos que se pueden cambiar con `Broker::update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub priority: Option<i64>,
    pub cpus: Option<f64>,
    pub memory: Option<u64>,
    pub host: Option<String>,
    pub platform: Option<String>,
    pub io_paths: Option<Vec<String>>,
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub user: Option<String>,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            user: None,
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(user) = &self.user {
            if &task.user != user {
                return false;
            }
        }
        true
    }
}

/// Un pedazo de stdout (fd 1) o stderr (fd 2) de una tarea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub task_id: TaskId,
    pub ctime: DateTime<Utc>,
    pub fd: i32,
    pub offset: u64,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub user: String,
    pub group: String,
}

/// Usuario y grupo efectivos del proceso actual.
pub fn current_login() -> Login {
    use nix::unistd::{geteuid, Group, User};

    let user = User::from_uid(geteuid()).ok().flatten();
    let group = user
        .as_ref()
        .and_then(|u| Group::from_gid(u.gid).ok().flatten())
        .map(|g| g.name);

    let user_name = user
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "nobody".to_string());

    Login {
        group: group.unwrap_or_else(|| user_name.clone()),
        user: user_name,
    }
}
