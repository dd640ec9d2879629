use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use common::broker::Broker;
use common::dag::PrototypeGraph;
use common::events::{output_event, signal_event, status_event_for_task, Event, EventPayload};
use common::queue::Queue;
use common::task::{current_login, Task, TaskFilter, TaskId, TaskSpec, TaskStatus, TaskUpdate};
use nix::sys::signal::Signal;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cli::TaskOptions;

/// Nombre que ve el script como `$0` con `--shell`.
const SHELL_ARGV0: &str = "dagq-submit";
/// Cada cuánto `output --watch` revisa el estado por si se perdió un evento.
const WATCH_RECHECK: Duration = Duration::from_secs(5);

/* --------- armado de tareas --------- */

/// Con `--shell` el primer argumento es el script:
/// `$SHELL -c SCRIPT dagq-submit ARGS...`.
pub fn shell_command(shell: bool, command: &[String]) -> Vec<String> {
    if !shell || command.is_empty() {
        return command.to_vec();
    }
    let sh = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
    let mut argv = vec![sh, "-c".to_string(), command[0].clone(), SHELL_ARGV0.to_string()];
    argv.extend(command[1..].iter().cloned());
    argv
}

/// Argumentos que nombran archivos existentes, en forma absoluta.
pub fn paths_from_args(args: &[String]) -> Vec<String> {
    args.iter()
        .filter(|a| Path::new(a.as_str()).is_file())
        .filter_map(|a| std::fs::canonicalize(a).ok())
        .map(|p| p.to_string_lossy().to_string())
        .collect()
}

fn task_spec(options: &TaskOptions, argv: Vec<String>, name: Option<String>) -> TaskSpec {
    let mut spec = TaskSpec::shell(argv);
    spec.name = name;
    spec.priority = options.priority;
    spec.cpus = options.cpus;
    spec.host = options.host.clone();
    spec.platform = options.platform.clone();
    spec.cwd = options.cwd.clone();
    spec.environ = std::env::vars().collect::<BTreeMap<_, _>>();
    spec
}

/* --------- tokens de xargs --------- */

/// Parte una línea como lo haría un shell: espacios separan, comillas
/// simples y dobles agrupan, `\` escapa el siguiente caracter.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_token = true;
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_token = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Grupos de argumentos, uno por tarea: cada `lines` líneas, cada `words`
/// palabras, o todo junto.
pub fn group_tokens(input: &str, lines: Option<usize>, words: Option<usize>) -> Vec<Vec<String>> {
    if let Some(n) = lines.filter(|n| *n > 0) {
        let all: Vec<&str> = input.lines().collect();
        return all
            .chunks(n)
            .map(|chunk| chunk.iter().flat_map(|l| tokenize(l)).collect())
            .collect();
    }
    let all: Vec<String> = input.lines().flat_map(tokenize).collect();
    match words.filter(|n| *n > 0) {
        Some(n) => all.chunks(n).map(|c| c.to_vec()).collect(),
        None => vec![all],
    }
}

/* --------- comandos --------- */

pub async fn submit(broker: Arc<dyn Broker>, options: &TaskOptions, command: &[String]) -> Result<()> {
    let argv = shell_command(options.shell, command);
    let spec = task_spec(options, argv, options.name.clone());
    let future = Queue::new(broker.clone()).submit(spec).await?;

    if options.watch {
        return output(broker, &[future.id()], true).await;
    }
    println!("{}", future.id());
    Ok(())
}

pub async fn xargs(
    broker: Arc<dyn Broker>,
    options: &TaskOptions,
    command: &[String],
    input: &str,
    lines: Option<usize>,
    words: Option<usize>,
    verbose: bool,
) -> Result<()> {
    let mut graph = PrototypeGraph::new();
    let group_name = options
        .name
        .clone()
        .unwrap_or_else(|| format!("xargs {}", command.join(" ")));
    let group = graph.add(TaskSpec::group().with_name(group_name));

    let mut members = Vec::new();
    for tokens in group_tokens(input, lines, words) {
        let mut argv = shell_command(options.shell, command);
        argv.extend(tokens);
        let name = argv.join(" ");
        let io_paths = paths_from_args(&argv);
        let spec = task_spec(options, argv, Some(name)).with_io_paths(io_paths);
        let node = graph.add(spec);
        graph.depend_on(group, node)?;
        members.push(node);
    }

    let futures = Queue::new(broker.clone()).submit_many(&graph, &[group]).await?;
    let mut ids: Vec<TaskId> = members
        .iter()
        .filter_map(|node| futures.get(node).map(|f| f.id()))
        .collect();
    ids.sort_unstable();
    if verbose {
        for id in &ids {
            println!("{}", id);
        }
    }

    let Some(group_id) = futures.get(&group).map(|f| f.id()) else {
        bail!("la tarea de agrupación no se creó");
    };
    if options.watch {
        ids.push(group_id);
        return output(broker, &ids, true).await;
    }
    println!("{}", group_id);
    Ok(())
}

fn status_line(task: &Task) -> String {
    let pattern = task.pattern.as_deref().unwrap_or("-");
    format!(
        "{:6} {} {:7} {:7} {}",
        task.id,
        task.user,
        task.status.as_str(),
        pattern,
        task.display_name()
    )
}

/// Una línea por tarea; sin `flat` las dependencias cuelgan de quien las
/// usa, indentadas con tabs hasta `depth` niveles (0 = sin límite).
pub fn render_status(tasks: &HashMap<TaskId, Task>, depth: usize, flat: bool) -> Vec<String> {
    let mut lines = Vec::new();
    let mut ids: Vec<TaskId> = tasks.keys().copied().collect();
    ids.sort_unstable();

    if flat {
        for id in ids {
            lines.push(status_line(&tasks[&id]));
        }
        return lines;
    }

    let nested: HashSet<TaskId> = tasks
        .values()
        .flat_map(|t| t.dependencies.iter().copied())
        .collect();
    let mut stack: Vec<(usize, TaskId)> = ids
        .iter()
        .rev()
        .filter(|id| !nested.contains(id))
        .map(|id| (1, *id))
        .collect();

    while let Some((level, id)) = stack.pop() {
        let Some(task) = tasks.get(&id) else {
            continue;
        };
        lines.push(format!("{}{}", "\t".repeat(level - 1), status_line(task)));
        if depth == 0 || level < depth {
            let mut deps: Vec<TaskId> = task
                .dependencies
                .iter()
                .copied()
                .filter(|d| tasks.contains_key(d))
                .collect();
            deps.sort_unstable();
            stack.extend(deps.into_iter().rev().map(|d| (level + 1, d)));
        }
    }
    lines
}

pub async fn status(
    broker: Arc<dyn Broker>,
    tids: &[TaskId],
    all_users: bool,
    depth: usize,
    flat: bool,
) -> Result<()> {
    let tasks: HashMap<TaskId, Task> = if tids.is_empty() {
        let filter = TaskFilter {
            status: None,
            user: (!all_users).then(|| current_login().user),
        };
        broker
            .search(&filter)
            .await?
            .into_iter()
            .map(|t| (t.id, t))
            .collect()
    } else {
        broker.fetch(tids).await?
    };

    for line in render_status(&tasks, depth, flat) {
        println!("{}", line);
    }
    Ok(())
}

enum Watched {
    Chunk { id: TaskId, fd: i32, offset: u64, data: Vec<u8> },
    Done(Vec<TaskId>),
}

/// Recuerda el mayor offset impreso por `(tarea, fd)`.
#[derive(Default)]
pub struct OutputPrinter {
    printed: HashMap<(TaskId, i32), u64>,
}

impl OutputPrinter {
    /// `false` si ese pedazo ya se mostró.
    pub fn accept(&mut self, id: TaskId, fd: i32, offset: u64) -> bool {
        match self.printed.get(&(id, fd)) {
            Some(last) if offset <= *last => false,
            _ => {
                self.printed.insert((id, fd), offset);
                true
            }
        }
    }

    fn print(&mut self, id: TaskId, fd: i32, offset: u64, data: &[u8]) -> Result<()> {
        if !self.accept(id, fd, offset) {
            return Ok(());
        }
        match fd {
            1 => {
                let mut out = std::io::stdout().lock();
                out.write_all(data)?;
                out.flush()?;
            }
            2 => {
                let mut err = std::io::stderr().lock();
                err.write_all(data)?;
                err.flush()?;
            }
            other => debug!("fd {} ignorado", other),
        }
        Ok(())
    }
}

pub async fn output(broker: Arc<dyn Broker>, tids: &[TaskId], watch: bool) -> Result<()> {
    let mut printer = OutputPrinter::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut bindings = Vec::new();

    // Primero escuchar, después leer lo que ya hay.
    if watch {
        for &tid in tids {
            let chunks = tx.clone();
            let event = output_event(tid);
            let binding = broker.bind(
                &event,
                Arc::new(move |e: &Event| {
                    if let EventPayload::Output { id, fd, offset, data } = &e.payload {
                        let _ = chunks.send(Watched::Chunk {
                            id: *id,
                            fd: *fd,
                            offset: *offset,
                            data: data.clone(),
                        });
                    }
                    Ok(())
                }),
            );
            bindings.push((event, binding));

            let done = tx.clone();
            let event = status_event_for_task(tid);
            let binding = broker.bind(
                &event,
                Arc::new(move |e: &Event| {
                    if let EventPayload::Status { ids, status } = &e.payload {
                        if status.is_terminal() {
                            let _ = done.send(Watched::Done(ids.clone()));
                        }
                    }
                    Ok(())
                }),
            );
            bindings.push((event, binding));
        }
    }

    let mut watching: BTreeSet<TaskId> = BTreeSet::new();
    if watch {
        let found = broker.fetch(tids).await?;
        watching.extend(
            found
                .values()
                .filter(|t| t.status == TaskStatus::Pending)
                .map(|t| t.id),
        );
    }

    for chunk in broker.get_output(tids).await? {
        printer.print(chunk.task_id, chunk.fd, chunk.offset, &chunk.content)?;
    }

    while !watching.is_empty() {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(Watched::Chunk { id, fd, offset, data }) => {
                    printer.print(id, fd, offset, &data)?;
                }
                Some(Watched::Done(ids)) => {
                    for id in ids {
                        watching.remove(&id);
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep(WATCH_RECHECK) => {
                let ids: Vec<TaskId> = watching.iter().copied().collect();
                let found = broker.fetch(&ids).await?;
                watching.retain(|id| {
                    found.get(id).map_or(false, |t| t.status == TaskStatus::Pending)
                });
                // lo que se haya escrito entre eventos perdidos
                for chunk in broker.get_output(&ids).await? {
                    printer.print(chunk.task_id, chunk.fd, chunk.offset, &chunk.content)?;
                }
            }
        }
    }

    for (event, binding) in bindings {
        broker.unbind(&event, binding);
    }
    Ok(())
}

/// Número, `TERM` o `SIGTERM`.
pub fn parse_signal(name: &str) -> Option<Signal> {
    if let Ok(num) = name.parse::<i32>() {
        return Signal::try_from(num).ok();
    }
    let upper = name.to_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&full).ok()
}

pub async fn kill(broker: Arc<dyn Broker>, signal: &str, tids: &[TaskId]) -> Result<()> {
    let Some(sig) = parse_signal(signal) else {
        bail!("señal desconocida: {}", signal);
    };

    // Para el worker cualquier señal significa que la tarea murió.
    broker.mark_killed(tids).await?;

    let events: Vec<String> = tids.iter().map(|id| signal_event(*id)).collect();
    broker
        .trigger(
            &events,
            EventPayload::Signal {
                ids: tids.to_vec(),
                signal: sig as i32,
            },
        )
        .await;
    Ok(())
}

pub async fn retry(
    broker: Arc<dyn Broker>,
    tids: &[TaskId],
    success: bool,
    priority: Option<i64>,
) -> Result<()> {
    let found = broker.fetch(tids).await?;
    let mut tasks: Vec<&Task> = found.values().collect();
    tasks.sort_by_key(|t| t.id);

    for task in tasks {
        let retryable = matches!(task.status, TaskStatus::Error | TaskStatus::Killed)
            || (success && task.status == TaskStatus::Success);
        let mut status = task.status;
        if retryable {
            if priority.is_some() {
                broker
                    .update(
                        task.id,
                        TaskUpdate {
                            priority,
                            ..TaskUpdate::default()
                        },
                    )
                    .await?;
            }
            broker.mark_pending(&[task.id]).await?;
            status = TaskStatus::Pending;
        }
        println!("{} {}", task.id, status);
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RmSelection {
    pub error: bool,
    pub success: bool,
    pub killed: bool,
    pub pending: bool,
    pub complete: bool,
    pub all: bool,
}

impl RmSelection {
    /// `None` dentro del resultado significa "cualquier estado".
    pub fn statuses(&self) -> Vec<Option<TaskStatus>> {
        if self.all {
            return vec![None];
        }
        let wanted = [
            (self.error || self.complete, TaskStatus::Error),
            (self.success || self.complete, TaskStatus::Success),
            (self.killed || self.complete, TaskStatus::Killed),
            (self.pending, TaskStatus::Pending),
        ];
        wanted
            .into_iter()
            .filter(|(on, _)| *on)
            .map(|(_, status)| Some(status))
            .collect()
    }
}

pub async fn rm(
    broker: Arc<dyn Broker>,
    selection: RmSelection,
    all_users: bool,
    verbose: bool,
    tids: &[TaskId],
) -> Result<()> {
    let statuses = selection.statuses();
    if statuses.is_empty() && tids.is_empty() {
        bail!("nada para borrar: pasar ids o algún filtro de estado");
    }

    let user = (!all_users).then(|| current_login().user);
    let mut to_delete: BTreeSet<TaskId> = tids.iter().copied().collect();
    for status in statuses {
        let filter = TaskFilter {
            status,
            user: user.clone(),
        };
        for task in broker.search(&filter).await? {
            to_delete.insert(task.id);
        }
    }

    let ids: Vec<TaskId> = to_delete.into_iter().collect();
    broker.delete(&ids).await?;
    if verbose {
        for id in &ids {
            println!("{}", id);
        }
    } else {
        println!("borradas {} tareas", ids.len());
    }
    Ok(())
}

pub async fn pause(broker: Arc<dyn Broker>, tids: &[TaskId]) -> Result<()> {
    broker.mark_paused(tids).await?;
    for id in tids {
        println!("{} {}", id, TaskStatus::Paused);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::brokers::MemoryBroker;
    use std::env;
    use std::fs;

    fn temp_dir(sub: &str) -> std::path::PathBuf {
        let dir = env::temp_dir().join(format!("dagq_client_{}", sub));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn task(id: TaskId, deps: Vec<TaskId>, name: &str) -> Task {
        let spec = TaskSpec::default().with_name(name);
        Task::from_new(id, spec.normalize(deps, vec![]), Utc::now())
    }

    #[test]
    fn tokens_con_comillas_y_escapes() {
        assert_eq!(tokenize("a  'b c' \"d\\\"e\" f\\ g"), vec!["a", "b c", "d\"e", "f g"]);
        assert_eq!(tokenize("''"), vec![""]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn grupos_por_lineas_y_por_palabras() {
        let input = "a b\nc\nd e f\n";
        assert_eq!(
            group_tokens(input, Some(2), None),
            vec![vec!["a", "b", "c"], vec!["d", "e", "f"]]
        );
        assert_eq!(
            group_tokens(input, None, Some(4)),
            vec![vec!["a", "b", "c", "d"], vec!["e", "f"]]
        );
        assert_eq!(group_tokens(input, None, None).len(), 1);
    }

    #[test]
    fn shell_inserta_script_y_argv0() {
        let cmd = vec!["echo $1".to_string(), "hola".to_string()];
        let argv = shell_command(true, &cmd);
        assert_eq!(argv[1], "-c");
        assert_eq!(&argv[2..], &["echo $1", "dagq-submit", "hola"]);
        assert_eq!(shell_command(false, &cmd), cmd);
    }

    #[test]
    fn solo_archivos_existentes_son_io_paths() {
        let dir = temp_dir("paths");
        let file = dir.join("input.txt");
        fs::write(&file, "x").unwrap();
        let args = vec![
            "cat".to_string(),
            file.to_string_lossy().to_string(),
            dir.join("no-existe").to_string_lossy().to_string(),
            dir.to_string_lossy().to_string(),
        ];
        let paths = paths_from_args(&args);
        assert_eq!(paths, vec![fs::canonicalize(&file).unwrap().to_string_lossy().to_string()]);
    }

    #[test]
    fn senales_por_nombre_y_numero() {
        assert_eq!(parse_signal("9"), Some(Signal::SIGKILL));
        assert_eq!(parse_signal("TERM"), Some(Signal::SIGTERM));
        assert_eq!(parse_signal("sigint"), Some(Signal::SIGINT));
        assert_eq!(parse_signal("NOPE"), None);
    }

    #[test]
    fn offsets_repetidos_no_se_imprimen() {
        let mut p = OutputPrinter::default();
        assert!(p.accept(1, 1, 0));
        assert!(!p.accept(1, 1, 0));
        assert!(p.accept(1, 2, 0));
        assert!(p.accept(1, 1, 5));
        assert!(!p.accept(1, 1, 3));
    }

    #[test]
    fn rm_complete_es_error_success_killed() {
        let sel = RmSelection {
            complete: true,
            ..RmSelection::default()
        };
        let statuses = sel.statuses();
        assert_eq!(statuses.len(), 3);
        assert!(!statuses.contains(&Some(TaskStatus::Pending)));
        let all = RmSelection {
            all: true,
            ..RmSelection::default()
        };
        assert_eq!(all.statuses(), vec![None]);
    }

    #[test]
    fn arbol_de_status() {
        let mut tasks = HashMap::new();
        tasks.insert(1, task(1, vec![], "a"));
        tasks.insert(2, task(2, vec![], "b"));
        tasks.insert(3, task(3, vec![1, 2], "grupo"));

        let lines = render_status(&tasks, 1, false);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\"grupo\""));

        let lines = render_status(&tasks, 0, false);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with('\t') && lines[1].contains("\"a\""));

        assert_eq!(render_status(&tasks, 1, true).len(), 3);
    }

    #[tokio::test]
    async fn retry_vuelve_a_pending_y_cambia_prioridad() {
        let broker: Arc<dyn Broker> = MemoryBroker::new();
        let queue = Queue::new(broker.clone());
        let failed = queue.submit(TaskSpec::default()).await.unwrap();
        let done = queue.submit(TaskSpec::default()).await.unwrap();
        broker
            .mark_error(failed.id(), common::TaskFailure::raised("ValueError", "x"))
            .await
            .unwrap();
        broker.mark_success(done.id(), serde_json::json!(1)).await.unwrap();

        retry(broker.clone(), &[failed.id(), done.id()], false, Some(7))
            .await
            .unwrap();

        let task = failed.task().await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 7);
        assert!(task.exception.is_none());
        assert_eq!(done.status().await.unwrap(), TaskStatus::Success);
    }

    #[tokio::test]
    async fn kill_marca_y_avisa() {
        let broker: Arc<dyn Broker> = MemoryBroker::new();
        let future = Queue::new(broker.clone())
            .submit(TaskSpec::default())
            .await
            .unwrap();
        let got = Arc::new(std::sync::Mutex::new(None));
        let sink = got.clone();
        broker.bind(
            &signal_event(future.id()),
            Arc::new(move |e: &Event| {
                if let EventPayload::Signal { signal, .. } = &e.payload {
                    *sink.lock().unwrap() = Some(*signal);
                }
                Ok(())
            }),
        );

        kill(broker.clone(), "TERM", &[future.id()]).await.unwrap();

        assert_eq!(future.status().await.unwrap(), TaskStatus::Killed);
        assert_eq!(*got.lock().unwrap(), Some(Signal::SIGTERM as i32));
        assert!(kill(broker, "NOPE", &[1]).await.is_err());
    }

    #[tokio::test]
    async fn rm_por_estado_y_por_id() {
        let broker: Arc<dyn Broker> = MemoryBroker::new();
        let queue = Queue::new(broker.clone());
        let a = queue.submit(TaskSpec::default()).await.unwrap();
        let b = queue.submit(TaskSpec::default()).await.unwrap();
        let c = queue.submit(TaskSpec::default()).await.unwrap();
        broker.mark_success(a.id(), serde_json::Value::Null).await.unwrap();

        let success = RmSelection {
            success: true,
            ..RmSelection::default()
        };
        rm(broker.clone(), success, false, true, &[b.id()]).await.unwrap();

        let left = broker.fetch(&[a.id(), b.id(), c.id()]).await.unwrap();
        assert_eq!(left.keys().copied().collect::<Vec<_>>(), vec![c.id()]);
        assert!(rm(broker, RmSelection::default(), false, false, &[]).await.is_err());
    }

    #[tokio::test]
    async fn xargs_crea_grupo_que_depende_de_todas() {
        let broker: Arc<dyn Broker> = MemoryBroker::new();
        let options = TaskOptions::default();
        xargs(
            broker.clone(),
            &options,
            &["echo".to_string()],
            "uno\ndos\ntres\n",
            Some(1),
            None,
            false,
        )
        .await
        .unwrap();

        let tasks = broker.search(&TaskFilter::status(TaskStatus::Pending)).await.unwrap();
        assert_eq!(tasks.len(), 4);
        let group = tasks.iter().find(|t| t.pattern.is_none()).unwrap();
        assert_eq!(group.dependencies.len(), 3);
        assert_eq!(group.name.as_deref(), Some("xargs echo"));
        let names: BTreeSet<String> = tasks
            .iter()
            .filter(|t| t.pattern.is_some())
            .filter_map(|t| t.name.clone())
            .collect();
        assert!(names.contains("echo uno") && names.contains("echo tres"));
    }
}
