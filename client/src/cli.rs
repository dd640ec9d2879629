use clap::{Args, Parser, Subcommand};
use common::task::TaskId;

#[derive(Parser, Debug)]
#[command(name = "dagq")]
#[command(about = "CLI para encolar y administrar tareas de dagq")]
pub struct Cli {
    /// URL del broker (memory:, http://host:puerto).
    #[arg(long, global = true, env = "DAGQ_BROKER")]
    pub broker: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Opciones de las tareas de shell que crean `submit` y `xargs`.
#[derive(Args, Debug, Clone, Default)]
pub struct TaskOptions {
    /// El primer argumento es un script de shell; el resto son sus argumentos.
    #[arg(short, long)]
    pub shell: bool,

    /// Seguir la salida de la tarea mientras corre.
    #[arg(short, long)]
    pub watch: bool,

    /// Nombre para `dagq status`.
    #[arg(long)]
    pub name: Option<String>,

    /// Las más altas van primero.
    #[arg(short, long)]
    pub priority: Option<i64>,

    /// Cpus por tarea; negativo es una fracción del host.
    #[arg(short, long, allow_negative_numbers = true)]
    pub cpus: Option<f64>,

    /// Globs de host separados por coma; `!` niega.
    #[arg(long)]
    pub host: Option<String>,

    /// Plataforma requerida (linux, macos, ...).
    #[arg(long)]
    pub platform: Option<String>,

    /// Dónde correr (por defecto el directorio actual).
    #[arg(long)]
    pub cwd: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Encola un comando de shell
    #[command(visible_aliases = ["s", "sub"])]
    Submit {
        #[command(flatten)]
        options: TaskOptions,

        #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Una tarea por grupo de argumentos leídos de stdin, más una de agrupación
    Xargs {
        /// Líneas de entrada por tarea.
        #[arg(short = 'L', long = "lines", value_name = "N", conflicts_with = "words")]
        lines: Option<usize>,

        /// Palabras de entrada por tarea.
        #[arg(short = 'n', long = "words", value_name = "N")]
        words: Option<usize>,

        /// Imprimir los ids de todas las tareas.
        #[arg(short, long)]
        verbose: bool,

        #[command(flatten)]
        options: TaskOptions,

        #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Lista tareas y su estado
    Status {
        /// Profundidad de dependencias a mostrar; 0 es sin límite.
        #[arg(short, long, default_value_t = 1)]
        depth: usize,

        /// Sin agrupar por dependencias.
        #[arg(long)]
        flat: bool,

        /// Tareas de todos los usuarios.
        #[arg(short = 'x', long)]
        all_users: bool,

        #[arg(value_name = "TID")]
        tids: Vec<TaskId>,
    },

    /// Muestra (o sigue) stdout/stderr de tareas
    Output {
        /// Seguir hasta que las tareas terminen.
        #[arg(short, long)]
        watch: bool,

        #[arg(value_name = "TID", required = true)]
        tids: Vec<TaskId>,
    },

    /// Marca tareas como killed y les manda una señal
    Kill {
        /// Señal como la acepta kill(1).
        #[arg(short, long, default_value = "KILL")]
        signal: String,

        #[arg(value_name = "TID", required = true)]
        tids: Vec<TaskId>,
    },

    /// Vuelve a poner en pending tareas con error o killed
    Retry {
        /// También las que terminaron bien.
        #[arg(short, long)]
        success: bool,

        /// Nueva prioridad.
        #[arg(short, long)]
        priority: Option<i64>,

        #[arg(value_name = "TID", required = true)]
        tids: Vec<TaskId>,
    },

    /// Borra tareas por id o por estado
    Rm {
        #[arg(short, long)]
        error: bool,
        #[arg(short, long)]
        success: bool,
        #[arg(short, long)]
        killed: bool,
        #[arg(short, long)]
        pending: bool,
        /// Igual que `-esk`.
        #[arg(short, long)]
        complete: bool,
        /// Igual que `-eskp`.
        #[arg(short, long)]
        all: bool,
        /// También tareas de otros usuarios.
        #[arg(short = 'x', long)]
        all_users: bool,
        #[arg(short, long)]
        verbose: bool,

        #[arg(value_name = "TID")]
        tids: Vec<TaskId>,
    },

    /// Pausa tareas pendientes
    Pause {
        #[arg(value_name = "TID", required = true)]
        tids: Vec<TaskId>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_con_guiones_en_el_comando() {
        let cli = Cli::try_parse_from([
            "dagq", "submit", "--priority", "5", "--", "ls", "-la", "/tmp",
        ])
        .unwrap();
        match cli.command {
            Commands::Submit { options, command } => {
                assert_eq!(options.priority, Some(5));
                assert_eq!(command, vec!["ls", "-la", "/tmp"]);
            }
            other => panic!("esperaba submit, vino {:?}", other),
        }
    }

    #[test]
    fn broker_global_y_kill_con_senal() {
        let cli = Cli::try_parse_from([
            "dagq", "kill", "-s", "TERM", "--broker", "memory:", "3", "4",
        ])
        .unwrap();
        assert_eq!(cli.broker.as_deref(), Some("memory:"));
        match cli.command {
            Commands::Kill { signal, tids } => {
                assert_eq!(signal, "TERM");
                assert_eq!(tids, vec![3, 4]);
            }
            other => panic!("esperaba kill, vino {:?}", other),
        }
    }

    #[test]
    fn xargs_lineas_y_palabras_se_excluyen() {
        assert!(Cli::try_parse_from(["dagq", "xargs", "-L", "1", "-n", "2", "echo"]).is_err());
        assert!(Cli::try_parse_from(["dagq", "xargs", "-n", "2", "echo"]).is_ok());
    }
}
