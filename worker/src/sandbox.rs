//! Lado hijo de un `ProcessJob`: `dagq-worker exec-task <id>`.
//!
//! El padre escribe un `SandboxPackage` en JSON por stdin y cierra. El hijo
//! se conecta al mismo broker, ejecuta la tarea y sale; su stdout/stderr los
//! lee el padre.

use std::sync::Arc;

use anyhow::Context;
use common::brokers;
use common::patterns::{Registry, TaskContext};
use common::task::Task;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::job::execute;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPackage {
    pub broker_url: String,
    pub task: Task,
}

pub async fn exec_task(registry: Arc<Registry>) -> anyhow::Result<()> {
    let mut input = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut input)
        .await
        .context("no se pudo leer el paquete de stdin")?;
    let package: SandboxPackage =
        serde_json::from_slice(&input).context("paquete de tarea inválido")?;

    debug!("exec-task {} contra {}", package.task.id, package.broker_url);
    let broker = brokers::connect(Some(&package.broker_url)).await?;

    execute(TaskContext {
        task: package.task,
        broker,
        registry,
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::task::TaskSpec;
    use serde_json::json;

    #[test]
    fn paquete_ida_y_vuelta_en_json() {
        let task = Task::from_new(
            9,
            TaskSpec::call("str", vec![json!(1)]).normalize(vec![], vec![]),
            Utc::now(),
        );
        let package = SandboxPackage {
            broker_url: "http://127.0.0.1:8080/".into(),
            task,
        };
        let text = serde_json::to_string(&package).unwrap();
        let back: SandboxPackage = serde_json::from_str(&text).unwrap();
        assert_eq!(back.task, package.task);
        assert_eq!(back.broker_url, package.broker_url);
    }
}
