use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::broker::Broker;
use crate::dag::{Dep, ProtoId, PrototypeGraph};
use crate::errors::SubmitError;
use crate::future::TaskFuture;
use crate::task::{NewTask, TaskId, TaskSpec};

/// Punto de entrada del cliente para enviar tareas a un broker.
#[derive(Clone)]
pub struct Queue {
    broker: Arc<dyn Broker>,
}

impl Queue {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub async fn submit(&self, spec: TaskSpec) -> Result<Arc<TaskFuture>, SubmitError> {
        let mut graph = PrototypeGraph::new();
        let root = graph.add(spec);
        self.submit_graph(&graph, root).await
    }

    pub async fn submit_graph(
        &self,
        graph: &PrototypeGraph,
        root: ProtoId,
    ) -> Result<Arc<TaskFuture>, SubmitError> {
        let mut futures = self.submit_many(graph, &[root]).await?;
        futures
            .remove(&root)
            .ok_or(SubmitError::UnknownPrototype(root))
    }

    /// Crea todos los prototipos alcanzables desde `roots`.
    ///
    /// 1. Linealiza el grafo; un ciclo falla antes de crear nada.
    /// 2. Por pasadas: todo prototipo cuyas referencias ya están resueltas se
    ///    crea en una sola llamada a `create`, así las dependencias reciben
    ///    ids menores que quienes dependen de ellas.
    /// 3. Marca todo el lote como pending.
    pub async fn submit_many(
        &self,
        graph: &PrototypeGraph,
        roots: &[ProtoId],
    ) -> Result<HashMap<ProtoId, Arc<TaskFuture>>, SubmitError> {
        let order = graph.linearize(roots)?;

        let mut resolved: HashMap<ProtoId, TaskId> = HashMap::new();
        let mut remaining = order;
        let mut created: Vec<TaskId> = Vec::new();
        let mut round = 0;

        while !remaining.is_empty() {
            round += 1;
            let (ready, blocked): (Vec<ProtoId>, Vec<ProtoId>) = remaining
                .into_iter()
                .partition(|p| references_resolved(graph, *p, &resolved));

            if ready.is_empty() {
                return Err(SubmitError::Unresolvable {
                    remaining: blocked.len(),
                });
            }

            let batch: Vec<NewTask> = ready
                .iter()
                .map(|p| normalize(graph, *p, &resolved))
                .collect::<Result<_, _>>()?;

            let ids = self.broker.create(batch).await?;
            debug!("pasada {}: {} tareas creadas", round, ids.len());

            for (proto, id) in ready.iter().zip(ids.iter()) {
                resolved.insert(*proto, *id);
            }
            created.extend(ids);
            remaining = blocked;
        }

        self.broker.mark_pending(&created).await?;
        info!("{} tareas enviadas en {} pasadas", created.len(), round);

        let mut futures = HashMap::with_capacity(resolved.len());
        for (proto, id) in resolved {
            futures.insert(proto, self.broker.get_future(id)?);
        }
        Ok(futures)
    }
}

fn references_resolved(graph: &PrototypeGraph, proto: ProtoId, resolved: &HashMap<ProtoId, TaskId>) -> bool {
    graph.node(proto).is_some_and(|node| {
        node.dependencies
            .iter()
            .chain(node.children.iter())
            .all(|d| match d {
                Dep::Proto(p) => resolved.contains_key(p),
                Dep::Future(_) | Dep::Id(_) => true,
            })
    })
}

fn resolve_refs(
    refs: &[Dep],
    resolved: &HashMap<ProtoId, TaskId>,
) -> Result<Vec<TaskId>, SubmitError> {
    let mut seen = HashSet::new();
    let mut ids = Vec::with_capacity(refs.len());
    for dep in refs {
        let id = match dep {
            Dep::Proto(p) => *resolved.get(p).ok_or(SubmitError::UnknownPrototype(*p))?,
            Dep::Future(f) => f.id(),
            Dep::Id(id) => *id,
        };
        // conjunto ordenado: la primera aparición gana
        if seen.insert(id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn normalize(
    graph: &PrototypeGraph,
    proto: ProtoId,
    resolved: &HashMap<ProtoId, TaskId>,
) -> Result<NewTask, SubmitError> {
    let node = graph.node(proto).ok_or(SubmitError::UnknownPrototype(proto))?;
    let dependencies = resolve_refs(&node.dependencies, resolved)?;
    let children = resolve_refs(&node.children, resolved)?;
    Ok(node.spec.normalize(dependencies, children))
}
