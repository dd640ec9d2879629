//! Grafo de prototipos antes de enviarlo al broker.
//!
//! Cada nodo vive en un arena y se referencia por su índice (`ProtoId`).
//! Las aristas (`dependencies` y `children`) pueden apuntar a otro
//! prototipo, a un future ya creado o a un id crudo.

use std::fmt;
use std::sync::Arc;

use crate::errors::SubmitError;
use crate::future::TaskFuture;
use crate::task::{TaskId, TaskSpec};

pub type ProtoId = usize;

#[derive(Clone)]
pub enum Dep {
    /// Otro nodo del mismo grafo.
    Proto(ProtoId),
    /// Tarea ya creada.
    Future(Arc<TaskFuture>),
    /// Id de una tarea que se asume existente.
    Id(TaskId),
}

impl fmt::Debug for Dep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dep::Proto(p) => write!(f, "Proto({})", p),
            Dep::Future(fut) => write!(f, "Future({})", fut.id()),
            Dep::Id(id) => write!(f, "Id({})", id),
        }
    }
}

impl From<Arc<TaskFuture>> for Dep {
    fn from(future: Arc<TaskFuture>) -> Self {
        Dep::Future(future)
    }
}

#[derive(Debug, Clone)]
pub struct ProtoNode {
    pub spec: TaskSpec,
    pub dependencies: Vec<Dep>,
    pub children: Vec<Dep>,
}

impl ProtoNode {
    /// Prototipos referenciados, dependencias primero.
    fn proto_edges(&self) -> impl Iterator<Item = ProtoId> + '_ {
        self.dependencies
            .iter()
            .chain(self.children.iter())
            .filter_map(|d| match d {
                Dep::Proto(p) => Some(*p),
                _ => None,
            })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrototypeGraph {
    nodes: Vec<ProtoNode>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl PrototypeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, spec: TaskSpec) -> ProtoId {
        self.nodes.push(ProtoNode {
            spec,
            dependencies: Vec::new(),
            children: Vec::new(),
        });
        self.nodes.len() - 1
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: ProtoId) -> Option<&ProtoNode> {
        self.nodes.get(id)
    }

    fn check(&self, id: ProtoId) -> Result<(), SubmitError> {
        if id < self.nodes.len() {
            Ok(())
        } else {
            Err(SubmitError::UnknownPrototype(id))
        }
    }

    fn node_mut(&mut self, id: ProtoId) -> Result<&mut ProtoNode, SubmitError> {
        self.nodes.get_mut(id).ok_or(SubmitError::UnknownPrototype(id))
    }

    /// `node` no corre hasta que `dep` termine con success.
    pub fn depend(&mut self, node: ProtoId, dep: Dep) -> Result<(), SubmitError> {
        if let Dep::Proto(p) = &dep {
            self.check(*p)?;
        }
        self.node_mut(node)?.dependencies.push(dep);
        Ok(())
    }

    /// Atajo para `depend(node, Dep::Proto(dep))`.
    pub fn depend_on(&mut self, node: ProtoId, dep: ProtoId) -> Result<(), SubmitError> {
        self.depend(node, Dep::Proto(dep))
    }

    /// Parte de la misma unidad lógica, sin bloquear a `node`.
    pub fn add_child(&mut self, node: ProtoId, child: Dep) -> Result<(), SubmitError> {
        if let Dep::Proto(p) = &child {
            self.check(*p)?;
        }
        self.node_mut(node)?.children.push(child);
        Ok(())
    }

    /// Recorre en profundidad desde `roots` siguiendo dependencias e hijos y
    /// devuelve cada prototipo alcanzable una sola vez, después de todo lo
    /// que referencia. Volver a un nodo en curso es un ciclo.
    pub fn linearize(&self, roots: &[ProtoId]) -> Result<Vec<ProtoId>, SubmitError> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut order = Vec::new();

        for &root in roots {
            self.check(root)?;
            if marks[root] != Mark::Unvisited {
                continue;
            }

            // (nodo, aristas pendientes)
            let mut stack: Vec<(ProtoId, Vec<ProtoId>)> = Vec::new();
            marks[root] = Mark::InProgress;
            stack.push((root, self.edges_of(root)?));

            while let Some((current, pending)) = stack.last_mut() {
                let current = *current;
                match pending.pop() {
                    Some(next) => match marks[next] {
                        Mark::Done => {}
                        Mark::InProgress => return Err(SubmitError::DependencyCycle(next)),
                        Mark::Unvisited => {
                            marks[next] = Mark::InProgress;
                            let edges = self.edges_of(next)?;
                            stack.push((next, edges));
                        }
                    },
                    None => {
                        marks[current] = Mark::Done;
                        order.push(current);
                        stack.pop();
                    }
                }
            }
        }

        Ok(order)
    }

    // Invertidas para que `pop` las visite en el orden declarado.
    fn edges_of(&self, id: ProtoId) -> Result<Vec<ProtoId>, SubmitError> {
        let node = self.nodes.get(id).ok_or(SubmitError::UnknownPrototype(id))?;
        let mut edges: Vec<ProtoId> = node.proto_edges().collect();
        for edge in &edges {
            self.check(*edge)?;
        }
        edges.reverse();
        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(n: i64) -> TaskSpec {
        TaskSpec::call("identity", vec![json!(n)])
    }

    fn pos(order: &[ProtoId], id: ProtoId) -> usize {
        order.iter().position(|x| *x == id).unwrap()
    }

    #[test]
    fn diamante_se_linealiza_con_dependencias_primero() {
        //     a
        //    / \
        //   b   c
        //    \ /
        //     d
        let mut g = PrototypeGraph::new();
        let a = g.add(spec(0));
        let b = g.add(spec(1));
        let c = g.add(spec(2));
        let d = g.add(spec(3));
        g.depend_on(a, b).unwrap();
        g.depend_on(a, c).unwrap();
        g.depend_on(b, d).unwrap();
        g.depend_on(c, d).unwrap();

        let order = g.linearize(&[a]).unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], d);
        assert_eq!(order[3], a);
        assert!(pos(&order, b) < pos(&order, a));
        assert!(pos(&order, c) < pos(&order, a));
    }

    #[test]
    fn hijos_tambien_se_recorren() {
        let mut g = PrototypeGraph::new();
        let group = g.add(TaskSpec::group());
        let x = g.add(spec(1));
        let y = g.add(spec(2));
        g.add_child(group, Dep::Proto(x)).unwrap();
        g.depend_on(group, y).unwrap();

        let order = g.linearize(&[group]).unwrap();
        assert_eq!(order, vec![y, x, group]);
    }

    #[test]
    fn ciclo_directo_e_indirecto() {
        let mut g = PrototypeGraph::new();
        let a = g.add(spec(0));
        g.depend_on(a, a).unwrap();
        assert!(matches!(g.linearize(&[a]), Err(SubmitError::DependencyCycle(_))));

        let mut g = PrototypeGraph::new();
        let a = g.add(spec(0));
        let b = g.add(spec(1));
        let c = g.add(spec(2));
        g.depend_on(a, b).unwrap();
        g.depend_on(b, c).unwrap();
        g.depend_on(c, a).unwrap();
        assert!(matches!(g.linearize(&[a]), Err(SubmitError::DependencyCycle(_))));
    }

    #[test]
    fn varias_raices_comparten_nodos() {
        let mut g = PrototypeGraph::new();
        let shared = g.add(spec(0));
        let r1 = g.add(spec(1));
        let r2 = g.add(spec(2));
        g.depend_on(r1, shared).unwrap();
        g.depend_on(r2, shared).unwrap();

        let order = g.linearize(&[r1, r2]).unwrap();
        assert_eq!(order, vec![shared, r1, r2]);
    }

    #[test]
    fn referencias_fuera_del_arena() {
        let mut g = PrototypeGraph::new();
        let a = g.add(spec(0));
        assert!(matches!(g.depend_on(a, 7), Err(SubmitError::UnknownPrototype(7))));
        assert!(matches!(g.linearize(&[3]), Err(SubmitError::UnknownPrototype(3))));
    }
}
