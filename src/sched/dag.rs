//! Precedence DAG: must-run-before edges between schedulable work.
//!
//! Every schedulable entity owns one vertex. Edges may only join vertices
//! in the same scheduling phase; ordering across phases already follows
//! from phase order. At finalization a stable topological sort assigns
//! each vertex a priority number, which the per-phase ready queues use as
//! their drain key.

use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use anyhow::{anyhow, bail, Result};

use super::{Scheduler, SchedulingPhase};

/// Identity of a vertex in the scheduler's precedence graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexId(pub(crate) u32);

struct VertexData {
    label: String,
    phase: SchedulingPhase,
    successors: Vec<VertexId>,
    priority: u32,
}

/// The precedence graph owned by a [`Scheduler`].
pub(crate) struct Dag {
    vertices: Vec<VertexData>,
    edge_count: usize,
    sorted: bool,
}

impl Dag {
    pub(crate) fn new() -> Self {
        Dag {
            vertices: Vec::new(),
            edge_count: 0,
            sorted: false,
        }
    }

    pub(crate) fn new_vertex(&mut self, label: &str, phase: SchedulingPhase) -> VertexId {
        let id = VertexId(self.vertices.len() as u32);
        self.vertices.push(VertexData {
            label: label.to_string(),
            phase,
            successors: Vec::new(),
            priority: 0,
        });
        id
    }

    pub(crate) fn label(&self, v: VertexId) -> &str {
        &self.vertices[v.0 as usize].label
    }

    pub(crate) fn phase(&self, v: VertexId) -> SchedulingPhase {
        self.vertices[v.0 as usize].phase
    }

    pub(crate) fn set_label(&mut self, v: VertexId, label: &str) {
        self.vertices[v.0 as usize].label = label.to_string();
    }

    pub(crate) fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub(crate) fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Insert `source -> dest`. Both endpoints must share a phase.
    pub(crate) fn add_edge(&mut self, source: VertexId, dest: VertexId) -> Result<()> {
        if source == dest {
            bail!(
                "precedence edge from '{}' to itself",
                self.label(source)
            );
        }
        let sp = self.phase(source);
        let dp = self.phase(dest);
        if sp != dp {
            bail!(
                "precedence between different phases: '{}' is in {} but '{}' is in {}",
                self.label(source),
                sp,
                self.label(dest),
                dp
            );
        }
        let succs = &mut self.vertices[source.0 as usize].successors;
        if !succs.contains(&dest) {
            succs.push(dest);
            self.edge_count += 1;
        }
        Ok(())
    }

    /// Priority assigned by the topological sort; lower runs first.
    pub(crate) fn priority(&self, v: VertexId) -> u32 {
        debug_assert!(self.sorted);
        self.vertices[v.0 as usize].priority
    }

    /// Stable topological sort. Ties between unordered vertices break on
    /// (label, id), so repeated runs of the same model drain identically.
    pub(crate) fn finalize(&mut self) -> Result<()> {
        let n = self.vertices.len();
        let mut indegree = vec![0u32; n];
        for v in &self.vertices {
            for succ in &v.successors {
                indegree[succ.0 as usize] += 1;
            }
        }

        let mut ready: BTreeSet<(String, u32)> = BTreeSet::new();
        for (i, v) in self.vertices.iter().enumerate() {
            if indegree[i] == 0 {
                ready.insert((v.label.clone(), i as u32));
            }
        }

        let mut assigned = 0u32;
        while let Some(next) = ready.iter().next().cloned() {
            ready.remove(&next);
            let idx = next.1 as usize;
            self.vertices[idx].priority = assigned;
            assigned += 1;
            let succs = self.vertices[idx].successors.clone();
            for succ in succs {
                let si = succ.0 as usize;
                indegree[si] -= 1;
                if indegree[si] == 0 {
                    ready.insert((self.vertices[si].label.clone(), succ.0));
                }
            }
        }

        if (assigned as usize) != n {
            let cycle = self.find_cycle(&indegree);
            bail!("cycle detected in precedence graph: {}", cycle);
        }

        self.sorted = true;
        Ok(())
    }

    /// Walk successors among the unsorted remainder until a vertex repeats,
    /// then render the loop for the error message.
    fn find_cycle(&self, indegree: &[u32]) -> String {
        let start = indegree
            .iter()
            .position(|&d| d > 0)
            .expect("cycle reported with no remaining vertices");
        let mut path: Vec<usize> = vec![start];
        let mut current = start;
        loop {
            let next = self.vertices[current]
                .successors
                .iter()
                .map(|s| s.0 as usize)
                .find(|&s| indegree[s] > 0)
                .expect("vertex on a cycle with no in-cycle successor");
            if let Some(pos) = path.iter().position(|&p| p == next) {
                let labels: Vec<&str> = path[pos..]
                    .iter()
                    .chain(std::iter::once(&next))
                    .map(|&i| self.vertices[i].label.as_str())
                    .collect();
                return labels.join(" -> ");
            }
            path.push(next);
            current = next;
        }
    }
}

/// A vertex with no handler, used as a rendezvous between otherwise
/// unrelated events: `a` before the point, the point before `b`, without
/// `a` and `b` knowing about each other.
#[derive(Clone)]
pub struct GlobalOrderingPoint {
    scheduler: Weak<Scheduler>,
    vertex: VertexId,
    phase: SchedulingPhase,
    label: String,
}

impl GlobalOrderingPoint {
    pub fn new(scheduler: &Rc<Scheduler>, name: &str, phase: SchedulingPhase) -> Result<Self> {
        let vertex = scheduler.new_vertex(name, phase)?;
        Ok(GlobalOrderingPoint {
            scheduler: Rc::downgrade(scheduler),
            vertex,
            phase,
            label: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.label
    }
}

impl crate::events::precedence::DagParticipant for GlobalOrderingPoint {
    fn dag_vertex(&self) -> VertexId {
        self.vertex
    }

    fn dag_phase(&self) -> SchedulingPhase {
        self.phase
    }

    fn dag_scheduler(&self) -> Result<Rc<Scheduler>> {
        self.scheduler
            .upgrade()
            .ok_or_else(|| anyhow!("scheduler for ordering point '{}' is gone", self.label))
    }

    fn dag_label(&self) -> String {
        self.label.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_priorities() {
        let mut dag = Dag::new();
        let a = dag.new_vertex("a", SchedulingPhase::Tick);
        let b = dag.new_vertex("b", SchedulingPhase::Tick);
        let c = dag.new_vertex("c", SchedulingPhase::Tick);
        dag.add_edge(c, b).unwrap();
        dag.add_edge(b, a).unwrap();
        dag.finalize().unwrap();
        assert!(dag.priority(c) < dag.priority(b));
        assert!(dag.priority(b) < dag.priority(a));
    }

    #[test]
    fn test_label_tie_break() {
        let mut dag = Dag::new();
        let z = dag.new_vertex("zed", SchedulingPhase::Tick);
        let a = dag.new_vertex("alpha", SchedulingPhase::Tick);
        dag.finalize().unwrap();
        assert!(dag.priority(a) < dag.priority(z));
    }

    #[test]
    fn test_phase_mismatch_rejected() {
        let mut dag = Dag::new();
        let a = dag.new_vertex("a", SchedulingPhase::Update);
        let b = dag.new_vertex("b", SchedulingPhase::Tick);
        let err = dag.add_edge(a, b).unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("'a'"));
        assert!(msg.contains("'b'"));
        assert!(msg.contains("Update"));
        assert!(msg.contains("Tick"));
    }

    #[test]
    fn test_cycle_listing() {
        let mut dag = Dag::new();
        let a = dag.new_vertex("a", SchedulingPhase::Tick);
        let b = dag.new_vertex("b", SchedulingPhase::Tick);
        let c = dag.new_vertex("c", SchedulingPhase::Tick);
        dag.add_edge(a, b).unwrap();
        dag.add_edge(b, c).unwrap();
        dag.add_edge(c, a).unwrap();
        let err = dag.finalize().unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("cycle"));
        assert!(msg.contains("a"));
        assert!(msg.contains("b"));
        assert!(msg.contains("c"));
    }

    #[test]
    fn test_duplicate_edge_counted_once() {
        let mut dag = Dag::new();
        let a = dag.new_vertex("a", SchedulingPhase::Tick);
        let b = dag.new_vertex("b", SchedulingPhase::Tick);
        dag.add_edge(a, b).unwrap();
        dag.add_edge(a, b).unwrap();
        assert_eq!(dag.edge_count(), 1);
        dag.finalize().unwrap();
    }
}
