//! Pass ordering and pipeline execution.
//!
//! "Run after"/"run before" declarations of the enabled passes form a
//! constraint graph. The pipeline order is a topological order of it where,
//! among the passes that are ready at a given step, the one registered first
//! always wins. The order therefore depends only on what was registered.

use super::{Pass, PassContext, PassError, PassRegistry, RegisteredPass};
use crate::asg::{Graph, GraphError};
use crate::diagnostics::{Diagnostic, DiagnosticContext, DiagnosticsReporter};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("cyclic dependency between passes: {}", passes.join(", "))]
    CyclicDependency { passes: Vec<String> },

    #[error("input graph is malformed: {0}")]
    InvalidGraph(GraphError),

    #[error("pass '{pass}' failed: {source}")]
    PassFailed { pass: String, source: PassError },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineStatus {
    Completed,
    /// The graph keeps every mutation committed before the failure.
    Aborted(PipelineError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub status: PipelineStatus,
    pub diagnostics: Vec<Diagnostic>,
    /// Names of the passes that ran to completion, in order.
    pub executed: Vec<String>,
}

impl PipelineReport {
    pub fn is_completed(&self) -> bool {
        self.status == PipelineStatus::Completed
    }

    /// Name of the pass that aborted the pipeline, if any.
    pub fn failed_pass(&self) -> Option<&str> {
        match &self.status {
            PipelineStatus::Aborted(PipelineError::PassFailed { pass, .. }) => Some(pass),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Scheduler {
    diagnostics: DiagnosticsReporter,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the execution order of the enabled passes.
    ///
    /// Constraints naming a disabled or unknown pass count as satisfied.
    pub fn order(registry: &PassRegistry) -> Result<Vec<&RegisteredPass>, PipelineError> {
        // Filtering keeps registration order, so a position here is a tie-break key.
        let enabled: Vec<&RegisteredPass> =
            registry.all().iter().filter(|p| p.descriptor.enabled).collect();

        let mut constraints = DiGraph::<usize, ()>::with_capacity(enabled.len(), 0);
        let mut by_name: HashMap<&str, NodeIndex> = HashMap::new();
        for (pos, entry) in enabled.iter().enumerate() {
            by_name.insert(entry.descriptor.name.as_str(), constraints.add_node(pos));
        }

        for entry in &enabled {
            let me = by_name[entry.descriptor.name.as_str()];
            for before in &entry.descriptor.run_after {
                match by_name.get(before.as_str()) {
                    Some(&from) => {
                        constraints.add_edge(from, me, ());
                    }
                    None => debug!(pass = %entry.descriptor.name, after = %before, "ignoring constraint on inactive pass"),
                }
            }
            for after in &entry.descriptor.run_before {
                match by_name.get(after.as_str()) {
                    Some(&to) => {
                        constraints.add_edge(me, to, ());
                    }
                    None => debug!(pass = %entry.descriptor.name, before = %after, "ignoring constraint on inactive pass"),
                }
            }
        }

        let mut indegree: Vec<usize> = constraints
            .node_indices()
            .map(|ix| constraints.edges_directed(ix, Direction::Incoming).count())
            .collect();
        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(pos, _)| Reverse(pos))
            .collect();

        let mut order = Vec::with_capacity(enabled.len());
        while let Some(Reverse(pos)) = ready.pop() {
            order.push(enabled[pos]);
            let ix = NodeIndex::new(pos);
            for succ in constraints.neighbors_directed(ix, Direction::Outgoing) {
                let s = constraints[succ];
                indegree[s] -= 1;
                if indegree[s] == 0 {
                    ready.push(Reverse(s));
                }
            }
        }

        if order.len() < enabled.len() {
            let mut cyclic: Vec<usize> = tarjan_scc(&constraints)
                .into_iter()
                .filter(|scc| scc.len() > 1 || constraints.contains_edge(scc[0], scc[0]))
                .flatten()
                .map(|ix| constraints[ix])
                .collect();
            cyclic.sort_unstable();
            let passes = cyclic.into_iter().map(|pos| enabled[pos].descriptor.name.clone()).collect();
            return Err(PipelineError::CyclicDependency { passes });
        }

        debug!(
            order = ?order.iter().map(|p| p.descriptor.name.as_str()).collect::<Vec<_>>(),
            "computed pass order"
        );
        Ok(order)
    }

    /// Runs every enabled pass against `graph`, in order.
    ///
    /// Diagnostics from a previous run are discarded first. A malformed input
    /// graph is rejected before any pass runs. A failing pass stops the
    /// pipeline; diagnostics gathered until then are still returned.
    pub fn run(&mut self, registry: &PassRegistry, graph: &mut Graph) -> PipelineReport {
        self.diagnostics.drain();
        let mut executed = Vec::new();

        let order = match Self::order(registry) {
            Ok(order) => order,
            Err(err) => {
                self.diagnostics.error(err.to_string(), None);
                return self.report(PipelineStatus::Aborted(err), executed);
            }
        };

        if let Err(source) = graph.validate() {
            let err = PipelineError::InvalidGraph(source);
            self.diagnostics.error(err.to_string(), None);
            return self.report(PipelineStatus::Aborted(err), executed);
        }

        for entry in order {
            let descriptor = &entry.descriptor;
            if !descriptor.enabled {
                continue;
            }
            info!(pass = %descriptor.name, "running pass");

            let result = Self::run_pass(
                entry.pass.as_ref(),
                &descriptor.name,
                descriptor.recurse_into_subgraphs,
                graph,
                &mut self.diagnostics,
            );

            if let Err(source) = result {
                let err = PipelineError::PassFailed { pass: descriptor.name.clone(), source };
                self.diagnostics.error(err.to_string(), Some(DiagnosticContext::pass(&descriptor.name)));
                return self.report(PipelineStatus::Aborted(err), executed);
            }
            info!(pass = %descriptor.name, "pass finished");
            executed.push(descriptor.name.clone());
        }

        self.report(PipelineStatus::Completed, executed)
    }

    fn run_pass(
        pass: &dyn Pass,
        name: &str,
        recurse: bool,
        graph: &mut Graph,
        diagnostics: &mut DiagnosticsReporter,
    ) -> Result<(), PassError> {
        pass.run(graph, &mut PassContext::new(diagnostics, name))?;
        if recurse {
            graph.for_each_subgraph_mut(&mut |body: &mut Graph| {
                debug!(pass = %name, body = body.id, "running pass on nested body");
                pass.run(body, &mut PassContext::new(diagnostics, name))
            })?;
        }
        // Whatever the pass did internally, no broken structure may leave it.
        graph.validate()?;
        Ok(())
    }

    fn report(&mut self, status: PipelineStatus, executed: Vec<String>) -> PipelineReport {
        PipelineReport { status, diagnostics: self.diagnostics.drain(), executed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::{DType, PortRef};
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<String>>>;

    struct Probe {
        name: &'static str,
        after: Vec<&'static str>,
        before: Vec<&'static str>,
        enabled: bool,
        recurse: bool,
        fail: bool,
        log: Log,
    }

    impl Probe {
        fn new(name: &'static str, log: &Log) -> Self {
            Self { name, after: vec![], before: vec![], enabled: true, recurse: true, fail: false, log: log.clone() }
        }
        fn after(mut self, names: &[&'static str]) -> Self {
            self.after = names.to_vec();
            self
        }
        fn before(mut self, names: &[&'static str]) -> Self {
            self.before = names.to_vec();
            self
        }
    }

    impl Pass for Probe {
        fn name(&self) -> &str {
            self.name
        }
        fn run_after(&self) -> Vec<&str> {
            self.after.clone()
        }
        fn run_before(&self) -> Vec<&str> {
            self.before.clone()
        }
        fn enabled(&self) -> bool {
            self.enabled
        }
        fn recurse_into_subgraphs(&self) -> bool {
            self.recurse
        }
        fn run(&self, graph: &mut Graph, ctx: &mut PassContext<'_>) -> Result<(), PassError> {
            self.log.borrow_mut().push(format!("{}@{}", self.name, graph.id));
            ctx.warn(format!("{} ran", self.name), None);
            if self.fail {
                return Err(PassError::Failed("probe failure".into()));
            }
            Ok(())
        }
    }

    fn names(order: &[&RegisteredPass]) -> Vec<String> {
        order.iter().map(|p| p.descriptor.name.clone()).collect()
    }

    #[test]
    fn test_before_and_after_constraints() {
        let log = Log::default();
        let mut registry = PassRegistry::new();
        registry.register(Probe::new("A", &log).before(&["B"])).unwrap();
        registry.register(Probe::new("B", &log)).unwrap();
        registry.register(Probe::new("C", &log).after(&["B"])).unwrap();
        assert_eq!(names(&Scheduler::order(&registry).unwrap()), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_constraints_override_registration_order() {
        let log = Log::default();
        let mut registry = PassRegistry::new();
        registry.register(Probe::new("Late", &log).after(&["Early"])).unwrap();
        registry.register(Probe::new("Free", &log)).unwrap();
        registry.register(Probe::new("Early", &log).before(&["Free"])).unwrap();
        assert_eq!(names(&Scheduler::order(&registry).unwrap()), vec!["Early", "Late", "Free"]);
    }

    #[test]
    fn test_order_is_deterministic() {
        let build = || {
            let log = Log::default();
            let mut registry = PassRegistry::new();
            for (name, after) in [("P0", vec![]), ("P1", vec!["P3"]), ("P2", vec![]), ("P3", vec!["P0"]), ("P4", vec![])] {
                registry.register(Probe::new(name, &log).after(&after)).unwrap();
            }
            registry
        };
        let first = names(&Scheduler::order(&build()).unwrap());
        for _ in 0..10 {
            assert_eq!(names(&Scheduler::order(&build()).unwrap()), first);
        }
        assert_eq!(first, vec!["P0", "P2", "P3", "P1", "P4"]);
    }

    #[test]
    fn test_unknown_and_disabled_constraints_are_ignored() {
        let log = Log::default();
        let mut registry = PassRegistry::new();
        let mut off = Probe::new("Off", &log).after(&["B"]);
        off.enabled = false;
        registry.register(Probe::new("B", &log).after(&["Off", "Missing"])).unwrap();
        registry.register(off).unwrap();
        registry.register(Probe::new("A", &log).before(&["Missing"])).unwrap();
        assert_eq!(names(&Scheduler::order(&registry).unwrap()), vec!["B", "A"]);
    }

    #[test]
    fn test_cycle_names_participants_and_runs_nothing() {
        let log = Log::default();
        let mut registry = PassRegistry::new();
        registry.register(Probe::new("A", &log).after(&["B"])).unwrap();
        registry.register(Probe::new("B", &log).after(&["A"])).unwrap();
        registry.register(Probe::new("C", &log)).unwrap();

        let err = Scheduler::order(&registry).err().unwrap();
        assert_eq!(err, PipelineError::CyclicDependency { passes: vec!["A".into(), "B".into()] });

        let mut graph = Graph::new(0, None);
        let report = Scheduler::new().run(&registry, &mut graph);
        assert_eq!(report.status, PipelineStatus::Aborted(err));
        assert!(report.executed.is_empty());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_self_cycle() {
        let log = Log::default();
        let mut registry = PassRegistry::new();
        registry.register(Probe::new("Loop", &log).after(&["Loop"])).unwrap();
        let err = Scheduler::order(&registry).err().unwrap();
        assert_eq!(err, PipelineError::CyclicDependency { passes: vec!["Loop".into()] });
    }

    #[test]
    fn test_failure_stops_pipeline_and_keeps_diagnostics() {
        let log = Log::default();
        let mut registry = PassRegistry::new();
        registry.register(Probe::new("A", &log)).unwrap();
        let mut bad = Probe::new("Bad", &log);
        bad.fail = true;
        registry.register(bad).unwrap();
        registry.register(Probe::new("C", &log)).unwrap();

        let mut graph = Graph::new(0, None);
        let report = Scheduler::new().run(&registry, &mut graph);
        assert_eq!(report.failed_pass(), Some("Bad"));
        assert_eq!(report.executed, vec!["A"]);
        assert_eq!(*log.borrow(), vec!["A@0", "Bad@0"]);
        let messages: Vec<&str> = report.diagnostics.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(messages[..2], ["A ran", "Bad ran"]);
        assert!(messages[2].contains("probe failure"));
    }

    #[test]
    fn test_recursion_into_bodies() {
        let log = Log::default();
        let mut registry = PassRegistry::new();
        registry.register(Probe::new("Deep", &log)).unwrap();
        let mut shallow = Probe::new("Shallow", &log);
        shallow.recurse = false;
        registry.register(shallow).unwrap();

        let mut graph = Graph::new(0, None);
        let cond = graph.add_parameter("cond", None, DType::Bool);
        let branch = graph.add_op("If", &[PortRef::new(cond, 0)], 0).unwrap();
        let mut then_body = Graph::new(1, None);
        let inner = then_body.add_node("Loop", None, 0, 0);
        then_body.node_mut(inner).unwrap().subgraphs.push(Graph::new(3, None));
        graph.node_mut(branch).unwrap().subgraphs = vec![then_body, Graph::new(2, None)];

        let report = Scheduler::new().run(&registry, &mut graph);
        assert!(report.is_completed());
        assert_eq!(*log.borrow(), vec!["Deep@0", "Deep@1", "Deep@3", "Deep@2", "Shallow@0"]);
    }

    #[test]
    fn test_malformed_input_rejected_before_any_pass() {
        let log = Log::default();
        let mut registry = PassRegistry::new();
        registry.register(Probe::new("A", &log)).unwrap();

        let json = r#"{"id": 0, "name": null, "nodes": {
            "0": {"id": 0, "name": null, "op": "Relu", "num_inputs": 1, "outputs": [{"shape": null, "dtype": null}]}
        }, "edges": [{"src": {"node": 9, "port": 0}, "dst": {"node": 0, "port": 0}}]}"#;
        let mut graph: Graph = serde_json::from_str(json).unwrap();

        let report = Scheduler::new().run(&registry, &mut graph);
        assert!(matches!(
            report.status,
            PipelineStatus::Aborted(PipelineError::InvalidGraph(GraphError::DanglingEdge(_)))
        ));
        assert_eq!(report.failed_pass(), None);
        assert!(log.borrow().is_empty());
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].context, None);
    }

    #[test]
    fn test_diagnostics_cleared_between_runs() {
        let log = Log::default();
        let mut registry = PassRegistry::new();
        registry.register(Probe::new("A", &log)).unwrap();
        let mut scheduler = Scheduler::new();
        let mut graph = Graph::new(0, None);
        assert_eq!(scheduler.run(&registry, &mut graph).diagnostics.len(), 1);
        assert_eq!(scheduler.run(&registry, &mut graph).diagnostics.len(), 1);
    }
}
