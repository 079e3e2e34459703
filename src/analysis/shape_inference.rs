//! Shape and element-type propagation (the `PartialInfer` pass).
//!
//! Walks the graph in data-dependency order and asks the callback registered
//! for each node's operation kind to compute its outputs from its inputs.
//! Shapes may stay partially dynamic; that is reported, never fatal.
//!
//! Control-flow bodies are inferred as separate problems, seeded with the
//! types that reach their owning node.

use super::registry::{InferenceInput, InferenceRegistry, TensorType};
use crate::asg::{Attribute, DType, Graph, Node, NodeId, PortRef, Shape, OP_CONST, OP_PARAMETER};
use crate::diagnostics::DiagnosticContext;
use crate::passes::{Pass, PassContext, PassError};
use std::collections::{HashMap, HashSet};
use tracing::debug;

type Result<T> = std::result::Result<T, PassError>;

/// Outcome of trying to infer one node.
enum Step {
    Inferred,
    /// An input or a body result is unknown, or there is no rule for the
    /// operation kind.
    Deferred,
}

pub struct PartialInfer {
    rules: InferenceRegistry,
}

impl PartialInfer {
    pub const NAME: &'static str = "PartialInfer";

    pub fn new(rules: InferenceRegistry) -> Self {
        Self { rules }
    }

    /// Infers every node of `graph`. Returns the nodes that stayed unresolved.
    ///
    /// `seeds` overrides or refines the declared type of `Parameter` nodes;
    /// it carries the outer types into a control-flow body.
    fn propagate(
        &self,
        graph: &mut Graph,
        ctx: &mut PassContext<'_>,
        seeds: &HashMap<NodeId, TensorType>,
    ) -> Result<Vec<NodeId>> {
        let order = graph.topological_order()?;

        Self::reset(graph);

        let mut pending = Vec::new();
        for &id in &order {
            let op = graph.node(id)?.op.clone();
            match op.as_str() {
                OP_PARAMETER => self.seed_parameter(graph, id, seeds.get(&id))?,
                OP_CONST => {
                    if !Self::seed_const(graph, id)? {
                        pending.push(id);
                    }
                }
                _ => pending.push(id),
            }
        }

        // Nodes whose bodies were inferred but left a result unknown.
        let mut stalled = HashSet::new();
        loop {
            let mut deferred = Vec::new();
            let mut progressed = false;
            for &id in &pending {
                match self.infer_node(graph, id, ctx, &mut stalled)? {
                    Step::Inferred => progressed = true,
                    Step::Deferred => deferred.push(id),
                }
            }
            pending = deferred;
            if pending.is_empty() || !progressed {
                break;
            }
            debug!(graph = graph.id, remaining = pending.len(), "retrying deferred nodes");
        }

        for &id in &pending {
            let node = graph.node(id)?;
            ctx.warn(
                format!(
                    "Shape of node '{}' (op {}) could not be inferred: its inputs or body results \
                     are unresolved, or no inference rule is registered for this operation",
                    node.display_name(),
                    node.op
                ),
                Some(DiagnosticContext::node(id, node.display_name())),
            );
        }
        Ok(pending)
    }

    /// Drops the results of a previous run, bodies included, so the new ones
    /// fully replace them and nothing stale survives in a branch that is not
    /// reached this time.
    fn reset(graph: &mut Graph) {
        for node in graph.nodes_mut() {
            match node.op.as_str() {
                OP_CONST => {}
                OP_PARAMETER => {
                    let declared = node.attr_shape("shape").cloned();
                    if let Some(port) = node.outputs.first_mut() {
                        port.shape = declared;
                    }
                }
                _ => {
                    for port in node.outputs.iter_mut() {
                        port.shape = None;
                        port.dtype = None;
                    }
                }
            }
            for body in node.subgraphs.iter_mut() {
                Self::reset(body);
            }
        }
    }

    fn seed_parameter(&self, graph: &mut Graph, id: NodeId, outer: Option<&TensorType>) -> Result<()> {
        let node = graph.node_mut(id)?;
        let declared = node.attr_shape("shape").cloned();
        let dtype = node.attr_dtype("dtype").unwrap_or(DType::F32);

        if let (Some(declared), Some(outer)) = (node.attr_dtype("dtype"), outer) {
            if declared != outer.dtype {
                return Err(PassError::ShapeContradiction {
                    node: id,
                    name: node.display_name(),
                    reason: format!("declared type {:?} conflicts with supplied type {:?}", declared, outer.dtype),
                });
            }
        }

        let (shape, dtype) = match (declared, outer) {
            (Some(mut declared), Some(outer)) => {
                if !Shape::merge_into(&mut declared, &outer.shape) {
                    return Err(PassError::ShapeContradiction {
                        node: id,
                        name: node.display_name(),
                        reason: format!("declared shape {} conflicts with supplied shape {}", declared, outer.shape),
                    });
                }
                (Some(declared), outer.dtype)
            }
            (None, Some(outer)) => (Some(outer.shape.clone()), outer.dtype),
            (declared, None) => (declared, dtype),
        };

        if let Some(port) = node.outputs.first_mut() {
            port.shape = shape;
            port.dtype = Some(dtype);
        }
        Ok(())
    }

    fn seed_const(graph: &mut Graph, id: NodeId) -> Result<bool> {
        let node = graph.node_mut(id)?;
        let shape = match node.attr("value") {
            Some(Attribute::Tensor(value)) => Shape::from_static(value.shape()),
            _ => return Ok(false),
        };
        let dtype = node.attr_dtype("dtype").unwrap_or(DType::F32);
        if let Some(port) = node.outputs.first_mut() {
            port.shape = Some(shape);
            port.dtype = Some(dtype);
        }
        Ok(true)
    }

    fn input_types(graph: &Graph, id: NodeId) -> Result<Option<Vec<TensorType>>> {
        let node = graph.node(id)?;
        let mut inputs = Vec::with_capacity(node.num_inputs);
        for port in 0..node.num_inputs {
            let Some(src) = graph.producer(PortRef::new(id, port)) else {
                return Ok(None);
            };
            let out = graph.node(src.node)?.outputs.get(src.port);
            match out.and_then(|o| o.shape.clone().zip(o.dtype)) {
                Some((shape, dtype)) => inputs.push(TensorType::new(shape, dtype)),
                None => return Ok(None),
            }
        }
        Ok(Some(inputs))
    }

    fn infer_node(
        &self,
        graph: &mut Graph,
        id: NodeId,
        ctx: &mut PassContext<'_>,
        stalled: &mut HashSet<NodeId>,
    ) -> Result<Step> {
        if stalled.contains(&id) {
            return Ok(Step::Deferred);
        }
        let Some(inputs) = Self::input_types(graph, id)? else {
            return Ok(Step::Deferred);
        };
        let op = graph.node(id)?.op.clone();
        let Some(rule) = self.rules.get(&op) else {
            debug!(node = id, op = %op, "no inference rule");
            return Ok(Step::Deferred);
        };

        if !graph.node(id)?.subgraphs.is_empty() {
            self.infer_bodies(graph, id, &inputs, ctx)?;
            if !Self::body_results_known(graph.node(id)?) {
                debug!(node = id, op = %op, "body results unresolved");
                stalled.insert(id);
                return Ok(Step::Deferred);
            }
        }

        let node = graph.node(id)?;
        let outputs = rule(&InferenceInput { node, inputs: &inputs }).map_err(|c| PassError::ShapeContradiction {
            node: id,
            name: node.display_name(),
            reason: c.0,
        })?;
        if outputs.len() != node.outputs.len() {
            return Err(PassError::ShapeContradiction {
                node: id,
                name: node.display_name(),
                reason: format!("rule for {} produced {} outputs for {} ports", op, outputs.len(), node.outputs.len()),
            });
        }

        debug!(
            node = id,
            op = %op,
            outputs = %outputs.iter().map(ToString::to_string).collect::<Vec<_>>().join(" "),
            "inferred"
        );
        let node = graph.node_mut(id)?;
        for (port, out) in node.outputs.iter_mut().zip(outputs) {
            port.shape = Some(out.shape);
            port.dtype = Some(out.dtype);
        }
        Ok(Step::Inferred)
    }

    fn body_results_known(node: &Node) -> bool {
        node.subgraphs.iter().all(|body| {
            body.results().into_iter().all(|result| {
                body.producer(PortRef::new(result, 0))
                    .and_then(|src| body.node(src.node).ok()?.outputs.get(src.port))
                    .map_or(false, |out| out.shape.is_some() && out.dtype.is_some())
            })
        })
    }

    /// Body parameters take the outer input selected by their `external_port`
    /// attribute, or the one at their position among the body's parameters.
    fn infer_bodies(
        &self,
        graph: &mut Graph,
        id: NodeId,
        inputs: &[TensorType],
        ctx: &mut PassContext<'_>,
    ) -> Result<()> {
        let mut bodies = std::mem::take(&mut graph.node_mut(id)?.subgraphs);
        let mut result = Ok(());
        for body in bodies.iter_mut() {
            let mut seeds = HashMap::new();
            for (ordinal, param) in body.parameters().into_iter().enumerate() {
                let port = body
                    .node(param)
                    .ok()
                    .and_then(|n| n.attr_int("external_port"))
                    .and_then(|p| usize::try_from(p).ok())
                    .unwrap_or(ordinal);
                if let Some(t) = inputs.get(port) {
                    seeds.insert(param, t.clone());
                }
            }
            debug!(node = id, body = body.id, "inferring body");
            if let Err(err) = self.propagate(body, ctx, &seeds) {
                result = Err(err);
                break;
            }
        }
        // Bodies go back even on failure; the graph keeps its structure.
        graph.node_mut(id)?.subgraphs = bodies;
        result
    }

    fn report_dynamic_inputs(graph: &Graph, ctx: &mut PassContext<'_>) {
        let dynamic: Vec<(NodeId, String, String)> = graph
            .nodes()
            .filter(|n| n.op == OP_PARAMETER)
            .filter_map(|n| match n.output_shape(0) {
                Some(shape) if shape.is_fully_defined() => None,
                Some(shape) => Some((n.id, n.display_name(), shape.to_string())),
                None => Some((n.id, n.display_name(), "?".to_string())),
            })
            .collect();
        if dynamic.is_empty() {
            return;
        }

        let listed = dynamic
            .iter()
            .map(|(_, name, shape)| format!("name=\"{}\" shape=\"{}\"", name, shape))
            .collect::<Vec<_>>()
            .join(",");
        let context = match dynamic.as_slice() {
            [(id, name, _)] => Some(DiagnosticContext::node(*id, name.clone())),
            _ => None,
        };
        ctx.warn(
            format!(
                "The model contains input(s) with partially defined shapes: {}. \
                 Dependent outputs keep dynamic dimensions; specify static input shapes \
                 to obtain a fully static graph.",
                listed
            ),
            context,
        );
    }
}

impl Pass for PartialInfer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run_after(&self) -> Vec<&str> {
        vec!["FuseSwish"]
    }

    /// Bodies are inferred from inside, seeded by their owner's inputs.
    fn recurse_into_subgraphs(&self) -> bool {
        false
    }

    fn run(&self, graph: &mut Graph, ctx: &mut PassContext<'_>) -> Result<()> {
        let unresolved = self.propagate(graph, ctx, &HashMap::new())?;
        debug!(graph = graph.id, unresolved = unresolved.len(), "shape propagation done");
        Self::report_dynamic_inputs(graph, ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Dimension::{Dynamic, Static};
    use crate::diagnostics::{DiagnosticsReporter, Severity};

    fn engine() -> PartialInfer {
        PartialInfer::new(InferenceRegistry::with_standard_ops())
    }

    fn run(graph: &mut Graph) -> (Result<()>, Vec<crate::diagnostics::Diagnostic>) {
        let mut reporter = DiagnosticsReporter::new();
        let result = engine().run(graph, &mut PassContext::new(&mut reporter, PartialInfer::NAME));
        (result, reporter.drain())
    }

    fn out_shape(graph: &Graph, id: NodeId) -> Option<Shape> {
        graph.node(id).unwrap().output_shape(0).cloned()
    }

    #[test]
    fn test_static_graph_fully_resolved() {
        let mut g = Graph::new(0, None);
        let x = g.add_parameter("x", Some(Shape::from_static(&[2, 4])), DType::F32);
        let w = g.add_const("w", ndarray::ArrayD::zeros(ndarray::IxDyn(&[4, 3])));
        let mm = g.add_op("MatMul", &[PortRef::new(x, 0), PortRef::new(w, 0)], 1).unwrap();
        let relu = g.add_op("Relu", &[PortRef::new(mm, 0)], 1).unwrap();
        g.add_result("y", PortRef::new(relu, 0)).unwrap();

        let (result, diagnostics) = run(&mut g);
        result.unwrap();
        assert!(diagnostics.is_empty());
        assert_eq!(out_shape(&g, relu), Some(Shape::from_static(&[2, 3])));
        assert_eq!(g.node(relu).unwrap().outputs[0].dtype, Some(DType::F32));
    }

    #[test]
    fn test_dynamic_parameter_is_forwarded_and_reported_once() {
        let mut g = Graph::new(0, None);
        let x = g.add_parameter("data", Some(Shape::new(vec![Dynamic, Static(3)])), DType::F32);
        let relu = g.add_op("Relu", &[PortRef::new(x, 0)], 1).unwrap();
        g.add_result("y", PortRef::new(relu, 0)).unwrap();

        let (result, diagnostics) = run(&mut g);
        result.unwrap();
        assert_eq!(out_shape(&g, relu), Some(Shape::new(vec![Dynamic, Static(3)])));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].severity, Severity::Warning);
        assert!(diagnostics[0].message.contains("name=\"data\" shape=\"[?,3]\""));
        assert_eq!(diagnostics[0].context.as_ref().and_then(|c| c.node), Some(x));
    }

    #[test]
    fn test_missing_rule_leaves_downstream_unresolved() {
        let mut g = Graph::new(0, None);
        let x = g.add_parameter("x", Some(Shape::from_static(&[1])), DType::F32);
        let custom = g.add_op("Mystery", &[PortRef::new(x, 0)], 1).unwrap();
        let relu = g.add_op("Relu", &[PortRef::new(custom, 0)], 1).unwrap();

        let (result, diagnostics) = run(&mut g);
        result.unwrap();
        assert_eq!(out_shape(&g, relu), None);
        let nodes: Vec<Option<NodeId>> = diagnostics.iter().map(|d| d.context.as_ref().and_then(|c| c.node)).collect();
        assert_eq!(nodes, vec![Some(custom), Some(relu)]);
    }

    #[test]
    fn test_unconnected_input_is_unresolved_not_fatal() {
        let mut g = Graph::new(0, None);
        let add = g.add_node("Add", Some("lonely".into()), 2, 1);
        let (result, diagnostics) = run(&mut g);
        result.unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].message.contains("'lonely'"));
        assert_eq!(out_shape(&g, add), None);
    }

    #[test]
    fn test_contradiction_is_fatal_and_names_node() {
        let mut g = Graph::new(0, None);
        let a = g.add_parameter("a", Some(Shape::from_static(&[2, 3])), DType::F32);
        let b = g.add_parameter("b", Some(Shape::from_static(&[4, 3])), DType::F32);
        let add = g.add_op("Add", &[PortRef::new(a, 0), PortRef::new(b, 0)], 1).unwrap();
        g.node_mut(add).unwrap().name = Some("sum".into());

        let (result, _) = run(&mut g);
        match result.unwrap_err() {
            PassError::ShapeContradiction { node, name, .. } => {
                assert_eq!(node, add);
                assert_eq!(name, "sum");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_rerun_replaces_stale_shapes() {
        let mut g = Graph::new(0, None);
        let x = g.add_parameter("x", Some(Shape::from_static(&[5, 3])), DType::F32);
        let relu = g.add_op("Relu", &[PortRef::new(x, 0)], 1).unwrap();
        run(&mut g).0.unwrap();
        assert_eq!(out_shape(&g, relu), Some(Shape::from_static(&[5, 3])));

        g.node_mut(x).unwrap().set_attr("shape", Attribute::Shape(Shape::new(vec![Dynamic, Static(3)])));
        run(&mut g).0.unwrap();
        assert_eq!(out_shape(&g, relu), Some(Shape::new(vec![Dynamic, Static(3)])));
    }

    #[test]
    fn test_idempotent() {
        let mut g = Graph::new(0, None);
        let x = g.add_parameter("x", Some(Shape::new(vec![Dynamic, Static(8)])), DType::F32);
        let t = g.add_op("Transpose", &[PortRef::new(x, 0)], 1).unwrap();
        g.add_op("Mystery", &[PortRef::new(t, 0)], 1).unwrap();

        let (_, first) = run(&mut g);
        let snapshot = g.clone();
        let (_, second) = run(&mut g);
        assert_eq!(g, snapshot);
        assert_eq!(first, second);
    }

    #[test]
    fn test_data_cycle_is_fatal() {
        let mut g = Graph::new(0, None);
        let a = g.add_node("Relu", None, 1, 1);
        let b = g.add_node("Relu", None, 1, 1);
        g.connect(PortRef::new(a, 0), PortRef::new(b, 0)).unwrap();
        g.connect(PortRef::new(b, 0), PortRef::new(a, 0)).unwrap();
        assert!(matches!(run(&mut g).0, Err(PassError::Graph(_))));
    }

    fn branch(id: usize, op: &str, external_port: Option<i64>) -> Graph {
        let mut body = Graph::new(id, None);
        let p = body.add_parameter("inner", None, DType::F32);
        if let Some(port) = external_port {
            body.node_mut(p).unwrap().set_attr("external_port", Attribute::Int(port));
        }
        let op = body.add_op(op, &[PortRef::new(p, 0)], 1).unwrap();
        body.add_result("out", PortRef::new(op, 0)).unwrap();
        body
    }

    #[test]
    fn test_if_bodies_seeded_from_outer_inputs() {
        let mut g = Graph::new(0, None);
        let cond = g.add_parameter("cond", Some(Shape::scalar()), DType::Bool);
        let x = g.add_parameter("x", Some(Shape::from_static(&[4, 2])), DType::F32);
        let node = g.add_op("If", &[PortRef::new(cond, 0), PortRef::new(x, 0)], 1).unwrap();
        g.node_mut(node).unwrap().subgraphs = vec![branch(1, "Relu", Some(1)), branch(2, "Transpose", Some(1))];

        let (result, diagnostics) = run(&mut g);
        result.unwrap();
        assert!(diagnostics.is_empty());
        // [4,2] in one branch, [2,4] in the other.
        assert_eq!(out_shape(&g, node), Some(Shape::new(vec![Dynamic, Dynamic])));
        let then_body = &g.node(node).unwrap().subgraphs[0];
        let inner = then_body.parameters()[0];
        assert_eq!(out_shape(then_body, inner), Some(Shape::from_static(&[4, 2])));
    }

    #[test]
    fn test_unresolved_body_defers_owner() {
        let mut g = Graph::new(0, None);
        let cond = g.add_parameter("cond", Some(Shape::scalar()), DType::Bool);
        let x = g.add_parameter("x", Some(Shape::from_static(&[4, 2])), DType::F32);
        let node = g.add_op("If", &[PortRef::new(cond, 0), PortRef::new(x, 0)], 1).unwrap();
        g.node_mut(node).unwrap().name = Some("select".into());
        g.node_mut(node).unwrap().subgraphs = vec![branch(1, "CustomOp", Some(1)), branch(2, "Relu", Some(1))];
        let out = g.add_result("y", PortRef::new(node, 0)).unwrap();

        let (result, diagnostics) = run(&mut g);
        result.unwrap();
        assert_eq!(out_shape(&g, node), None);
        assert!(diagnostics.iter().all(|d| d.severity == Severity::Warning));
        let nodes: Vec<Option<NodeId>> = diagnostics.iter().map(|d| d.context.as_ref().and_then(|c| c.node)).collect();
        assert_eq!(diagnostics.iter().filter(|d| d.message.contains("'select'")).count(), 1);
        assert!(nodes.contains(&Some(out)));
        let then_body = &g.node(node).unwrap().subgraphs[0];
        let custom = then_body.nodes().find(|n| n.op == "CustomOp").unwrap();
        assert_eq!(diagnostics.iter().filter(|d| d.message.contains("op CustomOp")).count(), 1);
        assert_eq!(out_shape(then_body, custom.id), None);
        let else_body = &g.node(node).unwrap().subgraphs[1];
        let relu = else_body.producer(PortRef::new(else_body.results()[0], 0)).unwrap().node;
        assert_eq!(out_shape(else_body, relu), Some(Shape::from_static(&[4, 2])));
    }

    #[test]
    fn test_body_parameter_type_conflict_is_fatal() {
        let mut g = Graph::new(0, None);
        let x = g.add_parameter("x", Some(Shape::from_static(&[4])), DType::I32);
        let node = g.add_op("If", &[PortRef::new(x, 0)], 1).unwrap();
        let body = branch(1, "Relu", None);
        let p = body.parameters()[0];
        g.node_mut(node).unwrap().subgraphs = vec![body, branch(2, "Relu", None)];

        let (result, _) = run(&mut g);
        match result {
            Err(PassError::ShapeContradiction { node, reason, .. }) => {
                assert_eq!(node, p);
                assert!(reason.contains("type"));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_body_parameter_conflict_is_fatal() {
        let mut g = Graph::new(0, None);
        let x = g.add_parameter("x", Some(Shape::from_static(&[4])), DType::F32);
        let node = g.add_op("If", &[PortRef::new(x, 0)], 1).unwrap();
        let mut body = branch(1, "Relu", None);
        let p = body.parameters()[0];
        body.node_mut(p).unwrap().set_attr("shape", Attribute::Shape(Shape::from_static(&[5])));
        g.node_mut(node).unwrap().subgraphs = vec![body, branch(2, "Relu", None)];

        let (result, _) = run(&mut g);
        assert!(matches!(result, Err(PassError::ShapeContradiction { node, .. }) if node == p));
        assert_eq!(g.node(node).unwrap().subgraphs.len(), 2);
    }
}
