//! Transformations shipped with the optimizer.

use super::{Pass, PassContext, PassError, PassRegistry, RegistryResult};
use crate::analysis::registry::InferenceRegistry;
use crate::analysis::shape_inference::PartialInfer;
use crate::asg::{Attribute, DType, Graph, NodeId, PortRef};
use crate::diagnostics::DiagnosticContext;
use tracing::debug;

/// Registers the standard pipeline:
/// `RemoveIdentity -> FuseSwish -> PartialInfer -> ConvertFp32ToFp16` (the last one disabled).
pub fn default_registry(rules: InferenceRegistry) -> RegistryResult<PassRegistry> {
    let mut registry = PassRegistry::new();
    registry.register(RemoveIdentity)?;
    registry.register(FuseSwish)?;
    registry.register(PartialInfer::new(rules))?;
    registry.register(ConvertFp32ToFp16)?;
    Ok(registry)
}

/// Deletes `Identity` nodes, wiring their consumers straight to the producer.
pub struct RemoveIdentity;

impl RemoveIdentity {
    pub const NAME: &'static str = "RemoveIdentity";
}

impl Pass for RemoveIdentity {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run_before(&self) -> Vec<&str> {
        vec![PartialInfer::NAME]
    }

    fn run(&self, graph: &mut Graph, ctx: &mut PassContext<'_>) -> Result<(), PassError> {
        let identities: Vec<NodeId> = graph.nodes().filter(|n| n.op == "Identity").map(|n| n.id).collect();
        for id in identities {
            let out = PortRef::new(id, 0);
            match graph.producer(PortRef::new(id, 0)) {
                Some(src) => graph.redirect_consumers(out, src)?,
                None if graph.consumers(out).is_empty() => {}
                None => {
                    let node = graph.node(id)?;
                    ctx.warn(
                        format!("Identity '{}' has no producer and was kept", node.display_name()),
                        Some(DiagnosticContext::node(id, node.display_name())),
                    );
                    continue;
                }
            }
            graph.remove_node(id)?;
            debug!(node = id, "removed identity");
        }
        Ok(())
    }
}

/// Rewrites `x * Sigmoid(x)` into `Swish(x)`.
pub struct FuseSwish;

impl FuseSwish {
    pub const NAME: &'static str = "FuseSwish";

    /// `(x, sigmoid)` when `mul` computes `x * Sigmoid(x)` in either operand order.
    fn match_pattern(graph: &Graph, mul: NodeId) -> Option<(PortRef, NodeId)> {
        let lhs = graph.producer(PortRef::new(mul, 0))?;
        let rhs = graph.producer(PortRef::new(mul, 1))?;
        for (x, sig) in [(lhs, rhs), (rhs, lhs)] {
            let sigmoid = graph.node(sig.node).ok()?;
            if sigmoid.op == "Sigmoid" && graph.producer(PortRef::new(sig.node, 0)) == Some(x) {
                return Some((x, sig.node));
            }
        }
        None
    }
}

impl Pass for FuseSwish {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run_after(&self) -> Vec<&str> {
        vec![RemoveIdentity::NAME]
    }

    fn run(&self, graph: &mut Graph, _ctx: &mut PassContext<'_>) -> Result<(), PassError> {
        let candidates: Vec<NodeId> =
            graph.nodes().filter(|n| n.op == "Multiply" && n.num_inputs == 2).map(|n| n.id).collect();

        for mul in candidates {
            let Some((x, sigmoid)) = Self::match_pattern(graph, mul) else {
                continue;
            };
            let swish = graph.add_op("Swish", &[x], 1)?;
            let name = graph.node(mul)?.name.clone();
            graph.node_mut(swish)?.name = name;
            graph.redirect_consumers(PortRef::new(mul, 0), PortRef::new(swish, 0))?;
            graph.remove_node(mul)?;
            if graph.consumers(PortRef::new(sigmoid, 0)).is_empty() {
                graph.remove_node(sigmoid)?;
            }
            debug!(multiply = mul, swish, "fused swish");
        }
        Ok(())
    }
}

/// Retypes every `F32` tensor in the graph to `F16`.
pub struct ConvertFp32ToFp16;

impl ConvertFp32ToFp16 {
    pub const NAME: &'static str = "ConvertFp32ToFp16";
}

impl Pass for ConvertFp32ToFp16 {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run_after(&self) -> Vec<&str> {
        vec![PartialInfer::NAME]
    }

    /// Opt-in through configuration.
    fn enabled(&self) -> bool {
        false
    }

    fn run(&self, graph: &mut Graph, _ctx: &mut PassContext<'_>) -> Result<(), PassError> {
        let mut retyped = 0usize;
        for node in graph.nodes_mut() {
            for port in node.outputs.iter_mut().filter(|p| p.dtype == Some(DType::F32)) {
                port.dtype = Some(DType::F16);
                retyped += 1;
            }
            for key in ["dtype", "destination_type"] {
                if node.attr_dtype(key) == Some(DType::F32) {
                    node.set_attr(key, Attribute::DType(DType::F16));
                }
            }
        }
        debug!(graph = graph.id, retyped, "converted outputs to f16");
        Ok(())
    }
}
