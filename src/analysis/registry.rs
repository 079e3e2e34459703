//! Lookup table from operation kind to its shape-inference callback.
//!
//! The engine in [`shape_inference`](super::shape_inference) knows nothing
//! about individual operators. Supporting a new operation kind means
//! registering one more callback here.

use crate::asg::{DType, Node, Shape, OP_RESULT};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Shape and element type of one tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorType {
    pub shape: Shape,
    pub dtype: DType,
}

impl TensorType {
    pub fn new(shape: Shape, dtype: DType) -> Self {
        Self { shape, dtype }
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.shape, self.dtype)
    }
}

/// The inputs could not have produced any consistent output.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct ShapeContradiction(pub String);

impl ShapeContradiction {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Everything a callback may look at: the node (attributes and bodies) and
/// the already resolved types of its inputs, in port order.
pub struct InferenceInput<'a> {
    pub node: &'a Node,
    pub inputs: &'a [TensorType],
}

impl<'a> InferenceInput<'a> {
    pub fn input(&self, port: usize) -> Result<&TensorType, ShapeContradiction> {
        self.inputs.get(port).ok_or_else(|| {
            ShapeContradiction::new(format!(
                "{} expects at least {} input(s), got {}",
                self.node.op,
                port + 1,
                self.inputs.len()
            ))
        })
    }

    /// Types reaching the `Result` nodes of body `index`, in id order.
    pub fn body_results(&self, index: usize) -> Result<Vec<TensorType>, ShapeContradiction> {
        let body = self
            .node
            .subgraphs
            .get(index)
            .ok_or_else(|| ShapeContradiction::new(format!("{} has no body #{}", self.node.op, index)))?;

        let mut out = Vec::new();
        for result in body.nodes().filter(|n| n.op == OP_RESULT) {
            let producer = body
                .input_edges(result.id)
                .first()
                .map(|e| e.src)
                .ok_or_else(|| ShapeContradiction::new(format!("body result {} has no producer", result.id)))?;
            let port = body
                .node(producer.node)
                .ok()
                .and_then(|n| n.outputs.get(producer.port))
                .ok_or_else(|| ShapeContradiction::new(format!("body result {} is dangling", result.id)))?;
            match (&port.shape, port.dtype) {
                (Some(shape), Some(dtype)) => out.push(TensorType::new(shape.clone(), dtype)),
                _ => {
                    return Err(ShapeContradiction::new(format!(
                        "body #{} result {} is not inferred",
                        index, result.id
                    )))
                }
            }
        }
        Ok(out)
    }
}

pub type InferFn = Box<dyn Fn(&InferenceInput<'_>) -> Result<Vec<TensorType>, ShapeContradiction>>;

#[derive(Default)]
pub struct InferenceRegistry {
    rules: HashMap<String, InferFn>,
}

impl InferenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the callbacks from [`ops`](super::ops).
    pub fn with_standard_ops() -> Self {
        let mut registry = Self::new();
        super::ops::register_standard_ops(&mut registry);
        registry
    }

    /// Adds or replaces the callback for `op`.
    pub fn register<F>(&mut self, op: &str, rule: F)
    where
        F: Fn(&InferenceInput<'_>) -> Result<Vec<TensorType>, ShapeContradiction> + 'static,
    {
        self.rules.insert(op.to_string(), Box::new(rule));
    }

    pub fn get(&self, op: &str) -> Option<&InferFn> {
        self.rules.get(op)
    }

    pub fn contains(&self, op: &str) -> bool {
        self.rules.contains_key(op)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
