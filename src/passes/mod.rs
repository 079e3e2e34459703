//! # Transformation passes
//!
//! A pass is one self-contained rewrite of the [`Graph`]. Passes never name
//! their position in the pipeline directly; they declare which other passes
//! (by name) must run before or after them, and the
//! [`Scheduler`](scheduler::Scheduler) turns those declarations into one
//! order.
//!
//! ```text
//! PassRegistry --(constraints)--> Scheduler --(order)--> pass.run(&mut Graph) ...
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let mut registry = PassRegistry::new();
//! registry.register(RemoveIdentity)?;
//! registry.register(PartialInfer::new(InferenceRegistry::with_standard_ops()))?;
//!
//! let report = Scheduler::new().run(&registry, &mut graph);
//! ```

pub mod builtin;
pub mod scheduler;

use crate::asg::{Graph, GraphError, NodeId};
use crate::diagnostics::{DiagnosticContext, DiagnosticsReporter};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PassError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("irrecoverable shape contradiction at node '{name}' (id {node}): {reason}")]
    ShapeContradiction { node: NodeId, name: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("a pass named '{0}' is already registered")]
    DuplicateName(String),

    #[error("no pass named '{0}' is registered")]
    UnknownPass(String),
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// What a pass sees while it runs, besides the graph itself.
pub struct PassContext<'a> {
    diagnostics: &'a mut DiagnosticsReporter,
    pass: &'a str,
}

impl<'a> PassContext<'a> {
    pub fn new(diagnostics: &'a mut DiagnosticsReporter, pass: &'a str) -> Self {
        Self { diagnostics, pass }
    }

    /// Records a warning; the context is tagged with the running pass.
    pub fn warn(&mut self, message: impl Into<String>, context: Option<DiagnosticContext>) {
        let context = context.unwrap_or_else(|| DiagnosticContext::pass(self.pass)).in_pass(self.pass);
        self.diagnostics.warn(message, Some(context));
    }
}

/// A graph rewrite with name-based ordering constraints.
pub trait Pass {
    fn name(&self) -> &str;

    /// Passes that must already have executed.
    fn run_after(&self) -> Vec<&str> {
        vec![]
    }

    /// Passes that must execute later.
    fn run_before(&self) -> Vec<&str> {
        vec![]
    }

    fn enabled(&self) -> bool {
        true
    }

    /// When `true` the scheduler also runs the pass on every nested body.
    fn recurse_into_subgraphs(&self) -> bool {
        true
    }

    fn run(&self, graph: &mut Graph, ctx: &mut PassContext<'_>) -> Result<(), PassError>;
}

/// Snapshot of a pass's declarations taken at registration.
#[derive(Debug, Clone, PartialEq)]
pub struct PassDescriptor {
    pub name: String,
    /// Registration index, the scheduler's tie-break key.
    pub index: usize,
    pub run_after: Vec<String>,
    pub run_before: Vec<String>,
    pub enabled: bool,
    pub recurse_into_subgraphs: bool,
}

pub struct RegisteredPass {
    pub descriptor: PassDescriptor,
    pub pass: Box<dyn Pass>,
}

#[derive(Default)]
pub struct PassRegistry {
    passes: Vec<RegisteredPass>,
}

impl PassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: Pass + 'static>(&mut self, pass: P) -> RegistryResult<()> {
        self.register_boxed(Box::new(pass))
    }

    pub fn register_boxed(&mut self, pass: Box<dyn Pass>) -> RegistryResult<()> {
        let name = pass.name().to_string();
        if self.get(&name).is_some() {
            return Err(RegistryError::DuplicateName(name));
        }
        let descriptor = PassDescriptor {
            index: self.passes.len(),
            run_after: pass.run_after().into_iter().map(String::from).collect(),
            run_before: pass.run_before().into_iter().map(String::from).collect(),
            enabled: pass.enabled(),
            recurse_into_subgraphs: pass.recurse_into_subgraphs(),
            name,
        };
        tracing::debug!(pass = %descriptor.name, index = descriptor.index, "registered pass");
        self.passes.push(RegisteredPass { descriptor, pass });
        Ok(())
    }

    /// Every registered pass, enabled or not, in registration order.
    pub fn all(&self) -> &[RegisteredPass] {
        &self.passes
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredPass> {
        self.passes.iter().find(|p| p.descriptor.name == name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name).map_or(false, |p| p.descriptor.enabled)
    }

    /// Configuration hook, applied before a run.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> RegistryResult<()> {
        let entry = self
            .passes
            .iter_mut()
            .find(|p| p.descriptor.name == name)
            .ok_or_else(|| RegistryError::UnknownPass(name.to_string()))?;
        entry.descriptor.enabled = enabled;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}
