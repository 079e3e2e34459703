//! # rustymo: Model Optimizer for ASG graphs
//!
//! **rustymo** turns a trained computation graph into an optimized one by
//! running an ordered pipeline of rewrite passes over it. Passes declare
//! only which other passes they must follow or precede; the scheduler
//! derives one deterministic order. One of the passes propagates tensor
//! shapes and types, keeping dimensions that are unknown until runtime as
//! dynamic instead of failing.
//!
//! ## Usage Example
//!
//! ```no_run
//! use rustymo::analysis::registry::InferenceRegistry;
//! use rustymo::asg::{DType, Dimension, Graph, PortRef, Shape};
//! use rustymo::passes::builtin::default_registry;
//! use rustymo::passes::scheduler::Scheduler;
//!
//! // 1. Graph handed over by a model reader
//! let mut graph = Graph::new(0, Some("model".into()));
//! let x = graph.add_parameter("x", Some(Shape::new(vec![Dimension::Dynamic, Dimension::Static(3)])), DType::F32);
//! let relu = graph.add_op("Relu", &[PortRef::new(x, 0)], 1).unwrap();
//! graph.add_result("y", PortRef::new(relu, 0)).unwrap();
//!
//! // 2. Pipeline
//! let registry = default_registry(InferenceRegistry::with_standard_ops()).unwrap();
//! let report = Scheduler::new().run(&registry, &mut graph);
//!
//! // 3. Graph is optimized; `report` carries status and diagnostics
//! assert!(report.is_completed());
//! ```

pub mod analysis;
pub mod asg;
pub mod config;
pub mod diagnostics;
pub mod passes;
