//! # Graph Analysis Module
//!
//! Shape and type inference over the ASG.
//!
//! ## Parts
//!
//! - [`registry`]: maps an operation kind to its inference callback.
//! - [`ops`]: callbacks for the standard operation kinds.
//! - [`shape_inference`]: the [`PartialInfer`](shape_inference::PartialInfer)
//!   pass that drives the callbacks across the whole graph.
//!
//! ## How It Works
//!
//! ```text
//! ASG (declared input shapes) -> PartialInfer -> ASG (shapes/dtypes on every output)
//! ```
//!
//! Dimensions that cannot be known before the model runs stay dynamic (`?`).
//! Inference never aborts because of them; it reports them as warnings.
//!
//! ## Example
//!
//! ```ignore
//! use rustymo::analysis::{registry::InferenceRegistry, shape_inference::PartialInfer};
//!
//! let mut rules = InferenceRegistry::with_standard_ops();
//! rules.register("MyOp", |input| Ok(vec![input.input(0)?.clone()]));
//!
//! registry.register(PartialInfer::new(rules))?;
//! ```

pub mod ops;
pub mod registry;
pub mod shape_inference;
