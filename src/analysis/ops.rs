//! Standard shape-inference rules for common operation kinds.
//!
//! Every rule works on partial shapes: a dynamic input dimension yields a
//! dynamic output dimension unless the operation itself pins the size.

use super::registry::{InferenceInput, InferenceRegistry, ShapeContradiction, TensorType};
use crate::asg::{Attribute, DType, Dimension, Shape, OP_RESULT};

type Result<T> = std::result::Result<T, ShapeContradiction>;

pub const UNARY_ELEMENTWISE: &[&str] =
    &["Identity", "Relu", "Sigmoid", "Tanh", "Exp", "Log", "Sqrt", "Negative", "Swish"];

pub const BINARY_BROADCAST: &[&str] = &["Add", "Subtract", "Multiply", "Divide", "Power"];

pub fn register_standard_ops(registry: &mut InferenceRegistry) {
    for op in UNARY_ELEMENTWISE {
        registry.register(op, same_as_input);
    }
    for op in BINARY_BROADCAST {
        registry.register(op, broadcast_binary);
    }
    registry.register(OP_RESULT, |_| Ok(vec![]));
    registry.register("Convert", convert);
    registry.register("MatMul", matmul);
    registry.register("Transpose", transpose);
    registry.register("Reshape", reshape);
    registry.register("Concat", concat);
    registry.register("AvgPool", avg_pool);
    registry.register("ShapeOf", shape_of);
    registry.register("If", if_op);
}

pub fn same_as_input(input: &InferenceInput<'_>) -> Result<Vec<TensorType>> {
    Ok(vec![input.input(0)?.clone()])
}

pub fn broadcast_binary(input: &InferenceInput<'_>) -> Result<Vec<TensorType>> {
    let lhs = input.input(0)?;
    let rhs = input.input(1)?;
    let shape = Shape::broadcast_merge(&lhs.shape, &rhs.shape).ok_or_else(|| {
        ShapeContradiction::new(format!(
            "{}: shapes {} and {} cannot be broadcast together",
            input.node.op, lhs.shape, rhs.shape
        ))
    })?;
    Ok(vec![TensorType::new(shape, lhs.dtype)])
}

fn convert(input: &InferenceInput<'_>) -> Result<Vec<TensorType>> {
    let data = input.input(0)?;
    let dtype = input.node.attr_dtype("destination_type").unwrap_or(data.dtype);
    Ok(vec![TensorType::new(data.shape.clone(), dtype)])
}

fn matmul(input: &InferenceInput<'_>) -> Result<Vec<TensorType>> {
    let lhs = input.input(0)?;
    let rhs = input.input(1)?;
    let (a, b) = (lhs.shape.dims(), rhs.shape.dims());
    if a.len() < 2 || b.len() < 2 {
        return Err(ShapeContradiction::new(format!(
            "MatMul needs operands of rank >= 2, got {} and {}",
            lhs.shape, rhs.shape
        )));
    }

    let (m, k1) = (a[a.len() - 2], a[a.len() - 1]);
    let (k2, n) = (b[b.len() - 2], b[b.len() - 1]);
    if !k1.compatible(&k2) {
        return Err(ShapeContradiction::new(format!(
            "MatMul inner dimensions differ: {} vs {} ({} x {})",
            k1, k2, lhs.shape, rhs.shape
        )));
    }

    let batch_a = Shape::new(a[..a.len() - 2].to_vec());
    let batch_b = Shape::new(b[..b.len() - 2].to_vec());
    let mut out = Shape::broadcast_merge(&batch_a, &batch_b)
        .ok_or_else(|| {
            ShapeContradiction::new(format!("MatMul batch dimensions {} and {} do not broadcast", batch_a, batch_b))
        })?
        .0;
    out.push(m);
    out.push(n);
    Ok(vec![TensorType::new(Shape::new(out), lhs.dtype)])
}

fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    if resolved < 0 || resolved >= rank as i64 {
        return Err(ShapeContradiction::new(format!("axis {} is out of range for rank {}", axis, rank)));
    }
    Ok(resolved as usize)
}

fn transpose(input: &InferenceInput<'_>) -> Result<Vec<TensorType>> {
    let data = input.input(0)?;
    let rank = data.shape.rank();
    let perm: Vec<usize> = match input.node.attr_ints("perm") {
        Some(perm) => perm.iter().map(|&p| normalize_axis(p, rank)).collect::<Result<_>>()?,
        None => (0..rank).rev().collect(),
    };
    let mut seen = vec![false; rank];
    if perm.len() != rank || perm.iter().any(|&p| std::mem::replace(&mut seen[p], true)) {
        return Err(ShapeContradiction::new(format!(
            "Transpose order {:?} is not a permutation of rank {}",
            perm, rank
        )));
    }
    let dims = perm.iter().map(|&p| data.shape.dims()[p]).collect();
    Ok(vec![TensorType::new(Shape::new(dims), data.dtype)])
}

/// `-1` in the target takes whatever is left, `0` copies the input dimension.
fn reshape(input: &InferenceInput<'_>) -> Result<Vec<TensorType>> {
    let data = input.input(0)?;
    let target = input
        .node
        .attr_ints("shape")
        .ok_or_else(|| ShapeContradiction::new("Reshape has no 'shape' attribute"))?;
    if target.iter().filter(|&&d| d == -1).count() > 1 {
        return Err(ShapeContradiction::new("Reshape target has more than one -1"));
    }

    let mut dims = Vec::with_capacity(target.len());
    for (i, &d) in target.iter().enumerate() {
        let dim = match d {
            -1 => Dimension::Dynamic,
            0 => *data.shape.dims().get(i).ok_or_else(|| {
                ShapeContradiction::new(format!("Reshape copies axis {} of {}", i, data.shape))
            })?,
            d if d > 0 => Dimension::Static(d as usize),
            d => return Err(ShapeContradiction::new(format!("Reshape target dimension {} is invalid", d))),
        };
        dims.push(dim);
    }

    let placeholder = target.iter().position(|&d| d == -1);
    let rest: usize = dims
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != placeholder)
        .filter_map(|(_, d)| d.get())
        .product();
    let all_known = dims.iter().enumerate().all(|(i, d)| Some(i) == placeholder || d.is_static());

    if let (Some(total), true) = (data.shape.num_elements(), all_known) {
        match placeholder {
            Some(pos) => {
                if rest == 0 || total % rest != 0 {
                    return Err(ShapeContradiction::new(format!(
                        "cannot reshape {} into {:?}",
                        data.shape, target
                    )));
                }
                dims[pos] = Dimension::Static(total / rest);
            }
            None if rest != total => {
                return Err(ShapeContradiction::new(format!(
                    "cannot reshape {} ({} elements) into {:?} ({} elements)",
                    data.shape, total, target, rest
                )));
            }
            None => {}
        }
    }
    Ok(vec![TensorType::new(Shape::new(dims), data.dtype)])
}

fn concat(input: &InferenceInput<'_>) -> Result<Vec<TensorType>> {
    let first = input.input(0)?;
    let rank = first.shape.rank();
    let axis = normalize_axis(input.node.attr_int("axis").unwrap_or(0), rank)?;

    let mut out = first.shape.clone();
    let mut axis_dim = first.shape.dims()[axis];
    for other in &input.inputs[1..] {
        if other.shape.rank() != rank {
            return Err(ShapeContradiction::new(format!(
                "Concat inputs {} and {} have different ranks",
                first.shape, other.shape
            )));
        }
        axis_dim = match (axis_dim, other.shape.dims()[axis]) {
            (Dimension::Static(a), Dimension::Static(b)) => Dimension::Static(a + b),
            _ => Dimension::Dynamic,
        };
        for i in (0..rank).filter(|&i| i != axis) {
            out.0[i] = out.0[i].merge(&other.shape.dims()[i]).ok_or_else(|| {
                ShapeContradiction::new(format!(
                    "Concat inputs {} and {} disagree on axis {}",
                    first.shape, other.shape, i
                ))
            })?;
        }
    }
    out.0[axis] = axis_dim;
    Ok(vec![TensorType::new(out, first.dtype)])
}

/// NCHW-style pooling over every axis after the first two.
fn avg_pool(input: &InferenceInput<'_>) -> Result<Vec<TensorType>> {
    let data = input.input(0)?;
    let node = input.node;
    let rank = data.shape.rank();
    if rank < 3 {
        return Err(ShapeContradiction::new(format!("AvgPool input {} has no spatial axes", data.shape)));
    }
    let spatial = rank - 2;
    let attr = |key: &str, default: i64| -> Result<Vec<i64>> {
        let values = node.attr_ints(key).map(<[i64]>::to_vec).unwrap_or_else(|| vec![default; spatial]);
        if values.len() != spatial || values.iter().any(|&v| v < 0) {
            return Err(ShapeContradiction::new(format!(
                "AvgPool '{}' must hold {} non-negative values, got {:?}",
                key, spatial, values
            )));
        }
        Ok(values)
    };
    let kernel = node
        .attr_ints("kernel")
        .map(<[i64]>::to_vec)
        .ok_or_else(|| ShapeContradiction::new("AvgPool has no 'kernel' attribute"))?;
    if kernel.len() != spatial || kernel.iter().any(|&k| k <= 0) {
        return Err(ShapeContradiction::new(format!("AvgPool kernel {:?} is invalid", kernel)));
    }
    let strides = attr("strides", 1)?;
    let pads_begin = attr("pads_begin", 0)?;
    let pads_end = attr("pads_end", 0)?;
    let ceil = matches!(node.attr("rounding_type"), Some(Attribute::Str(s)) if s == "ceil");

    let mut dims = data.shape.dims()[..2].to_vec();
    for i in 0..spatial {
        let dim = match data.shape.dims()[i + 2] {
            Dimension::Dynamic => Dimension::Dynamic,
            Dimension::Static(d) => {
                let padded = d as i64 + pads_begin[i] + pads_end[i];
                let stride = strides[i].max(1);
                if padded < kernel[i] {
                    return Err(ShapeContradiction::new(format!(
                        "AvgPool kernel {} exceeds padded input {} on spatial axis {}",
                        kernel[i], padded, i
                    )));
                }
                let span = padded - kernel[i];
                let steps = if ceil { (span + stride - 1) / stride } else { span / stride };
                Dimension::Static((steps + 1) as usize)
            }
        };
        dims.push(dim);
    }
    Ok(vec![TensorType::new(Shape::new(dims), data.dtype)])
}

fn shape_of(input: &InferenceInput<'_>) -> Result<Vec<TensorType>> {
    let data = input.input(0)?;
    Ok(vec![TensorType::new(Shape::from_static(&[data.shape.rank()]), DType::I64)])
}

/// Outputs of both branches are relaxed into one: equal dimensions survive,
/// differing ones become dynamic.
fn if_op(input: &InferenceInput<'_>) -> Result<Vec<TensorType>> {
    let then_results = input.body_results(0)?;
    let else_results = input.body_results(1)?;
    if then_results.len() != else_results.len() {
        return Err(ShapeContradiction::new(format!(
            "If branches produce {} and {} outputs",
            then_results.len(),
            else_results.len()
        )));
    }
    then_results
        .iter()
        .zip(&else_results)
        .map(|(t, e)| {
            if t.dtype != e.dtype {
                return Err(ShapeContradiction::new(format!("If branches disagree on type: {} vs {}", t, e)));
            }
            Shape::relax(&t.shape, &e.shape)
                .map(|shape| TensorType::new(shape, t.dtype))
                .ok_or_else(|| ShapeContradiction::new(format!("If branches disagree on rank: {} vs {}", t, e)))
        })
        .collect()
}
