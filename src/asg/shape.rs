//! Partial shapes: ordered dimensions, each either a concrete size or dynamic.
//!
//! A dynamic dimension is a size that is only known when the model runs.
//! Inference never replaces a dynamic dimension with a made-up number; the
//! operations below either keep it dynamic or take a concrete value from
//! another shape that is known to describe the same tensor.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// One axis of a shape.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Dimension {
    Static(usize),
    Dynamic,
}

impl Dimension {
    pub fn is_static(&self) -> bool {
        matches!(self, Dimension::Static(_))
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Dimension::Dynamic)
    }

    pub fn get(&self) -> Option<usize> {
        match self {
            Dimension::Static(n) => Some(*n),
            Dimension::Dynamic => None,
        }
    }

    /// Two dimensions are compatible if they may describe the same axis.
    pub fn compatible(&self, other: &Dimension) -> bool {
        match (self, other) {
            (Dimension::Static(a), Dimension::Static(b)) => a == b,
            _ => true,
        }
    }

    /// Most precise dimension consistent with both, or `None` on a static mismatch.
    pub fn merge(&self, other: &Dimension) -> Option<Dimension> {
        match (self, other) {
            (Dimension::Static(a), Dimension::Static(b)) if a == b => Some(*self),
            (Dimension::Static(_), Dimension::Static(_)) => None,
            (Dimension::Dynamic, d) | (d, Dimension::Dynamic) => Some(*d),
        }
    }

    /// NumPy broadcasting of a single axis.
    pub fn broadcast_merge(&self, other: &Dimension) -> Option<Dimension> {
        match (self, other) {
            (Dimension::Static(1), d) | (d, Dimension::Static(1)) => Some(*d),
            (Dimension::Static(a), Dimension::Static(b)) if a == b => Some(*self),
            (Dimension::Static(_), Dimension::Static(_)) => None,
            (Dimension::Dynamic, Dimension::Dynamic) => Some(Dimension::Dynamic),
            // A non-unit static size wins: the dynamic side must be 1 or equal at runtime.
            (Dimension::Dynamic, d) | (d, Dimension::Dynamic) => Some(*d),
        }
    }

    /// Least precise dimension covering both (used where two branches meet).
    pub fn relax(&self, other: &Dimension) -> Dimension {
        if self == other {
            *self
        } else {
            Dimension::Dynamic
        }
    }

    /// `self` is at least as general as `other`.
    pub fn relaxes(&self, other: &Dimension) -> bool {
        self.is_dynamic() || self == other
    }

    /// `self` is at least as precise as `other`.
    pub fn refines(&self, other: &Dimension) -> bool {
        other.is_dynamic() || self == other
    }
}

impl From<usize> for Dimension {
    fn from(n: usize) -> Self {
        Dimension::Static(n)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Static(n) => write!(f, "{}", n),
            Dimension::Dynamic => write!(f, "?"),
        }
    }
}

// Encoded as an integer with -1 standing for a dynamic dimension.
impl Serialize for Dimension {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Dimension::Static(n) => serializer.serialize_u64(*n as u64),
            Dimension::Dynamic => serializer.serialize_i64(-1),
        }
    }
}

impl<'de> Deserialize<'de> for Dimension {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DimensionVisitor;

        impl<'de> Visitor<'de> for DimensionVisitor {
            type Value = Dimension;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative dimension or -1 for a dynamic one")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Dimension, E> {
                Ok(Dimension::Static(v as usize))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Dimension, E> {
                match v {
                    -1 => Ok(Dimension::Dynamic),
                    v if v >= 0 => Ok(Dimension::Static(v as usize)),
                    v => Err(E::custom(format!("invalid dimension {}", v))),
                }
            }
        }

        deserializer.deserialize_i64(DimensionVisitor)
    }
}

/// Ordered sequence of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape(pub Vec<Dimension>);

impl Shape {
    pub fn new(dims: Vec<Dimension>) -> Self {
        Self(dims)
    }

    pub fn scalar() -> Self {
        Self(vec![])
    }

    pub fn from_static(dims: &[usize]) -> Self {
        Self(dims.iter().map(|&d| Dimension::Static(d)).collect())
    }

    /// Shape of the given rank with every dimension dynamic.
    pub fn dynamic(rank: usize) -> Self {
        Self(vec![Dimension::Dynamic; rank])
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.0
    }

    pub fn is_fully_defined(&self) -> bool {
        self.0.iter().all(Dimension::is_static)
    }

    pub fn to_static(&self) -> Option<Vec<usize>> {
        self.0.iter().map(Dimension::get).collect()
    }

    /// Number of elements, when every dimension is known.
    pub fn num_elements(&self) -> Option<usize> {
        self.to_static().map(|dims| dims.iter().product())
    }

    pub fn compatible(&self, other: &Shape) -> bool {
        self.rank() == other.rank()
            && self.0.iter().zip(&other.0).all(|(a, b)| a.compatible(b))
    }

    /// Refines `dst` with what `src` knows. Returns `false` (leaving `dst`
    /// untouched) when the two cannot describe the same tensor.
    pub fn merge_into(dst: &mut Shape, src: &Shape) -> bool {
        if dst.rank() != src.rank() {
            return false;
        }
        let merged: Option<Vec<Dimension>> =
            dst.0.iter().zip(&src.0).map(|(a, b)| a.merge(b)).collect();
        match merged {
            Some(dims) => {
                dst.0 = dims;
                true
            }
            None => false,
        }
    }

    /// NumPy-style broadcast of two shapes, aligned from the trailing axis.
    pub fn broadcast_merge(a: &Shape, b: &Shape) -> Option<Shape> {
        let rank = a.rank().max(b.rank());
        let one = Dimension::Static(1);
        let mut dims = Vec::with_capacity(rank);
        for i in 0..rank {
            let da = if i < rank - a.rank() { one } else { a.0[i - (rank - a.rank())] };
            let db = if i < rank - b.rank() { one } else { b.0[i - (rank - b.rank())] };
            dims.push(da.broadcast_merge(&db)?);
        }
        Some(Shape(dims))
    }

    /// Element-wise relaxation; `None` if the ranks differ.
    pub fn relax(a: &Shape, b: &Shape) -> Option<Shape> {
        if a.rank() != b.rank() {
            return None;
        }
        Some(Shape(a.0.iter().zip(&b.0).map(|(x, y)| x.relax(y)).collect()))
    }

    pub fn relaxes(&self, other: &Shape) -> bool {
        self.rank() == other.rank() && self.0.iter().zip(&other.0).all(|(a, b)| a.relaxes(b))
    }

    pub fn refines(&self, other: &Shape) -> bool {
        self.rank() == other.rank() && self.0.iter().zip(&other.0).all(|(a, b)| a.refines(b))
    }
}

impl From<Vec<Dimension>> for Shape {
    fn from(dims: Vec<Dimension>) -> Self {
        Shape(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Dimension::{Dynamic, Static};

    #[test]
    fn test_fully_defined() {
        assert!(Shape::from_static(&[2, 3]).is_fully_defined());
        assert!(Shape::scalar().is_fully_defined());
        assert!(!Shape::new(vec![Dynamic, Static(3)]).is_fully_defined());
    }

    #[test]
    fn test_display_uses_placeholder() {
        let s = Shape::new(vec![Dynamic, Static(3)]);
        assert_eq!(s.to_string(), "[?,3]");
        assert_eq!(Shape::scalar().to_string(), "[]");
    }

    #[test]
    fn test_merge_into_takes_known_values() {
        let mut dst = Shape::new(vec![Dynamic, Static(3)]);
        assert!(Shape::merge_into(&mut dst, &Shape::from_static(&[8, 3])));
        assert_eq!(dst, Shape::from_static(&[8, 3]));

        let mut dst = Shape::from_static(&[8, 3]);
        assert!(Shape::merge_into(&mut dst, &Shape::new(vec![Dynamic, Dynamic])));
        assert_eq!(dst, Shape::from_static(&[8, 3]));
    }

    #[test]
    fn test_merge_into_rejects_mismatch() {
        let mut dst = Shape::from_static(&[8, 3]);
        assert!(!Shape::merge_into(&mut dst, &Shape::from_static(&[8, 4])));
        assert_eq!(dst, Shape::from_static(&[8, 3]));
        assert!(!Shape::merge_into(&mut dst, &Shape::from_static(&[8])));
    }

    #[test]
    fn test_broadcast_merge() {
        let a = Shape::new(vec![Dynamic, Static(1), Static(4)]);
        let b = Shape::from_static(&[5, 1]);
        assert_eq!(
            Shape::broadcast_merge(&a, &b),
            Some(Shape::new(vec![Dynamic, Static(5), Static(4)]))
        );
        assert_eq!(
            Shape::broadcast_merge(&Shape::from_static(&[2, 3]), &Shape::from_static(&[4, 3])),
            None
        );
    }

    #[test]
    fn test_relax() {
        let a = Shape::from_static(&[1, 3]);
        let b = Shape::from_static(&[2, 3]);
        let r = Shape::relax(&a, &b).unwrap();
        assert_eq!(r, Shape::new(vec![Dynamic, Static(3)]));
        assert!(r.relaxes(&a));
        assert!(a.refines(&r));
        assert!(!r.refines(&a));
    }

    #[test]
    fn test_serde_uses_minus_one() {
        let s = Shape::new(vec![Dynamic, Static(3)]);
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "[-1,3]");
        let back: Shape = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
        assert!(serde_json::from_str::<Shape>("[-2]").is_err());
    }
}
