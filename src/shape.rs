//! Array shapes
//!
//! A shape is an ordered list of positive dimension sizes. The empty list is
//! the shape of a scalar and has size 1.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};

/// Immutable dimension list, cheap to clone
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Arc<[usize]>,
}

impl Shape {
    /// Build a shape, rejecting zero-sized dimensions
    pub fn new(dims: impl Into<Vec<usize>>) -> CompileResult<Self> {
        let dims = dims.into();
        if let Some(axis) = dims.iter().position(|&d| d == 0) {
            return Err(CompileError::invalid_shape(format!(
                "dimension {} of {:?} is zero",
                axis, dims
            )));
        }
        Ok(Self { dims: dims.into() })
    }

    /// The shape of a single value
    pub fn scalar() -> Self {
        Self { dims: Arc::from(Vec::new()) }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements (product of all dimensions)
    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Row-major strides; the innermost stride is 1
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.dims.len()];
        for axis in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * self.dims[axis + 1];
        }
        strides
    }

    /// Parse a `2x3x4` dimension list
    pub fn parse(text: &str) -> CompileResult<Self> {
        let dims = text
            .split('x')
            .map(|part| {
                part.trim().parse::<usize>().map_err(|_| {
                    CompileError::invalid_shape(format!("invalid dimension '{}' in '{}'", part, text))
                })
            })
            .collect::<CompileResult<Vec<_>>>()?;
        Self::new(dims)
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_scalar() {
            return write!(f, "scalar");
        }
        write!(f, "(")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", dim)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_and_strides() {
        let shape = Shape::new([28, 28, 10]).unwrap();
        assert_eq!(shape.size(), 7840);
        assert_eq!(shape.strides(), vec![280, 10, 1]);
        assert_eq!(shape.rank(), 3);
    }

    #[test]
    fn test_scalar_shape() {
        let shape = Shape::scalar();
        assert!(shape.is_scalar());
        assert_eq!(shape.size(), 1);
        assert!(shape.strides().is_empty());
        assert_eq!(shape.to_string(), "scalar");
    }

    #[test]
    fn test_structural_equality() {
        assert_eq!(Shape::new([2, 2]).unwrap(), Shape::new(vec![2, 2]).unwrap());
        assert_ne!(Shape::new([2, 2]).unwrap(), Shape::new([4]).unwrap());
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(matches!(
            Shape::new([3, 0]),
            Err(CompileError::InvalidShape { .. })
        ));
    }

    #[test]
    fn test_parse() {
        assert_eq!(Shape::parse("2x3x4").unwrap().dims(), &[2, 3, 4]);
        assert_eq!(Shape::parse("5").unwrap().to_string(), "(5)");
        assert!(Shape::parse("2xa").is_err());
    }
}
