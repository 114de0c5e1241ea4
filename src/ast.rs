//! Abstract syntax tree for array programs

use crate::ir::BinaryOp;

/// A complete program consisting of statements
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Statement>,
}

/// Assignment statement: `X = expr`
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub target: String,
    pub value: Expr,
}

/// Expression types
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Array or scalar variable reference
    Variable(String),

    /// Number literal
    Number(f64),

    /// Array literal: `[1, 2, 3]` or `[[1, 2], [3, 4]]`
    Array(ArrayLiteral),

    /// Elementwise arithmetic: `A + B`, `A * 2`
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// Full reduction: `A.sum()` or `sum(A)`
    Sum(Box<Expr>),
}

impl Expr {
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Visit this expression and its children, left to right
    pub fn walk<'e>(&'e self, visit: &mut impl FnMut(&'e Expr)) {
        visit(self);
        match self {
            Expr::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            Expr::Sum(inner) => inner.walk(visit),
            Expr::Variable(_) | Expr::Number(_) | Expr::Array(_) => {}
        }
    }
}

/// An array literal value, stored row-major
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayLiteral {
    pub dims: Vec<usize>,
    pub values: Vec<f64>,
}

impl ArrayLiteral {
    pub fn vector(values: Vec<f64>) -> Self {
        Self {
            dims: vec![values.len()],
            values,
        }
    }

    /// Build from rows; rows must all have the same length
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Option<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|row| row.len() != cols) {
            return None;
        }
        Some(Self {
            dims: vec![rows.len(), cols],
            values: rows.into_iter().flatten().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rows() {
        let literal = ArrayLiteral::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
        assert_eq!(literal.dims, vec![3, 2]);
        assert_eq!(literal.values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        assert!(ArrayLiteral::from_rows(vec![vec![1.0], vec![2.0, 3.0]]).is_none());
    }

    #[test]
    fn test_walk_order() {
        // (A + 1).sum() * B
        let expr = Expr::binary(
            BinaryOp::Mul,
            Expr::Sum(Box::new(Expr::binary(
                BinaryOp::Add,
                Expr::Variable("A".to_string()),
                Expr::Number(1.0),
            ))),
            Expr::Variable("B".to_string()),
        );

        let mut leaves = Vec::new();
        expr.walk(&mut |e| match e {
            Expr::Variable(name) => leaves.push(name.clone()),
            Expr::Number(n) => leaves.push(n.to_string()),
            _ => {}
        });
        assert_eq!(leaves, vec!["A", "1", "B"]);
    }
}
