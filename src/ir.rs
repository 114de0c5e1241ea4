//! Expression IR over multi-dimensional arrays
//!
//! Applying an operator builds a node and computes nothing. Leaves (`Array`,
//! `Scalar`) own their buffers; operation nodes reach their children through
//! a [`Child`] edge that is either borrowed or owned. Literal numbers passed
//! to an operator become an owned `Literal` child that is dropped with its
//! parent.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};
use crate::shape::Shape;

/// Dense array leaf with a single owned row-major buffer
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    shape: Shape,
    data: Vec<f32>,
}

impl Array {
    pub fn zeros(shape: Shape) -> Self {
        Self::filled(shape, 0.0)
    }

    pub fn filled(shape: Shape, value: f32) -> Self {
        let data = vec![value; shape.size()];
        Self { shape, data }
    }

    /// Wrap an existing buffer; its length must equal the shape's size
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> CompileResult<Self> {
        if data.len() != shape.size() {
            return Err(CompileError::shape_mismatch(
                format!("{} elements for shape {}", shape.size(), shape),
                format!("{} elements", data.len()),
            ));
        }
        Ok(Self { shape, data })
    }

    /// Array of independent standard-normal samples
    pub fn random(shape: Shape, source: &mut RandomSource) -> Self {
        let mut rng = source.next_rng();
        let data = (0..shape.size())
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect();
        Self { shape, data }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn fill(&mut self, value: f32) {
        self.data.iter_mut().for_each(|slot| *slot = value);
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Sum of all elements (sets up an expression, computes nothing)
    pub fn reduce_sum(&self) -> CompileResult<Expr<'_>> {
        Expr::unary(UnaryOp::Sum, self)
    }
}

impl std::fmt::Display for Array {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, value) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", value)?;
        }
        Ok(())
    }
}

/// Single-value leaf; referenced by pointer in generated kernels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scalar {
    value: f32,
}

impl Scalar {
    pub fn new(value: f32) -> Self {
        Self { value }
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn set(&mut self, value: f32) {
        self.value = value;
    }

    pub fn data(&self) -> &[f32] {
        std::slice::from_ref(&self.value)
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        std::slice::from_mut(&mut self.value)
    }
}

impl Default for Scalar {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Seed stream for random array initialization
///
/// Every array drawn from the same source gets its own generator, seeded
/// from the base seed plus the number of arrays created so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomSource {
    seed: u64,
    created: u64,
}

impl RandomSource {
    pub fn new(seed: u64) -> Self {
        Self { seed, created: 0 }
    }

    pub fn arrays_created(&self) -> u64 {
        self.created
    }

    fn next_rng(&mut self) -> StdRng {
        self.created += 1;
        StdRng::seed_from_u64(self.seed.wrapping_add(self.created))
    }
}

impl Default for RandomSource {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Elementwise binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }

    pub fn apply(self, left: f32, right: f32) -> f32 {
        match self {
            BinaryOp::Add => left + right,
            BinaryOp::Sub => left - right,
            BinaryOp::Mul => left * right,
            BinaryOp::Div => left / right,
        }
    }
}

/// Single-operand operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Sum of every element
    Sum,
    /// Elementwise map (no code generation rule yet)
    Map,
    /// Element count (no code generation rule yet)
    Count,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Sum => "sum",
            UnaryOp::Map => "map",
            UnaryOp::Count => "count",
        }
    }

    pub fn is_reduction(self) -> bool {
        matches!(self, UnaryOp::Sum | UnaryOp::Count)
    }
}

/// A node of the expression tree
#[derive(Debug)]
pub enum Expr<'a> {
    Array(&'a Array),
    Scalar(&'a Scalar),
    /// Scalar synthesized from a number passed to an operator
    Literal(Scalar),
    Binary(BinaryExpr<'a>),
    Unary(UnaryExpr<'a>),
}

/// Edge from an operation node to one of its children
#[derive(Debug)]
pub enum Child<'a> {
    Borrowed(&'a Expr<'a>),
    Owned(Box<Expr<'a>>),
}

impl<'a> Child<'a> {
    pub fn expr(&self) -> &Expr<'a> {
        match self {
            Child::Borrowed(expr) => expr,
            Child::Owned(expr) => expr,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Child::Owned(_))
    }
}

impl<'a> std::ops::Deref for Child<'a> {
    type Target = Expr<'a>;

    fn deref(&self) -> &Self::Target {
        self.expr()
    }
}

#[derive(Debug)]
pub struct BinaryExpr<'a> {
    op: BinaryOp,
    left: Child<'a>,
    right: Child<'a>,
    shape: Shape,
    reductions: usize,
}

impl<'a> BinaryExpr<'a> {
    pub fn op(&self) -> BinaryOp {
        self.op
    }

    pub fn left(&self) -> &Child<'a> {
        &self.left
    }

    pub fn right(&self) -> &Child<'a> {
        &self.right
    }
}

#[derive(Debug)]
pub struct UnaryExpr<'a> {
    op: UnaryOp,
    operand: Child<'a>,
    shape: Shape,
    reductions: usize,
}

impl<'a> UnaryExpr<'a> {
    pub fn op(&self) -> UnaryOp {
        self.op
    }

    pub fn operand(&self) -> &Child<'a> {
        &self.operand
    }
}

impl<'a> Expr<'a> {
    pub fn literal(value: f32) -> Self {
        Expr::Literal(Scalar::new(value))
    }

    /// Build a binary node, checking that two array-shaped sides agree
    pub fn binary(
        op: BinaryOp,
        left: impl Into<Child<'a>>,
        right: impl Into<Child<'a>>,
    ) -> CompileResult<Self> {
        let left = left.into();
        let right = right.into();
        let (left_shape, right_shape) = (left.shape(), right.shape());

        let shape = match (left_shape.is_scalar(), right_shape.is_scalar()) {
            (false, false) if left_shape != right_shape => {
                return Err(CompileError::shape_mismatch(left_shape, right_shape));
            }
            (false, _) => left_shape,
            (true, false) => right_shape,
            (true, true) => Shape::scalar(),
        };

        let reductions = left.reductions() + right.reductions();
        if reductions > 1 {
            return Err(CompileError::unsupported(
                "an expression may contain at most one reduction",
            ));
        }

        Ok(Expr::Binary(BinaryExpr { op, left, right, shape, reductions }))
    }

    pub fn unary(op: UnaryOp, operand: impl Into<Child<'a>>) -> CompileResult<Self> {
        let operand = operand.into();
        let mut reductions = operand.reductions();
        if op.is_reduction() {
            if reductions > 0 {
                return Err(CompileError::unsupported(format!(
                    "cannot apply {} to an expression that already contains a reduction",
                    op.name()
                )));
            }
            reductions += 1;
        }
        let shape = operand.shape();
        Ok(Expr::Unary(UnaryExpr { op, operand, shape, reductions }))
    }

    /// Sum of every element of this expression
    pub fn reduce_sum(self) -> CompileResult<Self> {
        Expr::unary(UnaryOp::Sum, self)
    }

    /// Structural shape of the node; a reduction keeps its operand's shape
    pub fn shape(&self) -> Shape {
        match self {
            Expr::Array(array) => array.shape().clone(),
            Expr::Scalar(_) | Expr::Literal(_) => Shape::scalar(),
            Expr::Binary(node) => node.shape.clone(),
            Expr::Unary(node) => node.shape.clone(),
        }
    }

    /// Shape of the value the expression produces
    pub fn result_shape(&self) -> Shape {
        match self {
            Expr::Unary(node) if node.op.is_reduction() => Shape::scalar(),
            Expr::Unary(node) => node.operand.result_shape(),
            Expr::Binary(node) => {
                if node.left.result_shape().is_scalar() && node.right.result_shape().is_scalar() {
                    Shape::scalar()
                } else {
                    node.shape.clone()
                }
            }
            other => other.shape(),
        }
    }

    /// Element count; a binary node reports the larger of its children
    pub fn size(&self) -> usize {
        match self {
            Expr::Array(array) => array.size(),
            Expr::Scalar(_) | Expr::Literal(_) => 1,
            Expr::Binary(node) => node.left.size().max(node.right.size()),
            Expr::Unary(node) => node.operand.size(),
        }
    }

    /// Number of reductions in this subtree (never more than one)
    pub fn reductions(&self) -> usize {
        match self {
            Expr::Binary(node) => node.reductions,
            Expr::Unary(node) => node.reductions,
            _ => 0,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Expr::Array(_) | Expr::Scalar(_) | Expr::Literal(_))
    }
}

impl<'a> From<&'a Array> for Expr<'a> {
    fn from(array: &'a Array) -> Self {
        Expr::Array(array)
    }
}

impl<'a> From<&'a Scalar> for Expr<'a> {
    fn from(scalar: &'a Scalar) -> Self {
        Expr::Scalar(scalar)
    }
}

impl<'a> From<&'a Array> for Child<'a> {
    fn from(array: &'a Array) -> Self {
        Child::Owned(Box::new(Expr::Array(array)))
    }
}

impl<'a> From<&'a Scalar> for Child<'a> {
    fn from(scalar: &'a Scalar) -> Self {
        Child::Owned(Box::new(Expr::Scalar(scalar)))
    }
}

impl<'a> From<Expr<'a>> for Child<'a> {
    fn from(expr: Expr<'a>) -> Self {
        Child::Owned(Box::new(expr))
    }
}

impl<'a> From<&'a Expr<'a>> for Child<'a> {
    fn from(expr: &'a Expr<'a>) -> Self {
        Child::Borrowed(expr)
    }
}

impl<'a> From<f32> for Child<'a> {
    fn from(value: f32) -> Self {
        Child::Owned(Box::new(Expr::literal(value)))
    }
}

impl<'a> From<f64> for Child<'a> {
    fn from(value: f64) -> Self {
        Child::Owned(Box::new(Expr::literal(value as f32)))
    }
}

impl<'a> From<i32> for Child<'a> {
    fn from(value: i32) -> Self {
        Child::Owned(Box::new(Expr::literal(value as f32)))
    }
}

macro_rules! binary_operator {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<'a, R: Into<Child<'a>>> std::ops::$trait<R> for &'a Array {
            type Output = CompileResult<Expr<'a>>;

            fn $method(self, rhs: R) -> Self::Output {
                Expr::binary($op, self, rhs)
            }
        }

        impl<'a, R: Into<Child<'a>>> std::ops::$trait<R> for &'a Scalar {
            type Output = CompileResult<Expr<'a>>;

            fn $method(self, rhs: R) -> Self::Output {
                Expr::binary($op, self, rhs)
            }
        }

        impl<'a, R: Into<Child<'a>>> std::ops::$trait<R> for Expr<'a> {
            type Output = CompileResult<Expr<'a>>;

            fn $method(self, rhs: R) -> Self::Output {
                Expr::binary($op, self, rhs)
            }
        }

        impl<'a, R: Into<Child<'a>>> std::ops::$trait<R> for &'a Expr<'a> {
            type Output = CompileResult<Expr<'a>>;

            fn $method(self, rhs: R) -> Self::Output {
                Expr::binary($op, self, rhs)
            }
        }
    };
}

binary_operator!(Add, add, BinaryOp::Add);
binary_operator!(Sub, sub, BinaryOp::Sub);
binary_operator!(Mul, mul, BinaryOp::Mul);
binary_operator!(Div, div, BinaryOp::Div);
