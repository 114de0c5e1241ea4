//! Runs array programs against a workspace of named leaves
//!
//! The [`Workspace`] owns every named array and scalar. The [`Analyzer`]
//! lowers each parsed statement into an [`ir::Expr`] that borrows the
//! workspace, compiles it into a fresh destination, optionally runs the
//! kernel, and then stores the destination under the statement's target.

use std::collections::HashMap;

use log::debug;
use serde::Serialize;

use crate::ast::{self, Program, Statement};
use crate::backend::{Backend, CpuBackend, LaunchConfig};
use crate::error::{CompileError, CompileResult};
use crate::ir::{self, Array, RandomSource, Scalar, UnaryOp};
use crate::kernel::{KernelConfig, KernelSource};
use crate::shape::Shape;
use crate::{Compilation, Runtime, Target};

/// A named value in the workspace
#[derive(Debug, Clone, PartialEq)]
pub enum Leaf {
    Array(Array),
    Scalar(Scalar),
}

impl Leaf {
    pub fn shape(&self) -> Shape {
        match self {
            Leaf::Array(array) => array.shape().clone(),
            Leaf::Scalar(_) => Shape::scalar(),
        }
    }

    pub fn data(&self) -> &[f32] {
        match self {
            Leaf::Array(array) => array.data(),
            Leaf::Scalar(scalar) => scalar.data(),
        }
    }

    pub fn as_target(&mut self) -> Target<'_> {
        match self {
            Leaf::Array(array) => Target::Array(array),
            Leaf::Scalar(scalar) => Target::Scalar(scalar),
        }
    }

    fn as_expr(&self) -> ir::Expr<'_> {
        match self {
            Leaf::Array(array) => ir::Expr::Array(array),
            Leaf::Scalar(scalar) => ir::Expr::Scalar(scalar),
        }
    }
}

/// Named arrays and scalars
#[derive(Debug, Default)]
pub struct Workspace {
    leaves: HashMap<String, Leaf>,
    random: RandomSource,
}

impl Workspace {
    pub fn new(seed: u64) -> Self {
        Self {
            leaves: HashMap::new(),
            random: RandomSource::new(seed),
        }
    }

    /// Declare an array filled with standard-normal samples
    pub fn declare_array(&mut self, name: impl Into<String>, shape: Shape) {
        let array = Array::random(shape, &mut self.random);
        self.leaves.insert(name.into(), Leaf::Array(array));
    }

    pub fn declare_scalar(&mut self, name: impl Into<String>, value: f32) {
        self.leaves.insert(name.into(), Leaf::Scalar(Scalar::new(value)));
    }

    pub fn insert(&mut self, name: impl Into<String>, leaf: Leaf) {
        self.leaves.insert(name.into(), leaf);
    }

    pub fn get(&self, name: &str) -> Option<&Leaf> {
        self.leaves.get(name)
    }

    pub fn array(&self, name: &str) -> Option<&Array> {
        match self.leaves.get(name) {
            Some(Leaf::Array(array)) => Some(array),
            _ => None,
        }
    }

    pub fn scalar(&self, name: &str) -> Option<&Scalar> {
        match self.leaves.get(name) {
            Some(Leaf::Scalar(scalar)) => Some(scalar),
            _ => None,
        }
    }

    /// Names in sorted order
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.leaves.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Outcome of one statement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatementResult {
    pub target: String,
    pub shape: Shape,
    pub kernel: KernelSource,
    /// Destination contents, present when the kernel was run
    pub values: Option<Vec<f32>>,
}

/// Lowers and compiles statements against a workspace
pub struct Analyzer<B: Backend = CpuBackend> {
    runtime: Runtime<B>,
    execute: bool,
}

impl Analyzer<CpuBackend> {
    pub fn new(config: KernelConfig, launch: LaunchConfig, execute: bool) -> CompileResult<Self> {
        let backend = CpuBackend::new(launch)?;
        Ok(Self::with_runtime(Runtime::new(config, backend), execute))
    }
}

impl<B: Backend> Analyzer<B> {
    pub fn with_runtime(runtime: Runtime<B>, execute: bool) -> Self {
        Self { runtime, execute }
    }

    pub fn runtime(&self) -> &Runtime<B> {
        &self.runtime
    }

    /// Run every statement in order
    pub fn analyze(
        &self,
        program: &Program,
        workspace: &mut Workspace,
    ) -> CompileResult<Vec<StatementResult>> {
        program
            .statements
            .iter()
            .map(|statement| self.analyze_statement(statement, workspace))
            .collect()
    }

    /// Compile one statement and store its destination under the target name
    pub fn analyze_statement(
        &self,
        statement: &Statement,
        workspace: &mut Workspace,
    ) -> CompileResult<StatementResult> {
        let literals = collect_literals(&statement.value)?;

        let (dest, kernel) = {
            let mut cursor = 0;
            let expr = lower(&statement.value, workspace, &literals, &mut cursor)?;

            let shape = expr.result_shape();
            let mut dest = if shape.is_scalar() {
                Leaf::Scalar(Scalar::default())
            } else {
                Leaf::Array(Array::zeros(shape))
            };

            let mut target = dest.as_target();
            let Compilation { kernel, inputs } = self.runtime.compile(&expr, &target)?;
            if self.execute {
                self.runtime
                    .backend()
                    .execute(&kernel, target.buffer_mut(), &inputs)?;
            }
            (dest, kernel)
        };

        debug!("{} = {} value(s) of shape {}", statement.target, dest.data().len(), dest.shape());
        let result = StatementResult {
            target: statement.target.clone(),
            shape: dest.shape(),
            kernel,
            values: self.execute.then(|| dest.data().to_vec()),
        };
        workspace.insert(statement.target.clone(), dest);
        Ok(result)
    }
}

/// Array literals of `expr` in evaluation order
fn collect_literals(expr: &ast::Expr) -> CompileResult<Vec<Array>> {
    let mut literals = Vec::new();
    expr.walk(&mut |node| {
        if let ast::Expr::Array(literal) = node {
            literals.push(literal);
        }
    });

    literals
        .into_iter()
        .map(|literal| {
            let shape = Shape::new(literal.dims.clone())?;
            Array::from_vec(shape, literal.values.iter().map(|&v| v as f32).collect())
        })
        .collect()
}

fn lower<'w>(
    expr: &ast::Expr,
    workspace: &'w Workspace,
    literals: &'w [Array],
    cursor: &mut usize,
) -> CompileResult<ir::Expr<'w>> {
    match expr {
        ast::Expr::Variable(name) => workspace
            .get(name)
            .map(Leaf::as_expr)
            .ok_or_else(|| CompileError::undefined(name.clone())),
        ast::Expr::Number(n) => Ok(ir::Expr::literal(*n as f32)),
        ast::Expr::Array(_) => {
            let array = literals
                .get(*cursor)
                .ok_or_else(|| CompileError::codegen("array literal was not materialized"))?;
            *cursor += 1;
            Ok(ir::Expr::Array(array))
        }
        ast::Expr::Binary { op, left, right } => {
            let left = lower(left, workspace, literals, cursor)?;
            let right = lower(right, workspace, literals, cursor)?;
            ir::Expr::binary(*op, left, right)
        }
        ast::Expr::Sum(inner) => {
            let inner = lower(inner, workspace, literals, cursor)?;
            ir::Expr::unary(UnaryOp::Sum, inner)
        }
    }
}
