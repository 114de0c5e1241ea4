//! Deferred array expressions compiled to data-parallel kernels
//!
//! Applying `+ - * /` to arrays and scalars only builds an expression tree.
//! Assigning the tree to a destination compiles it into kernel source and
//! hands the kernel plus its buffers to a [`Backend`], which writes the
//! result into the destination.
//!
//! # Example
//!
//! ```rust
//! use array_kernels::{assign, Array, Shape};
//!
//! let shape = Shape::new([2, 2]).unwrap();
//! let a = Array::from_vec(shape.clone(), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
//! let b = Array::filled(shape.clone(), 10.0);
//! let mut c = Array::zeros(shape);
//!
//! let expr = (&a + &b).unwrap();
//! assign(&expr, &mut c).unwrap();
//! assert_eq!(c.data(), &[11.0, 12.0, 13.0, 14.0]);
//! ```

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod analyzer;
pub mod shape;
pub mod ir;
pub mod eval;
pub mod codegen;
pub mod kernel;
pub mod backend;
pub mod error;

use std::time::Instant;

use log::debug;

pub use analyzer::{Analyzer, Workspace};
pub use backend::{Backend, CpuBackend, LaunchConfig};
pub use codegen::CodeGenerator;
pub use error::{BackendError, BackendResult, CompileError, CompileResult};
pub use ir::{Array, BinaryOp, Child, Expr, RandomSource, Scalar, UnaryOp};
pub use kernel::{KernelConfig, KernelSource, Param, ParamKind};
pub use parser::Parser;
pub use shape::Shape;

/// Destination of an assignment
#[derive(Debug)]
pub enum Target<'d> {
    Array(&'d mut Array),
    Scalar(&'d mut Scalar),
}

impl<'d> Target<'d> {
    pub fn shape(&self) -> Shape {
        match self {
            Target::Array(array) => array.shape().clone(),
            Target::Scalar(_) => Shape::scalar(),
        }
    }

    pub fn buffer(&self) -> &[f32] {
        match self {
            Target::Array(array) => array.data(),
            Target::Scalar(scalar) => scalar.data(),
        }
    }

    pub fn buffer_mut(&mut self) -> &mut [f32] {
        match self {
            Target::Array(array) => array.data_mut(),
            Target::Scalar(scalar) => scalar.data_mut(),
        }
    }
}

impl<'d> From<&'d mut Array> for Target<'d> {
    fn from(array: &'d mut Array) -> Self {
        Target::Array(array)
    }
}

impl<'d> From<&'d mut Scalar> for Target<'d> {
    fn from(scalar: &'d mut Scalar) -> Self {
        Target::Scalar(scalar)
    }
}

/// A compiled assignment: the kernel and the input buffers it binds
///
/// The destination buffer is parameter 0 and is not part of `inputs`.
#[derive(Debug, Clone, PartialEq)]
pub struct Compilation<'b> {
    pub kernel: KernelSource,
    pub inputs: Vec<&'b [f32]>,
}

/// Reject destinations the expression's value cannot be written into
fn check_destination(expr: &Expr<'_>, target: &Target<'_>) -> CompileResult<()> {
    let value = expr.result_shape();
    if value.is_scalar() {
        // Scalars broadcast into any destination
        return Ok(());
    }
    match target {
        Target::Array(array) if array.shape() == &value => Ok(()),
        other => Err(CompileError::shape_mismatch(other.shape(), value)),
    }
}

/// Compile `expr` for assignment into `target`
pub fn compile<'b>(
    expr: &'b Expr<'_>,
    target: &Target<'_>,
    config: &KernelConfig,
) -> CompileResult<Compilation<'b>> {
    check_destination(expr, target)?;

    let mut generator = CodeGenerator::new(config.clone());
    match target {
        Target::Array(array) => generator.add_iterable(array.shape()),
        Target::Scalar(_) => generator.add_constant(),
    };

    let mut inputs = Vec::new();
    eval::evaluate(expr, &mut generator, &mut inputs)?;
    generator.finish()?;

    let kernel = generator.render();
    debug!(
        "compiled '{}': {} parameters, {} temporaries",
        kernel.name,
        kernel.params.len(),
        kernel.temporaries
    );
    Ok(Compilation { kernel, inputs })
}

/// Compile `expr` with the default configuration and run it on the CPU backend
pub fn assign<'d>(expr: &Expr<'_>, target: impl Into<Target<'d>>) -> CompileResult<()> {
    Runtime::<CpuBackend>::default().assign(expr, target)
}

impl<'a> Expr<'a> {
    /// Evaluate this expression into `target`
    pub fn assign_to<'d>(&self, target: impl Into<Target<'d>>) -> CompileResult<()> {
        assign(self, target)
    }
}

/// Kernel configuration paired with the backend that runs the kernels
pub struct Runtime<B: Backend = CpuBackend> {
    config: KernelConfig,
    backend: B,
}

impl<B: Backend> Runtime<B> {
    pub fn new(config: KernelConfig, backend: B) -> Self {
        Self { config, backend }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn compile<'b>(
        &self,
        expr: &'b Expr<'_>,
        target: &Target<'_>,
    ) -> CompileResult<Compilation<'b>> {
        compile(expr, target, &self.config)
    }

    /// Compile `expr` and have the backend write its value into `target`
    pub fn assign<'d>(&self, expr: &Expr<'_>, target: impl Into<Target<'d>>) -> CompileResult<()> {
        let mut target = target.into();
        let started = Instant::now();
        let Compilation { kernel, inputs } = self.compile(expr, &target)?;
        let compiled = started.elapsed();

        debug!("dispatching '{}' with {} inputs", kernel.name, inputs.len());
        self.backend
            .execute(&kernel, target.buffer_mut(), &inputs)?;
        debug!(
            "'{}' compiled in {:?}, executed in {:?}",
            kernel.name,
            compiled,
            started.elapsed() - compiled
        );
        Ok(())
    }
}

impl Default for Runtime<CpuBackend> {
    fn default() -> Self {
        Self::new(KernelConfig::default(), CpuBackend::default())
    }
}
