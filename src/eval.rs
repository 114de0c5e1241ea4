//! Evaluation protocol
//!
//! Walks an expression tree left to right, depth first. Each leaf becomes
//! a kernel parameter (its buffer is appended to the ordered buffer list in
//! the same order) and each operation node is applied to the values its
//! children left on the generator's stack.

use crate::codegen::{CodeGenerator, Value};
use crate::error::{CompileError, CompileResult};
use crate::ir::{Expr, UnaryOp};

/// Evaluate `expr` into `generator`, collecting leaf buffers in parameter order
pub fn evaluate<'b>(
    expr: &'b Expr<'_>,
    generator: &mut CodeGenerator,
    buffers: &mut Vec<&'b [f32]>,
) -> CompileResult<Value> {
    match expr {
        Expr::Array(array) => {
            buffers.push(array.data());
            Ok(generator.add_iterable(array.shape()))
        }
        Expr::Scalar(scalar) => {
            buffers.push(scalar.data());
            Ok(generator.add_constant())
        }
        Expr::Literal(scalar) => {
            buffers.push(scalar.data());
            Ok(generator.add_constant())
        }
        Expr::Binary(node) => {
            evaluate(node.left(), generator, buffers)?;
            evaluate(node.right(), generator, buffers)?;
            generator.apply_binary(node.op())
        }
        Expr::Unary(node) => match node.op() {
            UnaryOp::Sum => {
                evaluate(node.operand(), generator, buffers)?;
                generator.apply_reduce()
            }
            op => Err(CompileError::unsupported(format!(
                "no code generation rule for {}",
                op.name()
            ))),
        },
    }
}
