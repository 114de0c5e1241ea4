//! Kernel code generator
//!
//! The generator is the compilation context for one assignment. The tree
//! walk in [`crate::eval`] pushes symbolic references onto an evaluation
//! stack and applies operators to the top entries; the generator turns each
//! step into kernel directives, opening a loop nest over the first array
//! shape it meets and allocating scratch temporaries from a free list.

use std::collections::HashSet;
use std::fmt;

use log::trace;

use crate::error::{CompileError, CompileResult};
use crate::ir::BinaryOp;
use crate::kernel::{KernelConfig, KernelSource, Param};
use crate::shape::Shape;

/// Symbolic reference on the evaluation stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Element of an array parameter, indexed by the active loop nest
    ArrayElement { name: String, shape: Shape },
    /// Single-element parameter, read through a dereference
    Constant { name: String },
    /// Scratch temporary
    ///
    /// `nest` is the loop nest whose indices the value depends on, `None`
    /// for loop-invariant values. `written_in` is the nest its assignment
    /// was emitted in.
    Local {
        name: String,
        nest: Option<usize>,
        written_in: Option<usize>,
    },
    /// Running reduction result
    Accumulator { name: String },
}

impl Value {
    pub fn name(&self) -> &str {
        match self {
            Value::ArrayElement { name, .. }
            | Value::Constant { name }
            | Value::Local { name, .. }
            | Value::Accumulator { name } => name,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Value::Local { .. })
    }

    pub fn is_accumulator(&self) -> bool {
        matches!(self, Value::Accumulator { .. })
    }

    /// Whether the value changes from one loop iteration to the next
    pub fn is_varying(&self) -> bool {
        matches!(
            self,
            Value::ArrayElement { .. } | Value::Local { nest: Some(_), .. }
        )
    }
}

/// One line of the kernel body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    For { index: String, bound: usize },
    Open,
    Close,
    Assign { target: String, value: String },
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::For { index, bound } => {
                write!(f, "for(int {0} = 0; {0} < {1}; {0}++)", index, bound)
            }
            Directive::Open => write!(f, "{{"),
            Directive::Close => write!(f, "}}"),
            Directive::Assign { target, value } => write!(f, "{} = {};", target, value),
        }
    }
}

/// The loop nest currently open in the kernel body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopNest {
    id: usize,
    shape: Shape,
    /// Index variable and row-major stride, outermost first
    indices: Vec<(String, usize)>,
}

impl LoopNest {
    fn new(id: usize, shape: Shape) -> Self {
        let indices = shape
            .strides()
            .into_iter()
            .enumerate()
            .map(|(axis, stride)| (format!("i{}", axis), stride))
            .collect();
        Self { id, shape, indices }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Flattened element offset, e.g. `i0*12 + i1*4 + i2`
    pub fn element_offset(&self) -> String {
        match self.indices.split_last() {
            None => "0".to_string(),
            Some(((innermost, _), outer)) => {
                let mut terms: Vec<String> = outer
                    .iter()
                    .map(|(index, stride)| format!("{}*{}", index, stride))
                    .collect();
                terms.push(innermost.clone());
                terms.join(" + ")
            }
        }
    }
}

#[derive(Debug, Clone)]
struct AccumulatorSlot {
    name: String,
    /// Declared but not yet written by the accumulation
    pending: bool,
}

/// Compilation context for a single assignment
pub struct CodeGenerator {
    config: KernelConfig,
    symbols: usize,
    nests: usize,
    stack: Vec<Value>,
    params: Vec<Param>,
    locals: Vec<String>,
    free_locals: Vec<String>,
    accumulator: Option<AccumulatorSlot>,
    current_loop: Option<LoopNest>,
    directives: Vec<Directive>,
}

impl CodeGenerator {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            symbols: 0,
            nests: 0,
            stack: Vec::new(),
            params: Vec::new(),
            locals: Vec::new(),
            free_locals: Vec::new(),
            accumulator: None,
            current_loop: None,
            directives: Vec::new(),
        }
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn locals(&self) -> &[String] {
        &self.locals
    }

    pub fn free_locals(&self) -> &[String] {
        &self.free_locals
    }

    pub fn current_loop(&self) -> Option<&LoopNest> {
        self.current_loop.as_ref()
    }

    /// Register an array parameter and push a reference to its element
    pub fn add_iterable(&mut self, shape: &Shape) -> Value {
        let name = self.fresh_symbol("A");
        self.params.push(Param::array(name.clone(), shape.size()));
        self.ensure_loop(shape);

        let value = Value::ArrayElement {
            name,
            shape: shape.clone(),
        };
        self.stack.push(value.clone());
        value
    }

    /// Register a single-element parameter and push its dereference
    pub fn add_constant(&mut self) -> Value {
        let name = self.fresh_symbol("C");
        self.params.push(Param::constant(name.clone()));

        let value = Value::Constant { name };
        self.stack.push(value.clone());
        value
    }

    /// Pop two operands, emit `dest = left op right;` and push `dest`
    pub fn apply_binary(&mut self, op: BinaryOp) -> CompileResult<Value> {
        let right = self.pop()?;
        let left = self.pop()?;

        let left_text = self.operand_text(&left)?;
        let right_text = self.operand_text(&right)?;
        let varying = left.is_varying() || right.is_varying();

        // Consumed temporaries may be reused as the destination
        self.release(&left);
        self.release(&right);

        let accumulate = (left.is_accumulator() || right.is_accumulator())
            && matches!(&self.accumulator, Some(slot) if slot.pending);
        let dest = if accumulate {
            self.claim_accumulator()?
        } else {
            self.take_local(varying)?
        };

        self.emit(Directive::Assign {
            target: dest.name().to_string(),
            value: format!("{} {} {}", left_text, op.symbol(), right_text),
        });
        self.stack.push(dest.clone());
        Ok(dest)
    }

    /// Accumulate the top of the stack into the global accumulator
    ///
    /// The accumulation runs inside the nest that produced the operand and
    /// the nest is closed afterwards, leaving the accumulator on the stack.
    pub fn apply_reduce(&mut self) -> CompileResult<Value> {
        if self.accumulator.is_some() {
            return Err(CompileError::unsupported(
                "only one reduction can be compiled into a kernel",
            ));
        }

        let loop_bound = match self.stack.last() {
            Some(value) => value.is_varying(),
            None => return Err(CompileError::codegen("evaluation stack underflow")),
        };
        if !loop_bound {
            // A loop-invariant operand is accumulated exactly once
            self.close_loop();
        }

        let name = self.fresh_symbol("G");
        self.accumulator = Some(AccumulatorSlot {
            name: name.clone(),
            pending: true,
        });
        self.stack.push(Value::Accumulator { name });
        self.swap()?;

        let result = self.apply_binary(BinaryOp::Add)?;
        self.close_loop();
        Ok(result)
    }

    /// Exchange the two topmost stack entries
    pub fn swap(&mut self) -> CompileResult<()> {
        let len = self.stack.len();
        if len < 2 {
            return Err(CompileError::codegen("swap needs two stack entries"));
        }
        self.stack.swap(len - 1, len - 2);
        Ok(())
    }

    /// Close the active loop nest, if any, and recycle idle temporaries
    pub fn close_loop(&mut self) {
        if self.current_loop.take().is_none() {
            return;
        }
        self.emit(Directive::Close);

        let live: HashSet<&str> = self
            .stack
            .iter()
            .filter(|value| value.is_local())
            .map(Value::name)
            .collect();
        self.free_locals = self
            .locals
            .iter()
            .rev()
            .filter(|name| !live.contains(name.as_str()))
            .cloned()
            .collect();
    }

    /// Emit the final assignment of the expression into the destination
    ///
    /// The stack must hold exactly the destination reference and the
    /// expression's value.
    pub fn finish(&mut self) -> CompileResult<()> {
        let value = self.pop()?;
        let dest = self.pop()?;
        if !self.stack.is_empty() {
            return Err(CompileError::codegen(format!(
                "{} values left on the evaluation stack",
                self.stack.len()
            )));
        }

        let target = match &dest {
            Value::ArrayElement { .. } | Value::Constant { .. } => self.operand_text(&dest)?,
            other => {
                return Err(CompileError::codegen(format!(
                    "destination {} is not a kernel parameter",
                    other.name()
                )))
            }
        };
        let value = self.operand_text(&value)?;

        self.emit(Directive::Assign { target, value });
        Ok(())
    }

    /// Render the complete kernel
    pub fn render(mut self) -> KernelSource {
        if self.current_loop.is_some() {
            self.close_loop();
        }

        let params = self
            .params
            .iter()
            .map(|param| format!("__global float* {}", param.name))
            .collect::<Vec<_>>()
            .join(", ");

        let mut lines = vec![format!("__kernel void {}({}){{", self.config.kernel_name, params)];
        if let Some(slot) = &self.accumulator {
            lines.push(format!("float {} = 0;", slot.name));
        }
        lines.extend(self.locals.iter().map(|name| format!("float {};", name)));
        lines.extend(self.directives.iter().map(Directive::to_string));
        lines.push("}".to_string());

        let source = lines.join("\n");
        trace!("generated kernel:\n{}", source);

        KernelSource {
            name: self.config.kernel_name,
            params: self.params,
            temporaries: self.locals.len(),
            has_accumulator: self.accumulator.is_some(),
            source,
        }
    }

    fn fresh_symbol(&mut self, prefix: &str) -> String {
        let name = format!("{}{}", prefix, self.symbols);
        self.symbols += 1;
        name
    }

    fn emit(&mut self, directive: Directive) {
        self.directives.push(directive);
    }

    fn pop(&mut self) -> CompileResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| CompileError::codegen("evaluation stack underflow"))
    }

    /// Make sure a nest over `shape` is open, replacing a nest of another shape
    fn ensure_loop(&mut self, shape: &Shape) {
        match &self.current_loop {
            Some(nest) if nest.shape == *shape => {}
            Some(_) => {
                self.close_loop();
                self.open_loop(shape);
            }
            None => self.open_loop(shape),
        }
    }

    fn open_loop(&mut self, shape: &Shape) {
        let nest = LoopNest::new(self.nests, shape.clone());
        self.nests += 1;

        for ((index, _), &bound) in nest.indices.iter().zip(shape.dims()) {
            self.directives.push(Directive::For {
                index: index.clone(),
                bound,
            });
        }
        self.emit(Directive::Open);
        self.current_loop = Some(nest);
    }

    /// Text for reading (or writing) a value at the current point
    fn operand_text(&mut self, value: &Value) -> CompileResult<String> {
        match value {
            Value::ArrayElement { name, shape } => {
                self.ensure_loop(shape);
                let offset = self
                    .current_loop
                    .as_ref()
                    .map(LoopNest::element_offset)
                    .ok_or_else(|| CompileError::codegen("no loop nest for array access"))?;
                Ok(format!("{}[{}]", name, offset))
            }
            Value::Constant { name } => Ok(format!("*{}", name)),
            Value::Local {
                name,
                nest: Some(id),
                ..
            } => {
                if self.current_loop.as_ref().map(LoopNest::id) != Some(*id) {
                    return Err(CompileError::unsupported(format!(
                        "temporary {} belongs to a loop nest that a reduction already closed",
                        name
                    )));
                }
                Ok(name.clone())
            }
            Value::Local { name, nest: None, .. } => Ok(name.clone()),
            Value::Accumulator { name } => Ok(name.clone()),
        }
    }

    /// Return a consumed temporary to the free list
    ///
    /// A temporary written before the active nest opened is read again on
    /// every iteration, so it stays idle until the nest closes.
    fn release(&mut self, value: &Value) {
        if let Value::Local {
            name, written_in, ..
        } = value
        {
            let current = self.current_loop.as_ref().map(LoopNest::id);
            if current.is_none() || *written_in == current {
                self.free_locals.push(name.clone());
            }
        }
    }

    fn claim_accumulator(&mut self) -> CompileResult<Value> {
        let slot = self
            .accumulator
            .as_mut()
            .ok_or_else(|| CompileError::codegen("no accumulator declared"))?;
        slot.pending = false;
        Ok(Value::Accumulator {
            name: slot.name.clone(),
        })
    }

    fn take_local(&mut self, varying: bool) -> CompileResult<Value> {
        let written_in = self.current_loop.as_ref().map(LoopNest::id);
        let nest = if varying { written_in } else { None };
        if let Some(name) = self.free_locals.pop() {
            return Ok(Value::Local {
                name,
                nest,
                written_in,
            });
        }

        if self.locals.len() >= self.config.max_temporaries {
            return Err(CompileError::codegen(format!(
                "temporary pool exhausted ({} slots)",
                self.config.max_temporaries
            )));
        }
        let name = self.fresh_symbol("L");
        self.locals.push(name.clone());
        Ok(Value::Local {
            name,
            nest,
            written_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn shape(dims: &[usize]) -> Shape {
        Shape::new(dims.to_vec()).unwrap()
    }

    fn generator() -> CodeGenerator {
        CodeGenerator::new(KernelConfig::default())
    }

    #[test]
    fn test_elementwise_kernel_text() {
        let mut gen = generator();
        gen.add_iterable(&shape(&[2, 2]));
        gen.add_iterable(&shape(&[2, 2]));
        gen.add_iterable(&shape(&[2, 2]));
        gen.apply_binary(BinaryOp::Add).unwrap();
        gen.finish().unwrap();

        let kernel = gen.render();
        assert_eq!(
            kernel.source,
            "__kernel void executable(__global float* A0, __global float* A1, __global float* A2){\n\
             float L3;\n\
             for(int i0 = 0; i0 < 2; i0++)\n\
             for(int i1 = 0; i1 < 2; i1++)\n\
             {\n\
             L3 = A1[i0*2 + i1] + A2[i0*2 + i1];\n\
             A0[i0*2 + i1] = L3;\n\
             }\n\
             }"
        );
        assert_eq!(kernel.temporaries, 1);
        assert!(!kernel.has_accumulator);
    }

    #[test]
    fn test_constant_is_dereferenced() {
        let mut gen = generator();
        gen.add_iterable(&shape(&[3]));
        gen.add_iterable(&shape(&[3]));
        gen.add_constant();
        gen.apply_binary(BinaryOp::Mul).unwrap();

        assert_eq!(
            gen.directives().last(),
            Some(&Directive::Assign {
                target: "L3".to_string(),
                value: "A1[i0] * *C2".to_string(),
            })
        );
    }

    #[test]
    fn test_offsets_use_row_major_strides() {
        let nest = LoopNest::new(0, shape(&[2, 3, 4]));
        assert_eq!(nest.element_offset(), "i0*12 + i1*4 + i2");
        assert_eq!(LoopNest::new(1, shape(&[5])).element_offset(), "i0");
        assert_eq!(LoopNest::new(2, Shape::scalar()).element_offset(), "0");
    }

    #[test]
    fn test_temporaries_are_reused() {
        // dest = (a * b) + (c * d)
        let mut gen = generator();
        for _ in 0..3 {
            gen.add_iterable(&shape(&[4]));
        }
        gen.apply_binary(BinaryOp::Mul).unwrap();
        gen.add_iterable(&shape(&[4]));
        gen.add_iterable(&shape(&[4]));
        gen.apply_binary(BinaryOp::Mul).unwrap();
        let sum = gen.apply_binary(BinaryOp::Add).unwrap();

        assert_eq!(gen.locals(), &["L3".to_string(), "L6".to_string()]);
        assert_eq!(sum.name(), "L6");
        assert_eq!(
            gen.directives().last(),
            Some(&Directive::Assign {
                target: "L6".to_string(),
                value: "L3 + L6".to_string(),
            })
        );
        // L3 went back to the free list
        assert_eq!(gen.free_locals(), &["L3".to_string()]);
    }

    #[test]
    fn test_reduce_targets_accumulator_and_closes_loop() {
        let mut gen = generator();
        gen.add_constant();
        gen.add_iterable(&shape(&[3]));
        let result = gen.apply_reduce().unwrap();

        assert_eq!(result, Value::Accumulator { name: "G2".to_string() });
        assert!(gen.current_loop().is_none());
        assert_eq!(
            gen.directives(),
            &[
                Directive::For { index: "i0".to_string(), bound: 3 },
                Directive::Open,
                Directive::Assign {
                    target: "G2".to_string(),
                    value: "G2 + A1[i0]".to_string(),
                },
                Directive::Close,
            ]
        );

        gen.finish().unwrap();
        let kernel = gen.render();
        assert_eq!(
            kernel.source,
            "__kernel void executable(__global float* C0, __global float* A1){\n\
             float G2 = 0;\n\
             for(int i0 = 0; i0 < 3; i0++)\n\
             {\n\
             G2 = G2 + A1[i0];\n\
             }\n\
             *C0 = G2;\n\
             }"
        );
    }

    #[test]
    fn test_reduce_of_temporary_accumulates() {
        // dest = (a * 2).sum()
        let mut gen = generator();
        gen.add_constant();
        gen.add_iterable(&shape(&[4]));
        gen.add_constant();
        gen.apply_binary(BinaryOp::Mul).unwrap();
        gen.apply_reduce().unwrap();

        assert!(gen.directives().contains(&Directive::Assign {
            target: "G4".to_string(),
            value: "G4 + L3".to_string(),
        }));
        // The loop closed with nothing live, so L3 is idle again
        assert_eq!(gen.free_locals(), &["L3".to_string()]);
    }

    #[test]
    fn test_reduced_value_broadcasts_into_array_destination() {
        let mut gen = generator();
        gen.add_iterable(&shape(&[2]));
        gen.add_iterable(&shape(&[3]));
        gen.apply_reduce().unwrap();
        gen.finish().unwrap();

        let lines: Vec<String> = gen.directives().iter().map(|d| d.to_string()).collect();
        assert_eq!(
            lines,
            vec![
                "for(int i0 = 0; i0 < 2; i0++)",
                "{",
                "}",
                "for(int i0 = 0; i0 < 3; i0++)",
                "{",
                "G2 = G2 + A1[i0];",
                "}",
                "for(int i0 = 0; i0 < 2; i0++)",
                "{",
                "A0[i0] = G2;",
            ]
        );
    }

    #[test]
    fn test_invariant_temporary_is_not_overwritten_inside_loop() {
        // dest = ((s * 2) + a).sum()
        let mut gen = generator();
        gen.add_constant();
        gen.add_constant();
        gen.add_constant();
        let scaled = gen.apply_binary(BinaryOp::Mul).unwrap();
        assert_eq!(
            scaled,
            Value::Local {
                name: "L3".to_string(),
                nest: None,
                written_in: None,
            }
        );

        gen.add_iterable(&shape(&[3]));
        gen.apply_binary(BinaryOp::Add).unwrap();
        // L3 is read on every iteration, so it cannot hold the sum
        assert!(gen.free_locals().is_empty());

        gen.apply_reduce().unwrap();
        gen.finish().unwrap();
        assert_eq!(
            gen.render().source,
            "__kernel void executable(__global float* C0, __global float* C1, __global float* C2, __global float* A4){\n\
             float G6 = 0;\n\
             float L3;\n\
             float L5;\n\
             L3 = *C1 * *C2;\n\
             for(int i0 = 0; i0 < 3; i0++)\n\
             {\n\
             L5 = L3 + A4[i0];\n\
             G6 = G6 + L5;\n\
             }\n\
             *C0 = G6;\n\
             }"
        );
    }

    #[test]
    fn test_invariant_reduction_runs_outside_destination_loop() {
        // dest[3] = (s * 2).sum()
        let mut gen = generator();
        gen.add_iterable(&shape(&[3]));
        gen.add_constant();
        gen.add_constant();
        let scaled = gen.apply_binary(BinaryOp::Mul).unwrap();
        assert!(!scaled.is_varying());

        gen.apply_reduce().unwrap();
        gen.finish().unwrap();

        let lines: Vec<String> = gen.directives().iter().map(|d| d.to_string()).collect();
        assert_eq!(
            lines,
            vec![
                "for(int i0 = 0; i0 < 3; i0++)",
                "{",
                "L3 = *C1 * *C2;",
                "}",
                "G4 = G4 + L3;",
                "for(int i0 = 0; i0 < 3; i0++)",
                "{",
                "A0[i0] = G4;",
            ]
        );
    }

    #[test]
    fn test_reduced_value_feeds_later_loop() {
        // dest[3] = a.sum() * 2 + b
        let mut gen = generator();
        gen.add_iterable(&shape(&[3]));
        gen.add_iterable(&shape(&[3]));
        gen.apply_reduce().unwrap();
        gen.add_constant();
        gen.apply_binary(BinaryOp::Mul).unwrap();
        gen.add_iterable(&shape(&[3]));
        let sum = gen.apply_binary(BinaryOp::Add).unwrap();
        assert!(sum.is_varying());
        gen.finish().unwrap();

        let lines: Vec<String> = gen.directives().iter().map(|d| d.to_string()).collect();
        assert_eq!(
            lines,
            vec![
                "for(int i0 = 0; i0 < 3; i0++)",
                "{",
                "G2 = G2 + A1[i0];",
                "}",
                "L4 = G2 * *C3;",
                "for(int i0 = 0; i0 < 3; i0++)",
                "{",
                "L6 = L4 + A5[i0];",
                "A0[i0] = L6;",
            ]
        );
    }

    #[test]
    fn test_second_reduction_rejected() {
        let mut gen = generator();
        gen.add_constant();
        gen.add_iterable(&shape(&[3]));
        gen.apply_reduce().unwrap();
        gen.add_iterable(&shape(&[3]));
        assert!(matches!(
            gen.apply_reduce(),
            Err(CompileError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn test_stale_temporary_rejected() {
        // (b * 2) + a.sum(): the product lives in a nest the reduction closes
        let mut gen = generator();
        gen.add_iterable(&shape(&[3]));
        gen.add_iterable(&shape(&[3]));
        gen.add_constant();
        gen.apply_binary(BinaryOp::Mul).unwrap();
        gen.add_iterable(&shape(&[3]));
        gen.apply_reduce().unwrap();
        assert!(matches!(
            gen.apply_binary(BinaryOp::Add),
            Err(CompileError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn test_temporary_pool_is_capped() {
        let mut gen = CodeGenerator::new(KernelConfig::new("k", 1));
        for _ in 0..4 {
            gen.add_iterable(&shape(&[2]));
        }
        gen.apply_binary(BinaryOp::Add).unwrap();
        gen.swap().unwrap();
        // Two live temporaries would be needed now
        gen.add_iterable(&shape(&[2]));
        assert!(matches!(
            gen.apply_binary(BinaryOp::Add),
            Err(CompileError::CodeGen { .. })
        ));
    }

    #[test]
    fn test_stack_underflow() {
        let mut gen = generator();
        gen.add_constant();
        assert!(matches!(
            gen.apply_binary(BinaryOp::Sub),
            Err(CompileError::CodeGen { .. })
        ));
    }
}
