//! Host CPU backend
//!
//! Kernels are parsed once, linked to buffer and variable slots and cached
//! by source text. A launch runs `work_items` execution units on a rayon
//! pool; every unit runs the whole body against a private copy of the
//! output buffer, and the copies must agree bit for bit before the result
//! is written back.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use rayon::prelude::*;

use super::parse::{parse_kernel, Operand, Place, Rhs, Statement};
use super::{Backend, LaunchConfig};
use crate::error::{BackendError, BackendResult};
use crate::ir::BinaryOp;
use crate::kernel::KernelSource;

/// Flattened offset: `constant + sum(index[slot] * scale)`
#[derive(Debug, Clone, PartialEq)]
struct Offset {
    terms: Vec<(usize, usize)>,
    constant: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Element { param: usize, offset: Offset },
    Deref(usize),
    Local(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Source {
    Slot(Slot),
    Number(f32),
}

#[derive(Debug, Clone, PartialEq)]
enum Instruction {
    Loop {
        index: usize,
        start: usize,
        bound: usize,
        body: Vec<Instruction>,
    },
    Copy {
        target: Slot,
        value: Source,
    },
    Binary {
        target: Slot,
        op: BinaryOp,
        left: Source,
        right: Source,
    },
}

/// A kernel resolved against its parameter list
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedKernel {
    name: String,
    params: usize,
    locals: Vec<f32>,
    indices: usize,
    body: Vec<Instruction>,
}

impl LinkedKernel {
    /// Parse and link kernel text
    pub fn compile(source: &str) -> BackendResult<Self> {
        let program = parse_kernel(source)?;

        let mut linker = Linker {
            params: program
                .params
                .iter()
                .enumerate()
                .map(|(slot, name)| (name.clone(), slot))
                .collect(),
            locals: HashMap::new(),
            scope: Vec::new(),
            depth: 0,
        };
        if linker.params.len() != program.params.len() {
            return Err(BackendError::compile("duplicate kernel parameter"));
        }

        let mut locals = Vec::with_capacity(program.declarations.len());
        for decl in &program.declarations {
            if linker.params.contains_key(&decl.name)
                || linker.locals.insert(decl.name.clone(), locals.len()).is_some()
            {
                return Err(BackendError::compile(format!(
                    "'{}' is declared twice",
                    decl.name
                )));
            }
            locals.push(decl.init.unwrap_or(0.0));
        }

        let body = linker.link_block(&program.body)?;
        Ok(Self {
            name: program.name,
            params: program.params.len(),
            locals,
            indices: linker.depth,
            body,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_count(&self) -> usize {
        self.params
    }

    /// Run the body once against `output` and `inputs`
    pub fn run(&self, output: &mut [f32], inputs: &[&[f32]]) -> BackendResult<()> {
        let mut unit = Unit {
            output,
            inputs,
            locals: self.locals.clone(),
            indices: vec![0; self.indices],
        };
        unit.run_block(&self.body)
    }
}

struct Linker {
    params: HashMap<String, usize>,
    locals: HashMap<String, usize>,
    /// Loop indices in scope, innermost last
    scope: Vec<(String, usize)>,
    depth: usize,
}

impl Linker {
    fn link_block(&mut self, statements: &[Statement]) -> BackendResult<Vec<Instruction>> {
        statements.iter().map(|s| self.link_statement(s)).collect()
    }

    fn link_statement(&mut self, statement: &Statement) -> BackendResult<Instruction> {
        match statement {
            Statement::Loop {
                index,
                start,
                bound,
                body,
            } => {
                let slot = self.scope.len();
                self.scope.push((index.clone(), slot));
                self.depth = self.depth.max(self.scope.len());
                let body = self.link_block(body);
                self.scope.pop();
                Ok(Instruction::Loop {
                    index: slot,
                    start: *start,
                    bound: *bound,
                    body: body?,
                })
            }
            Statement::Assign { target, value } => {
                let target = self.link_place(target)?;
                match &target {
                    Slot::Element { param, .. } | Slot::Deref(param) if *param != 0 => {
                        return Err(BackendError::compile(format!(
                            "kernel writes to input parameter {}",
                            param
                        )))
                    }
                    _ => {}
                }
                match value {
                    Rhs::Copy(operand) => Ok(Instruction::Copy {
                        target,
                        value: self.link_operand(operand)?,
                    }),
                    Rhs::Binary { op, left, right } => Ok(Instruction::Binary {
                        target,
                        op: *op,
                        left: self.link_operand(left)?,
                        right: self.link_operand(right)?,
                    }),
                }
            }
        }
    }

    fn link_operand(&self, operand: &Operand) -> BackendResult<Source> {
        match operand {
            Operand::Number(n) => Ok(Source::Number(*n)),
            Operand::Place(place) => Ok(Source::Slot(self.link_place(place)?)),
        }
    }

    fn link_place(&self, place: &Place) -> BackendResult<Slot> {
        match place {
            Place::Variable(name) => self
                .locals
                .get(name)
                .map(|&slot| Slot::Local(slot))
                .ok_or_else(|| BackendError::compile(format!("undeclared variable '{}'", name))),
            Place::Deref(name) => Ok(Slot::Deref(self.param(name)?)),
            Place::Element { buffer, offset } => {
                let param = self.param(buffer)?;
                let mut terms = Vec::new();
                let mut constant = 0;
                for term in offset {
                    match &term.index {
                        Some(index) => terms.push((self.index(index)?, term.scale)),
                        None => constant += term.scale,
                    }
                }
                Ok(Slot::Element {
                    param,
                    offset: Offset { terms, constant },
                })
            }
        }
    }

    fn param(&self, name: &str) -> BackendResult<usize> {
        self.params
            .get(name)
            .copied()
            .ok_or_else(|| BackendError::compile(format!("unknown buffer '{}'", name)))
    }

    fn index(&self, name: &str) -> BackendResult<usize> {
        self.scope
            .iter()
            .rev()
            .find(|(index, _)| index == name)
            .map(|&(_, slot)| slot)
            .ok_or_else(|| BackendError::compile(format!("'{}' is not a loop index in scope", name)))
    }
}

/// State of one execution unit
struct Unit<'a, 'b> {
    output: &'a mut [f32],
    inputs: &'a [&'b [f32]],
    locals: Vec<f32>,
    indices: Vec<usize>,
}

impl Unit<'_, '_> {
    fn run_block(&mut self, body: &[Instruction]) -> BackendResult<()> {
        for instruction in body {
            match instruction {
                Instruction::Loop {
                    index,
                    start,
                    bound,
                    body,
                } => {
                    for i in *start..*bound {
                        self.indices[*index] = i;
                        self.run_block(body)?;
                    }
                }
                Instruction::Copy { target, value } => {
                    let value = self.read(value)?;
                    self.write(target, value)?;
                }
                Instruction::Binary {
                    target,
                    op,
                    left,
                    right,
                } => {
                    let value = op.apply(self.read(left)?, self.read(right)?);
                    self.write(target, value)?;
                }
            }
        }
        Ok(())
    }

    fn offset(&self, offset: &Offset) -> usize {
        offset
            .terms
            .iter()
            .fold(offset.constant, |acc, &(slot, scale)| acc + self.indices[slot] * scale)
    }

    fn buffer(&self, param: usize) -> &[f32] {
        if param == 0 {
            &*self.output
        } else {
            self.inputs[param - 1]
        }
    }

    fn read(&self, source: &Source) -> BackendResult<f32> {
        let (param, at) = match source {
            Source::Number(n) => return Ok(*n),
            Source::Slot(Slot::Local(slot)) => return Ok(self.locals[*slot]),
            Source::Slot(Slot::Deref(param)) => (*param, 0),
            Source::Slot(Slot::Element { param, offset }) => (*param, self.offset(offset)),
        };
        self.buffer(param).get(at).copied().ok_or_else(|| {
            BackendError::launch(format!("read of parameter {} at {} is out of bounds", param, at))
        })
    }

    fn write(&mut self, target: &Slot, value: f32) -> BackendResult<()> {
        let at = match target {
            Slot::Local(slot) => {
                self.locals[*slot] = value;
                return Ok(());
            }
            Slot::Deref(_) => 0,
            Slot::Element { offset, .. } => self.offset(offset),
        };
        let len = self.output.len();
        let cell = self.output.get_mut(at).ok_or_else(|| {
            BackendError::launch(format!("write at {} past output of {} elements", at, len))
        })?;
        *cell = value;
        Ok(())
    }
}

/// Runs kernels on the host
pub struct CpuBackend {
    launch: LaunchConfig,
    pool: Option<rayon::ThreadPool>,
    cache: Mutex<HashMap<String, Arc<LinkedKernel>>>,
}

impl CpuBackend {
    pub fn new(launch: LaunchConfig) -> BackendResult<Self> {
        let pool = if launch.threads == 0 {
            None
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(launch.threads)
                .build()
                .map_err(|e| BackendError::device(e.to_string()))?;
            Some(pool)
        };
        Ok(Self {
            launch,
            pool,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn launch(&self) -> &LaunchConfig {
        &self.launch
    }

    /// Number of distinct kernels compiled so far
    pub fn cached_programs(&self) -> usize {
        self.cache.lock().len()
    }

    /// Compile `kernel`, reusing an earlier compilation of the same text
    pub fn program(&self, kernel: &KernelSource) -> BackendResult<Arc<LinkedKernel>> {
        let mut cache = self.cache.lock();
        if let Some(program) = cache.get(&kernel.source) {
            debug!("program cache hit for '{}'", kernel.name);
            return Ok(Arc::clone(program));
        }

        let program = Arc::new(LinkedKernel::compile(&kernel.source)?);
        debug!(
            "compiled kernel '{}' ({} parameters)",
            program.name(),
            program.param_count()
        );
        cache.insert(kernel.source.clone(), Arc::clone(&program));
        Ok(program)
    }

    fn check_bindings(
        &self,
        kernel: &KernelSource,
        program: &LinkedKernel,
        output: &[f32],
        inputs: &[&[f32]],
    ) -> BackendResult<()> {
        if program.param_count() != inputs.len() + 1 {
            return Err(BackendError::launch(format!(
                "kernel takes {} buffers, {} bound",
                program.param_count(),
                inputs.len() + 1
            )));
        }
        let bound = std::iter::once(output.len()).chain(inputs.iter().map(|b| b.len()));
        for (param, len) in kernel.params.iter().zip(bound) {
            if len < param.len {
                return Err(BackendError::launch(format!(
                    "buffer for {} holds {} floats, needs {}",
                    param.name, len, param.len
                )));
            }
        }
        Ok(())
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        // The global pool needs no builder
        Self {
            launch: LaunchConfig::default(),
            pool: None,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl Backend for CpuBackend {
    fn execute(
        &self,
        kernel: &KernelSource,
        output: &mut [f32],
        inputs: &[&[f32]],
    ) -> BackendResult<()> {
        if self.launch.work_items == 0 {
            return Err(BackendError::launch("launch grid has no work items"));
        }

        let program = self.program(kernel)?;
        self.check_bindings(kernel, &program, output, inputs)?;

        debug!(
            "launching '{}' on {} work items",
            program.name(),
            self.launch.work_items
        );

        let initial: &[f32] = output;
        let run_units = || {
            (0..self.launch.work_items)
                .into_par_iter()
                .map(|_| -> BackendResult<Vec<f32>> {
                    let mut private = initial.to_vec();
                    program.run(&mut private, inputs)?;
                    Ok(private)
                })
                .collect::<BackendResult<Vec<Vec<f32>>>>()
        };
        let results = match &self.pool {
            Some(pool) => pool.install(run_units)?,
            None => run_units()?,
        };

        let (first, rest) = results
            .split_first()
            .ok_or_else(|| BackendError::read_back("no execution unit produced a result"))?;
        for (unit, result) in rest.iter().enumerate() {
            let agrees = result
                .iter()
                .zip(first)
                .all(|(a, b)| a.to_bits() == b.to_bits());
            if !agrees {
                return Err(BackendError::read_back(format!(
                    "execution unit {} disagrees with unit 0",
                    unit + 1
                )));
            }
        }

        output.copy_from_slice(first);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Param;
    use pretty_assertions::assert_eq;

    fn kernel(params: Vec<Param>, source: &str) -> KernelSource {
        KernelSource {
            name: "executable".to_string(),
            params,
            temporaries: 0,
            has_accumulator: false,
            source: source.to_string(),
        }
    }

    fn add_kernel() -> KernelSource {
        kernel(
            vec![Param::array("A0", 4), Param::array("A1", 4), Param::array("A2", 4)],
            "__kernel void executable(__global float* A0, __global float* A1, __global float* A2){\n\
             float L3;\n\
             for(int i0 = 0; i0 < 2; i0++)\n\
             for(int i1 = 0; i1 < 2; i1++)\n\
             {\n\
             L3 = A1[i0*2 + i1] + A2[i0*2 + i1];\n\
             A0[i0*2 + i1] = L3;\n\
             }\n\
             }",
        )
    }

    #[test]
    fn test_execute_elementwise() {
        let backend = CpuBackend::default();
        let mut out = vec![0.0; 4];
        backend
            .execute(&add_kernel(), &mut out, &[&[1.0, 2.0, 3.0, 4.0], &[10.0; 4]])
            .unwrap();
        assert_eq!(out, vec![11.0, 12.0, 13.0, 14.0]);
    }

    #[test]
    fn test_execute_reduction() {
        let reduce = kernel(
            vec![Param::constant("C0"), Param::array("A1", 3)],
            "__kernel void executable(__global float* C0, __global float* A1){\n\
             float G2 = 0;\n\
             for(int i0 = 0; i0 < 3; i0++)\n\
             {\n\
             G2 = G2 + A1[i0];\n\
             }\n\
             *C0 = G2;\n\
             }",
        );
        let backend = CpuBackend::new(LaunchConfig::new(3, 2)).unwrap();
        let mut out = vec![0.0];
        backend.execute(&reduce, &mut out, &[&[1.0, 2.0, 3.0]]).unwrap();
        assert_eq!(out, vec![6.0]);
    }

    #[test]
    fn test_programs_are_cached() {
        let backend = CpuBackend::default();
        let kernel = add_kernel();
        let mut out = vec![0.0; 4];
        for _ in 0..3 {
            backend
                .execute(&kernel, &mut out, &[&[0.0; 4], &[1.0; 4]])
                .unwrap();
        }
        assert_eq!(backend.cached_programs(), 1);
    }

    #[test]
    fn test_write_to_input_rejected() {
        let bad = kernel(
            vec![Param::array("A0", 2), Param::array("A1", 2)],
            "__kernel void executable(__global float* A0, __global float* A1){\n\
             for(int i0 = 0; i0 < 2; i0++)\n\
             {\n\
             A1[i0] = A0[i0];\n\
             }\n\
             }",
        );
        let mut out = vec![0.0; 2];
        let result = CpuBackend::default().execute(&bad, &mut out, &[&[1.0, 2.0]]);
        assert!(matches!(result, Err(BackendError::Compile { .. })));
    }

    #[test]
    fn test_out_of_bounds_access() {
        let bad = kernel(
            vec![Param::array("A0", 2), Param::array("A1", 2)],
            "__kernel void executable(__global float* A0, __global float* A1){\n\
             for(int i0 = 0; i0 < 3; i0++)\n\
             {\n\
             A0[i0] = A1[i0];\n\
             }\n\
             }",
        );
        let mut out = vec![0.0; 2];
        let result = CpuBackend::default().execute(&bad, &mut out, &[&[1.0, 2.0]]);
        assert!(matches!(result, Err(BackendError::Launch { .. })));
        // Nothing is written back on failure
        assert_eq!(out, vec![0.0, 0.0]);
    }

    #[test]
    fn test_binding_checks() {
        let backend = CpuBackend::default();
        let mut out = vec![0.0; 4];
        // Missing input
        assert!(matches!(
            backend.execute(&add_kernel(), &mut out, &[&[1.0; 4]]),
            Err(BackendError::Launch { .. })
        ));
        // Short input
        assert!(matches!(
            backend.execute(&add_kernel(), &mut out, &[&[1.0; 4], &[1.0; 2]]),
            Err(BackendError::Launch { .. })
        ));
    }

    #[test]
    fn test_empty_launch_grid() {
        let backend = CpuBackend::new(LaunchConfig::new(0, 0)).unwrap();
        let mut out = vec![0.0; 4];
        assert!(matches!(
            backend.execute(&add_kernel(), &mut out, &[&[1.0; 4], &[1.0; 4]]),
            Err(BackendError::Launch { .. })
        ));
    }

    #[test]
    fn test_undeclared_variable() {
        let result = LinkedKernel::compile(
            "__kernel void k(__global float* A0){\n*A0 = L1;\n}",
        );
        assert!(matches!(result, Err(BackendError::Compile { .. })));
    }

    #[test]
    fn test_loop_index_out_of_scope() {
        let result = LinkedKernel::compile(
            "__kernel void k(__global float* A0){\n\
             for(int i0 = 0; i0 < 2; i0++)\n\
             {\n\
             }\n\
             A0[i0] = 1;\n\
             }",
        );
        assert!(matches!(result, Err(BackendError::Compile { .. })));
    }
}
