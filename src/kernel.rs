//! Kernel configuration and generated kernel source
//!
//! A [`KernelSource`] is what the code generator hands to a backend: the
//! kernel text plus the parameter list in binding order.

use serde::{Deserialize, Serialize};

/// Settings for kernel generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Name of the generated kernel function
    pub kernel_name: String,
    /// Size of the pool of scratch temporaries
    pub max_temporaries: usize,
}

impl KernelConfig {
    pub fn new(kernel_name: impl Into<String>, max_temporaries: usize) -> Self {
        Self {
            kernel_name: kernel_name.into(),
            max_temporaries,
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new("executable", 16)
    }
}

/// How a kernel parameter is used by the body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    /// Indexed by the loop nest
    Array,
    /// Single element, dereferenced
    Constant,
}

/// One `__global float*` parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    /// Number of floats the bound buffer must hold
    pub len: usize,
}

impl Param {
    pub fn array(name: impl Into<String>, len: usize) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Array,
            len,
        }
    }

    pub fn constant(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Constant,
            len: 1,
        }
    }
}

/// A generated kernel, ready for a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSource {
    pub name: String,
    /// Parameters in binding order; the first one is the write target
    pub params: Vec<Param>,
    /// Number of scratch temporaries declared
    pub temporaries: usize,
    /// Whether a reduction accumulator is declared
    pub has_accumulator: bool,
    /// Kernel text
    pub source: String,
}

impl KernelSource {
    /// The write-target parameter
    pub fn output(&self) -> Option<&Param> {
        self.params.first()
    }

    /// Export to JSON format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Generate a short human-readable summary
    pub fn summary(&self) -> String {
        let arrays = self
            .params
            .iter()
            .filter(|p| p.kind == ParamKind::Array)
            .count();
        format!(
            "Kernel Summary:\n\
             ===============\n\
             Name: {}\n\
             Parameters: {} ({} arrays, {} constants)\n\
             Temporaries: {}\n\
             Reduction: {}\n",
            self.name,
            self.params.len(),
            arrays,
            self.params.len() - arrays,
            self.temporaries,
            if self.has_accumulator { "yes" } else { "no" },
        )
    }
}

impl std::fmt::Display for KernelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> KernelSource {
        KernelSource {
            name: "executable".to_string(),
            params: vec![Param::array("A0", 4), Param::constant("C1")],
            temporaries: 1,
            has_accumulator: false,
            source: "__kernel void executable(__global float* A0, __global float* C1){\n}".to_string(),
        }
    }

    #[test]
    fn test_default_config() {
        let config = KernelConfig::default();
        assert_eq!(config.kernel_name, "executable");
        assert_eq!(config.max_temporaries, 16);
    }

    #[test]
    fn test_summary() {
        let summary = sample().summary();
        assert!(summary.contains("Parameters: 2 (1 arrays, 1 constants)"));
        assert!(summary.contains("Reduction: no"));
    }

    #[test]
    fn test_json_export() {
        let kernel = sample();
        let json = kernel.to_json().unwrap();
        let back: KernelSource = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kernel);
        assert_eq!(back.output().map(|p| p.name.as_str()), Some("A0"));
    }
}
