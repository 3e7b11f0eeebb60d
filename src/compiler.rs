//! Compilation of a calibrated module into an executable circuit.
//!
//! [`VirtualCompiler`] does not produce an encrypted program. It validates the
//! integer graph against the bit-width limit of exact circuits and returns a
//! [`VirtualCircuit`] that executes the same integer operations in the clear, which
//! is what an encrypted execution decrypts to.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::matrices::Matrix;
use crate::quantization::{AffineQuantizer, QuantizedArray, QuantizedLayer, QuantizedModule};

/// Compiler settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilationConfiguration {
    /// Widest integer an exact circuit can hold.
    pub max_bit_width: u32,
    /// Fail instead of warning when the virtual library lifts the bit-width limit.
    pub treat_warnings_as_errors: bool,
}

impl Default for CompilationConfiguration {
    fn default() -> Self {
        CompilationConfiguration {
            max_bit_width: 8,
            treat_warnings_as_errors: false,
        }
    }
}

/// Filled in by the compiler for inspection after the fact.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompilationArtifacts {
    pub module_id: Option<u64>,
    pub inputset_size: usize,
    pub max_bit_width: u32,
    pub use_virtual_lib: bool,
    pub intermediate_representation: Option<String>,
}

impl CompilationArtifacts {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn export(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// Pass-through options for [`Compiler::compile`].
#[derive(Debug, Default)]
pub struct CompileOptions<'a> {
    pub configuration: Option<&'a CompilationConfiguration>,
    pub artifacts: Option<&'a mut CompilationArtifacts>,
    pub show_mlir: bool,
    pub use_virtual_lib: bool,
}

/// An executable circuit, valid only for the module it was compiled from.
pub trait CompiledCircuit {
    /// Id of the [`QuantizedModule`] this circuit was compiled from.
    fn module_id(&self) -> u64;

    fn is_compiled(&self) -> bool;

    /// Bit width of the circuit inputs.
    fn input_bit_width(&self) -> u32;

    /// Map a raw row into the circuit's integer input domain.
    fn quantize_input(&self, row: &[f32]) -> Vec<i64>;

    /// Execute on one quantized row, returning the raw integer outputs.
    fn run(&self, q_row: &[i64]) -> Result<Vec<i64>>;
}

pub trait Compiler {
    type Circuit: CompiledCircuit;

    fn compile(
        &self,
        module: &QuantizedModule,
        inputset: &QuantizedArray,
        options: CompileOptions<'_>,
    ) -> Result<Self::Circuit>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct VirtualCompiler;

impl Compiler for VirtualCompiler {
    type Circuit = VirtualCircuit;

    fn compile(
        &self,
        module: &QuantizedModule,
        inputset: &QuantizedArray,
        options: CompileOptions<'_>,
    ) -> Result<VirtualCircuit> {
        inputset.qvalues().ensure_non_empty()?;
        if inputset.qvalues().cols != module.in_features() {
            return Err(Error::Shape {
                expected: module.in_features(),
                actual: inputset.qvalues().cols,
            });
        }

        let configuration = options.configuration.cloned().unwrap_or_default();
        let max_bit_width = module.max_accumulator_bits(inputset)?;
        let ir = render_ir(module, max_bit_width);

        if options.show_mlir {
            println!("{ir}");
        }
        if let Some(artifacts) = options.artifacts {
            *artifacts = CompilationArtifacts {
                module_id: Some(module.module_id()),
                inputset_size: inputset.qvalues().rows,
                max_bit_width,
                use_virtual_lib: options.use_virtual_lib,
                intermediate_representation: Some(ir),
            };
        }

        if max_bit_width > configuration.max_bit_width {
            let message = format!(
                "{max_bit_width}-bit accumulators exceed the {}-bit limit of exact circuits",
                configuration.max_bit_width
            );
            if !options.use_virtual_lib || configuration.treat_warnings_as_errors {
                return Err(Error::Compilation(message));
            }
            warn!("{message}; compiling with the virtual library");
        }

        info!(
            "compiled module {:#x}: {} layers, {max_bit_width}-bit max",
            module.module_id(),
            module.layers().len()
        );

        Ok(VirtualCircuit {
            module_id: module.module_id(),
            input_quantizer: *module.input_quantizer(),
            in_features: module.in_features(),
            layers: module.layers().to_vec(),
            max_bit_width,
        })
    }
}

/// Circuit produced by [`VirtualCompiler`].
#[derive(Clone, Debug)]
pub struct VirtualCircuit {
    module_id: u64,
    input_quantizer: AffineQuantizer,
    in_features: usize,
    layers: Vec<QuantizedLayer>,
    max_bit_width: u32,
}

impl VirtualCircuit {
    pub fn max_bit_width(&self) -> u32 {
        self.max_bit_width
    }
}

impl CompiledCircuit for VirtualCircuit {
    fn module_id(&self) -> u64 {
        self.module_id
    }

    fn is_compiled(&self) -> bool {
        true
    }

    fn input_bit_width(&self) -> u32 {
        self.input_quantizer.n_bits
    }

    fn quantize_input(&self, row: &[f32]) -> Vec<i64> {
        row.iter().map(|&v| self.input_quantizer.quantize(v)).collect()
    }

    fn run(&self, q_row: &[i64]) -> Result<Vec<i64>> {
        if q_row.len() != self.in_features {
            return Err(Error::Shape {
                expected: self.in_features,
                actual: q_row.len(),
            });
        }
        let (qmin, qmax) = (self.input_quantizer.qmin(), self.input_quantizer.qmax());
        if let Some(v) = q_row.iter().find(|&&v| v < qmin || v > qmax) {
            return Err(Error::Circuit(format!(
                "input {v} outside the {}-bit range [{qmin}, {qmax}]",
                self.input_quantizer.n_bits
            )));
        }

        let mut q = Matrix::row_vector(q_row);
        for layer in &self.layers {
            q = layer.forward(&q)?;
        }
        Ok(q.data)
    }
}

/// Textual form of the integer graph.
fn render_ir(module: &QuantizedModule, max_bit_width: u32) -> String {
    let input = module.input_quantizer();
    let mut ir = String::new();
    let _ = writeln!(
        ir,
        "func @main(%arg0: tensor<1x{}x!eint<{}>>) -> tensor<1x{}x!eint<{}>> {{",
        module.in_features(),
        input.n_bits,
        module.n_outputs(),
        module.output_quantizer().n_bits,
    );
    for (i, layer) in module.layers().iter().enumerate() {
        let arg = if i == 0 { "%arg0".to_string() } else { format!("%{}", i - 1) };
        match layer {
            QuantizedLayer::Linear(linear) => {
                let _ = writeln!(
                    ir,
                    "  %{i} = linear({arg}, w: tensor<{}x{}xi{}>, relu: {}) : acc<{max_bit_width}> -> eint<{}>",
                    linear.out_features(),
                    linear.in_features(),
                    linear.weights().quantizer().n_bits,
                    linear.has_fused_relu(),
                    linear.output_quantizer().n_bits,
                );
            }
            QuantizedLayer::ReLU { zero_point } => {
                let _ = writeln!(ir, "  %{i} = maximum({arg}, {zero_point})");
            }
        }
    }
    let last = module.layers().len().saturating_sub(1);
    let _ = writeln!(ir, "  return %{last}");
    ir.push('}');
    ir
}
