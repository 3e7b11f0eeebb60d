//! Quantized estimator lifecycle: train in floating point, calibrate to integers,
//! compile to a circuit, predict through whichever artifact the call asks for.
//!
//! ```text
//!            fit                 compile
//! Untrained ─────▶ Calibrated ─────────▶ Compiled
//!     ▲                │  ▲                 │
//!     └──── fit ───────┘  └─────── fit ─────┘
//! ```
//!
//! `fit` always drops the previous module and circuit before training, so a failed
//! fit leaves the estimator `Untrained`. `compile` only ever adds a circuit next to
//! the module it was compiled from.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::compiler::{CompileOptions, CompiledCircuit, Compiler, VirtualCompiler};
use crate::error::{Error, Result};
use crate::matrices::{argmax, Matrix};
use crate::module::{Sequential, TracedModule};
use crate::quantization::{PostTrainingAffineQuantization, QuantizedModule};

/// Options forwarded to the delegate's training loop.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingOptions {
    /// Overrides the estimator's own epoch count.
    pub max_epochs: Option<usize>,
    /// Continue from the current weights instead of re-initializing.
    pub warm_start: bool,
    /// Overrides the estimator's own seed.
    pub seed: Option<u64>,
}

/// A floating-point estimator the quantized lifecycle can drive.
pub trait TrainableEstimator: Sized {
    /// Hyperparameters, enough to rebuild an equivalent estimator.
    type Params: Clone;

    fn fit(&mut self, data: &Matrix<f32>, labels: &[i64], options: &TrainingOptions) -> Result<()>;

    fn predict(&self, data: &Matrix<f32>) -> Result<Vec<i64>>;

    fn params(&self) -> Self::Params;

    /// Parameters used to build the floating-point reference in
    /// [`QuantizedEstimator::fit_benchmark`].
    fn benchmark_params(&self) -> Self::Params {
        self.params()
    }

    /// Build an estimator around an already trained network. `module` replaces any
    /// module constructor carried by `params`.
    fn from_trained(params: Self::Params, module: Sequential) -> Self;

    /// Mark the estimator as trained without running training.
    fn initialize(&mut self);

    fn is_initialized(&self) -> bool;

    /// The trained network that gets quantized.
    fn module_to_compile(&self) -> Result<&Sequential>;

    /// Bit width used to quantize this estimator.
    fn n_bits_quant(&self) -> u32;
}

/// Observable lifecycle stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Untrained,
    Calibrated,
    Compiled,
}

/// Which computation a predict call runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InferenceMode {
    /// The delegate's own floating-point network.
    FloatingPoint,
    /// The calibrated integer network, executed in the clear.
    QuantizedClear,
    /// The compiled circuit.
    Compiled,
}

enum Lifecycle<T> {
    Untrained,
    Calibrated { module: QuantizedModule },
    Compiled { module: QuantizedModule, circuit: T },
}

/// Inference strategy resolved once per call, holding what it needs.
enum Inference<'a, T> {
    FloatingPoint,
    QuantizedClear(&'a QuantizedModule),
    Compiled(&'a QuantizedModule, &'a T),
}

impl<T> Inference<'_, T> {
    fn mode(&self) -> InferenceMode {
        match self {
            Inference::FloatingPoint => InferenceMode::FloatingPoint,
            Inference::QuantizedClear(_) => InferenceMode::QuantizedClear,
            Inference::Compiled(..) => InferenceMode::Compiled,
        }
    }
}

/// Wraps a [`TrainableEstimator`] with post-training quantization and compilation.
pub struct QuantizedEstimator<E, C: Compiler = VirtualCompiler> {
    delegate: E,
    compiler: C,
    lifecycle: Lifecycle<C::Circuit>,
}

impl<E: TrainableEstimator> QuantizedEstimator<E, VirtualCompiler> {
    pub fn new(delegate: E) -> Self {
        Self::with_compiler(delegate, VirtualCompiler)
    }
}

impl<E: TrainableEstimator, C: Compiler> QuantizedEstimator<E, C> {
    pub fn with_compiler(delegate: E, compiler: C) -> Self {
        QuantizedEstimator {
            delegate,
            compiler,
            lifecycle: Lifecycle::Untrained,
        }
    }

    /// Train the delegate, then calibrate a quantized module on `data`.
    ///
    /// Any previous module and circuit are dropped before training starts. If training
    /// or quantization fails the estimator is left `Untrained` and the error is
    /// returned as is.
    pub fn fit(
        &mut self,
        data: &Matrix<f32>,
        labels: &[i64],
        options: &TrainingOptions,
    ) -> Result<&mut Self> {
        data.ensure_non_empty()?;
        if labels.len() != data.rows {
            return Err(Error::Shape {
                expected: data.rows,
                actual: labels.len(),
            });
        }

        // Quantization is lost on refit
        if self.state() != LifecycleState::Untrained {
            debug!("refit: dropping {:?} module", self.state());
        }
        self.lifecycle = Lifecycle::Untrained;

        self.delegate.fit(data, labels, options)?;

        let traced = TracedModule::new(self.delegate.module_to_compile()?, data.row(0))?;
        let n_bits = self.delegate.n_bits_quant();
        let module =
            PostTrainingAffineQuantization::new(n_bits, traced, true).quantize_module(data)?;

        info!(
            "calibrated module {:#x}: {n_bits} bits on {} samples",
            module.module_id(),
            data.rows
        );
        self.lifecycle = Lifecycle::Calibrated { module };
        Ok(self)
    }

    /// Compile the calibrated module, using `data` as the compilation input set.
    ///
    /// `data` is quantized with the parameters fixed at fit time; it supplies new
    /// example values, not new parameters. On failure the previous state is kept.
    pub fn compile(&mut self, data: &Matrix<f32>, options: CompileOptions<'_>) -> Result<()> {
        let module = match &self.lifecycle {
            Lifecycle::Untrained => return Err(Error::NotCalibrated),
            Lifecycle::Calibrated { module } | Lifecycle::Compiled { module, .. } => module,
        };

        let mut inputset = module.q_inputs()[0].clone();
        inputset.update_values(data)?;

        let circuit = self.compiler.compile(module, &inputset, options)?;
        if circuit.module_id() != module.module_id() {
            return Err(Error::CircuitMismatch {
                circuit: circuit.module_id(),
                module: module.module_id(),
            });
        }

        if let Lifecycle::Calibrated { module } | Lifecycle::Compiled { module, .. } =
            std::mem::replace(&mut self.lifecycle, Lifecycle::Untrained)
        {
            debug!("module {:#x} compiled", module.module_id());
            self.lifecycle = Lifecycle::Compiled { module, circuit };
        }
        Ok(())
    }

    /// Predict class indices.
    ///
    /// In the clear, a calibrated estimator runs its integer network and an untrained
    /// one falls back to the delegate. Encrypted execution needs a compiled circuit and
    /// runs each row through it independently; results keep the input row order.
    pub fn predict(&self, data: &Matrix<f32>, execute_encrypted: bool) -> Result<Vec<i64>> {
        match self.resolve(execute_encrypted)? {
            Inference::FloatingPoint => self.delegate.predict(data),
            Inference::QuantizedClear(module) => {
                check_width(module, data)?;
                let q_y = module.forward(&module.quantize_batch(data))?;
                Ok(q_y.row_iter().map(|row| argmax(row) as i64).collect())
            }
            Inference::Compiled(module, circuit) => {
                check_width(module, data)?;
                if circuit.module_id() != module.module_id() {
                    return Err(Error::CircuitMismatch {
                        circuit: circuit.module_id(),
                        module: module.module_id(),
                    });
                }
                data.row_iter()
                    .map(|row| {
                        let q_x = module.quantize_input(row);
                        let q_y = circuit.run(&q_x)?;
                        Ok(argmax(&q_y) as i64)
                    })
                    .collect()
            }
        }
    }

    /// Predict a single row, treated as a batch of one.
    pub fn predict_row(&self, row: &[f32], execute_encrypted: bool) -> Result<i64> {
        let predictions = self.predict(&Matrix::row_vector(row), execute_encrypted)?;
        predictions.first().copied().ok_or(Error::EmptyData {
            rows: 0,
            cols: row.len(),
        })
    }

    /// Computation a predict call with this flag would run, or why it cannot.
    pub fn inference_mode(&self, execute_encrypted: bool) -> Result<InferenceMode> {
        self.resolve(execute_encrypted).map(|inference| inference.mode())
    }

    /// Fit, then build a floating-point estimator around the trained network for
    /// comparison. The reference is independent of `self` and is never fit again.
    pub fn fit_benchmark(&mut self, data: &Matrix<f32>, labels: &[i64]) -> Result<(&mut Self, E)> {
        self.fit(data, labels, &TrainingOptions::default())?;

        let network = self
            .quantized_module()
            .ok_or(Error::NotCalibrated)?
            .traced()
            .module()
            .clone();
        let mut reference = E::from_trained(self.delegate.benchmark_params(), network);
        reference.initialize();

        Ok((self, reference))
    }

    pub fn state(&self) -> LifecycleState {
        match self.lifecycle {
            Lifecycle::Untrained => LifecycleState::Untrained,
            Lifecycle::Calibrated { .. } => LifecycleState::Calibrated,
            Lifecycle::Compiled { .. } => LifecycleState::Compiled,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.state() != LifecycleState::Untrained
    }

    pub fn is_compiled(&self) -> bool {
        self.state() == LifecycleState::Compiled
    }

    pub fn quantized_module(&self) -> Option<&QuantizedModule> {
        match &self.lifecycle {
            Lifecycle::Untrained => None,
            Lifecycle::Calibrated { module } | Lifecycle::Compiled { module, .. } => Some(module),
        }
    }

    pub fn circuit(&self) -> Option<&C::Circuit> {
        match &self.lifecycle {
            Lifecycle::Compiled { circuit, .. } => Some(circuit),
            _ => None,
        }
    }

    pub fn delegate(&self) -> &E {
        &self.delegate
    }

    /// Changes reach the quantized module only through the next `fit`.
    pub fn delegate_mut(&mut self) -> &mut E {
        &mut self.delegate
    }

    pub fn n_bits_quant(&self) -> u32 {
        self.delegate.n_bits_quant()
    }

    fn resolve(&self, execute_encrypted: bool) -> Result<Inference<'_, C::Circuit>> {
        match (&self.lifecycle, execute_encrypted) {
            (Lifecycle::Untrained, false) => Ok(Inference::FloatingPoint),
            (Lifecycle::Calibrated { module } | Lifecycle::Compiled { module, .. }, false) => {
                Ok(Inference::QuantizedClear(module))
            }
            (Lifecycle::Untrained, true) => Err(Error::NotCalibrated),
            (Lifecycle::Calibrated { .. }, true) => Err(Error::NotCompiled),
            (Lifecycle::Compiled { module, circuit }, true) => {
                Ok(Inference::Compiled(module, circuit))
            }
        }
    }
}

fn check_width(module: &QuantizedModule, data: &Matrix<f32>) -> Result<()> {
    if data.cols != module.in_features() {
        return Err(Error::Shape {
            expected: module.in_features(),
            actual: data.cols,
        });
    }
    Ok(())
}
