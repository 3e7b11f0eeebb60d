//! Quantized neural-network estimators that train in floating point, calibrate to
//! integer arithmetic after training, and compile to circuits for encrypted inference.
//!
//! ```no_run
//! use quantized_fhe_estimator::compiler::CompileOptions;
//! use quantized_fhe_estimator::datasets::make_classification;
//! use quantized_fhe_estimator::estimator::{QuantizedEstimator, TrainingOptions};
//! use quantized_fhe_estimator::neural_net::{NeuralNetClassifier, NeuralNetParams};
//!
//! # fn main() -> quantized_fhe_estimator::Result<()> {
//! let (x, y) = make_classification(50, 4, 2, 0);
//! let mut model = QuantizedEstimator::new(NeuralNetClassifier::new(NeuralNetParams::default()));
//! model.fit(&x, &y, &TrainingOptions::default())?;
//! model.compile(&x, CompileOptions { use_virtual_lib: true, ..Default::default() })?;
//! let predictions = model.predict(&x, true)?;
//! # Ok(())
//! # }
//! ```

pub mod compiler;
pub mod datasets;
pub mod error;
pub mod estimator;
pub mod matrices;
pub mod module;
pub mod neural_net;
pub mod quantization;

pub use error::{Error, Result};
