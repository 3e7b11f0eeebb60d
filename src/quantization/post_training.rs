use log::debug;

use crate::error::{Error, Result};
use crate::matrices::Matrix;
use crate::module::{relu, Layer, TracedModule};

use super::{AffineQuantizer, QuantizedArray, QuantizedLayer, QuantizedLinear, QuantizedModule};
use super::{MAX_BITS, MIN_BITS};

/// Post-training static quantization of a traced network.
///
/// Activation ranges are observed by running the float network over the calibration
/// data; every tensor then gets its own per-tensor affine parameters. A ReLU that
/// directly follows a linear layer is fused into it.
pub struct PostTrainingAffineQuantization {
    n_bits: u32,
    traced: TracedModule,
    is_signed: bool,
}

impl PostTrainingAffineQuantization {
    pub fn new(n_bits: u32, traced: TracedModule, is_signed: bool) -> Self {
        PostTrainingAffineQuantization {
            n_bits,
            traced,
            is_signed,
        }
    }

    pub fn quantize_module(self, calibration_data: &Matrix<f32>) -> Result<QuantizedModule> {
        if !(MIN_BITS..=MAX_BITS).contains(&self.n_bits) {
            return Err(Error::InvalidBitWidth(self.n_bits));
        }
        calibration_data.ensure_non_empty()?;
        if calibration_data.cols != self.traced.in_features() {
            return Err(Error::Shape {
                expected: self.traced.in_features(),
                actual: calibration_data.cols,
            });
        }

        let q_input = QuantizedArray::calibrate(self.n_bits, calibration_data.clone(), self.is_signed)?;

        let network = self.traced.module();
        let mut activations = calibration_data.clone();
        let mut quantizer = *q_input.quantizer();
        let mut layers = Vec::with_capacity(network.layers.len());

        let mut i = 0;
        while i < network.layers.len() {
            match &network.layers[i] {
                Layer::Linear(linear) => {
                    let fused_relu = matches!(network.layers.get(i + 1), Some(Layer::ReLU));
                    let mut output = linear.forward(&activations)?;
                    if fused_relu {
                        output = relu(&output);
                        i += 1;
                    }
                    let (min_val, max_val) = output.min_and_max();
                    let output_quantizer =
                        AffineQuantizer::new(self.n_bits, self.is_signed, min_val, max_val)?;
                    debug!(
                        "layer {}: {}x{} range [{min_val}, {max_val}] scale {} zero {}",
                        layers.len(),
                        linear.out_features(),
                        linear.in_features(),
                        output_quantizer.scale,
                        output_quantizer.zero_point,
                    );

                    layers.push(QuantizedLayer::Linear(QuantizedLinear::new(
                        linear,
                        &quantizer,
                        output_quantizer,
                        self.n_bits,
                        fused_relu,
                    )?));
                    activations = output;
                    quantizer = output_quantizer;
                }
                Layer::ReLU => {
                    activations = relu(&activations);
                    layers.push(QuantizedLayer::ReLU {
                        zero_point: quantizer.zero_point,
                    });
                }
            }
            i += 1;
        }

        Ok(QuantizedModule::new(
            self.n_bits,
            vec![q_input],
            layers,
            quantizer,
            self.traced,
        ))
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::matrices::argmax;
    use crate::module::Sequential;

    fn traced(net: &Sequential, data: &Matrix<f32>) -> TracedModule {
        TracedModule::new(net, data.row(0)).unwrap()
    }

    #[test]
    fn fuses_relu_after_linear() {
        let mut rng = StdRng::seed_from_u64(11);
        let net = Sequential::mlp(4, &[8], 3, &mut rng);
        let data = Matrix::random(20, 4, -1.0..1.0, &mut rng);

        let module = PostTrainingAffineQuantization::new(6, traced(&net, &data), true)
            .quantize_module(&data)
            .unwrap();

        assert_eq!(module.layers().len(), 2);
        assert!(matches!(&module.layers()[0], QuantizedLayer::Linear(l) if l.has_fused_relu()));
        assert!(matches!(&module.layers()[1], QuantizedLayer::Linear(l) if !l.has_fused_relu()));
        assert_eq!(module.n_outputs(), 3);
        assert_eq!(module.q_inputs()[0].qvalues().rows, 20);
    }

    #[test]
    fn leading_relu_stays_standalone() {
        let mut rng = StdRng::seed_from_u64(12);
        let mut net = Sequential::mlp(2, &[], 2, &mut rng);
        net.layers.insert(0, Layer::ReLU);
        let data = Matrix::random(10, 2, -1.0..1.0, &mut rng);

        let module = PostTrainingAffineQuantization::new(8, traced(&net, &data), true)
            .quantize_module(&data)
            .unwrap();
        assert!(matches!(module.layers()[0], QuantizedLayer::ReLU { .. }));
    }

    #[test]
    fn high_precision_agrees_with_float_argmax() {
        let mut rng = StdRng::seed_from_u64(13);
        let net = Sequential::mlp(5, &[10], 4, &mut rng);
        let data = Matrix::random(40, 5, -2.0..2.0, &mut rng);

        let module = PostTrainingAffineQuantization::new(16, traced(&net, &data), true)
            .quantize_module(&data)
            .unwrap();

        let float_out = net.forward(&data).unwrap();
        let quant_out = module.forward_and_dequant(&data).unwrap();
        let mut agree = 0;
        for i in 0..data.rows {
            if argmax(float_out.row(i)) == argmax(quant_out.row(i)) {
                agree += 1;
            }
        }
        assert!(agree >= 38, "only {agree}/40 rows agree");
    }

    #[test]
    fn rejects_bad_bit_width_and_shape() {
        let mut rng = StdRng::seed_from_u64(14);
        let net = Sequential::mlp(3, &[], 2, &mut rng);
        let data = Matrix::random(5, 3, -1.0..1.0, &mut rng);

        let err = PostTrainingAffineQuantization::new(1, traced(&net, &data), true)
            .quantize_module(&data)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBitWidth(1)));

        let narrow = Matrix::random(5, 2, -1.0..1.0, &mut rng);
        let err = PostTrainingAffineQuantization::new(4, traced(&net, &data), true)
            .quantize_module(&narrow)
            .unwrap_err();
        assert!(matches!(err, Error::Shape { expected: 3, actual: 2 }));
    }

    #[test]
    fn each_calibration_gets_a_new_id() {
        let mut rng = StdRng::seed_from_u64(15);
        let net = Sequential::mlp(3, &[], 2, &mut rng);
        let data = Matrix::random(5, 3, -1.0..1.0, &mut rng);

        let a = PostTrainingAffineQuantization::new(4, traced(&net, &data), true)
            .quantize_module(&data)
            .unwrap();
        let b = PostTrainingAffineQuantization::new(4, traced(&net, &data), true)
            .quantize_module(&data)
            .unwrap();
        assert_ne!(a.module_id(), b.module_id());
    }
}
