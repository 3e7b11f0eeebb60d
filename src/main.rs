// Plot accuracy of the quantized classifier against its floating-point reference
use quantized_fhe_estimator::compiler::CompileOptions;
use quantized_fhe_estimator::datasets::make_classification;
use quantized_fhe_estimator::estimator::{QuantizedEstimator, TrainableEstimator};
use quantized_fhe_estimator::matrices::Matrix;
use quantized_fhe_estimator::neural_net::{NeuralNetClassifier, NeuralNetParams};

use plotters::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let accuracies = accuracy_as_bits_increase(2..=8)?;
    dbg!(&accuracies);

    let root = BitMapBackend::new("accuracy-bits.png", (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let (x_min, x_max) = (
        accuracies.first().map(|a| a.0).unwrap_or(2.0),
        accuracies.last().map(|a| a.0).unwrap_or(8.0),
    );

    let mut chart = ChartBuilder::on(&root)
        .caption("Accuracy vs. Quantization Bits", ("sans-serif", 40).into_font())
        .margin(30)
        .x_label_area_size(50)
        .y_label_area_size(75)
        .build_cartesian_2d(x_min..x_max, 0f32..1.05f32)?;

    chart
        .configure_mesh()
        .x_desc("Bits")
        .y_desc("Accuracy")
        .light_line_style(&WHITE.mix(0.8))
        .draw()?;

    let series = [
        ("FP32 reference", RED, accuracies.iter().map(|a| (a.0, a.1)).collect::<Vec<_>>()),
        ("Quantized (clear)", BLUE, accuracies.iter().map(|a| (a.0, a.2)).collect()),
        ("Compiled circuit", GREEN, accuracies.iter().map(|a| (a.0, a.3)).collect()),
    ];

    for (label, color, points) in series {
        chart
            .draw_series(LineSeries::new(points.iter().cloned(), &color))?
            .label(label)
            .legend(move |(x, y)| PathElement::new(vec![(x - 5, y), (x + 5, y)], color));

        chart.draw_series(points.iter().map(|(x, y)| Circle::new((*x, *y), 3, color.filled())))?;
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    root.present()?;

    Ok(())
}

fn accuracy(predictions: &[i64], labels: &[i64]) -> f32 {
    assert_eq!(predictions.len(), labels.len(), "Number of values must be equal");
    let hits = predictions
        .iter()
        .zip(labels.iter())
        .filter(|(p, l)| p == l)
        .count();
    hits as f32 / labels.len() as f32
}

/// (bits, fp32 accuracy, quantized clear accuracy, circuit accuracy) on held-out data.
fn accuracy_as_bits_increase(
    bits: std::ops::RangeInclusive<u32>,
) -> Result<Vec<(f32, f32, f32, f32)>, Box<dyn std::error::Error>> {
    let (x, y) = make_classification(300, 6, 4, 0);
    let split = 200;
    let train: Vec<usize> = (0..split).collect();
    let test: Vec<usize> = (split..x.rows).collect();
    let (x_train, y_train) = (x.select_rows(&train), y[..split].to_vec());
    let (x_test, y_test): (Matrix<f32>, Vec<i64>) = (x.select_rows(&test), y[split..].to_vec());

    let mut accuracies = Vec::new();
    for n_bits in bits {
        let mut model = QuantizedEstimator::new(NeuralNetClassifier::new(NeuralNetParams {
            hidden_layers: vec![16, 16],
            n_bits,
            seed: Some(0),
            ..Default::default()
        }));

        let (model, fp32_model) = model.fit_benchmark(&x_train, &y_train)?;
        model.compile(
            &x_train,
            CompileOptions {
                use_virtual_lib: true,
                ..Default::default()
            },
        )?;

        accuracies.push((
            n_bits as f32,
            accuracy(&fp32_model.predict(&x_test)?, &y_test),
            accuracy(&model.predict(&x_test, false)?, &y_test),
            accuracy(&model.predict(&x_test, true)?, &y_test),
        ));
    }

    Ok(accuracies)
}
