use std::sync::Arc;

use briny_conv::ops::cpu::CpuExecutor;
use briny_conv::{ConvError, ControllerConfig, ConvolutionController, KernelKind, Padding};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_vec(rng: &mut StdRng, len: usize) -> Vec<f64> {
    (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
}

fn random_batch(rng: &mut StdRng, items: usize, len: usize) -> Vec<Vec<f64>> {
    (0..items).map(|_| random_vec(rng, len)).collect()
}

fn dot(a: &[Vec<f64>], b: &[Vec<f64>]) -> f64 {
    a.iter()
        .zip(b)
        .flat_map(|(x, y)| x.iter().zip(y).map(|(p, q)| p * q))
        .sum()
}

fn cpu(input: &[usize], filter: &[usize], padding: Padding, config: ControllerConfig) -> ConvolutionController {
    ConvolutionController::with_config(input, filter, padding, config)
        .unwrap()
        .with_executor(Arc::new(CpuExecutor))
}

fn forward(c: &ConvolutionController, inputs: &[Vec<f64>], filter: &[f64]) -> Vec<Vec<f64>> {
    let out_len = c.geometry().output_len();
    let mut outputs = vec![vec![0.0; out_len]; inputs.len()];
    c.convolve(inputs, filter, &mut outputs).unwrap();
    outputs
}

fn input_grad(c: &ConvolutionController, errors: &[Vec<f64>], filter: &[f64]) -> Vec<Vec<f64>> {
    let in_len = c.geometry().input_len();
    let mut grads = vec![vec![0.0; in_len]; errors.len()];
    c.backprop(&mut grads, filter, errors).unwrap();
    grads
}

fn weight_grad(c: &ConvolutionController, inputs: &[Vec<f64>], errors: &[Vec<f64>]) -> Vec<f64> {
    let mut grad = vec![0.0; c.geometry().filter_len()];
    c.gradient(inputs, &mut grad, errors).unwrap();
    grad
}

#[test]
fn test_output_geometry_examples() {
    let c = ConvolutionController::new(&[8, 8, 1], &[3, 3, 1], Padding::Same).unwrap();
    assert_eq!(c.output_dims(), [8, 8, 1]);

    let c = ConvolutionController::new(&[8, 8, 7], &[3, 3, 21], Padding::Explicit { x: 0, y: 0 }).unwrap();
    assert_eq!(c.output_dims(), [6, 6, 3]);

    let err = ConvolutionController::new(&[2, 2, 1], &[3, 3, 1], Padding::Explicit { x: 0, y: 0 }).unwrap_err();
    assert!(matches!(err, ConvError::NonPositiveOutput { .. }));
}

#[test]
fn test_impulse_response_places_filter_around_impulse() {
    let c = cpu(&[5, 5, 1], &[3, 3, 1], Padding::Same, ControllerConfig::default());
    let mut input = vec![0.0; 25];
    input[2 + 5 * 2] = 1.0;
    let filter: Vec<f64> = (1..=9).map(f64::from).collect();

    let out = forward(&c, &[input], &filter);
    for y in 0..5 {
        for x in 0..5 {
            let expected = if (1..4).contains(&x) && (1..4).contains(&y) {
                filter[(x - 1) + 3 * (y - 1)]
            } else {
                0.0
            };
            assert_eq!(out[0][x + 5 * y], expected, "at ({x}, {y})");
        }
    }
}

/// Input `[4, 3, 1]`, filter `[3, 2, 1]` with taps `1..=6`, padding only
/// along x: output `[4, 2, 1]`, offset `(2, 0)`.
fn x_padded() -> (ConvolutionController, Vec<f64>) {
    let c = cpu(&[4, 3, 1], &[3, 2, 1], Padding::Explicit { x: 2, y: 0 }, ControllerConfig::default());
    assert_eq!(c.output_dims(), [4, 2, 1]);
    (c, (1..=6).map(f64::from).collect())
}

#[test]
fn test_x_padding_shifts_only_the_x_axis_forward() {
    let (c, filter) = x_padded();
    let mut input = vec![0.0; 12];
    input[1 + 4] = 1.0;

    // output (o0, o1) reads input (o0 - k0 + 2, o1 - k1)
    let out = forward(&c, &[input], &filter);
    let mut expected = vec![0.0; 8];
    expected[4] = filter[1];
    expected[5] = filter[2];
    assert_eq!(out[0], expected);
}

#[test]
fn test_x_padding_shifts_only_the_x_axis_backward() {
    let (c, filter) = x_padded();
    let mut error = vec![0.0; 8];
    error[4] = 1.0;

    let grads = input_grad(&c, &[error.clone()], &filter);
    let expected = [6.0, 5.0, 4.0, 0.0, 3.0, 2.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0];
    assert_eq!(grads[0], expected);

    let mut input = vec![0.0; 12];
    input[1 + 4] = 1.0;
    let grad = weight_grad(&c, &[input], &[error]);
    assert_eq!(grad, [0.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
}

#[test]
fn test_band_routing_through_packed_filter() {
    // 2 input bands, 2 output bands: tap band k2 = o2 + i2 * 2
    let c = cpu(&[3, 3, 2], &[1, 1, 4], Padding::Same, ControllerConfig::default());
    assert_eq!(c.output_dims(), [3, 3, 2]);
    let mut input = vec![0.0; 18];
    input[9] = 1.0;

    let out = forward(&c, &[input], &[10.0, 20.0, 30.0, 40.0]);
    assert_eq!(out[0][0], 30.0);
    assert_eq!(out[0][9], 40.0);
    assert_eq!(out[0].iter().filter(|&&v| v != 0.0).count(), 2);
}

#[test]
fn test_linearity_in_filter_and_input() {
    let mut rng = StdRng::seed_from_u64(11);
    let c = cpu(&[6, 5, 2], &[3, 3, 6], Padding::Same, ControllerConfig::default());
    let x = random_batch(&mut rng, 3, c.geometry().input_len());
    let y = random_batch(&mut rng, 3, c.geometry().input_len());
    let w = random_vec(&mut rng, c.geometry().filter_len());

    let base = forward(&c, &x, &w);
    let scaled_w: Vec<f64> = w.iter().map(|v| v * 2.5).collect();
    let scaled = forward(&c, &x, &scaled_w);
    for (a, b) in base.iter().flatten().zip(scaled.iter().flatten()) {
        assert!((a * 2.5 - b).abs() <= 1e-12, "{a} * 2.5 != {b}");
    }

    let zero = forward(&c, &x, &vec![0.0; w.len()]);
    assert!(zero.iter().flatten().all(|&v| v == 0.0));

    let sum: Vec<Vec<f64>> = x
        .iter()
        .zip(&y)
        .map(|(a, b)| a.iter().zip(b).map(|(p, q)| p + q).collect())
        .collect();
    let fx = forward(&c, &x, &w);
    let fy = forward(&c, &y, &w);
    let fsum = forward(&c, &sum, &w);
    for ((a, b), s) in fx.iter().flatten().zip(fy.iter().flatten()).zip(fsum.iter().flatten()) {
        assert!((a + b - s).abs() <= 1e-12);
    }
}

#[test]
fn test_backprop_is_adjoint_of_convolve() {
    let mut rng = StdRng::seed_from_u64(3);
    let cases = [
        ([5, 4, 2], [3, 3, 6], Padding::Same),
        ([6, 5, 2], [3, 2, 4], Padding::Explicit { x: 1, y: 0 }),
        ([7, 7, 1], [4, 4, 1], Padding::Same),
        ([5, 5, 3], [2, 3, 3], Padding::Explicit { x: -1, y: 2 }),
    ];

    for (input, filter, padding) in cases {
        let c = cpu(&input, &filter, padding, ControllerConfig::default());
        let g = *c.geometry();
        let x = random_batch(&mut rng, 4, g.input_len());
        let e = random_batch(&mut rng, 4, g.output_len());
        let w = random_vec(&mut rng, g.filter_len());

        let lhs = dot(&forward(&c, &x, &w), &e);
        let rhs = dot(&x, &input_grad(&c, &e, &w));
        assert!((lhs - rhs).abs() <= 1e-9 * (1.0 + lhs.abs()), "{g}: {lhs} vs {rhs}");
    }
}

#[test]
fn test_weight_gradient_matches_finite_differences() {
    let mut rng = StdRng::seed_from_u64(5);
    let c = cpu(&[5, 4, 2], &[3, 3, 4], Padding::Explicit { x: 1, y: 1 }, ControllerConfig::default());
    let g = *c.geometry();
    let x = random_batch(&mut rng, 3, g.input_len());
    let w = random_vec(&mut rng, g.filter_len());

    // loss = 0.5 * sum(y^2), so dloss/dy = y
    let loss = |w: &[f64]| -> f64 {
        forward(&c, &x, w)
            .iter()
            .flatten()
            .map(|v| 0.5 * v * v)
            .sum()
    };
    let y = forward(&c, &x, &w);
    let analytic = weight_grad(&c, &x, &y);

    let eps = 1e-5;
    for k in 0..g.filter_len() {
        let mut plus = w.clone();
        plus[k] += eps;
        let mut minus = w.clone();
        minus[k] -= eps;
        let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
        assert!(
            (numeric - analytic[k]).abs() <= 1e-5 * (1.0 + analytic[k].abs()),
            "tap {k}: numeric {numeric} vs analytic {}",
            analytic[k]
        );
    }
}

#[test]
fn test_gradient_accumulates_across_calls() {
    let mut rng = StdRng::seed_from_u64(9);
    let c = cpu(&[4, 4, 1], &[3, 3, 1], Padding::Same, ControllerConfig::default());
    let g = *c.geometry();
    let x = random_batch(&mut rng, 6, g.input_len());
    let e = random_batch(&mut rng, 6, g.output_len());

    let whole = weight_grad(&c, &x, &e);
    let mut split = vec![0.0; g.filter_len()];
    c.gradient(&x[..2], &mut split, &e[..2]).unwrap();
    c.gradient(&x[2..], &mut split, &e[2..]).unwrap();

    for (a, b) in whole.iter().zip(&split) {
        assert!((a - b).abs() <= 1e-12);
    }
}

#[test]
fn test_chunking_is_invisible_in_results() {
    let mut rng = StdRng::seed_from_u64(1000);
    let input = [4, 4, 1];
    let filter = [3, 3, 1];
    let one_chunk = cpu(&input, &filter, Padding::Same, ControllerConfig::default());
    let seven_chunks = cpu(
        &input,
        &filter,
        Padding::Same,
        ControllerConfig::default().with_max_buffer_len(143 * 16),
    );

    let x = random_batch(&mut rng, 1000, 16);
    let e = random_batch(&mut rng, 1000, 16);
    let w = random_vec(&mut rng, 9);

    assert_eq!(forward(&one_chunk, &x, &w), forward(&seven_chunks, &x, &w));
    assert_eq!(input_grad(&one_chunk, &e, &w), input_grad(&seven_chunks, &e, &w));

    let a = weight_grad(&one_chunk, &x, &e);
    let b = weight_grad(&seven_chunks, &x, &e);
    for (p, q) in a.iter().zip(&b) {
        assert!((p - q).abs() <= 1e-9 * (1.0 + p.abs()));
    }

    for kind in [KernelKind::Convolve, KernelKind::Backprop, KernelKind::Gradient] {
        assert_eq!(one_chunk.stats(kind).chunks, 1);
        assert_eq!(seven_chunks.stats(kind).chunks, 7);
        assert_eq!(seven_chunks.stats(kind).items, 1000);
    }
}

#[test]
fn test_zero_taps_match_negligible_taps() {
    let mut rng = StdRng::seed_from_u64(21);
    let c = cpu(&[6, 6, 2], &[3, 3, 4], Padding::Same, ControllerConfig::default());
    let g = *c.geometry();
    let x = random_batch(&mut rng, 2, g.input_len());
    let e = random_batch(&mut rng, 2, g.output_len());

    let sparse: Vec<f64> = (0..g.filter_len())
        .map(|k| if k % 3 == 0 { 0.0 } else { rng.random_range(-1.0..1.0) })
        .collect();
    let dense: Vec<f64> = sparse.iter().map(|&w| if w == 0.0 { 1e-300 } else { w }).collect();

    let close = |a: &[Vec<f64>], b: &[Vec<f64>]| {
        a.iter()
            .flatten()
            .zip(b.iter().flatten())
            .all(|(p, q)| (p - q).abs() <= 1e-250)
    };
    assert!(close(&forward(&c, &x, &sparse), &forward(&c, &x, &dense)));
    assert!(close(&input_grad(&c, &e, &sparse), &input_grad(&c, &e, &dense)));
}

#[test]
fn test_gradient_sizes_chunks_by_larger_item() {
    // output [6, 6, 1] is larger than input [4, 4, 1]
    let config = ControllerConfig::default().with_max_buffer_len(20);
    let c = cpu(&[4, 4, 1], &[3, 3, 1], Padding::Explicit { x: 4, y: 4 }, config);
    assert_eq!(c.output_dims(), [6, 6, 1]);

    let x = vec![vec![1.0; 16]];
    let mut out = vec![vec![0.0; 36]];
    c.convolve(&x, &[1.0; 9], &mut out).unwrap();

    let mut grad = [0.0; 9];
    let err = c.gradient(&x, &mut grad, &out).unwrap_err();
    assert!(matches!(
        err,
        ConvError::Capacity {
            item_len: 36,
            max_buffer_len: 20
        }
    ));
}

#[test]
fn test_mismatched_batches_are_rejected() {
    let c = cpu(&[4, 4, 1], &[3, 3, 1], Padding::Same, ControllerConfig::default());
    let mut grads = vec![vec![0.0; 16]; 2];
    let err = c.backprop(&mut grads, &[1.0; 9], &[vec![0.0; 16]]).unwrap_err();
    assert!(matches!(err, ConvError::BatchMismatch { inputs: 2, outputs: 1 }));

    let mut grad = [0.0; 9];
    let err = c.gradient(&[vec![0.0; 16]], &mut grad, &[vec![0.0; 15]]).unwrap_err();
    assert!(matches!(err, ConvError::LengthMismatch { index: 0, got: 15, .. }));
}

#[test]
fn test_concurrent_callers_see_sequential_results() {
    let mut rng = StdRng::seed_from_u64(77);
    let c = cpu(
        &[5, 5, 2],
        &[3, 3, 4],
        Padding::Same,
        ControllerConfig::default().with_max_buffer_len(50 * 3),
    );
    let g = *c.geometry();
    let x = random_batch(&mut rng, 10, g.input_len());
    let e = random_batch(&mut rng, 10, g.output_len());
    let w = random_vec(&mut rng, g.filter_len());

    let fwd = forward(&c, &x, &w);
    let back = input_grad(&c, &e, &w);
    let grad = weight_grad(&c, &x, &e);

    std::thread::scope(|s| {
        for _ in 0..3 {
            s.spawn(|| {
                for _ in 0..5 {
                    assert_eq!(forward(&c, &x, &w), fwd);
                }
            });
            s.spawn(|| {
                for _ in 0..5 {
                    assert_eq!(input_grad(&c, &e, &w), back);
                }
            });
            s.spawn(|| {
                for _ in 0..5 {
                    assert_eq!(weight_grad(&c, &x, &e), grad);
                }
            });
        }
    });

    assert_eq!(c.stats(KernelKind::Convolve).calls, 16);
    assert_eq!(c.stats(KernelKind::Gradient).calls, 16);
}
