// Gradient tests — tape recording, filtering, backprop, custom gradients

use tapir::prelude::*;
use tapir::CustomGradResult;

fn engine() -> CpuEngine {
    Engine::new(CpuBackend::new())
}

fn read_f64(engine: &CpuEngine, t: &Tensor) -> Vec<f64> {
    engine.read_sync(t).unwrap().to_f64_vec().unwrap()
}

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (g, e) in got.iter().zip(expected) {
        assert!(approx_eq(*g, *e, tol), "expected {:?}, got {:?}", expected, got);
    }
}

// Basic derivatives

#[test]
fn test_grad_of_x_times_x() {
    let mut eng = engine();
    let x = ops::scalar(&mut eng, 3.0, DType::F32).unwrap();

    let result = eng
        .gradients(|eng| ops::mul(eng, &x, &x), &[x.clone()], None, false)
        .unwrap();

    assert_vec_approx(&read_f64(&eng, &result.value), &[9.0], 1e-6);
    let grad = result.grads[0].as_ref().unwrap();
    // d(x*x)/dx = 2x = 6
    assert_vec_approx(&read_f64(&eng, grad), &[6.0], 1e-6);
}

#[test]
fn test_grad_of_square_matches_mul() {
    let mut eng = engine();
    let x = ops::scalar(&mut eng, 3.0, DType::F32).unwrap();
    let result = eng
        .gradients(|eng| ops::square(eng, &x), &[x.clone()], None, false)
        .unwrap();
    assert_vec_approx(&read_f64(&eng, result.grads[0].as_ref().unwrap()), &[6.0], 1e-6);
}

#[test]
fn test_grad_accumulates_across_uses() {
    let mut eng = engine();
    let x = ops::scalar(&mut eng, 2.0, DType::F32).unwrap();

    // y = (x + x) * x = 2x^2, dy/dx = 4x = 8
    let result = eng
        .gradients(
            |eng| {
                let two_x = ops::add(eng, &x, &x)?;
                ops::mul(eng, &two_x, &x)
            },
            &[x.clone()],
            None,
            false,
        )
        .unwrap();

    assert_vec_approx(&read_f64(&eng, &result.value), &[8.0], 1e-6);
    assert_vec_approx(&read_f64(&eng, result.grads[0].as_ref().unwrap()), &[8.0], 1e-6);
}

#[test]
fn test_grad_of_sum_broadcasts_seed() {
    let mut eng = engine();
    let x = ops::tensor(&mut eng, Values::from_slice(&[1.0f32, 2.0, 3.0]), (3,)).unwrap();
    let result = eng
        .gradients(|eng| ops::sum(eng, &x), &[x.clone()], None, false)
        .unwrap();
    assert_vec_approx(&read_f64(&eng, &result.value), &[6.0], 1e-6);
    assert_vec_approx(
        &read_f64(&eng, result.grads[0].as_ref().unwrap()),
        &[1.0, 1.0, 1.0],
        1e-6,
    );
}

#[test]
fn test_grad_through_div_and_exp() {
    let mut eng = engine();
    let x = ops::scalar(&mut eng, 2.0, DType::F32).unwrap();
    let c = ops::scalar(&mut eng, 4.0, DType::F32).unwrap();

    // y = exp(x) / c, dy/dx = exp(x) / c
    let result = eng
        .gradients(
            |eng| {
                let e = ops::exp(eng, &x)?;
                ops::div(eng, &e, &c)
            },
            &[x.clone()],
            None,
            false,
        )
        .unwrap();
    let expected = (2.0f64).exp() / 4.0;
    assert_vec_approx(&read_f64(&eng, result.grads[0].as_ref().unwrap()), &[expected], 1e-4);
}

#[test]
fn test_grad_of_relu_masks_negative_side() {
    let mut eng = engine();
    let x = ops::tensor(&mut eng, Values::from_slice(&[-1.0f32, 0.0, 2.0]), (3,)).unwrap();
    let result = eng
        .gradients(
            |eng| {
                let y = ops::relu(eng, &x)?;
                ops::sum(eng, &y)
            },
            &[x.clone()],
            None,
            false,
        )
        .unwrap();
    assert_vec_approx(
        &read_f64(&eng, result.grads[0].as_ref().unwrap()),
        &[0.0, 0.0, 1.0],
        1e-6,
    );
}

#[test]
fn test_grad_through_reshape_restores_shape() {
    let mut eng = engine();
    let x = ops::tensor(
        &mut eng,
        Values::from_slice(&[1.0f32, 2.0, 3.0, 4.0]),
        (2, 2),
    )
    .unwrap();
    let result = eng
        .gradients(
            |eng| {
                let flat = ops::reshape(eng, &x, &[-1])?;
                ops::sum(eng, &flat)
            },
            &[x.clone()],
            None,
            false,
        )
        .unwrap();
    let grad = result.grads[0].as_ref().unwrap();
    assert_eq!(grad.dims(), &[2, 2]);
    assert_vec_approx(&read_f64(&eng, grad), &[1.0; 4], 1e-6);
}

// Seeds

#[test]
fn test_explicit_dy_seed_scales_gradients() {
    let mut eng = engine();
    let x = ops::scalar(&mut eng, 3.0, DType::F32).unwrap();
    let dy = ops::scalar(&mut eng, 2.0, DType::F32).unwrap();
    let result = eng
        .gradients(|eng| ops::mul(eng, &x, &x), &[x.clone()], Some(dy), false)
        .unwrap();
    assert_vec_approx(&read_f64(&eng, result.grads[0].as_ref().unwrap()), &[12.0], 1e-6);
}

#[test]
fn test_dy_shape_must_match_output() {
    let mut eng = engine();
    let x = ops::scalar(&mut eng, 3.0, DType::F32).unwrap();
    let bad_dy = ops::ones(&mut eng, (2,), DType::F32).unwrap();
    let result = eng.gradients(|eng| ops::mul(eng, &x, &x), &[x.clone()], Some(bad_dy), false);
    assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
}

// Disconnection and missing gradients

#[test]
fn test_disconnected_xs_fails_by_default() {
    let mut eng = engine();
    let x = ops::scalar(&mut eng, 3.0, DType::F32).unwrap();
    let result = eng.gradients(
        |eng| ops::scalar(eng, 5.0, DType::F32),
        &[x.clone()],
        None,
        false,
    );
    assert!(matches!(result, Err(Error::DisconnectedGradients)));
}

#[test]
fn test_disconnected_xs_allowed_when_requested() {
    let mut eng = engine();
    let x = ops::scalar(&mut eng, 3.0, DType::F32).unwrap();
    let result = eng
        .gradients(
            |eng| ops::scalar(eng, 5.0, DType::F32),
            &[x.clone()],
            None,
            true,
        )
        .unwrap();
    assert!(result.grads[0].is_none());
    assert_vec_approx(&read_f64(&eng, &result.value), &[5.0], 1e-6);
}

#[test]
fn test_empty_xs_is_a_contract_violation() {
    let mut eng = engine();
    let result = eng.gradients(|eng| ops::scalar(eng, 1.0, DType::F32), &[], None, true);
    assert!(result.is_err());
}

#[test]
fn test_op_without_gradient_fails_naming_it() {
    let mut eng = engine();
    let x = ops::scalar(&mut eng, 3.0, DType::F32).unwrap();
    // step is recorded without a gradient function.
    let result = eng.gradients(|eng| ops::step(eng, &x), &[x.clone()], None, false);
    match result {
        Err(Error::MissingGradient { op }) => assert_eq!(op, "step"),
        other => panic!("expected MissingGradient, got {:?}", other.is_ok()),
    }
}

// Tape scoping

#[test]
fn test_no_tape_outside_gradient_mode() {
    let mut eng = engine();
    assert!(!eng.is_tape_active());
    let a = ops::ones(&mut eng, (2,), DType::F32).unwrap();
    let _b = ops::add(&mut eng, &a, &a).unwrap();
    assert!(!eng.is_tape_active());
    assert_eq!(eng.tape_len(), 0);
}

#[test]
fn test_tape_records_one_node_per_outermost_kernel() {
    let mut eng = engine();
    let a = ops::ones(&mut eng, (2,), DType::F32).unwrap();

    eng.start_scope(Some("grad"), true);
    assert!(eng.is_tape_active());
    assert_eq!(eng.tape_len(), 0);

    let b = ops::add(&mut eng, &a, &a).unwrap();
    assert_eq!(eng.tape_len(), 1);
    let _c = ops::mul(&mut eng, &b, &b).unwrap();
    assert_eq!(eng.tape_len(), 2);

    eng.end_scope(None, true).unwrap();
    assert!(!eng.is_tape_active());
    assert_eq!(eng.tape_len(), 0);
}

#[test]
fn test_nested_gradient_scopes_share_one_tape() {
    let mut eng = engine();
    let a = ops::ones(&mut eng, (2,), DType::F32).unwrap();

    eng.start_scope(Some("outer"), true);
    let _ = ops::add(&mut eng, &a, &a).unwrap();
    eng.start_scope(Some("inner"), true);
    let _ = ops::add(&mut eng, &a, &a).unwrap();
    assert_eq!(eng.tape_len(), 2);
    eng.end_scope(None, true).unwrap();
    // Inner scope closed, but the tape survives until the outermost one.
    assert!(eng.is_tape_active());
    assert_eq!(eng.tape_len(), 2);
    eng.end_scope(None, true).unwrap();
    assert!(!eng.is_tape_active());
}

#[test]
fn test_tensors_promoted_while_tape_active() {
    let mut eng = engine();
    eng.start_scope(Some("grad"), true);

    let mut escaped: Option<Tensor> = None;
    let _: () = eng
        .tidy(None, |eng| {
            let t = ops::ones(eng, (2,), DType::F32)?;
            escaped = Some(t);
            Ok(())
        })
        .unwrap();
    // Not returned and not kept, but the tape may still need it: the
    // closing scope promotes it instead of disposing.
    let escaped = escaped.unwrap();
    assert!(eng.is_live(&escaped));

    eng.end_scope(None, true).unwrap();
    // With the tape gone, the promoted tensor was reclaimed.
    assert!(!eng.is_live(&escaped));
}

// Custom gradients

#[test]
fn test_custom_grad_overrides_gradient() {
    let mut eng = engine();
    let x = ops::scalar(&mut eng, 3.0, DType::F32).unwrap();

    // y = x^2 computed out of mul, with an explicit 2x * dy gradient.
    let result = eng
        .gradients(
            |eng| {
                let x = x.clone();
                eng.custom_grad("square_composite", &[x.clone()], move |eng, inputs| {
                    let value = ops::mul(eng, &inputs[0], &inputs[0])?;
                    let grad_x = x.clone();
                    Ok(CustomGradResult {
                        value,
                        grad_func: Box::new(move |eng, dy| {
                            let two_x = ops::add(eng, &grad_x, &grad_x)?;
                            Ok(vec![ops::mul(eng, dy, &two_x)?])
                        }),
                    })
                })
            },
            &[x.clone()],
            None,
            false,
        )
        .unwrap();

    assert_vec_approx(&read_f64(&eng, &result.value), &[9.0], 1e-6);
    assert_vec_approx(&read_f64(&eng, result.grads[0].as_ref().unwrap()), &[6.0], 1e-6);
}

#[test]
fn test_custom_grad_suppresses_inner_recording() {
    let mut eng = engine();
    let x = ops::scalar(&mut eng, 2.0, DType::F32).unwrap();

    eng.start_scope(Some("grad"), true);
    let _y = eng
        .custom_grad("composite", &[x.clone()], |eng, inputs| {
            // Two internal kernels; neither may land on the tape.
            let a = ops::add(eng, &inputs[0], &inputs[0])?;
            let value = ops::mul(eng, &a, &inputs[0])?;
            Ok(CustomGradResult {
                value,
                grad_func: Box::new(|eng, dy| {
                    let shape = dy.shape().clone();
                    Ok(vec![eng.make_view(dy, shape)?])
                }),
            })
        })
        .unwrap();
    // Exactly one node: the composite itself.
    assert_eq!(eng.tape_len(), 1);
    eng.end_scope(None, true).unwrap();
}

#[test]
fn test_custom_grad_validates_gradient_count() {
    let mut eng = engine();
    let x = ops::scalar(&mut eng, 2.0, DType::F32).unwrap();

    let result = eng.gradients(
        |eng| {
            eng.custom_grad("bad_count", &[x.clone()], |eng, inputs| {
                let value = ops::mul(eng, &inputs[0], &inputs[0])?;
                Ok(CustomGradResult {
                    value,
                    grad_func: Box::new(|_eng, _dy| Ok(vec![])),
                })
            })
        },
        &[x.clone()],
        None,
        false,
    );
    assert!(matches!(
        result,
        Err(Error::GradientCountMismatch { expected: 1, got: 0, .. })
    ));
}

#[test]
fn test_custom_grad_shape_mismatch_names_op_and_input() {
    let mut eng = engine();
    let x = ops::scalar(&mut eng, 2.0, DType::F32).unwrap();

    let result = eng.gradients(
        |eng| {
            eng.custom_grad("bad_shape", &[x.clone()], |eng, inputs| {
                let value = ops::mul(eng, &inputs[0], &inputs[0])?;
                Ok(CustomGradResult {
                    value,
                    // Wrong shape: the input is a scalar.
                    grad_func: Box::new(|eng, _dy| Ok(vec![ops::ones(eng, (2,), DType::F32)?])),
                })
            })
        },
        &[x.clone()],
        None,
        false,
    );
    match result {
        Err(Error::GradientShapeMismatch { op, input, .. }) => {
            assert_eq!(op, "bad_shape");
            assert_eq!(input, "0");
        }
        other => panic!("expected GradientShapeMismatch, got {:?}", other.is_ok()),
    }
}

// Housekeeping around gradients()

#[test]
fn test_gradients_reclaims_backprop_intermediates() {
    let mut eng = engine();
    let x = ops::scalar(&mut eng, 3.0, DType::F32).unwrap();
    assert_eq!(eng.memory().num_tensors, 1);

    let result = eng
        .gradients(|eng| ops::mul(eng, &x, &x), &[x.clone()], None, false)
        .unwrap();

    // Live afterwards: x, the value, and the accumulated gradient.
    assert_eq!(eng.memory().num_tensors, 3);
    assert!(eng.is_live(&result.value));
    assert!(eng.is_live(result.grads[0].as_ref().unwrap()));
}

#[test]
fn test_cast_gradient_returns_to_input_dtype() {
    let mut eng = engine();
    let x = ops::tensor(&mut eng, Values::from_slice(&[1.0f32, 2.0]), (2,)).unwrap();
    let result = eng
        .gradients(
            |eng| {
                let as_int = ops::cast(eng, &x, DType::I32)?;
                let back = ops::cast(eng, &as_int, DType::F32)?;
                ops::sum(eng, &back)
            },
            &[x.clone()],
            None,
            false,
        )
        .unwrap();
    let grad = result.grads[0].as_ref().unwrap();
    assert_eq!(grad.dtype(), DType::F32);
    assert_eq!(grad.dims(), &[2]);
}
