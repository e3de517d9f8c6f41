// Engine tests — reference counting, scopes, disposal, keep, profiling

use tapir::prelude::*;
use tapir::PixelData;

fn engine() -> CpuEngine {
    Engine::new(CpuBackend::new())
}

fn read_f64(engine: &CpuEngine, t: &Tensor) -> Vec<f64> {
    engine.read_sync(t).unwrap().to_f64_vec().unwrap()
}

// Reference counting

#[test]
fn test_ref_count_tracks_buffers_and_bytes() {
    let mut eng = engine();
    let t = ops::zeros(&mut eng, (2, 2), DType::F32).unwrap();

    let mem = eng.memory();
    assert_eq!(mem.num_tensors, 1);
    assert_eq!(mem.num_data_buffers, 1);
    assert_eq!(mem.num_bytes, 16);
    assert_eq!(mem.backend.num_data_buffers, 1);
    assert_eq!(mem.backend.num_bytes, 16);

    // A view shares the buffer: tensor count goes up, buffer count doesn't.
    let v = eng.make_view(&t, (4,)).unwrap();
    let mem = eng.memory();
    assert_eq!(mem.num_tensors, 2);
    assert_eq!(mem.num_data_buffers, 1);
    assert_eq!(mem.num_bytes, 16);
    assert_eq!(eng.ref_count(t.data_id()), 2);

    // Disposing one handle keeps the buffer alive.
    eng.dispose_tensor(&t).unwrap();
    let mem = eng.memory();
    assert_eq!(mem.num_tensors, 1);
    assert_eq!(mem.num_data_buffers, 1);
    assert_eq!(eng.ref_count(t.data_id()), 1);

    // Disposing the last handle releases it.
    eng.dispose_tensor(&v).unwrap();
    let mem = eng.memory();
    assert_eq!(mem.num_tensors, 0);
    assert_eq!(mem.num_data_buffers, 0);
    assert_eq!(mem.num_bytes, 0);
    assert_eq!(mem.backend.num_data_buffers, 0);
}

#[test]
fn test_dispose_is_idempotent() {
    let mut eng = engine();
    let t = ops::ones(&mut eng, (3,), DType::I32).unwrap();
    eng.dispose_tensor(&t).unwrap();
    eng.dispose_tensor(&t).unwrap();
    assert_eq!(eng.memory().num_tensors, 0);
    assert_eq!(eng.memory().num_data_buffers, 0);
}

#[test]
fn test_complex_buffers_excluded_from_byte_counter() {
    let mut eng = engine();
    let _t = ops::tensor(&mut eng, Values::zeros(DType::C64, 2), (2,)).unwrap();

    let mem = eng.memory();
    assert_eq!(mem.num_tensors, 1);
    assert_eq!(mem.num_data_buffers, 1);
    // Engine bytes skip complex64; the backend still reports raw storage.
    assert_eq!(mem.num_bytes, 0);
    assert_eq!(mem.backend.num_bytes, 16);
}

// Scopes

#[test]
fn test_tidy_disposes_intermediates_keeps_result() {
    let mut eng = engine();
    let result = eng
        .tidy(Some("work"), |eng| {
            let a = ops::ones(eng, (2,), DType::F32).unwrap();
            let b = ops::ones(eng, (2,), DType::F32).unwrap();
            ops::add(eng, &a, &b)
        })
        .unwrap();

    // a, b, and nothing else were reclaimed; only the result survives.
    assert!(eng.is_live(&result));
    assert_eq!(eng.memory().num_tensors, 1);
    assert_eq!(read_f64(&eng, &result), vec![2.0, 2.0]);
}

#[test]
fn test_scope_balance_on_success_and_failure() {
    let mut eng = engine();
    assert_eq!(eng.scope_depth(), 1);

    let _ = eng.tidy(None, |eng| ops::zeros(eng, (2,), DType::F32));
    assert_eq!(eng.scope_depth(), 1);

    let failed: Result<Tensor> = eng.tidy(None, |eng| {
        let _leak = ops::zeros(eng, (2, 2), DType::F32).unwrap();
        Err(Error::msg("body failed"))
    });
    assert!(failed.is_err());
    // The scope was still closed and its tensors reclaimed.
    assert_eq!(eng.scope_depth(), 1);
    assert_eq!(eng.memory().num_tensors, 0);
}

#[test]
fn test_nested_tidy_result_promoted_to_outer_scope() {
    let mut eng = engine();
    let outer = eng
        .tidy(Some("outer"), |eng| {
            let inner = eng
                .tidy(Some("inner"), |eng| ops::ones(eng, (2,), DType::F32))
                .unwrap();
            // The inner result must still be usable here.
            ops::add(eng, &inner, &inner)
        })
        .unwrap();
    assert_eq!(read_f64(&eng, &outer), vec![2.0, 2.0]);
    assert_eq!(eng.memory().num_tensors, 1);
}

#[test]
fn test_keep_survives_every_enclosing_scope() {
    let mut eng = engine();
    let mut kept: Option<Tensor> = None;
    let _: () = eng
        .tidy(None, |eng| {
            eng.tidy(None, |eng| {
                let t = ops::ones(eng, (2,), DType::F32).unwrap();
                eng.keep(&t).unwrap();
                kept = Some(t);
                Ok(())
            })
        })
        .unwrap();
    let kept = kept.unwrap();
    assert!(eng.is_live(&kept));
    assert_eq!(read_f64(&eng, &kept), vec![1.0, 1.0]);
}

#[test]
fn test_safe_mode_rejects_top_level_tensors() {
    let config = EngineConfig::default().with_safe_mode(true);
    let mut eng = Engine::with_config(CpuBackend::new(), config);

    assert!(matches!(
        ops::zeros(&mut eng, (2,), DType::F32),
        Err(Error::SafeModeLeak)
    ));

    // Inside tidy the same creation is legal.
    let t = eng
        .tidy(None, |eng| {
            let t = ops::zeros(eng, (2,), DType::F32)?;
            eng.keep(&t)?;
            Ok(t)
        })
        .unwrap();
    assert!(eng.is_live(&t));

    // keep() at the outermost scope is also a leak.
    assert!(matches!(eng.keep(&t), Err(Error::SafeModeLeak)));
}

// Variables

#[test]
fn test_variables_exempt_from_scope_disposal() {
    let mut eng = engine();
    let w = eng
        .tidy(None, |eng| {
            eng.make_variable(
                "w",
                (2,),
                DType::F32,
                Some(Values::from_slice(&[1.0f32, 2.0])),
            )
        })
        .unwrap();
    assert!(eng.is_live(&w));
    assert_eq!(eng.variable("w").unwrap().id(), w.id());
    assert_eq!(read_f64(&eng, &w), vec![1.0, 2.0]);
}

#[test]
fn test_duplicate_variable_name_fails() {
    let mut eng = engine();
    eng.make_variable("w", (1,), DType::F32, None).unwrap();
    assert!(matches!(
        eng.make_variable("w", (1,), DType::F32, None),
        Err(Error::DuplicateVariable { .. })
    ));

    // Registering an existing tensor under a taken name fails the same way.
    let t = ops::zeros(&mut eng, (1,), DType::F32).unwrap();
    assert!(matches!(
        eng.register_variable("w", &t),
        Err(Error::DuplicateVariable { .. })
    ));
    eng.register_variable("w2", &t).unwrap();
    assert_eq!(eng.variable("w2").unwrap().id(), t.id());
}

#[test]
fn test_dispose_variables_frees_everything() {
    let mut eng = engine();
    eng.make_variable("a", (2,), DType::F32, None).unwrap();
    eng.make_variable("b", (3,), DType::I32, None).unwrap();
    assert_eq!(eng.memory().num_tensors, 2);
    eng.dispose_variables().unwrap();
    assert_eq!(eng.memory().num_tensors, 0);
    assert!(eng.variable("a").is_none());
}

// Reads, writes, and construction

#[test]
fn test_write_then_read_round_trip() {
    let mut eng = engine();
    let t = ops::zeros(&mut eng, (3,), DType::I32).unwrap();
    eng.write(&t, Values::from_slice(&[7i32, 8, 9])).unwrap();
    assert_eq!(read_f64(&eng, &t), vec![7.0, 8.0, 9.0]);
    assert_eq!(eng.read(&t).unwrap(), eng.read_sync(&t).unwrap());
}

#[test]
fn test_value_shape_and_dtype_validated() {
    let mut eng = engine();
    assert!(matches!(
        eng.make_tensor(
            Shape::from((3,)),
            DType::F32,
            Some(Values::from_slice(&[1.0f32]))
        ),
        Err(Error::ElementCountMismatch { .. })
    ));
    assert!(matches!(
        eng.make_tensor(
            Shape::from((1,)),
            DType::F32,
            Some(Values::from_slice(&[1i32]))
        ),
        Err(Error::DTypeMismatch { .. })
    ));
}

#[test]
fn test_tensor_buffer_to_tensor() {
    let mut eng = engine();
    let mut buf = TensorBuffer::new((2, 2), DType::F32, None).unwrap();
    buf.set(3.0, &[0, 1]).unwrap();
    buf.set(5.0, &[1, 0]).unwrap();
    let t = buf.to_tensor(&mut eng).unwrap();
    assert_eq!(read_f64(&eng, &t), vec![0.0, 3.0, 5.0, 0.0]);
}

#[test]
fn test_from_pixels_shape_and_values() {
    let mut eng = engine();
    let pixels = PixelData::new(2, 1, vec![1, 2, 3, 255, 4, 5, 6, 255]).unwrap();
    let t = ops::from_pixels(&mut eng, &pixels, 3).unwrap();
    assert_eq!(t.dims(), &[1, 2, 3]);
    assert_eq!(t.dtype(), DType::I32);
    assert_eq!(read_f64(&eng, &t), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
}

// Debug mode and profiling

#[test]
fn test_debug_mode_detects_nan() {
    let config = EngineConfig::default().with_debug_mode(true);
    let mut eng = Engine::with_config(CpuBackend::new(), config);

    let zero = ops::zeros(&mut eng, (1,), DType::F32).unwrap();
    let result = ops::div(&mut eng, &zero, &zero);
    match result {
        Err(Error::NanDetected { op }) => assert_eq!(op, "div"),
        other => panic!("expected NanDetected, got {:?}", other.map(|t| t.id())),
    }
}

#[test]
fn test_profile_records_kernels() {
    let mut eng = engine();
    let (result, info) = eng
        .profile(|eng| {
            eng.tidy(None, |eng| {
                let a = ops::ones(eng, (2, 2), DType::F32)?;
                let b = ops::add(eng, &a, &a)?;
                ops::mul(eng, &b, &b)
            })
        })
        .unwrap();

    assert_eq!(read_f64(&eng, &result), vec![4.0; 4]);
    let names: Vec<&str> = info.kernels.iter().map(|k| k.name.as_str()).collect();
    assert_eq!(names, vec!["add", "mul"]);
    assert!(info.peak_bytes >= 16);
    // Only the returned product survived the tidy.
    assert_eq!(info.new_tensors, 1);
    assert_eq!(info.kernels[0].input_shapes["a"], vec![2, 2]);
    assert_eq!(info.kernels[0].output_shapes, vec![vec![2, 2]]);
}

#[test]
fn test_memory_report_matches_backend() {
    let mut eng = engine();
    let _a = ops::zeros(&mut eng, (4,), DType::F32).unwrap();
    let _b = ops::zeros(&mut eng, (2,), DType::Bool).unwrap();
    let mem = eng.memory();
    assert_eq!(mem.num_data_buffers, mem.backend.num_data_buffers);
    assert_eq!(mem.num_bytes, 18);
    assert_eq!(mem.backend.num_bytes, 18);
}
