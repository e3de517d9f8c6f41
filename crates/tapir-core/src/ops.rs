use std::collections::HashMap;

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::backend::{Backend, PixelData};
use crate::bail;
use crate::dtype::{has_encoding_loss, sum_out_type, upcast_type, DType};
use crate::engine::{Engine, KernelBackward};
use crate::error::{Error, Result};
use crate::shape::{infer_from_implicit_shape, squeeze_shape, Shape};
use crate::tape::InputGradientFn;
use crate::tensor::Tensor;
use crate::values::Values;

// Ops — kernels expressed against the engine contract
//
// Every op here follows the same recipe: validate shapes/dtypes, then
// hand the engine a forward closure (which computes values through the
// tracker surface) and optionally a backward closure (which answers with
// one lazy gradient producer per named input). The engine decides whether
// the call lands on the tape.
//
// The numeric work is deliberately plain: read, loop, write. Kernel
// sophistication lives behind the Backend seam, not here.

// Creation ops

/// A scalar tensor holding one value.
pub fn scalar<B: Backend>(engine: &mut Engine<B>, value: f64, dtype: DType) -> Result<Tensor> {
    let values = Values::from_f64_vec(dtype, vec![value])?;
    engine.make_tensor(Shape::scalar(), dtype, Some(values))
}

/// A tensor from explicit values; the dtype is taken from the values.
pub fn tensor<B: Backend>(
    engine: &mut Engine<B>,
    values: Values,
    shape: impl Into<Shape>,
) -> Result<Tensor> {
    let dtype = values.dtype();
    engine.make_tensor(shape, dtype, Some(values))
}

/// A zero-filled tensor.
pub fn zeros<B: Backend>(
    engine: &mut Engine<B>,
    shape: impl Into<Shape>,
    dtype: DType,
) -> Result<Tensor> {
    let shape = shape.into();
    let values = Values::zeros(dtype, shape.elem_count());
    engine.make_tensor(shape, dtype, Some(values))
}

/// A one-filled tensor.
pub fn ones<B: Backend>(
    engine: &mut Engine<B>,
    shape: impl Into<Shape>,
    dtype: DType,
) -> Result<Tensor> {
    let shape = shape.into();
    let values = Values::ones(dtype, shape.elem_count());
    engine.make_tensor(shape, dtype, Some(values))
}

/// A constant-filled tensor.
pub fn fill<B: Backend>(
    engine: &mut Engine<B>,
    shape: impl Into<Shape>,
    value: f64,
    dtype: DType,
) -> Result<Tensor> {
    let shape = shape.into();
    let values = Values::from_f64_vec(dtype, vec![value; shape.elem_count()])?;
    engine.make_tensor(shape, dtype, Some(values))
}

/// Zeros with the shape and dtype of an existing tensor.
pub fn zeros_like<B: Backend>(engine: &mut Engine<B>, t: &Tensor) -> Result<Tensor> {
    zeros(engine, t.shape().clone(), t.dtype())
}

/// Ones with the shape and dtype of an existing tensor.
pub fn ones_like<B: Backend>(engine: &mut Engine<B>, t: &Tensor) -> Result<Tensor> {
    ones(engine, t.shape().clone(), t.dtype())
}

/// A float32 tensor with uniform samples from [lo, hi).
pub fn random_uniform<B: Backend>(
    engine: &mut Engine<B>,
    shape: impl Into<Shape>,
    lo: f64,
    hi: f64,
) -> Result<Tensor> {
    let shape = shape.into();
    let mut rng = rand::thread_rng();
    let data: Vec<f64> = (0..shape.elem_count())
        .map(|_| {
            let r: f64 = rng.gen();
            hi * r + (1.0 - r) * lo
        })
        .collect();
    engine.make_tensor(shape, DType::F32, Some(Values::from_f64_vec(DType::F32, data)?))
}

/// A float32 tensor with normal samples (given mean and stddev).
pub fn random_normal<B: Backend>(
    engine: &mut Engine<B>,
    shape: impl Into<Shape>,
    mean: f64,
    std: f64,
) -> Result<Tensor> {
    let shape = shape.into();
    let normal = Normal::new(mean, std)
        .map_err(|e| Error::msg(format!("invalid normal distribution: {}", e)))?;
    let mut rng = rand::thread_rng();
    let data: Vec<f64> = (0..shape.elem_count())
        .map(|_| normal.sample(&mut rng))
        .collect();
    engine.make_tensor(shape, DType::F32, Some(Values::from_f64_vec(DType::F32, data)?))
}

/// An int32 tensor of shape [height, width, num_channels] decoded from
/// raw RGBA pixels by the backend.
pub fn from_pixels<B: Backend>(
    engine: &mut Engine<B>,
    pixels: &PixelData,
    num_channels: usize,
) -> Result<Tensor> {
    let values = B::from_pixels(pixels, num_channels)?;
    engine.make_tensor(
        (pixels.height, pixels.width, num_channels),
        DType::I32,
        Some(values),
    )
}

// Elementwise binary ops

/// Elementwise addition. Gradients pass the output gradient through to
/// both operands.
pub fn add<B: Backend>(engine: &mut Engine<B>, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    assert_same_shape(a, b)?;
    let (fa, fb) = (a.clone(), b.clone());
    let backward: KernelBackward<B> = Box::new(|_engine, dys, _saved| {
        let dy = output_grad(dys)?;
        let mut grads = grad_map();
        // Fresh aliases: if one accumulator is later disposed, the other
        // must not lose its buffer.
        let dy_a = dy.clone();
        grads.insert(
            "a".to_string(),
            lazy(move |eng| {
                let shape = dy_a.shape().clone();
                eng.make_view(&dy_a, shape)
            }),
        );
        grads.insert(
            "b".to_string(),
            lazy(move |eng| {
                let shape = dy.shape().clone();
                eng.make_view(&dy, shape)
            }),
        );
        Ok(grads)
    });
    let outputs = engine.run_kernel(
        "add",
        named_inputs(&[("a", a), ("b", b)]),
        move |eng, _save| Ok(vec![eval_binary(eng, "add", &fa, &fb, |x, y| x + y)?]),
        Some(backward),
    )?;
    single("add", outputs)
}

/// Elementwise subtraction.
pub fn sub<B: Backend>(engine: &mut Engine<B>, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    assert_same_shape(a, b)?;
    let (fa, fb) = (a.clone(), b.clone());
    let backward: KernelBackward<B> = Box::new(|_engine, dys, _saved| {
        let dy = output_grad(dys)?;
        let mut grads = grad_map();
        let dy_a = dy.clone();
        grads.insert(
            "a".to_string(),
            lazy(move |eng| {
                let shape = dy_a.shape().clone();
                eng.make_view(&dy_a, shape)
            }),
        );
        grads.insert("b".to_string(), lazy(move |eng| neg(eng, &dy)));
        Ok(grads)
    });
    let outputs = engine.run_kernel(
        "sub",
        named_inputs(&[("a", a), ("b", b)]),
        move |eng, _save| Ok(vec![eval_binary(eng, "sub", &fa, &fb, |x, y| x - y)?]),
        Some(backward),
    )?;
    single("sub", outputs)
}

/// Elementwise multiplication. Saves both operands for the backward pass:
/// d/da = dy * b, d/db = dy * a.
pub fn mul<B: Backend>(engine: &mut Engine<B>, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    assert_same_shape(a, b)?;
    let (fa, fb) = (a.clone(), b.clone());
    let backward: KernelBackward<B> = Box::new(|_engine, dys, saved| {
        let dy = output_grad(dys)?;
        let (a, b) = saved_pair("mul", saved)?;
        let mut grads = grad_map();
        let dy_a = dy.clone();
        grads.insert("a".to_string(), lazy(move |eng| mul(eng, &dy_a, &b)));
        grads.insert("b".to_string(), lazy(move |eng| mul(eng, &dy, &a)));
        Ok(grads)
    });
    let outputs = engine.run_kernel(
        "mul",
        named_inputs(&[("a", a), ("b", b)]),
        move |eng, save| {
            save.save(&fa);
            save.save(&fb);
            Ok(vec![eval_binary(eng, "mul", &fa, &fb, |x, y| x * y)?])
        },
        Some(backward),
    )?;
    single("mul", outputs)
}

/// Elementwise division: d/da = dy / b, d/db = -dy * a / b².
pub fn div<B: Backend>(engine: &mut Engine<B>, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    assert_same_shape(a, b)?;
    let (fa, fb) = (a.clone(), b.clone());
    let backward: KernelBackward<B> = Box::new(|_engine, dys, saved| {
        let dy = output_grad(dys)?;
        let (a, b) = saved_pair("div", saved)?;
        let mut grads = grad_map();
        {
            let (dy, b) = (dy.clone(), b.clone());
            grads.insert("a".to_string(), lazy(move |eng| div(eng, &dy, &b)));
        }
        grads.insert(
            "b".to_string(),
            lazy(move |eng| {
                let num = mul(eng, &dy, &a)?;
                let denom = mul(eng, &b, &b)?;
                let quotient = div(eng, &num, &denom)?;
                neg(eng, &quotient)
            }),
        );
        Ok(grads)
    });
    let outputs = engine.run_kernel(
        "div",
        named_inputs(&[("a", a), ("b", b)]),
        move |eng, save| {
            save.save(&fa);
            save.save(&fb);
            Ok(vec![eval_binary(eng, "div", &fa, &fb, |x, y| x / y)?])
        },
        Some(backward),
    )?;
    single("div", outputs)
}

// Elementwise unary ops

/// Elementwise negation.
pub fn neg<B: Backend>(engine: &mut Engine<B>, x: &Tensor) -> Result<Tensor> {
    let fx = x.clone();
    let backward: KernelBackward<B> = Box::new(|_engine, dys, _saved| {
        let dy = output_grad(dys)?;
        let mut grads = grad_map();
        grads.insert("x".to_string(), lazy(move |eng| neg(eng, &dy)));
        Ok(grads)
    });
    let outputs = engine.run_kernel(
        "neg",
        named_inputs(&[("x", x)]),
        move |eng, _save| Ok(vec![eval_unary(eng, "neg", &fx, |v| -v)?]),
        Some(backward),
    )?;
    single("neg", outputs)
}

/// Elementwise exponential. Saves its output: d/dx = dy * exp(x).
pub fn exp<B: Backend>(engine: &mut Engine<B>, x: &Tensor) -> Result<Tensor> {
    let fx = x.clone();
    let backward: KernelBackward<B> = Box::new(|_engine, dys, saved| {
        let dy = output_grad(dys)?;
        let y = saved_single("exp", saved)?;
        let mut grads = grad_map();
        grads.insert("x".to_string(), lazy(move |eng| mul(eng, &dy, &y)));
        Ok(grads)
    });
    let outputs = engine.run_kernel(
        "exp",
        named_inputs(&[("x", x)]),
        move |eng, save| {
            let y = eval_unary(eng, "exp", &fx, f64::exp)?;
            save.save(&y);
            Ok(vec![y])
        },
        Some(backward),
    )?;
    single("exp", outputs)
}

/// Elementwise square. Saves its input: d/dx = dy * 2x.
pub fn square<B: Backend>(engine: &mut Engine<B>, x: &Tensor) -> Result<Tensor> {
    let fx = x.clone();
    let backward: KernelBackward<B> = Box::new(|_engine, dys, saved| {
        let dy = output_grad(dys)?;
        let x = saved_single("square", saved)?;
        let mut grads = grad_map();
        grads.insert(
            "x".to_string(),
            lazy(move |eng| {
                let two_x = add(eng, &x, &x)?;
                mul(eng, &dy, &two_x)
            }),
        );
        Ok(grads)
    });
    let outputs = engine.run_kernel(
        "square",
        named_inputs(&[("x", x)]),
        move |eng, save| {
            save.save(&fx);
            Ok(vec![eval_unary(eng, "square", &fx, |v| v * v)?])
        },
        Some(backward),
    )?;
    single("square", outputs)
}

/// Elementwise rectifier. Saves its output: d/dx = dy where x > 0.
pub fn relu<B: Backend>(engine: &mut Engine<B>, x: &Tensor) -> Result<Tensor> {
    let fx = x.clone();
    let backward: KernelBackward<B> = Box::new(|_engine, dys, saved| {
        let dy = output_grad(dys)?;
        let y = saved_single("relu", saved)?;
        let mut grads = grad_map();
        grads.insert(
            "x".to_string(),
            lazy(move |eng| {
                let mask = step(eng, &y)?;
                mul(eng, &dy, &mask)
            }),
        );
        Ok(grads)
    });
    let outputs = engine.run_kernel(
        "relu",
        named_inputs(&[("x", x)]),
        move |eng, save| {
            let y = eval_unary(eng, "relu", &fx, |v| v.max(0.0))?;
            save.save(&y);
            Ok(vec![y])
        },
        Some(backward),
    )?;
    single("relu", outputs)
}

/// Elementwise unit step (1 where positive). Recorded without a gradient;
/// it only appears on the backward side of relu.
pub fn step<B: Backend>(engine: &mut Engine<B>, x: &Tensor) -> Result<Tensor> {
    let fx = x.clone();
    let outputs = engine.run_kernel(
        "step",
        named_inputs(&[("x", x)]),
        move |eng, _save| {
            Ok(vec![eval_unary(eng, "step", &fx, |v| {
                if v > 0.0 {
                    1.0
                } else {
                    0.0
                }
            })?])
        },
        None,
    )?;
    single("step", outputs)
}

// Reductions and shape ops

/// Sum of all elements, as a scalar. Bool inputs promote to int32. The
/// gradient broadcasts dy back across the input's shape.
pub fn sum<B: Backend>(engine: &mut Engine<B>, x: &Tensor) -> Result<Tensor> {
    let out_dtype = sum_out_type(x.dtype());
    if out_dtype == DType::C64 {
        bail!("'sum' is not supported for complex64 tensors");
    }
    let fx = x.clone();
    let in_shape = x.shape().clone();
    let in_dtype = x.dtype();
    let backward: KernelBackward<B> = Box::new(move |_engine, dys, _saved| {
        let dy = output_grad(dys)?;
        let mut grads = grad_map();
        let (shape, dtype) = (in_shape.clone(), in_dtype);
        grads.insert(
            "x".to_string(),
            lazy(move |eng| {
                let dy_value = eng
                    .read_sync(&dy)?
                    .to_f64_vec()?
                    .first()
                    .copied()
                    .unwrap_or(0.0);
                fill(eng, shape, dy_value, dtype)
            }),
        );
        Ok(grads)
    });
    let outputs = engine.run_kernel(
        "sum",
        named_inputs(&[("x", x)]),
        move |eng, _save| {
            let total: f64 = eng.read_sync(&fx)?.to_f64_vec()?.iter().sum();
            let values = Values::from_f64_vec(out_dtype, vec![total])?;
            Ok(vec![eng.make_tensor(Shape::scalar(), out_dtype, Some(values))?])
        },
        Some(backward),
    )?;
    single("sum", outputs)
}

/// Reshape to a new shape with the same element count. The target shape
/// may hold one `-1` wildcard. Shares the input's buffer; the gradient is
/// the output gradient viewed back under the input's shape.
pub fn reshape<B: Backend>(
    engine: &mut Engine<B>,
    x: &Tensor,
    shape_spec: &[i64],
) -> Result<Tensor> {
    let resolved = Shape::new(infer_from_implicit_shape(shape_spec, x.size())?);
    let fx = x.clone();
    let src_shape = x.shape().clone();
    let backward: KernelBackward<B> = Box::new(move |_engine, dys, _saved| {
        let dy = output_grad(dys)?;
        let mut grads = grad_map();
        let src_shape = src_shape.clone();
        grads.insert(
            "x".to_string(),
            lazy(move |eng| eng.make_view(&dy, src_shape)),
        );
        Ok(grads)
    });
    let outputs = engine.run_kernel(
        "reshape",
        named_inputs(&[("x", x)]),
        move |eng, _save| Ok(vec![eng.make_view(&fx, resolved)?]),
        Some(backward),
    )?;
    single("reshape", outputs)
}

/// Drop size-1 dimensions (all of them, or the given axes).
pub fn squeeze<B: Backend>(
    engine: &mut Engine<B>,
    x: &Tensor,
    axes: Option<&[usize]>,
) -> Result<Tensor> {
    let (new_dims, _kept) = squeeze_shape(x.dims(), axes)?;
    let spec: Vec<i64> = new_dims.iter().map(|&d| d as i64).collect();
    reshape(engine, x, &spec)
}

/// Flatten to one dimension.
pub fn flatten<B: Backend>(engine: &mut Engine<B>, x: &Tensor) -> Result<Tensor> {
    reshape(engine, x, &[x.size() as i64])
}

/// View a size-1 tensor as a scalar.
pub fn as_scalar<B: Backend>(engine: &mut Engine<B>, x: &Tensor) -> Result<Tensor> {
    if x.size() != 1 {
        bail!("as_scalar expects a tensor with exactly 1 element, got {}", x.size());
    }
    reshape(engine, x, &[])
}

/// Convert to another dtype, allocating a new buffer. The gradient casts
/// the output gradient back to the input's dtype.
pub fn cast<B: Backend>(engine: &mut Engine<B>, x: &Tensor, dtype: DType) -> Result<Tensor> {
    if engine.config().debug_mode && has_encoding_loss(x.dtype(), dtype) {
        println!(
            "warning: casting {} to {} may lose information",
            x.dtype(),
            dtype
        );
    }
    let fx = x.clone();
    let in_dtype = x.dtype();
    let backward: KernelBackward<B> = Box::new(move |_engine, dys, _saved| {
        let dy = output_grad(dys)?;
        let mut grads = grad_map();
        grads.insert("x".to_string(), lazy(move |eng| cast(eng, &dy, in_dtype)));
        Ok(grads)
    });
    let debug_mode = engine.config().debug_mode;
    let outputs = engine.run_kernel(
        "cast",
        named_inputs(&[("x", x)]),
        move |eng, _save| {
            let converted = eng.read_sync(&fx)?.convert(dtype, debug_mode)?;
            Ok(vec![eng.make_tensor(fx.shape().clone(), dtype, Some(converted))?])
        },
        Some(backward),
    )?;
    single("cast", outputs)
}

// Helpers shared by the ops above

fn named_inputs(pairs: &[(&str, &Tensor)]) -> HashMap<String, Tensor> {
    pairs
        .iter()
        .map(|(role, t)| (role.to_string(), (*t).clone()))
        .collect()
}

fn grad_map<B: Backend>() -> HashMap<String, InputGradientFn<B>> {
    HashMap::new()
}

fn lazy<B, F>(f: F) -> InputGradientFn<B>
where
    B: Backend,
    F: FnOnce(&mut Engine<B>) -> Result<Tensor> + 'static,
{
    Box::new(f)
}

fn single(op: &str, mut outputs: Vec<Tensor>) -> Result<Tensor> {
    if outputs.len() != 1 {
        bail!(
            "'{}' was expected to produce exactly one output, got {}",
            op,
            outputs.len()
        );
    }
    Ok(outputs.remove(0))
}

fn output_grad(dys: &[Tensor]) -> Result<Tensor> {
    dys.first()
        .cloned()
        .ok_or_else(|| Error::msg("kernel gradient invoked with no output gradient"))
}

fn saved_single(op: &str, saved: &[Tensor]) -> Result<Tensor> {
    match saved {
        [t] => Ok(t.clone()),
        _ => bail!("'{}' expected 1 saved tensor, got {}", op, saved.len()),
    }
}

fn saved_pair(op: &str, saved: &[Tensor]) -> Result<(Tensor, Tensor)> {
    match saved {
        [a, b] => Ok((a.clone(), b.clone())),
        _ => bail!("'{}' expected 2 saved tensors, got {}", op, saved.len()),
    }
}

fn assert_same_shape(a: &Tensor, b: &Tensor) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(Error::ShapeMismatch {
            expected: a.shape().clone(),
            got: b.shape().clone(),
        });
    }
    Ok(())
}

fn eval_binary<B: Backend>(
    engine: &mut Engine<B>,
    op: &str,
    a: &Tensor,
    b: &Tensor,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Tensor> {
    let out_dtype = upcast_type(a.dtype(), b.dtype());
    if out_dtype == DType::C64 {
        bail!("'{}' is not supported for complex64 tensors", op);
    }
    let av = engine.read_sync(a)?.to_f64_vec()?;
    let bv = engine.read_sync(b)?.to_f64_vec()?;
    let out: Vec<f64> = av.iter().zip(&bv).map(|(&x, &y)| f(x, y)).collect();
    let values = Values::from_f64_vec(out_dtype, out)?;
    engine.make_tensor(a.shape().clone(), out_dtype, Some(values))
}

fn eval_unary<B: Backend>(
    engine: &mut Engine<B>,
    op: &str,
    x: &Tensor,
    f: impl Fn(f64) -> f64,
) -> Result<Tensor> {
    if x.dtype() == DType::C64 {
        bail!("'{}' is not supported for complex64 tensors", op);
    }
    let xv = engine.read_sync(x)?.to_f64_vec()?;
    let out: Vec<f64> = xv.into_iter().map(f).collect();
    let values = Values::from_f64_vec(x.dtype(), out)?;
    engine.make_tensor(x.shape().clone(), x.dtype(), Some(values))
}
