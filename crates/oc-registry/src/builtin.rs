use oc_kernel_cpu as kernels;
use oc_kernel_cpu::KernelError;

use crate::{AttrValue, GRAD_SUFFIX, KernelContext, OpError, OpKernel, OpSchema, SlotArity, SlotKind};

pub(crate) fn schemas() -> Vec<OpSchema> {
    vec![
        OpSchema::new("scale", kernel(infer_like_x, scale))
            .input("X")
            .output("Out")
            .attr("factor", Some(AttrValue::Float(1.0)))
            .accelerator(true)
            .grad("scale_grad"),
        grad_schema("scale_grad", &["X"], kernel(infer_input_grads, scale_grad))
            .attr("factor", Some(AttrValue::Float(1.0)))
            .accelerator(true),
        OpSchema::new("square", kernel(infer_like_x, square))
            .input("X")
            .output("Out")
            .accelerator(true)
            .grad("square_grad"),
        grad_schema("square_grad", &["X"], kernel(infer_input_grads, square_grad)).accelerator(true),
        OpSchema::new("mul", kernel(infer_like_x, mul))
            .input("X")
            .input("Y")
            .output("Out")
            .accelerator(true)
            .grad("mul_grad"),
        grad_schema("mul_grad", &["X", "Y"], kernel(infer_input_grads, mul_grad)).accelerator(true),
        OpSchema::new("sum", kernel(infer_sum, sum))
            .repeated_input("X")
            .output("Out")
            .grad("sum_grad"),
        grad_schema("sum_grad", &[], kernel(infer_input_grads, sum_grad))
            .repeated_input("X")
            .slot(SlotKind::Output, "X@GRAD", SlotArity::Repeated, true),
        OpSchema::new("sigmoid", kernel(infer_like_x, sigmoid))
            .input("X")
            .output("Out")
            .accelerator(true)
            .grad("sigmoid_grad"),
        grad_schema("sigmoid_grad", &["X"], kernel(infer_input_grads, sigmoid_grad)).accelerator(true),
        OpSchema::new("increment", kernel(infer_like_x, increment))
            .input("X")
            .output("Out")
            .attr("step", Some(AttrValue::Float(1.0)))
            .grad("increment_grad"),
        grad_schema("increment_grad", &["X"], kernel(infer_input_grads, increment_grad))
            .attr("step", Some(AttrValue::Float(1.0))),
        OpSchema::new("fill_zeros_like", kernel(infer_fill_zeros_like, fill_zeros_like))
            .input("Src")
            .output("Dst")
            .accelerator(true),
        OpSchema::new("gaussian_random", kernel(infer_gaussian_random, gaussian_random))
            .output("Out")
            .attr("shape", None)
            .attr("mean", Some(AttrValue::Float(0.0)))
            .attr("std", Some(AttrValue::Float(1.0)))
            .attr("seed", Some(AttrValue::Int(0)))
            .accelerator(true),
    ]
}

fn kernel(infer_shape: crate::KernelFn, compute: crate::KernelFn) -> OpKernel {
    OpKernel {
        infer_shape,
        compute,
    }
}

/// Gradient op reading forward `X`, `Out` and `Out@GRAD`, writing one
/// optional single gradient per listed forward input.
fn grad_schema(op_type: &str, single_inputs: &[&str], kernel: OpKernel) -> OpSchema {
    let mut schema = OpSchema::new(op_type, kernel);
    for name in single_inputs {
        schema = schema.slot(SlotKind::Input, name, SlotArity::Single, true);
    }
    schema = schema
        .slot(SlotKind::Input, "Out", SlotArity::Single, true)
        .input("Out@GRAD");
    for name in single_inputs {
        schema = schema.slot(SlotKind::Output, &format!("{name}{GRAD_SUFFIX}"), SlotArity::Single, true);
    }
    schema
}

fn infer_like_x(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    let shape = ctx.input_shape("X")?;
    ctx.shape_output("Out", &shape)
}

fn infer_sum(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    let op = ctx.operator();
    let first = op
        .input("X")
        .and_then(|binding| binding.bound_names().next())
        .ok_or(OpError::Kernel(KernelError::EmptyInputList))?;
    let shape = ctx.var_shape(first)?;
    ctx.shape_output("Out", &shape)
}

/// Shapes every `S@GRAD` output like the forward variable bound to `S`.
fn infer_input_grads(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    let op = ctx.operator();
    for (slot, grads) in op.outputs() {
        let Some(forward_slot) = slot.strip_suffix(GRAD_SUFFIX) else {
            continue;
        };
        let Some(forward) = op.input(forward_slot) else {
            continue;
        };
        for (grad_name, forward_name) in grads.names().iter().zip(forward.names()) {
            if grad_name == crate::EMPTY_VAR_NAME {
                continue;
            }
            let shape = ctx.var_shape(forward_name)?;
            ctx.shape_var(grad_name, &shape)?;
        }
    }
    Ok(())
}

fn infer_fill_zeros_like(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    let shape = ctx.input_shape("Src")?;
    ctx.shape_output("Dst", &shape)
}

fn gaussian_shape(ctx: &KernelContext<'_>) -> Result<Vec<usize>, OpError> {
    ctx.attr_ints("shape")?
        .iter()
        .map(|dim| match usize::try_from(*dim) {
            Ok(dim) if dim > 0 => Ok(dim),
            _ => Err(OpError::Kernel(KernelError::InvalidAttribute {
                name: "shape",
                reason: format!("dimensions must be positive, got {dim}"),
            })),
        })
        .collect()
}

fn infer_gaussian_random(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    let shape = gaussian_shape(ctx)?;
    ctx.shape_output("Out", &shape)
}

fn scale(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    let factor = ctx.attr_f32("factor")?;
    let x = ctx.input("X")?;
    let shape = x.shape().to_vec();
    let out = kernels::scale(x, factor);
    ctx.write_output("Out", out, &shape)
}

fn scale_grad(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    if !ctx.has_output("X@GRAD") {
        return Ok(());
    }
    let factor = ctx.attr_f32("factor")?;
    let out_grad = ctx.input("Out@GRAD")?;
    let shape = out_grad.shape().to_vec();
    let x_grad = kernels::scale(out_grad, factor);
    ctx.write_output("X@GRAD", x_grad, &shape)
}

fn square(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    let x = ctx.input("X")?;
    let shape = x.shape().to_vec();
    let out = kernels::square(x);
    ctx.write_output("Out", out, &shape)
}

fn square_grad(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    if !ctx.has_output("X@GRAD") {
        return Ok(());
    }
    let x = ctx.input("X")?;
    let shape = x.shape().to_vec();
    let x_grad = kernels::square_grad(x, ctx.input("Out@GRAD")?)?;
    ctx.write_output("X@GRAD", x_grad, &shape)
}

fn mul(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    let x = ctx.input("X")?;
    let shape = x.shape().to_vec();
    let out = kernels::mul(x, ctx.input("Y")?)?;
    ctx.write_output("Out", out, &shape)
}

fn mul_grad(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    if ctx.has_output("X@GRAD") {
        let y = ctx.input("Y")?;
        let shape = y.shape().to_vec();
        let x_grad = kernels::mul(ctx.input("Out@GRAD")?, y)?;
        ctx.write_output("X@GRAD", x_grad, &shape)?;
    }
    if ctx.has_output("Y@GRAD") {
        let x = ctx.input("X")?;
        let shape = x.shape().to_vec();
        let y_grad = kernels::mul(ctx.input("Out@GRAD")?, x)?;
        ctx.write_output("Y@GRAD", y_grad, &shape)?;
    }
    Ok(())
}

fn sum(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    let inputs = ctx.inputs("X")?;
    let shape = inputs
        .first()
        .map(|tensor| tensor.shape().to_vec())
        .ok_or(OpError::Kernel(KernelError::EmptyInputList))?;
    let out = kernels::sum(&inputs)?;
    ctx.write_output("Out", out, &shape)
}

fn sum_grad(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    if !ctx.has_output("X@GRAD") {
        return Ok(());
    }
    let out_grad = ctx.input("Out@GRAD")?;
    let shape = out_grad.shape().to_vec();
    let values = out_grad.values().to_vec();
    for name in ctx.output_names("X@GRAD")? {
        ctx.write_var(name, values.clone(), &shape)?;
    }
    Ok(())
}

fn sigmoid(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    let x = ctx.input("X")?;
    let shape = x.shape().to_vec();
    let out = kernels::sigmoid(x);
    ctx.write_output("Out", out, &shape)
}

fn sigmoid_grad(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    if !ctx.has_output("X@GRAD") {
        return Ok(());
    }
    let out = ctx.input("Out")?;
    let shape = out.shape().to_vec();
    let x_grad = kernels::sigmoid_grad(out, ctx.input("Out@GRAD")?)?;
    ctx.write_output("X@GRAD", x_grad, &shape)
}

fn increment(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    let step = ctx.attr_f32("step")?;
    let x = ctx.input("X")?;
    let shape = x.shape().to_vec();
    let out = kernels::increment(x, step);
    ctx.overwrite_input("X", out.clone())?;
    ctx.write_output("Out", out, &shape)
}

fn increment_grad(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    if !ctx.has_output("X@GRAD") {
        return Ok(());
    }
    let out_grad = ctx.input("Out@GRAD")?;
    let shape = out_grad.shape().to_vec();
    let x_grad = kernels::scale(out_grad, 1.0);
    ctx.write_output("X@GRAD", x_grad, &shape)
}

fn fill_zeros_like(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    let src = ctx.input("Src")?;
    let shape = src.shape().to_vec();
    let out = kernels::zeros_like(src);
    ctx.write_output("Dst", out, &shape)
}

fn gaussian_random(ctx: &mut KernelContext<'_>) -> Result<(), OpError> {
    let shape = gaussian_shape(ctx)?;
    let mean = ctx.attr_f32("mean")?;
    let std = ctx.attr_f32("std")?;
    let seed = ctx.attr_i64("seed")?;
    let numel = shape.iter().product();
    let out = kernels::gaussian_random(numel, mean, std, seed.unsigned_abs())?;
    ctx.write_output("Out", out, &shape)
}
