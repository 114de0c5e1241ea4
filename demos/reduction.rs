//! Example: Reductions
//!
//! A reduce-sum accumulates into the kernel's global accumulator. The
//! result can be stored in a scalar or broadcast into every element of an
//! array destination.
//!
//! Run with: cargo run --example reduction

use array_kernels::{
    Array, CompileResult, CpuBackend, KernelConfig, LaunchConfig, Runtime, Scalar, Shape, Target,
};

fn main() -> CompileResult<()> {
    println!("=== Reduction Example ===\n");

    let runtime = Runtime::new(
        KernelConfig::default(),
        CpuBackend::new(LaunchConfig::new(8, 2))?,
    );

    // Example 1: total = a.sum()
    let a = Array::from_vec(Shape::new([3])?, vec![1.0, 2.0, 3.0])?;
    let mut total = Scalar::default();
    let expr = a.reduce_sum()?;
    runtime.assign(&expr, &mut total)?;
    println!("Example 1: sum([1, 2, 3]) = {}\n", total.value());

    // Example 2: weighted sum, broadcast into an array
    let m = Array::from_vec(Shape::new([2, 2])?, vec![1.0, 2.0, 3.0, 4.0])?;
    let weight = Scalar::new(0.25);
    let mut spread = Array::zeros(Shape::new([3])?);
    let expr = (&m * &weight)?.reduce_sum()?;

    let compiled = runtime.compile(&expr, &Target::from(&mut spread))?;
    println!("Example 2: spread = (m * weight).sum()");
    println!("{}\n", compiled.kernel);
    runtime.assign(&expr, &mut spread)?;
    println!("spread = {}\n", spread);

    // Example 3: a second reduction is rejected when the tree is built
    println!("Example 3: a.sum() + m.sum()");
    match a.reduce_sum()? + m.reduce_sum()? {
        Ok(_) => println!("unexpectedly accepted"),
        Err(e) => println!("rejected: {}", e),
    }

    Ok(())
}
