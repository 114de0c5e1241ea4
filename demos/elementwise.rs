//! Example: Elementwise Expressions
//!
//! Builds deferred expressions over arrays and scalars with ordinary
//! operators and evaluates them by assignment.
//!
//! Run with: cargo run --example elementwise

use array_kernels::{assign, Array, CompileResult, RandomSource, Scalar, Shape};

fn main() -> CompileResult<()> {
    println!("=== Elementwise Expressions Example ===\n");

    // Example 1: a + b on a 2x2 shape
    let shape = Shape::new([2, 2])?;
    let a = Array::from_vec(shape.clone(), vec![1.0, 2.0, 3.0, 4.0])?;
    let b = Array::filled(shape.clone(), 10.0);
    let mut c = Array::zeros(shape);

    let sum = (&a + &b)?;
    println!("Example 1: c = a + b");
    println!("Nothing is computed yet: c = {}", c);
    assign(&sum, &mut c)?;
    println!("After assignment:       c = {}\n", c);

    // Example 2: scalars and literals mix with arrays
    let shape = Shape::new([2, 3, 4])?;
    let mut rng = RandomSource::new(42);
    let x = Array::random(shape.clone(), &mut rng);
    let y = Array::random(shape.clone(), &mut rng);
    let scale = Scalar::new(0.5);
    let mut out = Array::zeros(shape);

    println!("Example 2: out = (x - y) * scale + 1");
    let expr = ((((&x - &y)? * &scale)?) + 1)?;
    expr.assign_to(&mut out)?;
    println!("out[0..4] = {:?}", &out.data()[..4]);
    println!(
        "check:      {:?}\n",
        (0..4)
            .map(|i| (x.data()[i] - y.data()[i]) * 0.5 + 1.0)
            .collect::<Vec<_>>()
    );

    // Example 3: mismatched shapes are rejected before anything runs
    println!("Example 3: [2] + [3]");
    let p = Array::zeros(Shape::new([2])?);
    let q = Array::zeros(Shape::new([3])?);
    match &p + &q {
        Ok(_) => println!("unexpectedly accepted"),
        Err(e) => println!("rejected: {}", e),
    }

    Ok(())
}
