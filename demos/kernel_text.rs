//! Example: Kernel Text
//!
//! Compiles a small program with the text front end and prints the
//! generated kernels, their parameters and a JSON export.
//!
//! Run with: cargo run --example kernel_text

use array_kernels::parser::parse;
use array_kernels::{Analyzer, CompileResult, KernelConfig, LaunchConfig, Shape, Workspace};

fn main() -> CompileResult<()> {
    println!("=== Kernel Text Example ===\n");

    let program = parse(
        "D = (A * B) + (C * k);\n\
         E = D / 2 - A;\n\
         total = sum(E)",
    )?;

    let mut workspace = Workspace::new(7);
    let shape = Shape::new([2, 3, 4])?;
    workspace.declare_array("A", shape.clone());
    workspace.declare_array("B", shape.clone());
    workspace.declare_array("C", shape);
    workspace.declare_scalar("k", 3.0);

    let analyzer = Analyzer::new(KernelConfig::new("fused", 8), LaunchConfig::default(), true)?;
    let results = analyzer.analyze(&program, &mut workspace)?;

    for result in &results {
        println!("--- {} {} ---", result.target, result.shape);
        println!("{}", result.kernel.summary());
        println!("{}\n", result.kernel);
    }

    if let Some(last) = results.last() {
        println!("total = {:?}\n", last.values);
        match last.kernel.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("JSON export failed: {}", e),
        }
    }

    Ok(())
}
