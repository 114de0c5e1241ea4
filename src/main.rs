//! Array expression to kernel compiler CLI
//!
//! Usage:
//!   array2kernel "C = A + B * s" --shape A=2x3 --shape B=2x3 --scalar s=0.5
//!   array2kernel -f program.arr --run
//!   array2kernel "total = [[1, 2], [3, 4]].sum()" --run --json

use clap::Parser as ClapParser;
use colored::Colorize;
use std::fs;
use std::io::{self, Read};

use array_kernels::analyzer::StatementResult;
use array_kernels::parser::parse;
use array_kernels::{Analyzer, CompileResult, KernelConfig, LaunchConfig, Shape, Workspace};

#[derive(ClapParser, Debug)]
#[command(name = "array2kernel")]
#[command(author = "Array Kernels Team")]
#[command(version = "0.1.0")]
#[command(about = "Compiles array expressions to data-parallel kernels")]
struct Args {
    /// Program to compile (e.g., "C = A + B")
    #[arg(value_name = "EXPR")]
    expression: Option<String>,

    /// Read the program from a file
    #[arg(short = 'f', long = "file")]
    input_file: Option<String>,

    /// Declare a random array (e.g., "A=2x3x4")
    #[arg(short = 's', long = "shape", value_parser = parse_shape)]
    shapes: Vec<(String, Shape)>,

    /// Declare a scalar (e.g., "k=2.5")
    #[arg(short = 'c', long = "scalar", value_parser = parse_scalar)]
    scalars: Vec<(String, f32)>,

    /// Seed for random arrays
    #[arg(long = "seed", default_value = "0")]
    seed: u64,

    /// Name of the generated kernel function
    #[arg(long = "kernel-name", default_value = "executable")]
    kernel_name: String,

    /// Size of the temporary pool
    #[arg(long = "max-temps", default_value = "16")]
    max_temporaries: usize,

    /// Execution units per launch
    #[arg(short = 'w', long = "work-items", default_value = "4")]
    work_items: usize,

    /// Worker threads (0 uses all cores)
    #[arg(long = "threads", default_value = "0")]
    threads: usize,

    /// Execute kernels on the CPU backend and print results
    #[arg(short = 'r', long = "run")]
    run: bool,

    /// Output as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn split_binding(s: &str) -> Result<(&str, &str), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name, value)),
        _ => Err(format!("Expected NAME=VALUE, got '{}'", s)),
    }
}

fn parse_shape(s: &str) -> Result<(String, Shape), String> {
    let (name, dims) = split_binding(s)?;
    let shape = Shape::parse(dims).map_err(|e| e.to_string())?;
    Ok((name.to_string(), shape))
}

fn parse_scalar(s: &str) -> Result<(String, f32), String> {
    let (name, value) = split_binding(s)?;
    let value = value
        .parse::<f32>()
        .map_err(|_| format!("Invalid scalar value: {}", value))?;
    Ok((name.to_string(), value))
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    // Get program from argument, file, or stdin
    let source = if let Some(expr) = args.expression.clone() {
        expr
    } else if let Some(file) = &args.input_file {
        fs::read_to_string(file).unwrap_or_else(|e| {
            eprintln!("{}: Failed to read file '{}': {}", "Error".red(), file, e);
            std::process::exit(1);
        })
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer).unwrap_or_else(|e| {
            eprintln!("{}: Failed to read stdin: {}", "Error".red(), e);
            std::process::exit(1);
        });
        buffer
    };

    if args.verbose {
        println!("{}", "Array Expression Compiler".bold().blue());
        println!("{}", "=".repeat(35));
        println!();
        println!("{}: {}", "Input".green(), source.trim());
        println!(
            "{}: {} work items, {} threads",
            "Launch".green(),
            args.work_items,
            args.threads
        );
        println!();
    }

    let results = match run(&args, &source) {
        Ok(results) => results,
        Err(e) => {
            eprintln!("{}: {}", "Compilation error".red(), e);
            std::process::exit(1);
        }
    };

    if args.json_output {
        match serde_json::to_string_pretty(&results) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}: Failed to serialize to JSON: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
    } else {
        print_results(&results, args.verbose);
    }
}

fn run(args: &Args, source: &str) -> CompileResult<Vec<StatementResult>> {
    let program = parse(source)?;

    let mut workspace = Workspace::new(args.seed);
    for (name, shape) in &args.shapes {
        workspace.declare_array(name.clone(), shape.clone());
    }
    for (name, value) in &args.scalars {
        workspace.declare_scalar(name.clone(), *value);
    }

    let config = KernelConfig::new(args.kernel_name.clone(), args.max_temporaries);
    let launch = LaunchConfig::new(args.work_items, args.threads);
    let analyzer = Analyzer::new(config, launch, args.run)?;
    analyzer.analyze(&program, &mut workspace)
}

fn print_results(results: &[StatementResult], verbose: bool) {
    println!("{}", "Compilation Results".bold().green());
    println!("{}", "=".repeat(50));

    for result in results {
        println!();
        println!(
            "{} {} {}",
            result.target.bold(),
            "->".cyan(),
            result.shape.to_string().yellow()
        );
        if verbose {
            print!("{}", result.kernel.summary());
        }
        println!("{}", "-".repeat(50));
        println!("{}", result.kernel);
        println!("{}", "-".repeat(50));

        if let Some(values) = &result.values {
            let text: Vec<String> = values.iter().map(|v| v.to_string()).collect();
            println!("{}: [{}]", "Result".cyan(), text.join(", "));
        }
    }
}
