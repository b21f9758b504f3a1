//! Carmine runtime entry point.
//!
//! Runs a precompiled Carmine bytecode image (`.carb`) produced by the
//! compiler. Behavior summary:
//! - With `-h/--help`, print usage.
//! - With `-v/--version`, print build-target + version.
//! - With a `.carb` path, load the image and execute its entry irep.
//!
//! Argument separator: if a literal `--` appears after the image path,
//! everything after it is considered program arguments. Program arguments
//! are exposed to scripts through the `$ARGV` global.

use std::env;
use std::fs;
use std::process::ExitCode;

use carmine_runtime::{load_image, Value, Vm};

/// Human-facing runtime version string.
const VERSION: &str = "0.1.0";

/// Construct the help/usage text shown for `-h/--help`.
fn usage() -> String {
    format!(
        r#"Carmine Runtime v{0}

Usage:
    carmine <image.carb> [--] [program args...]

Arguments:
    <image.carb>
        Path to a compiled Carmine bytecode image to execute.

Options:
    -h, --help
        Show this help message and exit.
    -v, --version
        Show runtime version."#,
        VERSION
    )
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    if args.len() == 1 || args[1] == "-h" || args[1] == "--help" {
        println!("{}", usage());
        return ExitCode::SUCCESS;
    }

    if args[1] == "-v" || args[1] == "--version" {
        println!(
            "carmine-runtime-build-{}-{}: v{}",
            env::consts::OS,
            env::consts::ARCH,
            VERSION
        );
        return ExitCode::SUCCESS;
    }

    let image_path = &args[1];

    // Program arguments follow the image path; a leading `--` is skipped.
    let program_args: &[String] = if args.len() > 2 {
        if args[2] == "--" {
            &args[3..]
        } else {
            &args[2..]
        }
    } else {
        &[]
    };

    let data = match fs::read(image_path) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("carmine: cannot read {}: {}", image_path, e);
            return ExitCode::FAILURE;
        }
    };

    let mut vm = Vm::new();
    let entry = match load_image(&mut vm, &data) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("carmine: {}: {}", image_path, e);
            return ExitCode::FAILURE;
        }
    };

    let argv = Value::array(
        program_args
            .iter()
            .map(|s| Value::str(s.clone()))
            .collect(),
    );
    let argv_sym = vm.intern("$ARGV");
    vm.global_set(argv_sym, argv);

    let top = vm.top_self();
    vm.run(&entry, top);
    if let Some(exc) = vm.exception() {
        eprintln!("{}", vm.error_message(&exc));
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
