//! schema-compat - classify an Avro schema change before deploying it.
//!
//! Usage:
//!   schema-compat schemas/order_created/v1.avsc schemas/order_created/v2.avsc
//!   schema-compat old.avsc new.avsc --require full
//!
//! Exit status: 0 when the required level is met, 1 when it is not, 2 when a
//! schema file cannot be read or parsed.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use order_ingest::schema::{classify_files, CompatibilityLevel, SchemaError};

#[derive(Parser, Debug)]
#[command(name = "schema-compat")]
#[command(about = "Check BACKWARD/FORWARD/FULL compatibility between two Avro schemas")]
#[command(version)]
struct Args {
    /// Schema currently deployed
    old: PathBuf,

    /// Proposed schema
    new: PathBuf,

    /// Level the change must satisfy (none, backward, forward, full)
    #[arg(long, default_value = "none")]
    require: CompatibilityLevel,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let report = match classify_files(&args.old, &args.new).with_context(|| {
        format!(
            "cannot compare {} with {}",
            args.old.display(),
            args.new.display()
        )
    }) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(2);
        },
    };

    println!("{}", report);

    match report.require(args.require) {
        Ok(()) => ExitCode::SUCCESS,
        Err(SchemaError::CompatibilityViolation { required, reasons }) => {
            eprintln!("change does not satisfy {} compatibility:", required);
            for reason in reasons {
                eprintln!("  - {}", reason);
            }
            ExitCode::from(1)
        },
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(2)
        },
    }
}
