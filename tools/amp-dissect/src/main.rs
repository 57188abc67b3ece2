//! Decode captured bridge traffic.
//!
//! Reads one frame per line, `[timestamp] tx|rx <hex>`, from a file or
//! stdin, and prints each frame as a 1394 transaction. `tx` frames are host
//! requests including their control word; `rx` frames are bridge responses
//! including the trailing diagnostics.

mod dissect;

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use amp_port::tracing::prelude::*;
use amp_port::tracing::{self as logging, LevelFilter};
use anyhow::{Context, Result};
use clap::Parser;

use dissect::{dissect_line, CrcStatus};

#[derive(Parser)]
#[command(name = "amp-dissect")]
#[command(about = "Decode captured bridge frames into readable transactions")]
struct Args {
    /// Capture file (stdin if omitted)
    input: Option<PathBuf>,

    /// Only print frames that fail to decode
    #[arg(long)]
    errors_only: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Log decode failures to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.no_color {
        colored::control::set_override(false);
    }
    logging::init_stderr(if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    });

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let mut frames = 0;
    let mut bad = 0;
    for (n, line) in reader.lines().enumerate() {
        let line = line.context("reading capture")?;
        let Some(frame) = dissect_line(n + 1, &line) else {
            continue;
        };
        frames += 1;
        let failed = frame.is_invalid() || frame.crc_status == CrcStatus::Invalid;
        if failed {
            bad += 1;
            debug!(line = frame.line, "Frame failed to decode");
        }
        if failed || !args.errors_only {
            println!("{}", frame);
        }
    }
    if bad > 0 {
        warn!(frames, invalid = bad, "Capture contains invalid frames");
    }
    eprintln!("{} frames, {} invalid", frames, bad);
    Ok(())
}
