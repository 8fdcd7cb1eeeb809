// src/main.rs
// Batch runner: compile a file of moves into mcu step commands.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use chelper::batch::{parse_moves, BatchRunner};
use chelper::configfile::{ConfigFile, McuConfig, StepperConfig};
use chelper::serialqueue::{SerialQueue, TransportKind};
use chelper::transport;

/// Step generation and mcu transport batch runner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file
    #[arg()]
    config_file: PathBuf,

    /// file of moves to process
    #[arg(short, long)]
    moves: PathBuf,

    /// write output to file instead of to serial port
    #[arg(short = 'o', long)]
    debugoutput: Option<String>,

    /// write log to file instead of stderr
    #[arg(short, long)]
    logfile: Option<PathBuf>,

    /// enable debug messages
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(args: &Args) -> Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose {
        builder.filter(None, log::LevelFilter::Debug);
    } else {
        builder.filter(None, log::LevelFilter::Info);
    }
    if let Some(ref logfile) = args.logfile {
        let target = fs::File::create(logfile).with_context(|| format!("Can't create logfile {}", logfile.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(target)));
    }
    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    info!("Starting batch run of {}", args.moves.display());

    let cf = ConfigFile::load(&args.config_file)?;
    let mut mcu = McuConfig::from_config(&cf).context("Invalid [mcu] section")?;
    let steppers = StepperConfig::all_from_config(&cf).context("Invalid stepper section")?;
    if steppers.is_empty() {
        warn!("No [stepper_*] sections in {}", args.config_file.display());
    }

    let path = match args.debugoutput {
        Some(ref out) => {
            mcu.transport = TransportKind::DebugFile;
            out.clone()
        }
        None => mcu.serial.clone(),
    };
    let fd = transport::open(&path, mcu.transport, mcu.baud).with_context(|| format!("Unable to open {}", path))?;
    let sq = Arc::new(SerialQueue::new(fd, mcu.transport)?);

    let content =
        fs::read_to_string(&args.moves).with_context(|| format!("Unable to read {}", args.moves.display()))?;
    let moves = parse_moves(&content)?;
    let mut runner = BatchRunner::new(&mcu, &steppers, sq.clone())?;
    for mv in moves.iter() {
        runner.queue_move(mv)?;
    }
    let summary = runner.finish(Duration::from_secs(10))?;
    sq.exit();

    for (axis, pos) in summary.positions.iter() {
        println!("stepper_{}: position {}", axis, pos);
    }
    println!("{}", summary.stats);
    Ok(())
}
