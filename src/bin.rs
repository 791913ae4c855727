use std::fs;
use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result};
use clap::{arg, command, value_parser, ArgAction};

use pawn_amx::definitions::Cell;
use pawn_amx::loader::{Callbacks, HostCtx, Loader};
use pawn_amx::memory::{Neumann, PagedBacking};
use pawn_amx::vm::opcode::Opcode;
use pawn_amx::vm::{Amx, AmxError};

type Mem = Neumann<PagedBacking<u32, 5>>;
type Machine = Amx<u32, Mem>;

/// single-step hook printing each instruction before it executes
fn trace(amx: &mut Machine, _ctx: &mut HostCtx<'_, u32, Mem, ()>) -> Result<(), AmxError> {
    let cip = amx.cip();
    let opcode = match amx.code_v2p(cip) {
        Some(cell) => *cell,
        None => {
            eprintln!("TRACE: ** invalid CIP {:#x} **", cip);
            return Ok(());
        }
    };
    match Opcode::from_cell(opcode) {
        Some(op) if op.has_operand() => {
            match amx.code_v2p(cip + u32::STEP) {
                Some(operand) => {
                    eprintln!("TRACE: {} {}", op.mnemonic(), *operand as i32)
                }
                None => eprintln!("TRACE: {} **invalid**", op.mnemonic()),
            };
        }
        Some(op) => eprintln!("TRACE: {}", op.mnemonic()),
        None => eprintln!("TRACE: *invalid* ({:#x})", opcode),
    }
    Ok(())
}

fn run(path: &PathBuf, trace_run: bool) -> Result<i32> {
    let bytes =
        fs::read(path).with_context(|| format!("could not read '{}'", path.display()))?;

    let mut loader: Loader<u32, Mem, ()> = Loader::new(Neumann::new(PagedBacking::new()), ());
    let callbacks = Callbacks {
        natives: &[],
        on_single_step: if trace_run { Some(trace) } else { None },
        on_break: None,
    };
    if let Err(err) = loader.init(&bytes, callbacks) {
        eprintln!("Malformed file: {}", err);
        exit(2);
    }

    let main = match loader.get_main().or_else(|| loader.get_public("main")) {
        Some(main) => main,
        None => {
            eprintln!("No main() found");
            exit(3);
        }
    };

    match loader.call(main, &[]) {
        Ok(retval) => Ok(retval as i32),
        Err(err) => {
            eprintln!("Error during execution: {}", err);
            exit(4);
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let file_arg = arg!([file] "The compiled AMX module to execute")
        .required(true)
        .value_parser(value_parser!(PathBuf));

    let trace_arg =
        arg!(-t --trace "Print every instruction before it executes").action(ArgAction::SetTrue);

    let matches = command!().arg(file_arg).arg(trace_arg).get_matches();

    let file = matches.get_one::<PathBuf>("file").unwrap();
    let trace_run = *matches.get_one::<bool>("trace").unwrap();

    let retval = run(file, trace_run)?;
    println!("main() returned: {}", retval);
    Ok(())
}
