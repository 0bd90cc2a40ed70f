//! Disassembler for vmgen bytecode images.
//!
//! Prints one decoded instruction per line. Images carry their
//! code-segment constants after the code, so `--limit` stops decoding at
//! the end of the code.

use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::process;
use vmgen::vm::Disassembler;

#[derive(Parser)]
#[command(name = "vmdis")]
#[command(about = "Disassemble a vmgen bytecode image")]
struct Args {
    /// Path to the image
    image: PathBuf,

    /// Stop decoding after this many bytes
    #[arg(short, long)]
    limit: Option<usize>,

    /// Print the raw bytes of each instruction as well
    #[arg(short, long)]
    bytes: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let code = fs::read(&args.image).unwrap_or_else(|e| {
        eprintln!("Error reading image '{}': {}", args.image.display(), e);
        process::exit(1);
    });
    log::info!("read {} bytes from {}", code.len(), args.image.display());

    let mut disassembler = Disassembler::new(&code);
    if let Some(limit) = args.limit {
        disassembler = disassembler.with_limit(limit);
    }

    let mut count = 0usize;
    for decoded in disassembler {
        match decoded {
            Ok(instr) => {
                if args.bytes {
                    let raw = &code[instr.offset..instr.offset + instr.size()];
                    let hex: Vec<String> = raw.iter().map(|b| format!("{b:02x}")).collect();
                    println!("{:<48} ; {}", instr.to_string(), hex.join(" "));
                } else {
                    println!("{instr}");
                }
                count += 1;
            }
            Err(e) => {
                eprintln!("Disassembly error: {e}");
                process::exit(1);
            }
        }
    }
    log::debug!("decoded {count} instructions");
}
