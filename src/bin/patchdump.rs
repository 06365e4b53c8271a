//! Print the patches generated for a sequence of x86-64 instructions.
//!
//! ```text
//! patchdump --hex "48 8b 43 08 c3" --address 0x401000 --record read --resolve
//! ```

use std::process::ExitCode;

use bumpalo::Bump;
use clap::{Parser, ValueEnum};
use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter};

use rewire::config::HookOrder;
use rewire::x64::decoder::decode;
use rewire::x64::encoder::{Placement, Resolver, SlotMap};
use rewire::x64::exec_block::SHADOW_BASE;
use rewire::x64::patch::{GeneratorConfig, Patch, PatchGenerator};
use rewire::{InstrRule, MemoryAccessType, PatchError};

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum RecordArg {
    #[default]
    None,
    Read,
    Write,
    All,
}

impl From<RecordArg> for MemoryAccessType {
    fn from(arg: RecordArg) -> Self {
        match arg {
            RecordArg::None => MemoryAccessType::NONE,
            RecordArg::Read => MemoryAccessType::READ,
            RecordArg::Write => MemoryAccessType::WRITE,
            RecordArg::All => MemoryAccessType::READ_WRITE,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OrderArg {
    #[default]
    MemoryFirst,
    CallbackFirst,
}

impl From<OrderArg> for HookOrder {
    fn from(arg: OrderArg) -> Self {
        match arg {
            OrderArg::MemoryFirst => HookOrder::MemoryAccessFirst,
            OrderArg::CallbackFirst => HookOrder::CallbackFirst,
        }
    }
}

#[derive(Parser)]
#[command(name = "patchdump")]
#[command(about = "Show rewire patch sequences for x86-64 code", long_about = None)]
struct Cli {
    /// Instruction bytes in hex, spaces allowed
    #[arg(long)]
    hex: String,

    /// Guest address of the first byte
    #[arg(long, default_value = "0x1000", value_parser = parse_address)]
    address: u64,

    /// Memory accesses to capture
    #[arg(long, value_enum, default_value_t)]
    record: RecordArg,

    /// Order of hooks sharing a position
    #[arg(long, value_enum, default_value_t)]
    order: OrderArg,

    /// Also print the code resolved at a sample placement
    #[arg(long)]
    resolve: bool,
}

fn parse_address(text: &str) -> Result<u64, String> {
    let digits = text.trim_start_matches("0x");
    u64::from_str_radix(digits, 16).map_err(|e| format!("bad address {text}: {e}"))
}

fn parse_hex(text: &str) -> Result<Vec<u8>, String> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err("odd number of hex digits".to_string());
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

const SAMPLE_CODE: u64 = 0x7f00_0000_0000;
const SAMPLE_DATA: u64 = 0x7f00_0001_0000;
const SAMPLE_EPILOGUE: u64 = 0x7f00_0000_0100;

fn generate<'a>(arena: &'a Bump, cli: &Cli, bytes: &[u8]) -> Result<Vec<Patch<'a>>, PatchError> {
    let generator = PatchGenerator::new(GeneratorConfig {
        record: cli.record.into(),
        hook_order: cli.order.into(),
    });
    let mut patches = Vec::new();
    let mut offset = 0;
    let mut address = cli.address;
    let mut last_writes_pc = false;
    while offset < bytes.len() {
        let analysis = decode(&bytes[offset..], address)?;
        let patch = generator.generate(arena, &analysis, std::iter::empty::<&dyn InstrRule>())?;
        last_writes_pc = patch.writes_pc;
        patches.push(patch);
        offset += analysis.size;
        address = analysis.next_address();
        if analysis.flow.ends_block() {
            break;
        }
    }
    patches.push(generator.block_exit(arena, address, !last_writes_pc)?);
    Ok(patches)
}

fn print_patches(patches: &[Patch<'_>]) {
    for (id, patch) in patches.iter().enumerate() {
        if patch.is_block_exit() {
            println!("patch {id}: block exit -> {:#x}", patch.address);
        } else {
            println!("patch {id}: {:#x} ({} bytes)", patch.address, patch.size);
        }
        for item in patch.insts.iter() {
            println!("    {:<24} {}", format!("{:?}", item.tag), item.op);
        }
        for binding in patch.temps.iter() {
            println!(
                "    ; temp {:#x} -> {} in {:?}",
                binding.temp.0, binding.reg, binding.region
            );
        }
    }
}

fn print_resolved(patches: &[Patch<'_>]) -> Result<(), PatchError> {
    let mut next = 0;
    let slots: Vec<SlotMap> = patches
        .iter()
        .map(|p| {
            p.shadows
                .iter()
                .map(|s| {
                    next += 1;
                    (s.tag(), next - 1)
                })
                .collect()
        })
        .collect();
    let placement = Placement {
        code_address: SAMPLE_CODE,
        context_address: SAMPLE_DATA,
        shadow_base: SAMPLE_DATA + SHADOW_BASE as u64,
        epilogue_address: SAMPLE_EPILOGUE,
        first_patch_id: 0,
        slots: &slots,
    };
    let resolved = Resolver::new(placement).resolve(patches)?;

    println!("resolved {} bytes at {:#x}:", resolved.code.len(), SAMPLE_CODE);
    let mut decoder = Decoder::with_ip(64, &resolved.code, SAMPLE_CODE, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut text = String::new();
    while decoder.can_decode() {
        let inst = decoder.decode();
        let offset = (inst.ip() - SAMPLE_CODE) as usize;
        if let Some(id) = resolved.patch_offsets.iter().position(|&o| o == offset) {
            println!("  ; patch {id}");
        }
        text.clear();
        formatter.format(&inst, &mut text);
        println!("  {:016x}  {}", inst.ip(), text);
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let bytes = match parse_hex(&cli.hex) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let arena = Bump::new();
    let patches = match generate(&arena, &cli, &bytes) {
        Ok(patches) => patches,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    print_patches(&patches);

    if cli.resolve {
        if let Err(e) = print_resolved(&patches) {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}
