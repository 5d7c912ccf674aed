use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, CommandFactory, Parser, Subcommand};

use regwasm::ast::{ExportKind, ImportKind, Module};
use regwasm::bytecode::disassemble;
use regwasm::compiler::{self, CompileOptions, SimpleGasPolicy, TableGasPolicy};
use regwasm::diagnostic::ansi::AnsiRenderer;
use regwasm::diagnostic::{Diagnostic, json, registry};
use regwasm::parser::parse_source;
use regwasm::trace::StderrTrace;
use regwasm::vm::{Config, HostContext, HostFunction, ImportResolver, Trap, VirtualMachine};

#[derive(Parser)]
#[command(name = "regwasm", version, about = "Lower WebAssembly-style stack code to register bytecode and run it")]
struct Cli {
    /// Explain an error code, e.g. RW-T002
    #[arg(long, value_name = "CODE")]
    explain: Option<String>,

    /// Report results and diagnostics as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run an exported function
    Run(RunArgs),
    /// Compile a module and print its register bytecode
    #[command(alias = "compile")]
    Disasm(DisasmArgs),
}

#[derive(Args)]
struct GasArgs {
    /// Instrument with a flat per-instruction gas cost
    #[arg(long, value_name = "N")]
    gas_cost: Option<u64>,

    /// Instrument with per-operator costs from a JSON file
    #[arg(long, value_name = "FILE", conflicts_with = "gas_cost")]
    gas_table: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    /// Module listing, or a JSON module when the name ends in `.json`
    file: PathBuf,

    /// Exported function to call (default: the first export)
    #[arg(long)]
    invoke: Option<String>,

    /// Integer arguments
    #[arg(allow_negative_numbers = true)]
    args: Vec<i64>,

    #[command(flatten)]
    gas: GasArgs,

    /// Trap once more gas than this is used (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    gas_limit: u64,

    /// Trap after this many instructions (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_steps: u64,

    #[arg(long, default_value_t = 512)]
    max_call_depth: usize,

    /// Registers plus locals across all frames (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_value_slots: usize,

    /// Compile eligible functions to native code
    #[arg(long)]
    jit: bool,

    /// Print calls, host calls and gas charges on stderr
    #[arg(long)]
    trace: bool,

    /// Value of an imported global, as `module.field=value`
    #[arg(long = "global", value_name = "NAME=VALUE")]
    globals: Vec<String>,
}

#[derive(Args)]
struct DisasmArgs {
    file: PathBuf,

    #[command(flatten)]
    gas: GasArgs,

    /// Keep stores to locals that are never read
    #[arg(long)]
    no_dse: bool,
}

/// A failure already turned into a diagnostic, with the listing attached.
struct Failure {
    diagnostic: Diagnostic,
}

impl Failure {
    fn new(diagnostic: Diagnostic, source: Option<&str>) -> Self {
        let diagnostic = match source {
            Some(src) => diagnostic.with_source(src),
            None => diagnostic,
        };
        Failure { diagnostic }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(code) = &cli.explain {
        return explain(code);
    }

    let result = match &cli.command {
        Some(Command::Run(args)) => run(args, cli.json),
        Some(Command::Disasm(args)) => disasm(args, cli.json),
        None => {
            let _ = Cli::command().print_help();
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            report(&failure.diagnostic, cli.json);
            ExitCode::FAILURE
        }
    }
}

fn report(d: &Diagnostic, as_json: bool) {
    if as_json {
        eprintln!("{}", json::render(d));
    } else {
        let renderer = AnsiRenderer { use_color: std::io::stderr().is_terminal() };
        eprint!("{}", renderer.render(d));
    }
}

fn explain(code: &str) -> ExitCode {
    match registry::lookup(&code.to_ascii_uppercase()) {
        Some(entry) => {
            println!("{}: {}\n\n{}", entry.code, entry.short, entry.long);
            ExitCode::SUCCESS
        }
        None => {
            eprintln!("unknown error code: {code}");
            ExitCode::FAILURE
        }
    }
}

/// Reads a module and keeps the listing text for diagnostics.
fn load(path: &Path) -> Result<(Module, Option<String>), Failure> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Failure::new(Diagnostic::error(format!("cannot read {}: {e}", path.display())), None)
    })?;
    if path.extension().is_some_and(|ext| ext == "json") {
        let module = Module::from_json(&text)
            .map_err(|e| Failure::new(Diagnostic::error(format!("invalid JSON module: {e}")), None))?;
        return Ok((module, None));
    }
    match parse_source(&text) {
        Ok(module) => Ok((module, Some(text))),
        Err(e) => Err(Failure::new(Diagnostic::from(&e), Some(&text))),
    }
}

fn compile_options(gas: &GasArgs, gas_limit: u64) -> Result<CompileOptions, Failure> {
    let opts = CompileOptions::default();
    if let Some(path) = &gas.gas_table {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Failure::new(Diagnostic::error(format!("cannot read {}: {e}", path.display())), None)
        })?;
        let policy = TableGasPolicy::from_json(&text)
            .map_err(|e| Failure::new(Diagnostic::error(format!("invalid gas table: {e}")), None))?;
        return Ok(opts.with_gas(policy));
    }
    match gas.gas_cost {
        Some(per_instruction) => Ok(opts.with_gas(SimpleGasPolicy { per_instruction })),
        // a limit without a cost model still needs metering
        None if gas_limit != 0 => Ok(opts.with_gas(SimpleGasPolicy::default())),
        None => Ok(opts),
    }
}

fn run(args: &RunArgs, as_json: bool) -> Result<(), Failure> {
    let (module, source) = load(&args.file)?;
    let src = source.as_deref();
    let opts = compile_options(&args.gas, args.gas_limit)?;
    if args.gas_limit != 0 && args.gas.gas_cost.is_none() && args.gas.gas_table.is_none() {
        let warning = Diagnostic::warning("--gas-limit given without a cost model")
            .with_note("charging 1 gas per instruction")
            .with_suggestion("pass --gas-cost or --gas-table to price instructions");
        report(&warning, as_json);
    }
    let config = Config {
        gas_limit: args.gas_limit,
        max_steps: args.max_steps,
        max_call_stack_depth: args.max_call_depth,
        max_value_slots: args.max_value_slots,
        enable_jit: args.jit,
        ..Config::default()
    };
    let imports = CliImports::parse(&args.globals).map_err(|d| Failure::new(d, None))?;

    let mut vm = VirtualMachine::with_options(&module, imports, config, &opts)
        .map_err(|e| Failure::new(Diagnostic::from(&e), src))?;
    if args.trace {
        vm.set_trace(Box::new(StderrTrace::default()));
    }

    let name = match &args.invoke {
        Some(name) => name.clone(),
        None => module
            .exports
            .iter()
            .find(|e| e.kind == ExportKind::Function)
            .map(|e| e.name.clone())
            .ok_or_else(|| Failure::new(Diagnostic::error("module exports no function; nothing to run"), None))?,
    };

    match vm.invoke(&name, &args.args) {
        Ok(value) => {
            if as_json {
                let out = serde_json::json!({
                    "function": name,
                    "result": value,
                    "gas_used": vm.gas_used(),
                    "steps": vm.steps(),
                });
                println!("{out}");
            } else if let Some(v) = value {
                println!("{v}");
            }
            Ok(())
        }
        Err(e) => {
            let mut d = Diagnostic::from(&e);
            if let Some(site) = vm.trap_site() {
                d = d.with_note(format!("in function {} at offset {:#06x}", site.function, site.offset));
            }
            Err(Failure::new(d, src))
        }
    }
}

fn disasm(args: &DisasmArgs, as_json: bool) -> Result<(), Failure> {
    let (module, source) = load(&args.file)?;
    let mut opts = compile_options(&args.gas, 0)?;
    opts.dead_store_elimination = !args.no_dse;
    let compiled = compiler::compile_module(&module, &opts)
        .map_err(|e| Failure::new(Diagnostic::from(&e), source.as_deref()))?;

    let names = function_names(&module);
    let mut listing = Vec::new();
    for (index, f) in compiled.functions.iter().enumerate() {
        let rows = disassemble(&f.code).map_err(|e| {
            Failure::new(Diagnostic::error(format!("function {index} does not decode: {e}")), None)
        })?;
        let name = names.get(index).cloned().unwrap_or_default();
        if as_json {
            listing.push(serde_json::json!({
                "index": index,
                "name": name,
                "registers": f.num_regs,
                "params": f.num_params,
                "locals": f.num_locals,
                "code": rows.iter().map(|r| serde_json::json!({
                    "offset": r.offset,
                    "target": r.target,
                    "op": r.op.name(),
                    "operands": r.operands,
                })).collect::<Vec<_>>(),
            }));
        } else {
            println!(
                "func {index} {name} (params {}, locals {}, regs {})",
                f.num_params, f.num_locals, f.num_regs
            );
            for row in &rows {
                println!("  {row}");
            }
        }
    }
    if as_json {
        println!("{}", serde_json::Value::Array(listing));
    }
    Ok(())
}

fn function_names(module: &Module) -> Vec<String> {
    let imported = module
        .imports
        .iter()
        .filter(|i| matches!(i.kind, ImportKind::Function { .. }))
        .map(|i| format!("{}.{}", i.module, i.field));
    let defined = module
        .functions
        .iter()
        .enumerate()
        .map(|(i, f)| f.name.clone().unwrap_or_else(|| format!("#{i}")));
    imported.chain(defined).collect()
}

/// Host side of the CLI: `env.print_i32`, `env.print_i64` and imported
/// globals given with `--global`.
struct CliImports {
    globals: Vec<(String, String, i64)>,
}

impl CliImports {
    fn parse(entries: &[String]) -> Result<Self, Diagnostic> {
        let mut globals = Vec::with_capacity(entries.len());
        for entry in entries {
            let parsed = entry.split_once('=').and_then(|(name, value)| {
                let (module, field) = name.split_once('.')?;
                Some((module.to_string(), field.to_string(), value.trim().parse::<i64>().ok()?))
            });
            match parsed {
                Some(g) => globals.push(g),
                None => {
                    return Err(Diagnostic::error(format!("invalid --global `{entry}`"))
                        .with_suggestion("write it as module.field=value, e.g. env.base=100"));
                }
            }
        }
        Ok(CliImports { globals })
    }
}

fn print_arg(ctx: &mut HostContext<'_>) -> Result<i64, Trap> {
    println!("{}", ctx.arg(0)?);
    Ok(0)
}

impl ImportResolver for CliImports {
    fn resolve_func(&mut self, module: &str, field: &str) -> Option<HostFunction> {
        match (module, field) {
            ("env", "print_i32" | "print_i64") => Some(Box::new(print_arg)),
            _ => None,
        }
    }

    fn resolve_global(&mut self, module: &str, field: &str) -> Option<i64> {
        self.globals.iter().find(|(m, f, _)| m == module && f == field).map(|(_, _, v)| *v)
    }
}
