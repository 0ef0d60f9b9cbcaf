use kiln_core::{Diagnostic, ObjectBody, Program, Report};
use kiln_native::runtime::Process;
use kiln_native::CompileOptions;
use std::env;
use std::path::{Path, PathBuf};
use std::process;

const HELP: &str = "\
Kiln native compiler

Usage:
  kilnc <command> [options]

Commands:
  compile <snapshot> [--emit obj|ir|clif] [--out <file>] [--target <triple>] [--pic] [--no-verify] [--no-opt] [--json]
  run <snapshot> [--no-verify] [--no-opt] [--json]
  dump <snapshot> [--emit ir|clif] [--no-verify] [--no-opt]
  disasm <snapshot>

Options:
  -h, --help     Show this help message
  --version      Show version information

Set RUST_LOG=info (or debug, trace) for pipeline logging.
";

const COMPILE_HELP: &str = "\
Usage:
  kilnc compile <snapshot> [--emit obj|ir|clif] [--out <file>] [--target <triple>] [--pic] [--no-verify] [--no-opt] [--json]

Options:
  --emit         Artifact kind (obj, ir, or clif); defaults to obj
  --out          Output file; defaults to the snapshot path with a new extension
  --target       Target triple; defaults to the host
  --pic          Generate position-independent code
  --no-verify    Skip the IR verifier
  --no-opt       Skip the generic optimizations
  --json         Emit a JSON report
  -h, --help     Show this help message
";

const RUN_HELP: &str = "\
Usage:
  kilnc run <snapshot> [--no-verify] [--no-opt] [--json]

Options:
  --no-verify    Skip the IR verifier
  --no-opt       Skip the generic optimizations
  --json         Emit a JSON report
  -h, --help     Show this help message
";

const DUMP_HELP: &str = "\
Usage:
  kilnc dump <snapshot> [--emit ir|clif] [--no-verify] [--no-opt]

Options:
  --emit         IR to print (ir or clif); defaults to ir
  --no-verify    Skip the IR verifier
  --no-opt       Skip the generic optimizations
  -h, --help     Show this help message
";

const DISASM_HELP: &str = "\
Usage:
  kilnc disasm <snapshot>

Options:
  -h, --help     Show this help message
";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Compile {
        path: String,
        options: CompileOptions,
        emit: EmitFormat,
        out: Option<String>,
        json: bool,
    },
    Run {
        path: String,
        options: CompileOptions,
        json: bool,
    },
    Dump {
        path: String,
        options: CompileOptions,
        emit: EmitFormat,
    },
    Disasm {
        path: String,
    },
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum EmitFormat {
    Obj,
    Ir,
    Clif,
}

impl EmitFormat {
    fn extension(self) -> &'static str {
        match self {
            EmitFormat::Obj => "o",
            EmitFormat::Ir => "kir",
            EmitFormat::Clif => "clif",
        }
    }
}

/// A pipeline diagnostic that ends the command.
#[derive(Debug)]
struct Failure(Diagnostic);

impl From<kiln_native::NativeError> for Failure {
    fn from(err: kiln_native::NativeError) -> Self {
        Failure(err.diagnostic())
    }
}

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().skip(1).collect();

    if args.is_empty() || matches!(args[0].as_str(), "-h" | "--help") {
        print!("{HELP}");
        return;
    }

    if args[0] == "--version" {
        println!("kilnc {}", kiln_core::VERSION);
        return;
    }

    let sub_help = match args[0].as_str() {
        "compile" => Some(COMPILE_HELP),
        "run" => Some(RUN_HELP),
        "dump" => Some(DUMP_HELP),
        "disasm" => Some(DISASM_HELP),
        _ => None,
    };
    if let Some(help) = sub_help {
        if contains_help_flag(&args[1..]) {
            print!("{help}");
            return;
        }
    }

    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("error: {message}");
            eprintln!();
            eprintln!("{HELP}");
            process::exit(2);
        }
    };

    let json = command.json();
    if let Err(Failure(diagnostic)) = execute(command) {
        if json {
            println!("{}", Report::failure(diagnostic).to_json());
        } else {
            eprintln!("error[{}]: {}", diagnostic.code, diagnostic.message);
            for note in &diagnostic.notes {
                eprintln!("  note: {note}");
            }
        }
        process::exit(1);
    }
}

impl Command {
    fn json(&self) -> bool {
        match self {
            Command::Compile { json, .. } | Command::Run { json, .. } => *json,
            Command::Dump { .. } | Command::Disasm { .. } => false,
        }
    }
}

fn contains_help_flag(args: &[String]) -> bool {
    args.iter().any(|arg| matches!(arg.as_str(), "-h" | "--help"))
}

fn parse_command(args: &[String]) -> Result<Command, String> {
    match args[0].as_str() {
        "compile" => parse_compile(&args[1..]),
        "run" => parse_run(&args[1..]),
        "dump" => parse_dump(&args[1..]),
        "disasm" => parse_disasm(&args[1..]),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn parse_compile(args: &[String]) -> Result<Command, String> {
    let parsed = parse_path_and_flags(
        args,
        Allowed {
            emit: true,
            out: true,
            target: true,
            pipeline: true,
            json: true,
        },
    )?;
    let path = parsed.path.ok_or_else(|| "missing snapshot for compile".to_string())?;
    let emit = parsed.emit.unwrap_or(EmitFormat::Obj);
    if parsed.json && parsed.out.is_none() && emit != EmitFormat::Obj {
        return Err("--json with --emit ir|clif requires --out".to_string());
    }
    Ok(Command::Compile {
        path,
        options: parsed.options,
        emit,
        out: parsed.out,
        json: parsed.json,
    })
}

fn parse_run(args: &[String]) -> Result<Command, String> {
    let parsed = parse_path_and_flags(
        args,
        Allowed {
            pipeline: true,
            json: true,
            ..Allowed::default()
        },
    )?;
    let path = parsed.path.ok_or_else(|| "missing snapshot for run".to_string())?;
    Ok(Command::Run {
        path,
        options: parsed.options,
        json: parsed.json,
    })
}

fn parse_dump(args: &[String]) -> Result<Command, String> {
    let parsed = parse_path_and_flags(
        args,
        Allowed {
            emit: true,
            pipeline: true,
            ..Allowed::default()
        },
    )?;
    let path = parsed.path.ok_or_else(|| "missing snapshot for dump".to_string())?;
    let emit = match parsed.emit.unwrap_or(EmitFormat::Ir) {
        EmitFormat::Obj => return Err("dump prints ir or clif, not obj".to_string()),
        format => format,
    };
    Ok(Command::Dump {
        path,
        options: parsed.options,
        emit,
    })
}

fn parse_disasm(args: &[String]) -> Result<Command, String> {
    let parsed = parse_path_and_flags(args, Allowed::default())?;
    let path = parsed.path.ok_or_else(|| "missing snapshot for disasm".to_string())?;
    Ok(Command::Disasm { path })
}

/// Flags a command accepts beyond its snapshot path.
#[derive(Clone, Copy, Default)]
struct Allowed {
    emit: bool,
    out: bool,
    target: bool,
    /// `--no-verify` and `--no-opt`.
    pipeline: bool,
    json: bool,
}

struct ParsedArgs {
    path: Option<String>,
    options: CompileOptions,
    emit: Option<EmitFormat>,
    out: Option<String>,
    json: bool,
}

fn parse_path_and_flags(args: &[String], allowed: Allowed) -> Result<ParsedArgs, String> {
    let mut path = None;
    let mut options = CompileOptions::default();
    let mut emit = None;
    let mut out = None;
    let mut json = false;
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => {
                if !allowed.json {
                    return Err("unexpected --json".to_string());
                }
                json = true;
            }
            "--emit" => {
                if !allowed.emit {
                    return Err("unexpected --emit".to_string());
                }
                let value = iter
                    .next()
                    .ok_or_else(|| "missing value for --emit".to_string())?;
                emit = Some(parse_emit(value)?);
            }
            "--out" => {
                if !allowed.out {
                    return Err("unexpected --out".to_string());
                }
                let value = iter
                    .next()
                    .ok_or_else(|| "missing value for --out".to_string())?;
                out = Some(value.to_string());
            }
            "--target" => {
                if !allowed.target {
                    return Err("unexpected --target".to_string());
                }
                let value = iter
                    .next()
                    .ok_or_else(|| "missing value for --target".to_string())?;
                options.target = Some(value.to_string());
            }
            "--pic" => {
                if !allowed.target {
                    return Err("unexpected --pic".to_string());
                }
                options.pic = true;
            }
            "--no-verify" => {
                if !allowed.pipeline {
                    return Err("unexpected --no-verify".to_string());
                }
                options.verify = false;
            }
            "--no-opt" => {
                if !allowed.pipeline {
                    return Err("unexpected --no-opt".to_string());
                }
                options.optimize = false;
            }
            flag if flag.starts_with('-') => {
                return Err(format!("unknown option '{flag}'"));
            }
            value => {
                if path.is_some() {
                    return Err("multiple snapshots provided".to_string());
                }
                path = Some(value.to_string());
            }
        }
    }

    if let Some(path) = &path {
        if let Some(stem) = Path::new(path).file_stem().and_then(|stem| stem.to_str()) {
            options.module_name = stem.to_string();
        }
    }

    Ok(ParsedArgs {
        path,
        options,
        emit,
        out,
        json,
    })
}

fn parse_emit(value: &str) -> Result<EmitFormat, String> {
    match value {
        "obj" => Ok(EmitFormat::Obj),
        "ir" => Ok(EmitFormat::Ir),
        "clif" => Ok(EmitFormat::Clif),
        _ => Err(format!(
            "invalid emit format '{value}' (expected 'obj', 'ir', or 'clif')"
        )),
    }
}

fn load(path: &str) -> Result<Program, Failure> {
    Program::load(Path::new(path)).map_err(|err| {
        Failure(Diagnostic::error(kiln_native::E_SNAPSHOT, err.to_string()).with_note(format!("in {path}")))
    })
}

fn execute(command: Command) -> Result<(), Failure> {
    match command {
        Command::Compile {
            path,
            options,
            emit,
            out,
            json,
        } => {
            let program = load(&path)?;
            match emit {
                EmitFormat::Obj => {
                    let out_path = out.unwrap_or_else(|| default_emit_path(&path, emit.extension()));
                    kiln_native::write_object(&program, &options, Path::new(&out_path))?;
                    report_artifact(json, &out_path);
                }
                EmitFormat::Ir | EmitFormat::Clif => {
                    let text = if emit == EmitFormat::Ir {
                        kiln_native::dump_ir(&program, &options)?
                    } else {
                        kiln_native::dump_clif(&program, &options)?
                    };
                    match out {
                        Some(out_path) => {
                            kiln_native::write_artifact(Path::new(&out_path), text.as_bytes())?;
                            report_artifact(json, &out_path);
                        }
                        None => print!("{text}"),
                    }
                }
            }
            Ok(())
        }
        Command::Run { path, options, json } => {
            let program = load(&path)?;
            let mut process = Process::new();
            let execution = kiln_native::run_with(&program, &options, &mut process)?;
            let result = execution.smi().unwrap_or(execution.result);
            if json {
                println!("{}", Report::success(None, Some(result)).to_json());
            } else if let Some(value) = execution.smi() {
                println!("{value}");
            } else {
                let offset = (execution.result as u64).wrapping_sub(execution.image_start);
                println!("<object {:#x}> (image offset {offset:#x})", execution.result);
            }
            Ok(())
        }
        Command::Dump { path, options, emit } => {
            let program = load(&path)?;
            let text = match emit {
                EmitFormat::Clif => kiln_native::dump_clif(&program, &options)?,
                _ => kiln_native::dump_ir(&program, &options)?,
            };
            print!("{text}");
            Ok(())
        }
        Command::Disasm { path } => {
            let program = load(&path)?;
            print!("{}", disassemble_program(&program)?);
            Ok(())
        }
    }
}

fn report_artifact(json: bool, out_path: &str) {
    if json {
        println!("{}", Report::success(Some(out_path.to_string()), None).to_json());
    } else {
        log::info!("wrote {out_path}");
    }
}

/// Bytecode listing of every function in the snapshot, in heap order.
fn disassemble_program(program: &Program) -> Result<String, Failure> {
    let mut out = String::new();
    for object in program.heap.iter() {
        let ObjectBody::Function(function) = &object.body else {
            continue;
        };
        let name = function.name.as_deref().unwrap_or("<anonymous>");
        out.push_str(&format!("function {} {name} (arity {}):\n", object.id, function.arity));
        let listing = kiln_core::bytecode::disassemble(&function.bytecodes).map_err(|err| {
            Failure(Diagnostic::error(kiln_native::E_BYTECODE, err.to_string()).with_note(format!("in {name}")))
        })?;
        out.push_str(&listing);
        for range in &function.catch_ranges {
            out.push_str(&format!(
                "  catch [{}, {}) frame {}\n",
                range.start, range.end, range.frame_size
            ));
        }
        out.push('\n');
    }
    Ok(out)
}

fn default_emit_path(path: &str, extension: &str) -> String {
    let mut output = PathBuf::from(path);
    output.set_extension(extension);
    output.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::builder::{Assembler, ProgramBuilder};
    use kiln_core::bytecode::Opcode;

    fn cmd(args: &[&str]) -> Result<Command, String> {
        let args = args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        parse_command(&args)
    }

    fn options_for(name: &str) -> CompileOptions {
        CompileOptions {
            module_name: name.to_string(),
            ..CompileOptions::default()
        }
    }

    #[test]
    fn parse_compile_defaults_to_an_object_file() {
        let command = cmd(&["compile", "snapshots/main.json"]).unwrap();
        assert_eq!(
            command,
            Command::Compile {
                path: "snapshots/main.json".to_string(),
                options: options_for("main"),
                emit: EmitFormat::Obj,
                out: None,
                json: false,
            }
        );
    }

    #[test]
    fn parse_compile_flags_in_any_order() {
        let command = cmd(&[
            "compile",
            "--no-opt",
            "--target",
            "x86_64-unknown-linux-gnu",
            "app.json",
            "--pic",
            "--out",
            "app.o",
            "--no-verify",
            "--json",
        ])
        .unwrap();
        assert_eq!(
            command,
            Command::Compile {
                path: "app.json".to_string(),
                options: CompileOptions {
                    verify: false,
                    optimize: false,
                    target: Some("x86_64-unknown-linux-gnu".to_string()),
                    pic: true,
                    module_name: "app".to_string(),
                },
                emit: EmitFormat::Obj,
                out: Some("app.o".to_string()),
                json: true,
            }
        );
    }

    #[test]
    fn parse_compile_text_emit_with_json_needs_out() {
        let err = cmd(&["compile", "app.json", "--emit", "clif", "--json"]).unwrap_err();
        assert!(err.contains("requires --out"));
        assert!(cmd(&["compile", "app.json", "--emit", "ir", "--json", "--out", "app.kir"]).is_ok());
    }

    #[test]
    fn parse_rejects_unknown_emit_format() {
        let err = cmd(&["compile", "app.json", "--emit", "bitcode"]).unwrap_err();
        assert!(err.contains("invalid emit format 'bitcode'"));
    }

    #[test]
    fn parse_run_rejects_compile_only_flags() {
        assert_eq!(cmd(&["run", "app.json", "--out", "x"]).unwrap_err(), "unexpected --out");
        assert_eq!(cmd(&["run", "app.json", "--pic"]).unwrap_err(), "unexpected --pic");
        assert_eq!(
            cmd(&["run", "app.json", "--json"]).unwrap(),
            Command::Run {
                path: "app.json".to_string(),
                options: options_for("app"),
                json: true,
            }
        );
    }

    #[test]
    fn parse_dump_defaults_to_ir_and_refuses_obj() {
        assert_eq!(
            cmd(&["dump", "app.json", "--emit", "clif"]).unwrap(),
            Command::Dump {
                path: "app.json".to_string(),
                options: options_for("app"),
                emit: EmitFormat::Clif,
            }
        );
        assert!(matches!(
            cmd(&["dump", "app.json"]).unwrap(),
            Command::Dump { emit: EmitFormat::Ir, .. }
        ));
        assert!(cmd(&["dump", "app.json", "--emit", "obj"]).is_err());
    }

    #[test]
    fn parse_rejects_missing_and_duplicate_paths() {
        assert_eq!(cmd(&["disasm"]).unwrap_err(), "missing snapshot for disasm");
        assert_eq!(cmd(&["disasm", "a.json", "b.json"]).unwrap_err(), "multiple snapshots provided");
        assert_eq!(cmd(&["disasm", "a.json", "--no-opt"]).unwrap_err(), "unexpected --no-opt");
        assert_eq!(cmd(&["link", "a.json"]).unwrap_err(), "unknown command 'link'");
    }

    #[test]
    fn default_emit_path_swaps_the_extension() {
        assert_eq!(default_emit_path("dir/main.json", "o"), "dir/main.o");
        assert_eq!(default_emit_path("main", "clif"), "main.clif");
    }

    #[test]
    fn disassembly_lists_every_function() {
        let mut builder = ProgramBuilder::new();
        let mut asm = Assembler::new();
        asm.load_literal(3).emit(Opcode::Return);
        let main = builder.add_function("main", 0, asm.finish().unwrap(), Vec::new());
        let program = builder.build(main).unwrap();

        let listing = disassemble_program(&program).unwrap();
        assert!(listing.contains("main (arity 0):"));
        assert!(listing.contains(Opcode::Return.mnemonic()));
    }

    #[test]
    fn compile_and_run_through_the_driver() {
        let mut builder = ProgramBuilder::new();
        let mut asm = Assembler::new();
        asm.load_literal(5).emit(Opcode::Return);
        let main = builder.add_function("main", 0, asm.finish().unwrap(), Vec::new());
        let program = builder.build(main).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("five.json");
        std::fs::write(&snapshot, program.to_json().unwrap()).unwrap();
        let snapshot = snapshot.to_string_lossy().to_string();

        execute(Command::Compile {
            path: snapshot.clone(),
            options: options_for("five"),
            emit: EmitFormat::Obj,
            out: None,
            json: false,
        })
        .unwrap();
        assert!(dir.path().join("five.o").exists());

        execute(Command::Run {
            path: snapshot,
            options: options_for("five"),
            json: true,
        })
        .unwrap();
    }

    #[test]
    fn missing_snapshot_is_a_diagnostic() {
        let err = execute(Command::Disasm {
            path: "/nonexistent/kiln.json".to_string(),
        })
        .unwrap_err();
        assert_eq!(err.0.code, kiln_native::E_SNAPSHOT);
    }
}
