use std::path::PathBuf;
use std::process::{Command, Output};

use tempfile::TempDir;

fn regwasm() -> Command {
    Command::new(env!("CARGO_BIN_EXE_regwasm"))
}

/// Writes `source` into a fresh directory and returns both.
fn listing(name: &str, source: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(name);
    std::fs::write(&path, source).expect("write listing");
    (dir, path)
}

fn run(args: &[&str]) -> Output {
    regwasm().args(args).output().expect("failed to run regwasm")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).to_string()
}

const ADD: &str = r#"
func add (i32 i32) -> i32 export "add" {
  local.get 0
  local.get 1
  i32.add
}
"#;

const DIV: &str = r#"
func div (i32 i32) -> i32 export "div" {
  local.get 0
  local.get 1
  i32.div_s
}
"#;

// --- run ---

#[test]
fn run_first_export() {
    let (_dir, path) = listing("add.wat", ADD);
    let out = run(&["run", path.to_str().unwrap(), "3", "4"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "7");
}

#[test]
fn run_named_export_with_negative_args() {
    let (_dir, path) = listing("div.wat", DIV);
    let out = run(&["run", path.to_str().unwrap(), "--invoke", "div", "-9", "3"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "-3");
}

#[test]
fn run_json_reports_gas() {
    let (_dir, path) = listing("add.wat", ADD);
    let out = run(&["--json", "run", path.to_str().unwrap(), "--gas-cost", "1", "3", "4"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let v: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("valid JSON");
    assert_eq!(v["function"], "add");
    assert_eq!(v["result"], 7);
    assert_eq!(v["gas_used"], 4);
}

#[test]
fn gas_table_prices_operators() {
    let (dir, path) = listing("add.wat", ADD);
    let table = dir.path().join("costs.json");
    std::fs::write(&table, r#"{"default": 1, "costs": {"i32.add": 10}}"#).unwrap();
    let out = run(&[
        "run",
        path.to_str().unwrap(),
        "--gas-table",
        table.to_str().unwrap(),
        "--json",
        "1",
        "2",
    ]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let v: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(v["gas_used"], 13);
}

#[test]
fn gas_limit_traps() {
    let (_dir, path) = listing("add.wat", ADD);
    let out = run(&["run", path.to_str().unwrap(), "--gas-limit", "3", "1", "2"]);
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.contains("RW-T011"), "stderr: {err}");
    assert!(err.contains("warning: --gas-limit given without a cost model"), "stderr: {err}");
}

#[test]
fn gas_limit_with_a_cost_model_does_not_warn() {
    let (_dir, path) = listing("add.wat", ADD);
    let out = run(&["run", path.to_str().unwrap(), "--gas-cost", "1", "--gas-limit", "10", "1", "2"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "3");
    assert!(!stderr(&out).contains("warning"), "stderr: {}", stderr(&out));
}

#[test]
fn host_print_and_imported_global() {
    let src = r#"
import "env" "print_i32" func print (i32)
import "env" "base" global base i32
func main () -> i32 export "main" {
  global.get base
  call print
  global.get base
  i32.const 1
  i32.add
}
"#;
    let (_dir, path) = listing("host.wat", src);
    let out = run(&["run", path.to_str().unwrap(), "--global", "env.base=41"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "41\n42");
}

#[test]
fn missing_imported_global_is_a_load_error() {
    let src = r#"import "env" "base" global base i32"#;
    let (_dir, path) = listing("host.wat", src);
    let out = run(&["--json", "run", path.to_str().unwrap()]);
    assert!(!out.status.success());
    let v: serde_json::Value = serde_json::from_str(stderr(&out).trim()).expect("JSON diagnostic");
    assert_eq!(v["code"], "RW-V006");
}

#[test]
fn json_module_input() {
    let dir = tempfile::tempdir().unwrap();
    let text = regwasm::parser::parse_source(ADD).unwrap().to_json().unwrap();
    let path = dir.path().join("add.json");
    std::fs::write(&path, text).unwrap();
    let out = run(&["run", path.to_str().unwrap(), "20", "22"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "42");
}

#[test]
fn jit_gives_the_same_answer() {
    let (_dir, path) = listing("add.wat", ADD);
    let out = run(&["run", path.to_str().unwrap(), "--jit", "--gas-cost", "1", "--json", "3", "4"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let v: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(v["result"], 7);
    assert_eq!(v["gas_used"], 4);
}

#[test]
fn trace_goes_to_stderr() {
    let (_dir, path) = listing("add.wat", ADD);
    let out = run(&["run", path.to_str().unwrap(), "--trace", "--gas-cost", "1", "3", "4"]);
    assert!(out.status.success());
    assert_eq!(stdout(&out), "7");
    let err = stderr(&out);
    assert!(err.contains("[trace] -> f0"), "stderr: {err}");
    assert!(err.contains("gas +4 = 4"), "stderr: {err}");
}

// --- traps and diagnostics ---

#[test]
fn division_by_zero_exits_nonzero() {
    let (_dir, path) = listing("div.wat", DIV);
    let out = run(&["run", path.to_str().unwrap(), "1", "0"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(out.stdout.is_empty());
    let err = stderr(&out);
    assert!(err.contains("error[RW-T002]"), "stderr: {err}");
    assert!(err.contains("in function 0"), "stderr: {err}");
}

#[test]
fn overflow_trap_as_json() {
    let (_dir, path) = listing("div.wat", DIV);
    let out = run(&["--json", "run", path.to_str().unwrap(), "--", "-2147483648", "-1"]);
    assert!(!out.status.success());
    let v: serde_json::Value = serde_json::from_str(stderr(&out).trim()).expect("JSON diagnostic");
    assert_eq!(v["severity"], "error");
    assert_eq!(v["code"], "RW-T003");
}

#[test]
fn parse_error_points_into_the_listing() {
    let src = "func f () -> i32 export \"f\" {\n  call nowhere\n}\n";
    let (_dir, path) = listing("bad.wat", src);
    let out = run(&["--json", "run", path.to_str().unwrap()]);
    assert!(!out.status.success());
    let v: serde_json::Value = serde_json::from_str(stderr(&out).trim()).unwrap();
    assert_eq!(v["code"], "RW-P003");
    assert_eq!(v["labels"][0]["line"], 2);
}

#[test]
fn compile_error_names_the_function() {
    let src = "func f () -> i32 export \"f\" {\n  i32.add\n}\n";
    let (_dir, path) = listing("bad.wat", src);
    let out = run(&["run", path.to_str().unwrap()]);
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.contains("RW-C"), "stderr: {err}");
    assert!(err.contains("`f`"), "stderr: {err}");
}

#[test]
fn unknown_export() {
    let (_dir, path) = listing("add.wat", ADD);
    let out = run(&["run", path.to_str().unwrap(), "--invoke", "sub", "1", "2"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("RW-V003"));
}

#[test]
fn missing_file() {
    let out = run(&["run", "/definitely/not/here.wat"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("cannot read"));
}

// --- disasm ---

#[test]
fn disasm_lists_functions() {
    let (_dir, path) = listing("add.wat", ADD);
    let out = run(&["disasm", path.to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let text = stdout(&out);
    assert!(text.starts_with("func 0 add"), "got: {text}");
    assert!(text.contains("i32.add"));
    assert!(text.contains("return_value"));
}

#[test]
fn disasm_json_with_gas() {
    let (_dir, path) = listing("add.wat", ADD);
    let out = run(&["--json", "compile", path.to_str().unwrap(), "--gas-cost", "1"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let v: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    let f = &v[0];
    assert_eq!(f["name"], "add");
    assert_eq!(f["params"], 2);
    let code = f["code"].as_array().unwrap();
    assert_eq!(code[0]["op"], "add_gas");
    assert_eq!(code[0]["operands"][0], 4);
    assert_eq!(code.last().unwrap()["op"], "return_value");
}

#[test]
fn disasm_shows_import_stubs() {
    let src = r#"
import "env" "print_i32" func print (i32)
func main () export "main" { i32.const 1 call print }
"#;
    let (_dir, path) = listing("host.wat", src);
    let out = run(&["disasm", path.to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let text = stdout(&out);
    assert!(text.contains("func 0 env.print_i32"), "got: {text}");
    assert!(text.contains("invoke_import"));
}

// --- explain / usage ---

#[test]
fn explain_known_code() {
    let out = run(&["--explain", "RW-T002"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("division by zero"));
}

#[test]
fn explain_unknown_code() {
    let out = run(&["--explain", "RW-X999"]);
    assert!(!out.status.success());
}

#[test]
fn no_args_shows_usage() {
    let out = regwasm().output().expect("failed to run regwasm");
    assert!(!out.status.success());
    assert!(stdout(&out).contains("Usage"), "expected usage, got: {}", stdout(&out));
}
