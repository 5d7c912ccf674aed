/// An entry in the error code registry.
pub struct ErrorEntry {
    pub code: &'static str,
    pub short: &'static str, // brief description for tooling
    pub long: &'static str,  // full explanation for --explain
}

/// All stable error codes.
pub static REGISTRY: &[ErrorEntry] = &[
    // ── Lexer ────────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "RW-L001",
        short: "unexpected character",
        long: r#"## RW-L001: unexpected character

A character appeared that no token of the listing format starts with.

**Example:**

    func f () { i32.const 1 # bump }

Comments start with `;;` and run to the end of the line. Names are
written bare, without a leading `$`.
"#,
    },
    ErrorEntry {
        code: "RW-L002",
        short: "malformed number",
        long: r#"## RW-L002: malformed number

A numeric literal could not be read. Integers are decimal or `0x` hex and
must fit in 64 bits (unsigned values up to 2^64-1 are accepted and stored
as their two's complement bit pattern).
"#,
    },
    ErrorEntry {
        code: "RW-L003",
        short: "unterminated string",
        long: r#"## RW-L003: unterminated string

A string literal has no closing `"`. Strings may contain `\n`, `\t`,
`\\`, `\"` and two-digit hex escapes such as `\00`.
"#,
    },

    // ── Parser ───────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "RW-P001",
        short: "unexpected token",
        long: r#"## RW-P001: unexpected token

The parser expected a different kind of token. At the top level every item
starts with `import`, `func`, `global`, `memory`, `data`, `table`, `elem`
or `export`. Inside a function body every instruction starts with an
operator name.
"#,
    },
    ErrorEntry {
        code: "RW-P002",
        short: "unexpected end of input",
        long: r#"## RW-P002: unexpected end of input

The listing ended in the middle of an item, most often a function body
missing its closing `}`.
"#,
    },
    ErrorEntry {
        code: "RW-P003",
        short: "undefined name",
        long: r#"## RW-P003: undefined name

A `call`, `elem`, `export` or `global.get` refers to a name that is never
defined. Functions may be referenced before their definition; globals must
be declared before an initializer or instruction uses them.
"#,
    },
    ErrorEntry {
        code: "RW-P004",
        short: "duplicate name",
        long: r#"## RW-P004: duplicate name

Two functions (or two globals) share a name. Function and global names
live in separate namespaces.
"#,
    },
    ErrorEntry {
        code: "RW-P005",
        short: "import after definition",
        long: r#"## RW-P005: import after definition

Imports occupy the first slots of the function and global index spaces,
so every `import` must come before the first `func` or `global`
definition.
"#,
    },
    ErrorEntry {
        code: "RW-P006",
        short: "invalid literal",
        long: r#"## RW-P006: invalid literal

A literal is out of range for where it is used (a negative memory size, an
index above 2^32-1) or a string holds a bad escape or invalid UTF-8 where
a name is expected.
"#,
    },
    ErrorEntry {
        code: "RW-P007",
        short: "duplicate memory or table",
        long: r#"## RW-P007: duplicate memory or table

A module has at most one linear memory and one table.
"#,
    },

    // ── Compiler ─────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "RW-C001",
        short: "operand stack underflow",
        long: r#"## RW-C001: operand stack underflow

An operator pops more values than the current region has pushed.

**Example:**

    func f () -> i32 { i32.const 1 i32.add }

`i32.add` needs two operands but only one is available.
"#,
    },
    ErrorEntry {
        code: "RW-C002",
        short: "unknown operator",
        long: r#"## RW-C002: unknown operator

The operator name is not part of the instruction set. Legacy spellings
such as `get_local`, `set_global` and `grow_memory` are accepted.
"#,
    },
    ErrorEntry {
        code: "RW-C003",
        short: "missing immediate",
        long: r#"## RW-C003: missing immediate

An operator was given fewer immediates than it needs, for example
`br` without a label depth or `i32.const` without a value.
"#,
    },
    ErrorEntry {
        code: "RW-C004",
        short: "inconsistent stack at end of region",
        long: r#"## RW-C004: inconsistent stack at end of region

At `end`, a region must leave exactly its result (one value for a typed
block, none otherwise) on top of the stack it started with.

**Example:**

    block
      i32.const 1
    end

The untyped block leaves a stray value. Add `drop` or give the block a
result type.
"#,
    },
    ErrorEntry {
        code: "RW-C005",
        short: "unbalanced control",
        long: r#"## RW-C005: unbalanced control

An `end` closes a region that was never opened, or the body ends while
regions are still open.
"#,
    },
    ErrorEntry {
        code: "RW-C006",
        short: "else without if",
        long: r#"## RW-C006: else without if

`else` may only appear directly inside an `if` region, once.
"#,
    },
    ErrorEntry {
        code: "RW-C007",
        short: "if without else yields a value",
        long: r#"## RW-C007: if without else yields a value

An `if` with a result type must have an `else` arm, otherwise the value
is undefined when the condition is false.

**Fix:**

    local.get 0
    if i32
      i32.const 1
    else
      i32.const 0
    end
"#,
    },
    ErrorEntry {
        code: "RW-C008",
        short: "label out of range",
        long: r#"## RW-C008: label out of range

A `br`, `br_if` or `br_table` depth is larger than the number of open
regions. Depth 0 is the innermost region; the function body itself is the
outermost.
"#,
    },
    ErrorEntry {
        code: "RW-C009",
        short: "index out of range",
        long: r#"## RW-C009: index out of range

A local, global, function or type index does not exist. Locals count the
parameters first, then the declared `local` slots.
"#,
    },
    ErrorEntry {
        code: "RW-C010",
        short: "invalid jump target",
        long: r#"## RW-C010: invalid jump target

A lowered jump points outside the function body. This indicates a
compiler bug rather than a problem with the input.
"#,
    },
    ErrorEntry {
        code: "RW-C011",
        short: "block without terminator",
        long: r#"## RW-C011: block without terminator

A basic block of the lowered code neither jumps nor returns. This
indicates a compiler bug rather than a problem with the input.
"#,
    },
    ErrorEntry {
        code: "RW-C012",
        short: "value without register",
        long: r#"## RW-C012: value without register

Register allocation found a value that was never assigned a register.
This indicates a compiler bug rather than a problem with the input.
"#,
    },
    ErrorEntry {
        code: "RW-C013",
        short: "gas cost overflow",
        long: r#"## RW-C013: gas cost overflow

The summed gas cost of one basic block does not fit in 64 bits. Check the
`--gas-table` values.
"#,
    },

    // ── Traps ────────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "RW-T001",
        short: "unreachable executed",
        long: r#"## RW-T001: unreachable executed

Control reached an `unreachable` instruction.
"#,
    },
    ErrorEntry {
        code: "RW-T002",
        short: "integer division by zero",
        long: r#"## RW-T002: integer division by zero

`div_s`, `div_u`, `rem_s` or `rem_u` was given a zero divisor.
"#,
    },
    ErrorEntry {
        code: "RW-T003",
        short: "integer overflow",
        long: r#"## RW-T003: integer overflow

A signed division overflowed (`i32.div_s` of -2147483648 by -1) or a
float-to-integer truncation produced a value outside the target range.
"#,
    },
    ErrorEntry {
        code: "RW-T004",
        short: "invalid conversion to integer",
        long: r#"## RW-T004: invalid conversion to integer

A `trunc` operator was given NaN.
"#,
    },
    ErrorEntry {
        code: "RW-T005",
        short: "out of bounds memory access",
        long: r#"## RW-T005: out of bounds memory access

A load or store touched bytes past the end of linear memory. The effective
address is the base operand plus the static `offset=` immediate.
"#,
    },
    ErrorEntry {
        code: "RW-T006",
        short: "table index out of bounds",
        long: r#"## RW-T006: table index out of bounds

`call_indirect` selected a slot past the end of the table.
"#,
    },
    ErrorEntry {
        code: "RW-T007",
        short: "uninitialized table element",
        long: r#"## RW-T007: uninitialized table element

`call_indirect` selected a table slot that no `elem` segment filled.
"#,
    },
    ErrorEntry {
        code: "RW-T008",
        short: "indirect call signature mismatch",
        long: r#"## RW-T008: indirect call signature mismatch

The function found in the table does not have the signature written on
the `call_indirect` instruction.
"#,
    },
    ErrorEntry {
        code: "RW-T009",
        short: "value slot budget exceeded",
        long: r#"## RW-T009: value slot budget exceeded

The registers and locals of all live frames would exceed
`--max-value-slots`.
"#,
    },
    ErrorEntry {
        code: "RW-T010",
        short: "call stack exhausted",
        long: r#"## RW-T010: call stack exhausted

A call would exceed `--max-call-depth` frames (512 by default). This is
usually unbounded recursion.
"#,
    },
    ErrorEntry {
        code: "RW-T011",
        short: "gas limit exceeded",
        long: r#"## RW-T011: gas limit exceeded

Gas instrumentation charges each basic block on entry. The run stopped
when the total would pass `--gas-limit`.
"#,
    },
    ErrorEntry {
        code: "RW-T012",
        short: "step limit exceeded",
        long: r#"## RW-T012: step limit exceeded

More instructions were dispatched than `--max-steps` allows.
"#,
    },
    ErrorEntry {
        code: "RW-T013",
        short: "unresolved import",
        long: r#"## RW-T013: unresolved import

An imported function was called but the host supplied no implementation
for its module and field names.
"#,
    },
    ErrorEntry {
        code: "RW-T014",
        short: "host function failure",
        long: r#"## RW-T014: host function failure

A host function returned an error or panicked.
"#,
    },
    ErrorEntry {
        code: "RW-T015",
        short: "bytecode out of bounds",
        long: r#"## RW-T015: bytecode out of bounds

The interpreter tried to read an operand past the end of a function's
bytecode. This indicates corrupted code.
"#,
    },
    ErrorEntry {
        code: "RW-T016",
        short: "unknown opcode",
        long: r#"## RW-T016: unknown opcode

A bytecode instruction carries an opcode byte the interpreter does not
know. This indicates corrupted code.
"#,
    },
    ErrorEntry {
        code: "RW-T017",
        short: "bad index",
        long: r#"## RW-T017: bad index

An instruction named a register, local, global or function that does not
exist in the running frame or module.
"#,
    },

    // ── VM ───────────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "RW-V001",
        short: "invalid vm state",
        long: r#"## RW-V001: invalid vm state

An operation was requested in the wrong state: `step` outside `running`,
`run_host_call` with no pending import, or `ignite` after a trap without a
`reset`.
"#,
    },
    ErrorEntry {
        code: "RW-V002",
        short: "unknown function",
        long: r#"## RW-V002: unknown function

No function has the requested index.
"#,
    },
    ErrorEntry {
        code: "RW-V003",
        short: "unknown export",
        long: r#"## RW-V003: unknown export

No exported function has the requested name. Export one with
`func name (...) export "name" { ... }` or `export "name" func name`.
"#,
    },
    ErrorEntry {
        code: "RW-V004",
        short: "argument count mismatch",
        long: r#"## RW-V004: argument count mismatch

The entry function was given a different number of arguments than it has
parameters.
"#,
    },
    ErrorEntry {
        code: "RW-V005",
        short: "bad snapshot",
        long: r#"## RW-V005: bad snapshot

A snapshot could not be decoded or does not fit the module it is restored
into (unknown function, wrong register count, ip outside the code).
"#,
    },
    ErrorEntry {
        code: "RW-V006",
        short: "unresolved imported global",
        long: r#"## RW-V006: unresolved imported global

Imported globals are resolved when the module is instantiated and the
host did not provide this one.
"#,
    },
    ErrorEntry {
        code: "RW-V007",
        short: "segment out of range",
        long: r#"## RW-V007: segment out of range

A `data` segment does not fit in memory or an `elem` segment does not fit
in the table (or names a function that does not exist).
"#,
    },
    ErrorEntry {
        code: "RW-V008",
        short: "invalid initializer",
        long: r#"## RW-V008: invalid initializer

A global initializer reads a global that is not yet defined.
"#,
    },
    ErrorEntry {
        code: "RW-V009",
        short: "memory limit",
        long: r#"## RW-V009: memory limit

The module's initial memory is larger than its declared maximum or the
`max_memory_pages` configuration.
"#,
    },
];

/// Look up an error entry by code (e.g. `"RW-T002"`).
pub fn lookup(code: &str) -> Option<&'static ErrorEntry> {
    REGISTRY.iter().find(|e| e.code == code)
}
