use serde::{Deserialize, Serialize};

pub mod source_map;
pub use source_map::SourceMap;

// ---- Span infrastructure ----

/// Byte range within a module listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn is_unknown(&self) -> bool {
        *self == Span::UNKNOWN
    }
}

// ---- Types ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueType::I32 => write!(f, "i32"),
            ValueType::I64 => write!(f, "i64"),
            ValueType::F32 => write!(f, "f32"),
            ValueType::F64 => write!(f, "f64"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FuncType {
    #[serde(default)]
    pub params: Vec<ValueType>,
    #[serde(default)]
    pub results: Vec<ValueType>,
}

impl FuncType {
    pub fn new(params: Vec<ValueType>, results: Vec<ValueType>) -> Self {
        FuncType { params, results }
    }

    pub fn returns_value(&self) -> bool {
        !self.results.is_empty()
    }
}

impl std::fmt::Display for FuncType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, ")")?;
        if let Some(r) = self.results.first() {
            write!(f, " -> {r}")?;
        }
        Ok(())
    }
}

// ---- Instructions ----

/// One disassembled stack-machine instruction.
///
/// `result` is only meaningful on `block`, `loop` and `if`, where it marks a
/// region that leaves one value on the stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInstr {
    pub op: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub immediates: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ValueType>,
    #[serde(skip)]
    pub span: Span,
}

impl SourceInstr {
    pub fn new(op: &str, immediates: &[i64]) -> Self {
        SourceInstr {
            op: op.to_string(),
            immediates: immediates.to_vec(),
            result: None,
            span: Span::UNKNOWN,
        }
    }

    pub fn with_result(mut self, ty: ValueType) -> Self {
        self.result = Some(ty);
        self
    }

    pub fn yields(&self) -> bool {
        self.result.is_some()
    }
}

// ---- Module ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ImportKind {
    Function { type_index: u32 },
    Global { ty: ValueType },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Import {
    pub module: String,
    pub field: String,
    #[serde(flatten)]
    pub kind: ImportKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub type_index: u32,
    #[serde(default)]
    pub locals: Vec<ValueType>,
    pub body: Vec<SourceInstr>,
    #[serde(skip)]
    pub span: Span,
}

/// Constant expression used for global initializers and segment offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitExpr {
    Const(i64),
    GlobalGet(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Global {
    pub ty: ValueType,
    #[serde(default)]
    pub mutable: bool,
    pub init: InitExpr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryType {
    pub initial: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSegment {
    pub offset: InitExpr,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableType {
    pub initial: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementSegment {
    pub offset: InitExpr,
    pub functions: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Function,
    Global,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
    pub index: u32,
}

/// A decoded module: the input of the compiler and of instantiation.
///
/// Function and global index spaces put imports first, then definitions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Module {
    #[serde(default)]
    pub types: Vec<FuncType>,
    #[serde(default)]
    pub imports: Vec<Import>,
    #[serde(default)]
    pub functions: Vec<Function>,
    #[serde(default)]
    pub globals: Vec<Global>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryType>,
    #[serde(default)]
    pub data: Vec<DataSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<TableType>,
    #[serde(default)]
    pub elements: Vec<ElementSegment>,
    #[serde(default)]
    pub exports: Vec<Export>,
}

impl Module {
    pub fn from_json(text: &str) -> Result<Module, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn imported_functions(&self) -> impl Iterator<Item = (&Import, u32)> {
        self.imports.iter().filter_map(|imp| match imp.kind {
            ImportKind::Function { type_index } => Some((imp, type_index)),
            ImportKind::Global { .. } => None,
        })
    }

    pub fn imported_globals(&self) -> impl Iterator<Item = (&Import, ValueType)> {
        self.imports.iter().filter_map(|imp| match imp.kind {
            ImportKind::Global { ty } => Some((imp, ty)),
            ImportKind::Function { .. } => None,
        })
    }

    pub fn num_imported_functions(&self) -> usize {
        self.imported_functions().count()
    }

    pub fn num_imported_globals(&self) -> usize {
        self.imported_globals().count()
    }

    /// Total size of the function index space.
    pub fn num_functions(&self) -> usize {
        self.num_imported_functions() + self.functions.len()
    }

    /// Total size of the global index space.
    pub fn num_globals(&self) -> usize {
        self.num_imported_globals() + self.globals.len()
    }

    /// Type index of a function in the combined index space.
    pub fn function_type_index(&self, func_index: u32) -> Option<u32> {
        let idx = func_index as usize;
        let imported = self.num_imported_functions();
        if idx < imported {
            self.imported_functions().nth(idx).map(|(_, t)| t)
        } else {
            self.functions.get(idx - imported).map(|f| f.type_index)
        }
    }

    pub fn function_type(&self, func_index: u32) -> Option<&FuncType> {
        self.function_type_index(func_index)
            .and_then(|t| self.types.get(t as usize))
    }

    /// Signatures for the whole function index space, in order.
    pub fn signatures(&self) -> Vec<Option<&FuncType>> {
        (0..self.num_functions() as u32)
            .map(|i| self.function_type(i))
            .collect()
    }

    pub fn find_export(&self, name: &str, kind: ExportKind) -> Option<u32> {
        self.exports
            .iter()
            .find(|e| e.name == name && e.kind == kind)
            .map(|e| e.index)
    }

    /// Interns a signature into the type table, returning its index.
    pub fn intern_type(&mut self, ty: FuncType) -> u32 {
        if let Some(pos) = self.types.iter().position(|t| *t == ty) {
            return pos as u32;
        }
        self.types.push(ty);
        (self.types.len() - 1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Module {
        let mut m = Module::default();
        let t = m.intern_type(FuncType::new(vec![ValueType::I32, ValueType::I32], vec![ValueType::I32]));
        m.imports.push(Import {
            module: "env".into(),
            field: "sum".into(),
            kind: ImportKind::Function { type_index: t },
        });
        m.functions.push(Function {
            name: Some("add".into()),
            type_index: t,
            locals: vec![],
            body: vec![
                SourceInstr::new("local.get", &[0]),
                SourceInstr::new("local.get", &[1]),
                SourceInstr::new("i32.add", &[]),
            ],
            span: Span::UNKNOWN,
        });
        m.exports.push(Export { name: "add".into(), kind: ExportKind::Function, index: 1 });
        m
    }

    #[test]
    fn index_space_puts_imports_first() {
        let m = sample();
        assert_eq!(m.num_imported_functions(), 1);
        assert_eq!(m.num_functions(), 2);
        assert_eq!(m.function_type_index(0), Some(0));
        assert_eq!(m.function_type_index(1), Some(0));
        assert_eq!(m.function_type_index(2), None);
    }

    #[test]
    fn intern_type_dedups() {
        let mut m = sample();
        let again = m.intern_type(FuncType::new(vec![ValueType::I32, ValueType::I32], vec![ValueType::I32]));
        assert_eq!(again, 0);
        let other = m.intern_type(FuncType::default());
        assert_eq!(other, 1);
        assert_eq!(m.types.len(), 2);
    }

    #[test]
    fn json_round_trip_keeps_import_kind() {
        let m = sample();
        let text = m.to_json().unwrap();
        assert!(text.contains("\"kind\": \"function\""), "{text}");
        let back = Module::from_json(&text).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn json_defaults_missing_sections() {
        let m = Module::from_json(r#"{"types":[{"params":["i64"]}],"functions":[{"type_index":0,"body":[{"op":"nop"}]}]}"#)
            .unwrap();
        assert!(m.imports.is_empty());
        assert!(m.memory.is_none());
        assert_eq!(m.functions[0].body[0].op, "nop");
        assert!(!m.functions[0].body[0].yields());
    }

    #[test]
    fn func_type_display() {
        let t = FuncType::new(vec![ValueType::I32, ValueType::F64], vec![ValueType::I64]);
        assert_eq!(t.to_string(), "(i32 f64) -> i64");
        assert_eq!(FuncType::default().to_string(), "()");
    }

    #[test]
    fn find_export_by_kind() {
        let m = sample();
        assert_eq!(m.find_export("add", ExportKind::Function), Some(1));
        assert_eq!(m.find_export("add", ExportKind::Global), None);
    }
}
