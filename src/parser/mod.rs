//! Recursive-descent parser for module listings.
//!
//! ```text
//! import "env" "sum" func sum (i32 i32) -> i32
//! global counter mut i32 = 0
//! memory 1 max 4
//! data 16 "hi\00"
//! table 2
//! elem 0 : add sum
//!
//! func add (i32 i32) -> i32 export "add" {
//!   local i64
//!   local.get 0
//!   local.get 1
//!   i32.add
//! }
//! export "counter" global counter
//! ```
//!
//! Function bodies are flat operator lists; `block`, `loop` and `if` take an
//! optional result type and close with `end`. Names resolve after the whole
//! listing is read, so calls may refer to functions defined further down.

use std::collections::HashMap;

use crate::ast::*;
use crate::bytecode::{Opcode, Shape, canonical_name};
use crate::lexer::{self, Token};

pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    module: Module,
    funcs: HashMap<String, u32>,
    globals: HashMap<String, u32>,
    defined_any: bool,
    fixups: Vec<Fixup>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("parse error at token {position}: {message}")]
pub struct ParseError {
    pub code: &'static str,
    pub position: usize,
    pub span: Span,
    pub message: String,
}

type Result<T> = std::result::Result<T, ParseError>;

/// A name used before its definition was seen.
struct Fixup {
    name: String,
    span: Span,
    site: Site,
}

enum Site {
    /// Immediate 0 of a body instruction.
    Instr { func: usize, instr: usize },
    Element { segment: usize, slot: usize },
    Export(usize),
}

/// A reference written either as a number or as a name.
enum Ref {
    Index(u32),
    Name(String, Span),
}

impl Parser {
    pub fn new(tokens: Vec<(Token, Span)>) -> Self {
        Parser {
            tokens,
            pos: 0,
            module: Module::default(),
            funcs: HashMap::new(),
            globals: HashMap::new(),
            defined_any: false,
            fixups: Vec::new(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, s)| *s)
            .unwrap_or(Span::UNKNOWN)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Span> {
        match self.peek() {
            Some(tok) if tok == expected => {
                let span = self.peek_span();
                self.pos += 1;
                Ok(span)
            }
            Some(tok) => Err(self.error("RW-P001", format!("expected {:?}, got {:?}", expected, tok))),
            None => Err(self.error("RW-P002", format!("expected {:?}, got end of input", expected))),
        }
    }

    fn expect_word(&mut self) -> Result<String> {
        match self.peek().cloned() {
            Some(Token::Word(name)) => {
                self.pos += 1;
                Ok(name)
            }
            Some(tok) => Err(self.error("RW-P001", format!("expected a name, got {:?}", tok))),
            None => Err(self.error("RW-P002", "expected a name, got end of input".into())),
        }
    }

    fn expect_int(&mut self) -> Result<i64> {
        match self.peek().cloned() {
            Some(Token::Int(n)) => {
                self.pos += 1;
                Ok(n)
            }
            Some(tok) => Err(self.error("RW-P001", format!("expected an integer, got {:?}", tok))),
            None => Err(self.error("RW-P002", "expected an integer, got end of input".into())),
        }
    }

    fn expect_u32(&mut self) -> Result<u32> {
        let n = self.expect_int()?;
        u32::try_from(n).map_err(|_| self.error_prev("RW-P006", format!("{n} does not fit in 32 bits")))
    }

    fn expect_string(&mut self) -> Result<Vec<u8>> {
        match self.peek().cloned() {
            Some(Token::Str(raw)) => {
                self.pos += 1;
                unescape(&raw).ok_or_else(|| self.error_prev("RW-P006", format!("bad escape in \"{raw}\"")))
            }
            Some(tok) => Err(self.error("RW-P001", format!("expected a string, got {:?}", tok))),
            None => Err(self.error("RW-P002", "expected a string, got end of input".into())),
        }
    }

    fn expect_name_string(&mut self) -> Result<String> {
        let bytes = self.expect_string()?;
        String::from_utf8(bytes).map_err(|_| self.error_prev("RW-P006", "name is not valid UTF-8".into()))
    }

    fn error(&self, code: &'static str, message: String) -> ParseError {
        ParseError { code, position: self.pos, span: self.peek_span(), message }
    }

    /// An error pointing at the token just consumed.
    fn error_prev(&self, code: &'static str, message: String) -> ParseError {
        let idx = self.pos.saturating_sub(1);
        let span = self.tokens.get(idx).map(|(_, s)| *s).unwrap_or(Span::UNKNOWN);
        ParseError { code, position: idx, span, message }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    // ---- Top-level parsing ----

    pub fn parse_module(mut self) -> Result<Module> {
        while !self.at_end() {
            self.parse_item()?;
        }
        self.resolve()?;
        Ok(self.module)
    }

    fn parse_item(&mut self) -> Result<()> {
        match self.peek() {
            Some(Token::Import) => self.parse_import(),
            Some(Token::Func) => self.parse_func(),
            Some(Token::Global) => self.parse_global(),
            Some(Token::Memory) => self.parse_memory(),
            Some(Token::Data) => self.parse_data(),
            Some(Token::Table) => self.parse_table(),
            Some(Token::Elem) => self.parse_elem(),
            Some(Token::Export) => self.parse_export(),
            Some(tok) => Err(self.error("RW-P001", format!("expected a module item, got {:?}", tok))),
            None => Err(self.error("RW-P002", "unexpected end of input".into())),
        }
    }

    fn declare(&mut self, global: bool, name: String, index: u32) -> Result<()> {
        let table = if global { &mut self.globals } else { &mut self.funcs };
        if table.insert(name.clone(), index).is_some() {
            return Err(self.error_prev("RW-P004", format!("`{name}` is defined twice")));
        }
        Ok(())
    }

    fn parse_import(&mut self) -> Result<()> {
        self.expect(&Token::Import)?;
        if self.defined_any {
            return Err(self.error_prev("RW-P005", "imports must come before definitions".into()));
        }
        let module = self.expect_name_string()?;
        let field = self.expect_name_string()?;
        let kind = match self.advance() {
            Some(Token::Func) => {
                let name = self.expect_word()?;
                let index = self.module.num_imported_functions() as u32;
                self.declare(false, name, index)?;
                let ty = self.parse_signature()?;
                ImportKind::Function { type_index: self.module.intern_type(ty) }
            }
            Some(Token::Global) => {
                let name = self.expect_word()?;
                let index = self.module.num_imported_globals() as u32;
                self.declare(true, name, index)?;
                self.eat(&Token::Mut);
                ImportKind::Global { ty: self.parse_type()? }
            }
            Some(tok) => return Err(self.error_prev("RW-P001", format!("expected func or global, got {:?}", tok))),
            None => return Err(self.error("RW-P002", "unexpected end of input".into())),
        };
        self.module.imports.push(Import { module, field, kind });
        Ok(())
    }

    fn parse_type(&mut self) -> Result<ValueType> {
        match self.advance() {
            Some(Token::I32) => Ok(ValueType::I32),
            Some(Token::I64) => Ok(ValueType::I64),
            Some(Token::F32) => Ok(ValueType::F32),
            Some(Token::F64) => Ok(ValueType::F64),
            Some(tok) => Err(self.error_prev("RW-P001", format!("expected a value type, got {:?}", tok))),
            None => Err(self.error("RW-P002", "expected a value type, got end of input".into())),
        }
    }

    fn peek_type(&self) -> bool {
        matches!(self.peek(), Some(Token::I32 | Token::I64 | Token::F32 | Token::F64))
    }

    /// `(params...) [-> result]`
    fn parse_signature(&mut self) -> Result<FuncType> {
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        while !self.eat(&Token::RParen) {
            params.push(self.parse_type()?);
        }
        let mut results = Vec::new();
        if self.eat(&Token::Arrow) {
            results.push(self.parse_type()?);
        }
        Ok(FuncType::new(params, results))
    }

    fn parse_func(&mut self) -> Result<()> {
        let start = self.expect(&Token::Func)?;
        let name = self.expect_word()?;
        let index = self.module.num_functions() as u32;
        self.declare(false, name.clone(), index)?;
        self.defined_any = true;

        let ty = self.parse_signature()?;
        let type_index = self.module.intern_type(ty);
        if self.eat(&Token::Export) {
            let export = self.expect_name_string()?;
            self.module.exports.push(Export { name: export, kind: ExportKind::Function, index });
        }

        self.expect(&Token::LBrace)?;
        let mut locals = Vec::new();
        while self.eat(&Token::Local) {
            while self.peek_type() {
                locals.push(self.parse_type()?);
            }
        }
        let def = self.module.functions.len();
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Some(Token::RBrace) => break,
                Some(_) => {
                    let ins = self.parse_instr(def, body.len())?;
                    body.push(ins);
                }
                None => return Err(self.error("RW-P002", format!("function `{name}` is missing its closing brace"))),
            }
        }
        let end = self.expect(&Token::RBrace)?;

        self.module.functions.push(Function { name: Some(name), type_index, locals, body, span: start.merge(end) });
        Ok(())
    }

    fn parse_ref(&mut self) -> Result<Ref> {
        match self.peek().cloned() {
            Some(Token::Int(_)) => Ok(Ref::Index(self.expect_u32()?)),
            Some(Token::Word(name)) => {
                let span = self.peek_span();
                self.pos += 1;
                Ok(Ref::Name(name, span))
            }
            Some(tok) => Err(self.error("RW-P001", format!("expected an index or a name, got {:?}", tok))),
            None => Err(self.error("RW-P002", "expected an index or a name, got end of input".into())),
        }
    }

    /// Resolves a global name right away; globals are declared before use.
    fn global_ref(&mut self) -> Result<u32> {
        match self.parse_ref()? {
            Ref::Index(i) => Ok(i),
            Ref::Name(name, span) => self.globals.get(&name).copied().ok_or(ParseError {
                code: "RW-P003",
                position: self.pos - 1,
                span,
                message: format!("undefined global `{name}`"),
            }),
        }
    }

    fn parse_instr(&mut self, func: usize, instr: usize) -> Result<SourceInstr> {
        let span = self.peek_span();
        let op = self.expect_word()?;
        let mut ins = SourceInstr::new(&op, &[]);
        ins.span = span;

        match canonical_name(&op) {
            "block" | "loop" | "if" => {
                if self.peek_type() {
                    ins.result = Some(self.parse_type()?);
                }
            }
            "br" | "br_if" => ins.immediates.push(self.expect_int()?),
            "br_table" => {
                while let Some(Token::Int(n)) = self.peek() {
                    ins.immediates.push(*n);
                    self.pos += 1;
                }
                if ins.immediates.is_empty() {
                    return Err(self.error("RW-P001", "br_table needs at least a default label".into()));
                }
            }
            "call" => match self.parse_ref()? {
                Ref::Index(i) => ins.immediates.push(i as i64),
                Ref::Name(name, span) => {
                    ins.immediates.push(0);
                    self.fixups.push(Fixup { name, span, site: Site::Instr { func, instr } });
                }
            },
            "call_indirect" => {
                let ty = self.parse_signature()?;
                ins.immediates.push(self.module.intern_type(ty) as i64);
            }
            "local.get" | "local.set" | "local.tee" => ins.immediates.push(self.expect_u32()? as i64),
            "global.get" | "global.set" => ins.immediates.push(self.global_ref()? as i64),
            "i32.const" | "i64.const" => ins.immediates.push(self.expect_int()?),
            "f32.const" => {
                let v = self.expect_float()?;
                ins.immediates.push((v as f32).to_bits() as i64);
            }
            "f64.const" => {
                let v = self.expect_float()?;
                ins.immediates.push(v.to_bits() as i64);
            }
            name => {
                let shape = Opcode::from_name(name).map(|o| o.shape());
                if matches!(shape, Some(Shape::Load | Shape::Store)) {
                    let (align, offset) = self.parse_memarg()?;
                    ins.immediates.extend([align, offset]);
                }
            }
        }
        Ok(ins)
    }

    fn expect_float(&mut self) -> Result<f64> {
        match self.peek().cloned() {
            Some(Token::Float(v)) => {
                self.pos += 1;
                Ok(v)
            }
            Some(Token::Int(n)) => {
                self.pos += 1;
                Ok(n as f64)
            }
            Some(tok) => Err(self.error("RW-P001", format!("expected a number, got {:?}", tok))),
            None => Err(self.error("RW-P002", "expected a number, got end of input".into())),
        }
    }

    /// `[offset=N] [align=N]` in either order.
    fn parse_memarg(&mut self) -> Result<(i64, i64)> {
        let (mut align, mut offset) = (0, 0);
        loop {
            let key = match self.peek() {
                Some(Token::Word(w)) if w == "offset" || w == "align" => w.clone(),
                _ => break,
            };
            if !matches!(self.tokens.get(self.pos + 1), Some((Token::Assign, _))) {
                break;
            }
            self.pos += 2;
            let value = self.expect_u32()? as i64;
            if key == "offset" {
                offset = value;
            } else {
                align = value;
            }
        }
        Ok((align, offset))
    }

    /// A constant initializer: a literal of the given type or `global.get`.
    fn parse_init(&mut self, ty: ValueType) -> Result<InitExpr> {
        if let Some(Token::Word(w)) = self.peek() {
            if canonical_name(w) == "global.get" {
                self.pos += 1;
                return Ok(InitExpr::GlobalGet(self.global_ref()?));
            }
        }
        let v = match ty {
            ValueType::I32 | ValueType::I64 => self.expect_int()?,
            ValueType::F32 => (self.expect_float()? as f32).to_bits() as i64,
            ValueType::F64 => self.expect_float()?.to_bits() as i64,
        };
        Ok(InitExpr::Const(v))
    }

    fn parse_global(&mut self) -> Result<()> {
        self.expect(&Token::Global)?;
        let name = self.expect_word()?;
        let index = self.module.num_globals() as u32;
        self.declare(true, name, index)?;
        self.defined_any = true;
        let mutable = self.eat(&Token::Mut);
        let ty = self.parse_type()?;
        self.expect(&Token::Assign)?;
        let init = self.parse_init(ty)?;
        self.module.globals.push(Global { ty, mutable, init });
        Ok(())
    }

    fn parse_memory(&mut self) -> Result<()> {
        self.expect(&Token::Memory)?;
        if self.module.memory.is_some() {
            return Err(self.error_prev("RW-P007", "only one memory may be declared".into()));
        }
        let initial = self.expect_u32()?;
        let maximum = if self.eat(&Token::Max) { Some(self.expect_u32()?) } else { None };
        self.module.memory = Some(MemoryType { initial, maximum });
        Ok(())
    }

    fn parse_data(&mut self) -> Result<()> {
        self.expect(&Token::Data)?;
        let offset = self.parse_init(ValueType::I32)?;
        let mut bytes = self.expect_string()?;
        while let Some(Token::Str(_)) = self.peek() {
            bytes.extend(self.expect_string()?);
        }
        self.module.data.push(DataSegment { offset, bytes });
        Ok(())
    }

    fn parse_table(&mut self) -> Result<()> {
        self.expect(&Token::Table)?;
        if self.module.table.is_some() {
            return Err(self.error_prev("RW-P007", "only one table may be declared".into()));
        }
        let initial = self.expect_u32()?;
        self.module.table = Some(TableType { initial });
        Ok(())
    }

    fn parse_elem(&mut self) -> Result<()> {
        self.expect(&Token::Elem)?;
        let offset = self.parse_init(ValueType::I32)?;
        self.expect(&Token::Colon)?;
        let segment = self.module.elements.len();
        let mut functions = Vec::new();
        while matches!(self.peek(), Some(Token::Int(_) | Token::Word(_))) {
            match self.parse_ref()? {
                Ref::Index(i) => functions.push(i),
                Ref::Name(name, span) => {
                    let slot = functions.len();
                    functions.push(0);
                    self.fixups.push(Fixup { name, span, site: Site::Element { segment, slot } });
                }
            }
        }
        self.module.elements.push(ElementSegment { offset, functions });
        Ok(())
    }

    fn parse_export(&mut self) -> Result<()> {
        self.expect(&Token::Export)?;
        let name = self.expect_name_string()?;
        let kind = match self.advance() {
            Some(Token::Func) => ExportKind::Function,
            Some(Token::Global) => ExportKind::Global,
            Some(tok) => return Err(self.error_prev("RW-P001", format!("expected func or global, got {:?}", tok))),
            None => return Err(self.error("RW-P002", "unexpected end of input".into())),
        };
        let index = match self.parse_ref()? {
            Ref::Index(i) => i,
            Ref::Name(target, span) => {
                let site = Site::Export(self.module.exports.len());
                self.fixups.push(Fixup { name: target, span, site });
                0
            }
        };
        self.module.exports.push(Export { name, kind, index });
        Ok(())
    }

    fn resolve(&mut self) -> Result<()> {
        for fix in std::mem::take(&mut self.fixups) {
            let global = matches!(fix.site, Site::Export(i) if self.module.exports[i].kind == ExportKind::Global);
            let table = if global { &self.globals } else { &self.funcs };
            let index = table.get(&fix.name).copied().ok_or_else(|| ParseError {
                code: "RW-P003",
                position: self.pos,
                span: fix.span,
                message: format!("undefined {} `{}`", if global { "global" } else { "function" }, fix.name),
            })?;
            match fix.site {
                Site::Instr { func, instr } => {
                    if let Some(imm) = self.module.functions[func].body[instr].immediates.first_mut() {
                        *imm = index as i64;
                    }
                }
                Site::Element { segment, slot } => self.module.elements[segment].functions[slot] = index,
                Site::Export(i) => self.module.exports[i].index = index,
            }
        }
        Ok(())
    }
}

/// Decodes `\n`, `\t`, `\\`, `\"`, `\'` and two-digit hex escapes.
fn unescape(raw: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let c = *bytes.get(i + 1)?;
        match c {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'\\' | b'"' | b'\'' => out.push(c),
            _ => {
                let hex = raw.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 1;
            }
        }
        i += 2;
    }
    Some(out)
}

/// Parse from token+span pairs.
pub fn parse(tokens: Vec<(Token, Span)>) -> Result<Module> {
    Parser::new(tokens).parse_module()
}

/// Either half of reading a listing failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error(transparent)]
    Lex(#[from] lexer::LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl SourceError {
    pub fn code(&self) -> &'static str {
        match self {
            SourceError::Lex(e) => e.code,
            SourceError::Parse(e) => e.code,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            SourceError::Lex(e) => e.span,
            SourceError::Parse(e) => e.span,
        }
    }
}

/// Lex and parse a whole listing.
pub fn parse_source(source: &str) -> std::result::Result<Module, SourceError> {
    let tokens = lexer::lex(source)?;
    Ok(parse(tokens)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(source: &str) -> Module {
        match parse_source(source) {
            Ok(m) => m,
            Err(e) => panic!("parse failed: {e}"),
        }
    }

    fn parse_err(source: &str) -> ParseError {
        match parse_source(source) {
            Err(SourceError::Parse(e)) => e,
            other => panic!("expected a parse error, got {other:?}"),
        }
    }

    #[test]
    fn parse_simple_function() {
        let m = parse_str(
            "func add (i32 i32) -> i32 export \"add\" {\n  local.get 0\n  local.get 1\n  i32.add\n}",
        );
        assert_eq!(m.types, vec![FuncType::new(vec![ValueType::I32, ValueType::I32], vec![ValueType::I32])]);
        assert_eq!(m.functions.len(), 1);
        let f = &m.functions[0];
        assert_eq!(f.name.as_deref(), Some("add"));
        assert_eq!(f.body.len(), 3);
        assert_eq!(f.body[0].op, "local.get");
        assert_eq!(f.body[0].immediates, vec![0]);
        assert_eq!(m.find_export("add", ExportKind::Function), Some(0));
    }

    #[test]
    fn imports_come_first_in_index_space() {
        let m = parse_str(
            r#"
            import "env" "sum" func sum (i32 i32) -> i32
            import "env" "base" global base i32
            func main () -> i32 {
              global.get base
              i32.const 1
              call sum
            }
            "#,
        );
        assert_eq!(m.num_imported_functions(), 1);
        assert_eq!(m.num_imported_globals(), 1);
        let body = &m.functions[0].body;
        assert_eq!(body[0].immediates, vec![0]);
        assert_eq!(body[2].op, "call");
        assert_eq!(body[2].immediates, vec![0]);
    }

    #[test]
    fn forward_calls_and_elements_resolve() {
        let m = parse_str(
            r#"
            table 2
            elem 0 : second first
            func first () { call second }
            func second () { }
            export "go" func first
            "#,
        );
        assert_eq!(m.functions[0].body[0].immediates, vec![1]);
        assert_eq!(m.elements[0].functions, vec![1, 0]);
        assert_eq!(m.exports[0].index, 0);
    }

    #[test]
    fn blocks_locals_and_memargs() {
        let m = parse_str(
            r#"
            memory 1 max 2
            data 8 "ab\01" "c"
            func f (i32) -> i32 {
              local i64 f32
              local.get 0
              if i32
                i32.const 4
                i32.load offset=8 align=2
              else
                f32.const 1.5
                i32.reinterpret_f32
              end
            }
            "#,
        );
        let f = &m.functions[0];
        assert_eq!(f.locals, vec![ValueType::I64, ValueType::F32]);
        assert_eq!(f.body[1].result, Some(ValueType::I32));
        assert_eq!(f.body[3].immediates, vec![2, 8]);
        assert_eq!(f.body[5].immediates, vec![1.5f32.to_bits() as i64]);
        assert_eq!(m.memory, Some(MemoryType { initial: 1, maximum: Some(2) }));
        assert_eq!(m.data[0].bytes, b"ab\x01c".to_vec());
    }

    #[test]
    fn call_indirect_interns_signature() {
        let m = parse_str(
            r#"
            func f (i32) -> i32 { local.get 0 }
            func g () -> i32 { i32.const 1 i32.const 0 call_indirect (i32) -> i32 }
            "#,
        );
        assert_eq!(m.types.len(), 2);
        assert_eq!(m.functions[1].body[2].immediates, vec![0]);
    }

    #[test]
    fn globals_with_initializers() {
        let m = parse_str(
            r#"
            import "env" "seed" global seed i64
            global a mut i64 = global.get seed
            global b f64 = -2.5
            export "a" global a
            "#,
        );
        assert_eq!(m.globals[0].init, InitExpr::GlobalGet(0));
        assert!(m.globals[0].mutable);
        assert_eq!(m.globals[1].init, InitExpr::Const((-2.5f64).to_bits() as i64));
        assert_eq!(m.find_export("a", ExportKind::Global), Some(1));
    }

    #[test]
    fn undefined_name_is_reported() {
        let err = parse_err("func f () { call nowhere }");
        assert_eq!(err.code, "RW-P003");
        assert!(err.message.contains("nowhere"));
        assert_eq!(err.span, Span { start: 17, end: 24 });
    }

    #[test]
    fn import_after_definition_is_rejected() {
        let err = parse_err("func f () { }\nimport \"env\" \"g\" func g ()");
        assert_eq!(err.code, "RW-P005");
    }

    #[test]
    fn duplicate_and_truncated_input() {
        assert_eq!(parse_err("func f () { } func f () { }").code, "RW-P004");
        assert_eq!(parse_err("func f () { i32.const 1").code, "RW-P002");
        assert_eq!(parse_err("memory 1 memory 2").code, "RW-P007");
        assert_eq!(parse_err("i32.add").code, "RW-P001");
    }

    #[test]
    fn lex_errors_pass_through() {
        let err = parse_source("func f () { @ }").unwrap_err();
        assert_eq!(err.code(), "RW-L001");
    }
}
