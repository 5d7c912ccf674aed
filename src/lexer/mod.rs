use logos::Logos;

use crate::ast::Span;

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip(r";;[^\n]*", allow_greedy = true))]
pub enum Token {
    // Module items
    #[token("import")]
    Import,
    #[token("func")]
    Func,
    #[token("global")]
    Global,
    #[token("memory")]
    Memory,
    #[token("data")]
    Data,
    #[token("table")]
    Table,
    #[token("elem")]
    Elem,
    #[token("export")]
    Export,
    #[token("local")]
    Local,
    #[token("mut")]
    Mut,
    #[token("max")]
    Max,

    // Value types
    #[token("i32")]
    I32,
    #[token("i64")]
    I64,
    #[token("f32")]
    F32,
    #[token("f64")]
    F64,

    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("->")]
    Arrow,
    #[token(":")]
    Colon,
    #[token("=")]
    Assign,

    // Literals
    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok().or_else(|| lex.slice().parse::<u64>().ok().map(|v| v as i64)))]
    #[regex(r"-?0x[0-9a-fA-F]+", |lex| parse_hex(lex.slice()))]
    Int(i64),

    #[regex(r"-?[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"-?(inf|nan)", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    /// Raw contents between the quotes; escapes are decoded by the parser.
    #[regex(r#""([^"\\]|\\.)*""#, |lex| {
        let s = lex.slice();
        s[1..s.len()-1].to_string()
    })]
    Str(String),

    // Operator and item names: `i32.add`, `i32.wrap/i64`, `callSumAndAdd1`
    #[regex(r"[A-Za-z_][A-Za-z0-9_./]*", |lex| lex.slice().to_string())]
    Word(String),
}

fn parse_hex(slice: &str) -> Option<i64> {
    let (negative, digits) = match slice.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, slice),
    };
    let v = u64::from_str_radix(&digits[2..], 16).ok()? as i64;
    Some(if negative { v.wrapping_neg() } else { v })
}

/// Lex a module listing into tokens with byte spans.
pub fn lex(source: &str) -> Result<Vec<(Token, Span)>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        let range = lexer.span();
        let span = Span { start: range.start, end: range.end };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => {
                let snippet = source[range].to_string();
                let (code, suggestion) = suggest_fix(&snippet);
                return Err(LexError { code, position: span.start, span, snippet, suggestion });
            }
        }
    }

    Ok(tokens)
}

fn suggest_fix(bad_token: &str) -> (&'static str, String) {
    let first = bad_token.chars().next().unwrap_or(' ');
    if first.is_ascii_digit() || first == '-' {
        ("RW-L002", format!("'{bad_token}' is not a valid number; integers must fit in 64 bits"))
    } else if first == '"' {
        ("RW-L003", "string is not terminated; close it with '\"'".to_string())
    } else if first == '$' {
        ("RW-L001", format!("names are written without '$': '{}'", &bad_token[1..]))
    } else {
        ("RW-L001", format!("unexpected character(s) '{bad_token}'; comments start with ';;'"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("lex error at position {position}: '{snippet}'. {suggestion}")]
pub struct LexError {
    pub code: &'static str,
    pub position: usize,
    pub span: Span,
    pub snippet: String,
    pub suggestion: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        lex(source).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn lex_function_header() {
        let tokens = kinds("func add (i32 i32) -> i32 export \"add\" {");
        assert_eq!(
            tokens,
            vec![
                Token::Func,
                Token::Word("add".into()),
                Token::LParen,
                Token::I32,
                Token::I32,
                Token::RParen,
                Token::Arrow,
                Token::I32,
                Token::Export,
                Token::Str("add".into()),
                Token::LBrace,
            ]
        );
    }

    #[test]
    fn operator_names_win_over_keywords() {
        let tokens = kinds("global.get i32.add local");
        assert_eq!(
            tokens,
            vec![Token::Word("global.get".into()), Token::Word("i32.add".into()), Token::Local]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(kinds("-7 0x10 -0x1"), vec![Token::Int(-7), Token::Int(16), Token::Int(-1)]);
        assert_eq!(kinds("18446744073709551615"), vec![Token::Int(-1)]);
        assert_eq!(kinds("1.5 -2.0e1"), vec![Token::Float(1.5), Token::Float(-20.0)]);
        assert_eq!(kinds("-inf"), vec![Token::Float(f64::NEG_INFINITY)]);
    }

    #[test]
    fn comment_and_string() {
        let tokens = kinds(";; header\ndata 0 \"hi\\00\"");
        assert_eq!(tokens, vec![Token::Data, Token::Int(0), Token::Str("hi\\00".into())]);
    }

    #[test]
    fn spans_are_byte_ranges() {
        let tokens = lex("  memory 1").unwrap();
        assert_eq!(tokens[0].1, Span { start: 2, end: 8 });
        assert_eq!(tokens[1].1, Span { start: 9, end: 10 });
    }

    #[test]
    fn bad_character_reports_position() {
        let err = lex("func f () { i32.const 1 # }").unwrap_err();
        assert_eq!(err.code, "RW-L001");
        assert_eq!(err.position, 24);
        assert_eq!(err.snippet, "#");
    }
}
