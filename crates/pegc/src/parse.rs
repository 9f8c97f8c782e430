//! The `.peg` front-end: a byte-level lexer and a recursive-descent parser
//! that drives the grammar builder.
//!
//! A source file is a series of declarations and rules, optionally closed by
//! a trailer:
//!
//! ```text
//! %{key} value        option (the pseudo-key switchexcl lists excluded rules)
//! %{
//!    raw header text
//! %}
//! Name <- Expression  rule
//! %%                  everything after is trailer text
//! ```
//!
//! Expressions use `/` for ordered choice, juxtaposition for sequencing,
//! `&`/`!` lookaheads, `? * +` suffixes, `'…'`/`"…"` literals, `[…]`
//! classes, `.`, `&{ predicate }`, `{ action }`, `<`/`>` markers,
//! `var:Name` bindings, and the `commit` keyword. `#` comments run to end
//! of line.

use crate::error::ParseError;
use crate::grammar::{Grammar, GrammarBuilder};

struct Lexer<'a> {
    src: &'a [u8],
    pos: u32,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a [u8]) -> Lexer<'a> {
        Lexer { src, pos: 0 }
    }

    fn pos(&self) -> u32 {
        self.pos
    }

    fn restore_pos(&mut self, pos: u32) {
        debug_assert!(pos as usize <= self.src.len());
        self.pos = pos;
    }

    fn is_empty(&self) -> bool {
        self.pos as usize == self.src.len()
    }

    fn next(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos as usize).copied()
    }

    fn peek_at(&self, lookahead: u32) -> Option<u8> {
        self.src.get((self.pos + lookahead) as usize).copied()
    }

    fn consume(&mut self, value: u8) -> bool {
        if self.peek() == Some(value) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn consume_while(&mut self, predicate: impl Fn(u8) -> bool) -> (u32, u32) {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if predicate(c) {
                self.pos += 1;
            } else {
                break;
            }
        }
        (start, self.pos)
    }

    fn sequence(&mut self, sequence: &[u8]) -> bool {
        if self.src[self.pos as usize..].starts_with(sequence) {
            self.pos += sequence.len() as u32;
            true
        } else {
            false
        }
    }
}

/// Parses a `.peg` source into a grammar ready for compilation.
pub fn parse_grammar(
    src: &str,
    inline: bool,
    switch_dispatch: bool,
) -> Result<Grammar, ParseError> {
    let mut p = PegParser {
        l: Lexer::new(src.as_bytes()),
        src,
        b: GrammarBuilder::new(inline, switch_dispatch),
    };
    p.file()?;
    Ok(p.b.finish())
}

struct PegParser<'a> {
    l: Lexer<'a>,
    src: &'a str,
    b: GrammarBuilder,
}

impl<'a> PegParser<'a> {
    fn err(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            offset: self.l.pos(),
            message: message.into(),
        }
    }

    fn text(&self, range: (u32, u32)) -> &'a str {
        &self.src[range.0 as usize..range.1 as usize]
    }

    fn spacing(&mut self) {
        loop {
            self.l.consume_while(|c| c.is_ascii_whitespace());
            if self.l.peek() == Some(b'#') {
                self.l.consume_while(|c| c != b'\n');
            } else {
                break;
            }
        }
    }

    fn file(&mut self) -> Result<(), ParseError> {
        self.spacing();
        while !self.l.is_empty() {
            if self.l.sequence(b"%%") {
                let rest = &self.src[self.l.pos() as usize..];
                self.b.add_trailer(rest);
                return Ok(());
            }
            if self.l.peek() == Some(b'%') && self.l.peek_at(1) == Some(b'{') {
                self.declaration()?;
            } else {
                self.definition()?;
            }
            self.spacing();
        }
        Ok(())
    }

    /// `%{key} value` sets an option; `%{` followed by anything else opens a
    /// raw header block closed by `%}`.
    fn declaration(&mut self) -> Result<(), ParseError> {
        self.l.next();
        self.l.next();
        let start = self.l.pos();

        let key = self.l.consume_while(|c| c.is_ascii_alphanumeric() || c == b'_');
        if key.0 != key.1 && self.l.consume(b'}') {
            let key = self.text(key).to_string();
            let value = self.l.consume_while(|c| c != b'\n');
            let value = self.text(value).trim().to_string();
            if key == "switchexcl" {
                for name in value.split_whitespace() {
                    self.b.switch_exclude(name);
                }
            } else {
                self.b.define(&key, &value);
            }
            return Ok(());
        }

        self.l.restore_pos(start);
        loop {
            if self.l.sequence(b"%}") {
                break;
            }
            if self.l.next().is_none() {
                return Err(self.err("unterminated '%{' block"));
            }
        }
        let text = &self.src[start as usize..(self.l.pos() - 2) as usize];
        self.b.add_header(text);
        Ok(())
    }

    fn identifier(&mut self) -> Option<&'a str> {
        match self.l.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => {}
            _ => return None,
        }
        let span = self
            .l
            .consume_while(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'-');
        Some(self.text(span))
    }

    fn definition(&mut self) -> Result<(), ParseError> {
        let Some(name) = self.identifier() else {
            return Err(self.err("expected a rule definition"));
        };
        let name = name.to_string();
        self.spacing();
        if !self.l.sequence(b"<-") {
            return Err(self.err(format!("expected '<-' after rule name '{name}'")));
        }
        self.spacing();
        self.b.add_rule(&name);
        self.expression()?;
        self.b.add_expression();
        Ok(())
    }

    fn expression(&mut self) -> Result<(), ParseError> {
        self.sequence_expr()?;
        while self.l.consume(b'/') {
            self.spacing();
            self.sequence_expr()?;
            self.b.add_alternate();
        }
        Ok(())
    }

    /// A juxtaposed run of prefixed terms; an empty run is a valid (empty)
    /// alternative and parses as `Nil`.
    fn sequence_expr(&mut self) -> Result<(), ParseError> {
        if !self.prefix()? {
            self.b.add_nil();
            return Ok(());
        }
        while self.prefix()? {
            self.b.add_sequence();
        }
        Ok(())
    }

    fn prefix(&mut self) -> Result<bool, ParseError> {
        match self.l.peek() {
            Some(b'&') => {
                if self.l.peek_at(1) == Some(b'{') {
                    self.l.next();
                    let text = self.braces_text()?;
                    self.b.add_predicate(text);
                    self.spacing();
                    return Ok(true);
                }
                self.l.next();
                self.spacing();
                if !self.suffix()? {
                    return Err(self.err("expected an expression after '&'"));
                }
                self.b.add_peek_for();
                Ok(true)
            }
            Some(b'!') => {
                self.l.next();
                self.spacing();
                if !self.suffix()? {
                    return Err(self.err("expected an expression after '!'"));
                }
                self.b.add_peek_not();
                Ok(true)
            }
            _ => self.suffix(),
        }
    }

    fn suffix(&mut self) -> Result<bool, ParseError> {
        if !self.primary()? {
            return Ok(false);
        }
        if self.l.consume(b'?') {
            self.b.add_query();
        } else if self.l.consume(b'*') {
            self.b.add_star();
        } else if self.l.consume(b'+') {
            self.b.add_plus();
        }
        self.spacing();
        Ok(true)
    }

    fn primary(&mut self) -> Result<bool, ParseError> {
        match self.l.peek() {
            Some(b'(') => {
                self.l.next();
                self.spacing();
                self.expression()?;
                if !self.l.consume(b')') {
                    return Err(self.err("expected ')'"));
                }
                self.spacing();
                Ok(true)
            }
            Some(b'\'') => {
                let text = self.quoted_text(b'\'')?;
                self.b.add_string(text);
                self.spacing();
                Ok(true)
            }
            Some(b'"') => {
                let text = self.quoted_text(b'"')?;
                self.b.add_string(text);
                self.spacing();
                Ok(true)
            }
            Some(b'[') => {
                let text = self.class_text()?;
                self.b.add_class(text);
                self.spacing();
                Ok(true)
            }
            Some(b'.') => {
                self.l.next();
                self.b.add_dot();
                self.spacing();
                Ok(true)
            }
            Some(b'{') => {
                let text = self.braces_text()?;
                self.b.add_action(text);
                self.spacing();
                Ok(true)
            }
            Some(b'<') => {
                self.l.next();
                self.b.add_begin();
                self.spacing();
                Ok(true)
            }
            Some(b'>') => {
                self.l.next();
                self.b.add_end();
                self.spacing();
                Ok(true)
            }
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => {
                let save = self.l.pos();
                let name = self.identifier().unwrap().to_string();
                if self.l.peek() == Some(b':') {
                    self.l.next();
                    let Some(rule) = self.identifier() else {
                        return Err(self.err("expected a rule name after ':'"));
                    };
                    let rule = rule.to_string();
                    self.b.add_variable(&name);
                    self.b.add_name(&rule);
                    self.spacing();
                    return Ok(true);
                }
                if name == "commit" {
                    self.b.add_commit();
                    self.spacing();
                    return Ok(true);
                }
                self.spacing();
                // an identifier followed by '<-' opens the next rule
                let here = self.l.pos();
                if self.l.sequence(b"<-") {
                    self.l.restore_pos(save);
                    return Ok(false);
                }
                self.l.restore_pos(here);
                self.b.add_name(&name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Text between balanced braces, starting at `{`.
    fn braces_text(&mut self) -> Result<&'a str, ParseError> {
        self.l.next();
        let start = self.l.pos();
        let mut depth = 1u32;
        loop {
            match self.l.next() {
                Some(b'{') => depth += 1,
                Some(b'}') => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                Some(_) => {}
                None => return Err(self.err("unterminated '{' block")),
            }
        }
        Ok(&self.src[start as usize..(self.l.pos() - 1) as usize])
    }

    /// Text between quotes, escapes kept verbatim.
    fn quoted_text(&mut self, quote: u8) -> Result<&'a str, ParseError> {
        self.l.next();
        let start = self.l.pos();
        loop {
            match self.l.next() {
                Some(b'\\') => {
                    self.l.next();
                }
                Some(c) if c == quote => break,
                Some(_) => {}
                None => return Err(self.err("unterminated literal")),
            }
        }
        Ok(&self.src[start as usize..(self.l.pos() - 1) as usize])
    }

    fn class_text(&mut self) -> Result<&'a str, ParseError> {
        self.l.next();
        let start = self.l.pos();
        loop {
            match self.l.next() {
                Some(b'\\') => {
                    self.l.next();
                }
                Some(b']') => break,
                Some(_) => {}
                None => return Err(self.err("unterminated character class")),
            }
        }
        Ok(&self.src[start as usize..(self.l.pos() - 1) as usize])
    }
}

#[cfg(test)]
use crate::grammar::{Expr, Kind};

#[test]
fn test_parse_rules_and_order() {
    let g = parse_grammar("Start <- A B\nA <- 'a'\nB <- 'b'\n", false, false).unwrap();
    assert_eq!(g.rules.len(), 3);
    let names: Vec<&str> = g.rule_order.iter().map(|&h| &*g.rules[h].name).collect();
    assert_eq!(names, vec!["Start", "A", "B"]);
}

#[test]
fn test_parse_expression_shapes() {
    let g = parse_grammar("A <- !'x' ('a' / [b-d])* &B .? \nB <- 'b'\n", false, false).unwrap();
    let Some(Expr::Sequence(items)) = &g.rule("A").unwrap().expression else {
        panic!("expected a sequence");
    };
    let kinds: Vec<Kind> = items.iter().map(Expr::kind).collect();
    assert_eq!(
        kinds,
        vec![Kind::PeekNot, Kind::Star, Kind::PeekFor, Kind::Query]
    );
    let Expr::Star(inner) = &items[1] else {
        panic!()
    };
    assert_eq!(inner.kind(), Kind::Alternate);
}

#[test]
fn test_parse_headers_defines_trailer() {
    let src = "\
%{
#include-ish header
%}
%{package} calc
%{Peg} CalcParser
%{unknown} dropped
A <- 'x'
%% func main() {}
";
    let g = parse_grammar(src, false, false).unwrap();
    assert_eq!(g.headers.len(), 1);
    assert!(g.headers[0].contains("#include-ish header"));
    assert_eq!(g.defines.package, "calc");
    assert_eq!(g.defines.peg, "CalcParser");
    assert_eq!(g.trailers.len(), 1);
    assert!(g.trailers[0].contains("func main()"));
}

#[test]
fn test_parse_switchexcl() {
    let g = parse_grammar("%{switchexcl} A B\nA <- 'x'\n", false, false).unwrap();
    assert!(g.switch_excl.contains("A"));
    assert!(g.switch_excl.contains("B"));
}

#[test]
fn test_parse_variables_and_actions() {
    let g = parse_grammar("A <- v:B { yy = v }\nB <- 'b'\n", false, false).unwrap();
    let rule = g.rule("A").unwrap();
    assert_eq!(rule.variables.len(), 1);
    assert_eq!(&*rule.variables[0].name, "v");
    let Some(Expr::Sequence(items)) = &rule.expression else {
        panic!("expected a sequence");
    };
    assert!(matches!(&items[0], Expr::Name { var: Some(0), .. }));
    assert!(matches!(&items[1], Expr::Action(_)));
}

#[test]
fn test_parse_predicate_and_commit() {
    let g = parse_grammar("A <- &{ p.ok() } 'x' commit\n", false, false).unwrap();
    let Some(Expr::Sequence(items)) = &g.rule("A").unwrap().expression else {
        panic!("expected a sequence");
    };
    assert!(matches!(&items[0], Expr::Predicate(p) if &**p == "p.ok()"));
    assert!(matches!(&items[2], Expr::Commit));
}

#[test]
fn test_parse_empty_alternative() {
    let g = parse_grammar("A <- 'a' /\n", false, false).unwrap();
    let Some(Expr::Alternate(items)) = &g.rule("A").unwrap().expression else {
        panic!("expected an alternate");
    };
    assert_eq!(items.len(), 2);
    assert!(matches!(&items[1], Expr::Nil));
}

#[test]
fn test_parse_errors_carry_offsets() {
    let err = parse_grammar("A 'x'\n", false, false).unwrap_err();
    assert!(err.message.contains("<-"));
    assert_eq!(err.offset, 2);

    let err = parse_grammar("A <- 'x\n", false, false).unwrap_err();
    assert!(err.message.contains("unterminated"));

    let err = parse_grammar("A <- (\n", false, false).unwrap_err();
    assert!(err.message.contains("')'"));
}

#[test]
fn test_comments_are_skipped() {
    let g = parse_grammar("# leading\nA <- 'x' # trailing\n# end\n", false, false).unwrap();
    assert_eq!(g.rules.len(), 1);
}
