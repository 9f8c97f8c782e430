//! The grammar tree a PEG source is parsed into, and the builder API the
//! front-end drives while parsing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cranelift_entity::{entity_impl, PrimaryMap};

#[cfg(test)]
use cranelift_entity::EntityRef;

use crate::charclass::CharClass;

pub type Ident = Arc<str>;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RuleHandle(u32);
entity_impl!(RuleHandle);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ActionHandle(u32);
entity_impl!(ActionHandle);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ClassHandle(u32);
entity_impl!(ClassHandle);

/// Node kinds, one tag per [`Expr`] variant plus `Rule`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[rustfmt::skip]
pub enum Kind {
    Rule, Name, Dot, Character, String, Class, Predicate, Action,
    Commit, Begin, End, Alternate, UnorderedAlternate, Sequence,
    PeekFor, PeekNot, Query, Star, Plus, Nil,
}

impl Kind {
    pub const COUNT: usize = Kind::Nil as usize + 1;
}

/// A PEG expression. List variants hold at least two children once built
/// (the builder fuses same-kind lists instead of nesting them).
#[derive(Clone, Debug)]
pub enum Expr {
    Dot,
    /// Reference to a rule by name; `var` is the index of the bound variable
    /// in the enclosing rule's variable list.
    Name {
        name: Ident,
        var: Option<u32>,
    },
    /// Literal matching a single byte. Payload is the source text with its
    /// escapes intact (`\n`, `\123`, …).
    Character(Ident),
    String(Ident),
    Class {
        text: Ident,
        class: CharClass,
    },
    /// Host-code predicate, suspends the match unless it evaluates true.
    Predicate(Ident),
    Action(ActionHandle),
    Commit,
    Begin,
    End,
    Nil,
    Alternate(Vec<Expr>),
    UnorderedAlternate(Vec<Expr>),
    Sequence(Vec<Expr>),
    PeekFor(Box<Expr>),
    PeekNot(Box<Expr>),
    Query(Box<Expr>),
    Star(Box<Expr>),
    Plus(Box<Expr>),
}

impl Expr {
    pub fn kind(&self) -> Kind {
        match self {
            Expr::Dot => Kind::Dot,
            Expr::Name { .. } => Kind::Name,
            Expr::Character(_) => Kind::Character,
            Expr::String(_) => Kind::String,
            Expr::Class { .. } => Kind::Class,
            Expr::Predicate(_) => Kind::Predicate,
            Expr::Action(_) => Kind::Action,
            Expr::Commit => Kind::Commit,
            Expr::Begin => Kind::Begin,
            Expr::End => Kind::End,
            Expr::Nil => Kind::Nil,
            Expr::Alternate(_) => Kind::Alternate,
            Expr::UnorderedAlternate(_) => Kind::UnorderedAlternate,
            Expr::Sequence(_) => Kind::Sequence,
            Expr::PeekFor(_) => Kind::PeekFor,
            Expr::PeekNot(_) => Kind::PeekNot,
            Expr::Query(_) => Kind::Query,
            Expr::Star(_) => Kind::Star,
            Expr::Plus(_) => Kind::Plus,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Variable {
    pub name: Ident,
}

#[derive(Debug)]
pub struct Rule {
    pub name: Ident,
    /// `None` marks a rule that was referenced but never defined; a nil slot
    /// is emitted in its place so rule ids stay dense.
    pub expression: Option<Expr>,
    pub variables: Vec<Variable>,
    pub has_actions: bool,
}

#[derive(Debug)]
pub struct Action {
    pub text: String,
    pub rule: RuleHandle,
}

/// Recognized `%{key} value` options. Unknown keys are dropped silently.
#[derive(Debug)]
pub struct Defines {
    pub package: String,
    pub peg: String,
    pub userstate: String,
    pub yystype: String,
    pub noexport: String,
}

impl Default for Defines {
    fn default() -> Defines {
        Defines {
            package: String::new(),
            peg: "yyParser".to_string(),
            userstate: String::new(),
            yystype: "yyStype".to_string(),
            noexport: String::new(),
        }
    }
}

impl Defines {
    pub fn set(&mut self, key: &str, value: &str) {
        let slot = match key {
            "package" => &mut self.package,
            "Peg" => &mut self.peg,
            "userstate" => &mut self.userstate,
            "yystype" => &mut self.yystype,
            "noexport" => &mut self.noexport,
            _ => return,
        };
        *slot = value.to_string();
    }
}

#[derive(Debug)]
pub struct Grammar {
    pub rules: PrimaryMap<RuleHandle, Rule>,
    pub by_name: HashMap<Ident, RuleHandle>,
    /// Rules in completion order; the start rule is first. Placeholder rules
    /// for undefined names are appended when the builder finishes.
    pub rule_order: Vec<RuleHandle>,
    pub classes: PrimaryMap<ClassHandle, CharClass>,
    pub class_index: HashMap<Ident, ClassHandle>,
    pub actions: PrimaryMap<ActionHandle, Action>,
    pub headers: Vec<String>,
    pub trailers: Vec<String>,
    pub defines: Defines,
    pub switch_excl: HashSet<Ident>,
    pub inline: bool,
    pub switch_dispatch: bool,
}

impl Grammar {
    pub fn new(inline: bool, switch_dispatch: bool) -> Grammar {
        Grammar {
            rules: PrimaryMap::new(),
            by_name: HashMap::new(),
            rule_order: Vec::new(),
            classes: PrimaryMap::new(),
            class_index: HashMap::new(),
            actions: PrimaryMap::new(),
            headers: Vec::new(),
            trailers: Vec::new(),
            defines: Defines::default(),
            switch_excl: HashSet::new(),
            inline,
            switch_dispatch,
        }
    }

    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.by_name.get(name).map(|&h| &self.rules[h])
    }

    /// Total number of bound variables across all rules.
    pub fn nvar(&self) -> usize {
        self.rules.values().map(|r| r.variables.len()).sum()
    }
}

const MAX_STACK: usize = 1024;

enum StackEntry {
    Rule(RuleHandle),
    Expr(Expr),
}

/// Builds a [`Grammar`] from the push/pop call sequence the front-end emits
/// while parsing. A rule is opened with [`add_rule`](Self::add_rule), its
/// expression assembled on the stack, and closed with
/// [`add_expression`](Self::add_expression).
pub struct GrammarBuilder {
    g: Grammar,
    stack: Vec<StackEntry>,
    pending_var: Option<u32>,
    referenced: Vec<Ident>,
}

impl GrammarBuilder {
    pub fn new(inline: bool, switch_dispatch: bool) -> GrammarBuilder {
        GrammarBuilder {
            g: Grammar::new(inline, switch_dispatch),
            stack: Vec::new(),
            pending_var: None,
            referenced: Vec::new(),
        }
    }

    fn push(&mut self, e: Expr) {
        assert!(self.stack.len() < MAX_STACK, "expression stack overflow");
        self.stack.push(StackEntry::Expr(e));
    }

    fn pop_expr(&mut self) -> Expr {
        match self.stack.pop() {
            Some(StackEntry::Expr(e)) => e,
            _ => panic!("expected an expression on the builder stack"),
        }
    }

    fn current_rule(&self) -> RuleHandle {
        match self.stack.first() {
            Some(&StackEntry::Rule(h)) => h,
            _ => panic!("no rule is open"),
        }
    }

    pub fn add_rule(&mut self, name: &str) {
        let name: Ident = name.into();
        let h = self.g.rules.push(Rule {
            name: name.clone(),
            expression: None,
            variables: Vec::new(),
            has_actions: false,
        });
        self.g.by_name.insert(name, h);
        assert!(self.stack.len() < MAX_STACK, "expression stack overflow");
        self.stack.push(StackEntry::Rule(h));
    }

    pub fn add_expression(&mut self) {
        let expression = self.pop_expr();
        let h = match self.stack.pop() {
            Some(StackEntry::Rule(h)) => h,
            _ => panic!("no rule is open"),
        };
        self.g.rules[h].expression = Some(expression);
        self.g.rule_order.push(h);
    }

    pub fn add_variable(&mut self, text: &str) {
        let h = self.current_rule();
        let vars = &mut self.g.rules[h].variables;
        let index = match vars.iter().position(|v| &*v.name == text) {
            Some(i) => i,
            None => {
                vars.push(Variable { name: text.into() });
                vars.len() - 1
            }
        };
        self.pending_var = Some(index as u32);
    }

    pub fn add_name(&mut self, text: &str) {
        let name: Ident = text.into();
        if !self.g.by_name.contains_key(&name) && !self.referenced.contains(&name) {
            self.referenced.push(name.clone());
        }
        let var = self.pending_var.take();
        self.push(Expr::Name { name, var });
    }

    pub fn add_dot(&mut self) {
        self.push(Expr::Dot);
    }

    /// Pushes a literal, classified as `Character` when the text denotes a
    /// single byte: one plain byte, a two-byte `\X` escape, or a four-byte
    /// `\NNN` octal escape.
    pub fn add_string(&mut self, text: &str) {
        let bytes = text.as_bytes();
        let single = match bytes.len() {
            1 => true,
            2 => bytes[0] == b'\\',
            4 => bytes[0] == b'\\' && bytes[1].is_ascii_digit(),
            _ => false,
        };
        if single {
            self.push(Expr::Character(text.into()));
        } else {
            self.push(Expr::String(text.into()));
        }
    }

    pub fn add_class(&mut self, text: &str) {
        let text: Ident = text.into();
        let h = match self.g.class_index.get(&text) {
            Some(&h) => h,
            None => {
                let h = self.g.classes.push(CharClass::parse(&text));
                self.g.class_index.insert(text.clone(), h);
                h
            }
        };
        let class = self.g.classes[h];
        self.push(Expr::Class { text, class });
    }

    pub fn add_predicate(&mut self, text: &str) {
        self.push(Expr::Predicate(text.trim().into()));
    }

    pub fn add_action(&mut self, text: &str) {
        let rule = self.current_rule();
        let text = text.replace("$$", "yy");
        self.g.rules[rule].has_actions = true;
        let h = self.g.actions.push(Action { text, rule });
        self.push(Expr::Action(h));
    }

    pub fn add_commit(&mut self) {
        self.push(Expr::Commit);
    }

    pub fn add_begin(&mut self) {
        self.push(Expr::Begin);
    }

    pub fn add_end(&mut self) {
        self.push(Expr::End);
    }

    pub fn add_nil(&mut self) {
        self.push(Expr::Nil);
    }

    fn add_list(&mut self, alternate: bool) {
        let a = self.pop_expr();
        let b = self.pop_expr();
        let list = match (alternate, b) {
            (true, Expr::Alternate(mut v)) => {
                v.push(a);
                Expr::Alternate(v)
            }
            (false, Expr::Sequence(mut v)) => {
                v.push(a);
                Expr::Sequence(v)
            }
            (true, b) => Expr::Alternate(vec![b, a]),
            (false, b) => Expr::Sequence(vec![b, a]),
        };
        self.push(list);
    }

    pub fn add_alternate(&mut self) {
        self.add_list(true);
    }

    pub fn add_sequence(&mut self) {
        self.add_list(false);
    }

    fn add_fix(&mut self, wrap: fn(Box<Expr>) -> Expr) {
        let e = self.pop_expr();
        self.push(wrap(Box::new(e)));
    }

    pub fn add_peek_for(&mut self) {
        self.add_fix(Expr::PeekFor);
    }

    pub fn add_peek_not(&mut self) {
        self.add_fix(Expr::PeekNot);
    }

    pub fn add_query(&mut self) {
        self.add_fix(Expr::Query);
    }

    pub fn add_star(&mut self) {
        self.add_fix(Expr::Star);
    }

    pub fn add_plus(&mut self) {
        self.add_fix(Expr::Plus);
    }

    pub fn add_header(&mut self, text: &str) {
        self.g.headers.push(text.to_string());
    }

    pub fn add_trailer(&mut self, text: &str) {
        self.g.trailers.push(text.to_string());
    }

    pub fn define(&mut self, key: &str, value: &str) {
        self.g.defines.set(key, value);
    }

    pub fn switch_exclude(&mut self, rule: &str) {
        self.g.switch_excl.insert(rule.into());
    }

    /// Closes the builder: names that were referenced but never defined get a
    /// placeholder rule with no expression, appended after the real rules so
    /// ids stay dense.
    pub fn finish(mut self) -> Grammar {
        assert!(self.stack.is_empty(), "unfinished rule on the builder stack");
        for name in self.referenced {
            if self.g.by_name.contains_key(&name) {
                continue;
            }
            let h = self.g.rules.push(Rule {
                name: name.clone(),
                expression: None,
                variables: Vec::new(),
                has_actions: false,
            });
            self.g.by_name.insert(name, h);
            self.g.rule_order.push(h);
        }
        self.g
    }
}

#[cfg(test)]
fn list_len(e: &Expr) -> usize {
    match e {
        Expr::Alternate(v) | Expr::UnorderedAlternate(v) | Expr::Sequence(v) => v.len(),
        _ => 0,
    }
}

#[test]
fn test_string_classification() {
    let mut b = GrammarBuilder::new(false, false);
    b.add_rule("A");
    b.add_string("x");
    b.add_string("\\n");
    b.add_sequence();
    b.add_string("\\101");
    b.add_sequence();
    b.add_string("xy");
    b.add_sequence();
    b.add_string("\\nx");
    b.add_sequence();
    b.add_expression();
    let g = b.finish();

    let Some(Expr::Sequence(items)) = &g.rules[RuleHandle::new(0)].expression else {
        panic!("expected a sequence");
    };
    let kinds: Vec<Kind> = items.iter().map(Expr::kind).collect();
    assert_eq!(
        kinds,
        vec![
            Kind::Character,
            Kind::Character,
            Kind::Character,
            Kind::String,
            Kind::String
        ]
    );
}

#[test]
fn test_list_fusing() {
    // 'a' / 'b' / 'c' must come out as one flat three-way alternate
    let mut b = GrammarBuilder::new(false, false);
    b.add_rule("A");
    b.add_string("a");
    b.add_string("b");
    b.add_alternate();
    b.add_string("c");
    b.add_alternate();
    b.add_expression();
    let g = b.finish();
    let expr = g.rules[RuleHandle::new(0)].expression.as_ref().unwrap();
    assert_eq!(expr.kind(), Kind::Alternate);
    assert_eq!(list_len(expr), 3);
}

#[test]
fn test_placeholder_rules() {
    let mut b = GrammarBuilder::new(false, false);
    b.add_rule("A");
    b.add_name("B");
    b.add_name("C");
    b.add_sequence();
    b.add_expression();
    b.add_rule("C");
    b.add_string("c");
    b.add_expression();
    let g = b.finish();

    // A and C are defined, B gets a placeholder with a dense id
    assert_eq!(g.rules.len(), 3);
    assert!(g.rule("B").unwrap().expression.is_none());
    assert!(g.rule("C").unwrap().expression.is_some());
    let mut ids: Vec<usize> = g.rule_order.iter().map(|h| h.index()).collect();
    ids.sort();
    assert_eq!(ids, vec![0, 1, 2]);
}

#[test]
fn test_class_interning() {
    let mut b = GrammarBuilder::new(false, false);
    b.add_rule("A");
    b.add_class("a-z");
    b.add_class("0-9");
    b.add_sequence();
    b.add_class("a-z");
    b.add_sequence();
    b.add_expression();
    let g = b.finish();
    assert_eq!(g.classes.len(), 2);
    assert_eq!(g.class_index["a-z"].index(), 0);
    assert_eq!(g.class_index["0-9"].index(), 1);
}

#[test]
fn test_action_substitution() {
    let mut b = GrammarBuilder::new(false, false);
    b.add_rule("A");
    b.add_action(" $$ = 1 ");
    b.add_expression();
    let g = b.finish();
    assert_eq!(g.actions[ActionHandle::new(0)].text, " yy = 1 ");
    assert!(g.rule("A").unwrap().has_actions);
}
