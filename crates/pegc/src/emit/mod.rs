//! Two-phase emission of the generated parser: a dry walk that records
//! which backtracking sites must save which state, then the real walk that
//! prints the rule bodies around the preamble supplied by an [`Emitter`].

pub mod go;
pub mod writer;

use std::fmt::{self, Display};

use cranelift_entity::EntityRef;

use crate::analysis::Analysis;
use crate::charclass::{first_byte_len, CharClass};
use crate::grammar::{Expr, Grammar, Kind, RuleHandle};
use crate::optimize::{self, OptiFlags};

pub use go::GoEmitter;
pub use writer::{ChgFlags, Label, Stats, Writer};

/// The values the core hands to a host-language template. Everything the
/// preamble may mention is here; host-language specifics stay behind the
/// trait.
pub struct TemplateHoles<'a> {
    pub headers: &'a [String],
    /// Rules in grammar order: `(id, identifier)`.
    pub rules: Vec<(usize, String)>,
    pub num_rules: usize,
    pub package: &'a str,
    pub peg: &'a str,
    pub userstate: &'a str,
    pub yystype: &'a str,
    pub actions: Vec<ActionHole<'a>>,
    /// Class bitmaps in interning order.
    pub classes: Vec<&'a CharClass>,
    /// Thunk action field width: action count rounded up to 8/16/32/64 bits.
    pub action_bits: u32,
    pub nvar: usize,
    pub has_commit: bool,
    pub stats: Stats,
}

pub struct ActionHole<'a> {
    pub id: usize,
    pub rule: &'a str,
    pub text: &'a str,
    /// Bound variables of the owning rule with their frame offsets.
    pub vars: Vec<(&'a str, i64)>,
}

pub trait Emitter {
    /// Writes everything up to and including the opening of the rule table;
    /// the rule bodies and trailers follow.
    fn preamble(&self, holes: &TemplateHoles<'_>, out: &mut String);
}

impl<'a> TemplateHoles<'a> {
    fn new(g: &'a Grammar, analysis: &Analysis, stats: Stats) -> TemplateHoles<'a> {
        let rules = g
            .rule_order
            .iter()
            .map(|&h| (h.index(), go_ident(&g.rules[h].name)))
            .collect();
        let actions = g
            .actions
            .iter()
            .map(|(h, a)| {
                let rule = &g.rules[a.rule];
                ActionHole {
                    id: h.index(),
                    rule: &rule.name,
                    text: &a.text,
                    vars: rule
                        .variables
                        .iter()
                        .enumerate()
                        .map(|(i, v)| (&*v.name, var_offset(i)))
                        .collect(),
                }
            })
            .collect();
        let mut bits = 0u32;
        let mut n = g.actions.len();
        while n != 0 {
            bits += 1;
            n >>= 1;
        }
        let action_bits = match bits {
            0..=7 => 8,
            8..=15 => 16,
            16..=31 => 32,
            _ => 64,
        };
        TemplateHoles {
            headers: &g.headers,
            rules,
            num_rules: g.rules.len(),
            package: &g.defines.package,
            peg: &g.defines.peg,
            userstate: &g.defines.userstate,
            yystype: &g.defines.yystype,
            actions,
            classes: g.classes.values().collect(),
            action_bits,
            nvar: g.nvar(),
            has_commit: analysis.counts[Kind::Commit as usize] > 0,
            stats,
        }
    }
}

/// Rule names become host identifiers with `-` mapped to `_`.
pub fn go_ident(name: &str) -> String {
    name.replace('-', "_")
}

/// The k-th bound variable of a rule lives at frame offset -(k+1).
fn var_offset(index: usize) -> i64 {
    -(index as i64 + 1)
}

/// A byte as it appears inside a generated character literal.
struct GoChar(u8);

impl Display for GoChar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self.0 {
            0x07 => "\\a",
            0x08 => "\\b",
            0x0c => "\\f",
            b'\n' => "\\n",
            b'\r' => "\\r",
            b'\t' => "\\t",
            0x0b => "\\v",
            b'\\' => "\\\\",
            b'\'' => "\\'",
            b if b < 32 || b >= 0x80 => return write!(f, "\\{:03o}", b),
            b => return write!(f, "{}", b as char),
        };
        f.write_str(s)
    }
}

impl Grammar {
    /// Compiles the grammar, appending the generated parser to `out`.
    /// Warnings go to stderr; the returned counters feed `-verbose`.
    pub fn compile(&mut self, opti: &OptiFlags, emitter: &dyn Emitter, out: &mut String) -> Stats {
        let analysis = Analysis::run(self);
        for warning in &analysis.warnings {
            eprintln!("{warning}");
        }

        let mut stats = Stats::default();
        if opti.inline_leafs {
            optimize::inline_leafs(self, &mut stats);
        }
        if self.switch_dispatch {
            optimize::optimize_alternates(self);
        }

        let mut w = Writer::new();
        w.stats = stats;
        w.elim_restore = opti.elim_restore;
        w.thunk_state = !self.actions.is_empty();
        let mut cx = EmitCx {
            g: self,
            analysis: &analysis,
            opti,
            w,
        };

        cx.w.set_dry(true);
        for i in 0..self.rule_order.len() {
            cx.dry_rule(self.rule_order[i]);
        }
        cx.w.set_dry(false);

        let holes = TemplateHoles::new(self, &analysis, cx.w.stats);
        let stats = holes.stats;
        emitter.preamble(&holes, cx.w.out_mut());

        for i in 0..self.rule_order.len() {
            cx.real_rule(self.rule_order[i]);
        }
        cx.w.print(format_args!("\n\t}}"));
        cx.w.print(format_args!("\n}}\n"));
        for trailer in &self.trailers {
            cx.w.print(format_args!("{trailer}"));
        }

        out.push_str(&cx.w.into_output());
        stats
    }
}

struct EmitCx<'a> {
    g: &'a Grammar,
    analysis: &'a Analysis,
    opti: &'a OptiFlags,
    w: Writer,
}

impl<'a> EmitCx<'a> {
    fn dry_rule(&mut self, h: RuleHandle) {
        let g = self.g;
        let rule = &g.rules[h];
        if rule.expression.is_none() {
            return;
        }
        let ko = self.w.new_label();
        self.w.set_sid(ko, 0);
        if let Some(&count) = self.analysis.rules_count.get(&rule.name) {
            if self.g.inline && count == 1 && ko.id() != 0 {
                return;
            }
        }
        self.w.save(ko);
        let (cko, _) = self.compile_expression(h, ko);
        if self.w.used(ko) {
            self.w.restore(ko, cko.pos, cko.th_pos);
        }
    }

    fn real_rule(&mut self, h: RuleHandle) {
        let g = self.g;
        let rule = &g.rules[h];
        if rule.expression.is_none() {
            eprintln!("rule '{}' used but not defined", rule.name);
            self.w.line(format_args!("nil,"));
            return;
        }
        let ko = self.w.new_label();
        self.w.set_sid(ko, 0);
        self.w.line(format_args!("/* {} ", h.index()));
        self.print_rule(h);
        self.w.print(format_args!(" */"));
        match self.analysis.rules_count.get(&rule.name) {
            None => eprintln!("rule '{}' defined but not used", rule.name),
            Some(&count) if g.inline && count == 1 && ko.id() != 0 => {
                self.w.line(format_args!("nil,"));
                return;
            }
            _ => {}
        }
        self.w.line(format_args!("func() bool {{"));
        self.w.indent += 1;
        self.w.save(ko);
        let (cko, _) = self.compile_expression(h, ko);
        self.w.line(format_args!("return true"));
        if self.w.used(ko) {
            self.w.restore(ko, cko.pos, cko.th_pos);
            self.w.line(format_args!("return false"));
        }
        self.w.indent -= 1;
        self.w.line(format_args!("}},"));
    }

    /// Compiles a rule body, bracketing it with a variable frame when the
    /// rule binds variables.
    fn compile_expression(&mut self, h: RuleHandle, ko: Label) -> (ChgFlags, ChgFlags) {
        let g = self.g;
        let rule = &g.rules[h];
        let nvar = rule.variables.len();
        if nvar > 0 {
            self.w.line(format_args!("doarg(yyPush, {nvar})"));
        }
        let (mut cko, mut cok) = match &rule.expression {
            Some(e) => self.compile(e, ko),
            None => (ChgFlags::default(), ChgFlags::default()),
        };
        if nvar > 0 {
            self.w.line(format_args!("doarg(yyPop, {nvar})"));
            cko.th_pos = true;
            cok.th_pos = true;
        }
        (cko, cok)
    }

    /// Single-byte lookaheads can test the input without moving the
    /// position, skipping the save/restore dance entirely.
    fn try_peek(&mut self, node: &Expr, jump_if_true: bool, l: Label) -> bool {
        if !self.opti.peek {
            return false;
        }
        match node {
            Expr::Dot => {
                self.w
                    .cjump(l, jump_if_true, format_args!("(position < len(p.Buffer))"));
            }
            Expr::Character(c) => {
                self.w.cjump(l, jump_if_true, format_args!("peekChar('{c}')"));
                self.w.stats.peek_char += 1;
            }
            Expr::Class { text, .. } => {
                let index = self.g.class_index[text].index();
                self.w
                    .cjump(l, jump_if_true, format_args!("peekClass({index})"));
                self.w.stats.peek_class += 1;
            }
            Expr::Predicate(p) => {
                self.w.cjump(l, jump_if_true, format_args!("({p})"));
            }
            _ => return false,
        }
        true
    }

    /// Emits the code for one node. The returned pair describes whether
    /// `position` / `thunkPosition` may have changed on the failure and
    /// success paths respectively; callers union them up the tree and the
    /// label restores consume them.
    fn compile(&mut self, node: &Expr, ko: Label) -> (ChgFlags, ChgFlags) {
        let g = self.g;
        let mut chgko = ChgFlags::default();
        let mut chgok = ChgFlags::default();

        match node {
            Expr::Dot => {
                self.w.cjump(ko, false, format_args!("matchDot()"));
                self.w.stats.match_dot += 1;
                chgok.pos = true;
            }
            Expr::Name { name, var } => {
                let h = g.by_name[name];
                let rule = &g.rules[h];
                let count = self.analysis.rules_count.get(name).copied();
                if g.inline && count == Some(1) {
                    let (cko, cok) = self.compile_expression(h, ko);
                    chgko = cko;
                    chgok = cok;
                } else {
                    self.w.cjump(
                        ko,
                        false,
                        format_args!("p.rules[rule{}]()", go_ident(&rule.name)),
                    );
                    if !rule.variables.is_empty() || rule.has_actions {
                        chgok.th_pos = true;
                    }
                    chgok.pos = true;
                }
                if let Some(index) = var {
                    self.w.line(format_args!(
                        "doarg(yySet, {})",
                        var_offset(*index as usize)
                    ));
                    chgok.th_pos = true;
                }
            }
            Expr::Character(c) => {
                self.w.cjump(ko, false, format_args!("matchChar('{c}')"));
                self.w.stats.match_char += 1;
                chgok.pos = true;
            }
            Expr::String(s) => {
                if !s.is_empty() {
                    self.w.cjump(ko, false, format_args!("matchString(\"{s}\")"));
                    self.w.stats.match_string += 1;
                    chgok.pos = true;
                }
            }
            Expr::Class { text, .. } => {
                let index = self.g.class_index[text].index();
                self.w.cjump(ko, false, format_args!("matchClass({index})"));
                self.w.stats.match_class += 1;
                chgok.pos = true;
            }
            Expr::Predicate(p) => {
                self.w.cjump(ko, false, format_args!("({p})"));
            }
            Expr::Action(h) => {
                self.w.line(format_args!("do({})", h.index()));
                chgok.th_pos = true;
            }
            Expr::Commit => {
                self.w
                    .cjump(ko, false, format_args!("(commit(thunkPosition0))"));
                chgko.th_pos = true;
            }
            Expr::Begin => {
                if !g.actions.is_empty() {
                    self.w.line(format_args!("begin = position"));
                }
            }
            Expr::End => {
                if !g.actions.is_empty() {
                    self.w.line(format_args!("end = position"));
                }
            }
            Expr::Nil => {}
            Expr::Alternate(list) => {
                let ok = self.w.new_label();
                if self.w.is_unsafe(ok) {
                    self.w.begin();
                    self.w.save(ok);
                }
                let n = list.len();
                let mut next = None;
                for branch in &list[..n - 1] {
                    let nl = self.w.new_label();
                    next = Some(nl);
                    let (cko, cok) = self.compile(branch, nl);
                    chgko.merge(cko);
                    chgok.merge(cok);
                    self.w.jump(ok);
                    if self.w.used(nl) {
                        self.w.restore_at(ok, Some(nl), cko.pos, cko.th_pos);
                    }
                }
                // when the previous branch cannot fail the rest is
                // unreachable
                if next.map_or(true, |nl| self.w.used(nl)) {
                    let (cko, cok) = self.compile(&list[n - 1], ko);
                    chgko.merge(cko);
                    chgok.merge(cok);
                }
                if self.w.is_unsafe(ok) {
                    self.w.end();
                }
                if self.w.used(ok) {
                    self.w.anchor(ok);
                }
            }
            Expr::UnorderedAlternate(list) => {
                let done = ko;
                self.w.begin();
                self.w
                    .cjump(done, true, format_args!("position == len(p.Buffer)"));
                self.w.line(format_args!("switch p.Buffer[position] {{"));
                let n = list.len();
                for (i, branch) in list.iter().enumerate() {
                    let Some((class, body)) = split_guard(branch) else {
                        eprintln!("malformed unordered alternate branch");
                        continue;
                    };
                    let last = i + 1 == n;
                    if last && class.len() > 2 {
                        self.w.line(format_args!("default:"));
                        self.w.indent += 1;
                        let (cko, cok) = self.compile(body, done);
                        chgko.merge(cko);
                        chgok.merge(cok);
                        self.w.indent -= 1;
                        break;
                    }
                    self.w.line(format_args!("case"));
                    let mut comma = false;
                    for d in 0..=255u8 {
                        if class.has(d) {
                            if comma {
                                self.w.print(format_args!(","));
                            }
                            self.w.print(format_args!(" '{}'", GoChar(d)));
                            comma = true;
                        }
                    }
                    self.w.print(format_args!(":"));
                    self.w.indent += 1;
                    let (cko, cok) = if self.opti.unordered_first_item {
                        self.compile_opt_first(body, done)
                    } else {
                        self.compile(body, done)
                    };
                    chgko.merge(cko);
                    chgok.merge(cok);
                    self.w.line(format_args!("break"));
                    self.w.indent -= 1;
                    if last {
                        self.w.line(format_args!("default:"));
                        self.w.indent += 1;
                        self.w.jump(done);
                        self.w.indent -= 1;
                    }
                }
                self.w.line(format_args!("}}"));
                self.w.end();
            }
            Expr::Sequence(list) => {
                let mut collected: Vec<&str> = Vec::new();
                let mut peeked: Option<Kind> = None;
                let mut start = 0;
                if self.opti.seq_peek_not {
                    for (i, el) in list.iter().enumerate() {
                        match el {
                            Expr::PeekNot(child) => match child.as_ref() {
                                Expr::Character(c) => collected.push(c),
                                _ => break,
                            },
                            Expr::Dot => {
                                if !collected.is_empty() {
                                    peeked = Some(Kind::Dot);
                                    start = i + 1;
                                }
                                break;
                            }
                            other => {
                                if collected.len() > 1 {
                                    peeked = Some(other.kind());
                                    start = i;
                                }
                                break;
                            }
                        }
                    }
                }

                if let Some(kind) = peeked {
                    self.w.stats.seq_peek_not += 1;
                    self.w
                        .cjump(ko, true, format_args!("position == len(p.Buffer)"));
                    self.w.line(format_args!("switch p.Buffer[position] {{"));
                    let labels = collected
                        .iter()
                        .map(|c| format!("'{c}'"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    self.w.line(format_args!("case {labels}:"));
                    self.w.indent += 1;
                    self.w.jump(ko);
                    self.w.indent -= 1;
                    self.w.line(format_args!("default:"));
                    self.w.indent += 1;
                    if kind == Kind::Dot {
                        self.w.line(format_args!("position++"));
                        chgok.pos = true;
                    }
                } else {
                    start = 0;
                }

                let n = list.len();
                for (i, el) in list.iter().enumerate().skip(start) {
                    let (mut cko, cok) = self.compile(el, ko);
                    // once earlier elements have consumed, failing here
                    // leaves the position moved
                    if i + 1 == n {
                        if chgok.pos {
                            cko.pos = true;
                        }
                        if chgok.th_pos {
                            cko.th_pos = true;
                        }
                    }
                    chgko.merge(cko);
                    chgok.merge(cok);
                }

                if peeked.is_some() {
                    self.w.indent -= 1;
                    self.w.line(format_args!("}}"));
                }
            }
            Expr::PeekFor(sub) => {
                if self.try_peek(sub, false, ko) {
                    return (chgko, chgok);
                }
                let l = self.w.new_label();
                self.w.save_block(l);
                let (cko, cok) = self.compile(sub, ko);
                self.w.restore_at(l, None, cok.pos, cok.th_pos);
                chgko = cko;
            }
            Expr::PeekNot(sub) => {
                if self.try_peek(sub, true, ko) {
                    return (chgko, chgok);
                }
                let ok = self.w.new_label();
                self.w.save_block(ok);
                let (cko, cok) = self.compile(sub, ok);
                self.w.jump(ko);
                if self.w.used(ok) {
                    self.w.restore(ok, cko.pos, cko.th_pos);
                }
                chgko = cok;
            }
            Expr::Query(sub) => {
                match sub.as_ref() {
                    Expr::Character(c) => {
                        self.w.line(format_args!("matchChar('{c}')"));
                        self.w.stats.match_char += 1;
                        chgok.pos = true;
                        return (chgko, chgok);
                    }
                    Expr::Dot => {
                        self.w.line(format_args!("matchDot()"));
                        self.w.stats.match_dot += 1;
                        chgok.pos = true;
                        return (chgko, chgok);
                    }
                    _ => {}
                }
                let qko = self.w.new_label();
                let qok = self.w.new_label();
                self.w.save_block(qko);
                let (cko, cok) = self.compile(sub, qko);
                if self.w.is_unsafe(qko) {
                    self.w.jump(qok);
                }
                if self.w.used(qko) {
                    self.w.restore(qko, cko.pos, cko.th_pos);
                }
                if self.w.is_unsafe(qko) {
                    self.w.anchor(qok);
                }
                chgok = cok;
            }
            Expr::Star(sub) => {
                let again = self.w.new_label();
                let out = self.w.new_label();
                self.w.anchor(again);
                self.w.save_block(out);
                let (cko, cok) = self.compile(sub, out);
                self.w.jump(again);
                self.w.restore(out, cko.pos, cko.th_pos);
                chgok = cok;
            }
            Expr::Plus(sub) => {
                let again = self.w.new_label();
                let out = self.w.new_label();
                let (cko, cok) = self.compile(sub, ko);
                chgko.merge(cko);
                chgok.merge(cok);
                self.w.anchor(again);
                self.w.save_block(out);
                let (cko, _) = self.compile(sub, out);
                self.w.jump(again);
                if self.w.used(out) {
                    self.w.restore(out, cko.pos, cko.th_pos);
                }
            }
        }

        (chgko, chgok)
    }

    /// Compiles the first item of an unordered-alternate branch knowing the
    /// switch already matched the first byte, so matching it again can be
    /// replaced by a bare position bump.
    fn compile_opt_first(&mut self, node: &Expr, ko: Label) -> (ChgFlags, ChgFlags) {
        let mut chgko = ChgFlags::default();
        let mut chgok = ChgFlags::default();
        match node {
            Expr::Character(_) => {
                self.w.line(format_args!("position++ // matchChar"));
                chgok.pos = true;
                self.w.stats.opt_first_char += 1;
            }
            Expr::Dot => {
                chgok.pos = true;
                self.w.stats.opt_first_dot += 1;
            }
            Expr::Class { .. } => {
                self.w.line(format_args!("position++ // matchClass"));
                chgok.pos = true;
                self.w.stats.opt_first_class += 1;
            }
            Expr::String(s) => {
                if !s.is_empty() {
                    let rest = &s[first_byte_len(s)..];
                    if rest.len() == 1 {
                        self.w.line(format_args!("position++ // matchString(`{s}`)"));
                        self.w.cjump(
                            ko,
                            false,
                            format_args!("matchChar('{}')", GoChar(rest.as_bytes()[0])),
                        );
                        self.w.stats.match_char += 1;
                    } else {
                        self.w.line(format_args!("position++"));
                        self.w
                            .cjump(ko, false, format_args!("matchString(\"{rest}\")"));
                        self.w.stats.match_string += 1;
                    }
                    self.w.stats.opt_first_string += 1;
                    chgok.pos = true;
                }
            }
            Expr::Sequence(items) => {
                for (i, el) in items.iter().enumerate() {
                    let (cko, cok) = if i == 0 {
                        self.compile_opt_first(el, ko)
                    } else {
                        self.compile(el, ko)
                    };
                    chgko.merge(cko);
                    chgok.merge(cok);
                }
                if items.len() > 1 {
                    if chgok.pos {
                        chgko.pos = true;
                    }
                    if chgok.th_pos {
                        chgko.th_pos = true;
                    }
                }
            }
            other => return self.compile(other, ko),
        }
        (chgko, chgok)
    }

    /// Prints the rule in grammar notation, for the comment ahead of its
    /// generated body.
    fn print_rule(&mut self, h: RuleHandle) {
        let g = self.g;
        let rule = &g.rules[h];
        self.w.print(format_args!("{} <- ", rule.name));
        if let Some(e) = &rule.expression {
            self.print_expr(e);
        }
    }

    fn print_list(&mut self, items: &[Expr], sep: &str) {
        self.w.print(format_args!("("));
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.w.print(format_args!("{sep}"));
            }
            self.print_expr(item);
        }
        self.w.print(format_args!(")"));
    }

    fn print_expr(&mut self, e: &Expr) {
        match e {
            Expr::Dot => self.w.print(format_args!(".")),
            Expr::Name { name, .. } => self.w.print(format_args!("{name}")),
            Expr::Character(s) | Expr::String(s) => self.w.print(format_args!("'{s}'")),
            Expr::Class { text, .. } => self.w.print(format_args!("[{text}]")),
            Expr::Predicate(p) => self.w.print(format_args!("&{{{p}}}")),
            Expr::Action(h) => {
                let text = &self.g.actions[*h].text;
                self.w.print(format_args!("{{{text}}}"))
            }
            Expr::Commit => self.w.print(format_args!("commit")),
            Expr::Begin => self.w.print(format_args!("<")),
            Expr::End => self.w.print(format_args!(">")),
            Expr::Nil => {}
            Expr::Alternate(v) => self.print_list(v, " / "),
            Expr::UnorderedAlternate(v) => self.print_list(v, " | "),
            Expr::Sequence(v) => self.print_list(v, " "),
            Expr::PeekFor(c) => {
                self.w.print(format_args!("&"));
                self.print_expr(c);
            }
            Expr::PeekNot(c) => {
                self.w.print(format_args!("!"));
                self.print_expr(c);
            }
            Expr::Query(c) => {
                self.print_expr(c);
                self.w.print(format_args!("?"));
            }
            Expr::Star(c) => {
                self.print_expr(c);
                self.w.print(format_args!("*"));
            }
            Expr::Plus(c) => {
                self.print_expr(c);
                self.w.print(format_args!("+"));
            }
        }
    }
}

/// An unordered-alternate branch as the optimizer builds it: a two-element
/// sequence of a class lookahead guard and the original branch body.
fn split_guard(branch: &Expr) -> Option<(&CharClass, &Expr)> {
    let Expr::Sequence(items) = branch else {
        return None;
    };
    if items.len() != 2 {
        return None;
    }
    let Expr::PeekFor(guard) = &items[0] else {
        return None;
    };
    let Expr::Class { class, .. } = guard.as_ref() else {
        return None;
    };
    Some((class, &items[1]))
}

#[cfg(test)]
fn compile_src(src: &str, inline: bool, switch: bool, flags: &str) -> String {
    let mut g = crate::parse::parse_grammar(src, inline, switch).unwrap();
    let mut out = String::new();
    g.compile(&OptiFlags::parse(flags), &GoEmitter, &mut out);
    out
}

#[test]
fn test_disjoint_alternate_emits_switch() {
    let out = compile_src("A <- 'a' / 'b' / 'c'\n", false, true, "");
    assert!(out.contains("switch p.Buffer[position] {"));
    assert!(out.contains("case 'b':"));
    assert!(out.contains("case 'a':"));
    assert!(out.contains("position == len(p.Buffer)"));
    // the default arm of a narrow dispatch jumps to the fail label
    assert!(out.contains("default:"));
}

#[test]
fn test_intersecting_alternate_keeps_ordered_form() {
    let out = compile_src("A <- 'ab' / 'ac'\n", false, true, "");
    assert!(!out.contains("switch p.Buffer[position]"));
    assert!(out.contains("matchString(\"ab\")"));
    assert!(out.contains("matchString(\"ac\")"));
}

#[test]
fn test_seq_peek_not_switch() {
    let out = compile_src("A <- !'a' !'b' .\n", false, false, "s");
    assert!(out.contains("switch p.Buffer[position] {"));
    assert!(out.contains("case 'a', 'b':"));
    assert!(out.contains("position++"));
    // the dot is absorbed by the switch, no matchDot remains
    assert!(!out.contains("matchDot()"));
}

#[test]
fn test_query_shortcut_has_no_save_restore() {
    let out = compile_src("A <- 'x'?\n", false, false, "all");
    assert!(out.contains("matchChar('x')"));
    assert!(!out.contains("position0"));
    assert!(!out.contains("goto"));
}

#[test]
fn test_leaf_inlining_replaces_call() {
    let out = compile_src("A <- B\nB <- 'x'\n", false, false, "l");
    let body = &out[out.find("/* 0 ").unwrap()..];
    assert!(body.contains("matchChar('x')"));
    assert!(!body.contains("p.rules[ruleB]()"));
}

#[test]
fn test_single_use_rule_inlined_to_nil_slot() {
    let out = compile_src("A <- B\nB <- 'x' 'y'\n", true, false, "");
    // B's body is spliced into A and its own slot becomes nil
    assert!(out.contains("nil,"));
    let a = &out[out.find("/* 0 ").unwrap()..out.find("/* 1 ").unwrap()];
    assert!(a.contains("matchChar('x')"));
    assert!(a.contains("matchChar('y')"));
}

#[test]
fn test_undefined_rule_gets_nil_slot() {
    let out = compile_src("A <- B 'x'\n", false, false, "");
    assert!(out.contains("p.rules[ruleB]()"));
    assert!(out.contains("nil,"));
    assert!(out.contains("ruleB"));
}

#[test]
fn test_backtracking_save_restore_pairs_match() {
    let out = compile_src("A <- 'a' 'b' / 'c'\n", false, false, "all");
    // the alternate's save slot is written exactly where the dry run saw
    // the branch-failure restore read it
    assert!(out.contains("position1 := position"));
    assert!(out.contains("position = position1"));
    assert!(!out.contains("thunkPosition1"));
}

#[test]
fn test_preamble_surface() {
    let out = compile_src(
        "%{package} main\n%{Peg} Calc\nA <- 'x'\n",
        false,
        false,
        "",
    );
    assert!(out.contains("package main"));
    assert!(out.contains("ruleA = iota"));
    assert!(out.contains("type Calc struct {"));
    assert!(out.contains("func (p *Calc) Parse(ruleId int) bool {"));
    assert!(out.contains("func (p *Calc) PrintError() {"));
    assert!(out.contains("func (p *Calc) Init() {"));
    assert!(out.contains("p.ResetBuffer = func(s string) (old string) {"));
    assert!(out.contains("p.rules = [...]func() bool{"));
    assert!(out.ends_with("}\n"));
}

#[test]
fn test_actions_and_commit_machinery() {
    let src = "A <- < B > { $$ = yytext } commit\nB <- v:C { yy = v }\nC <- 'x'\n";
    let out = compile_src(src, false, false, "");
    assert!(out.contains("thunks := make([]thunk, 32)"));
    assert!(out.contains("action uint8"));
    assert!(out.contains("do(0)"));
    assert!(out.contains("doarg(yyPush, 1)"));
    assert!(out.contains("doarg(yySet, -1)"));
    assert!(out.contains("commit := func(thunkPosition0 int) bool {"));
    assert!(out.contains("if !(commit(thunkPosition0)) {"));
    assert!(out.contains("begin = position"));
    assert!(out.contains("end = position"));
    assert!(out.contains("yyval[yyp-1]"));
}

#[test]
fn test_match_primitives_gated_on_use() {
    let out = compile_src("A <- 'x'\n", false, false, "");
    assert!(out.contains("matchChar := func(c byte) bool {"));
    assert!(!out.contains("matchDot := func"));
    assert!(!out.contains("matchString := func"));
    assert!(!out.contains("matchClass := func"));

    let out = compile_src("A <- [a-z] .\n", false, false, "");
    assert!(out.contains("matchClass := func(class uint) bool {"));
    assert!(out.contains("matchDot := func() bool {"));
    assert!(out.contains("classes := [...][32]uint8{"));
}

#[test]
fn test_peek_shortcuts() {
    let out = compile_src("A <- &'x' ![a-z] 'y'\n", false, false, "p");
    assert!(out.contains("peekChar('x')"));
    assert!(out.contains("peekClass(0)"));
    assert!(out.contains("peekClass := func(class uint) bool {"));
    // lookaheads compile to bare tests, no state juggling
    assert!(!out.contains("position1"));
}

#[test]
fn test_unordered_first_item_skips_retest() {
    let out = compile_src("A <- 'ax' / 'b' / [0-9]\n", false, true, "1");
    assert!(out.contains("position++"));
    assert!(out.contains("matchChar('x')"));
    // the already-dispatched first byte of "ax" is not matched again
    assert!(!out.contains("matchString(\"ax\")"));
}
