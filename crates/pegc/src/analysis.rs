//! Whole-grammar analyses that run before optimization: node type counts,
//! rule reachability with use counts, and the left-recursion check. The
//! passes are independent and run as parallel tasks joined before the
//! optimizer starts; each returns its own result, so scheduling cannot
//! change the outcome.

use std::collections::HashMap;

use cranelift_entity::SecondaryMap;

use crate::grammar::{Expr, Grammar, Ident, Kind, RuleHandle};

pub struct Analysis {
    pub counts: [u32; Kind::COUNT],
    /// How often each rule is entered on a walk from the start rule. Rules
    /// absent from the map are unreachable.
    pub rules_count: HashMap<Ident, u32>,
    /// Left-recursion warnings, in rule id order.
    pub warnings: Vec<String>,
}

impl Analysis {
    pub fn run(g: &Grammar) -> Analysis {
        let (counts, rules_count, warnings) = std::thread::scope(|s| {
            let counts = s.spawn(|| count_types(g));
            let uses = s.spawn(|| count_rule_uses(g));
            let recursion = s.spawn(|| check_left_recursion(g));
            (
                counts.join().unwrap(),
                uses.join().unwrap(),
                recursion.join().unwrap(),
            )
        });
        Analysis {
            counts,
            rules_count,
            warnings,
        }
    }
}

fn count_types(g: &Grammar) -> [u32; Kind::COUNT] {
    fn visit(counts: &mut [u32; Kind::COUNT], e: &Expr) {
        counts[e.kind() as usize] += 1;
        match e {
            Expr::Alternate(v) | Expr::UnorderedAlternate(v) | Expr::Sequence(v) => {
                for child in v {
                    visit(counts, child);
                }
            }
            Expr::PeekFor(c) | Expr::PeekNot(c) | Expr::Query(c) | Expr::Star(c)
            | Expr::Plus(c) => visit(counts, c),
            _ => {}
        }
    }

    let mut counts = [0; Kind::COUNT];
    for rule in g.rules.values() {
        counts[Kind::Rule as usize] += 1;
        match &rule.expression {
            Some(e) => visit(&mut counts, e),
            None => counts[Kind::Nil as usize] += 1,
        }
    }
    counts
}

fn count_rule_uses(g: &Grammar) -> HashMap<Ident, u32> {
    fn visit_rule(
        g: &Grammar,
        h: RuleHandle,
        counts: &mut HashMap<Ident, u32>,
        reached: &mut SecondaryMap<RuleHandle, bool>,
    ) {
        let rule = &g.rules[h];
        *counts.entry(rule.name.clone()).or_insert(0) += 1;
        if reached[h] {
            return;
        }
        reached[h] = true;
        if let Some(e) = &rule.expression {
            visit_expr(g, e, counts, reached);
        }
    }

    fn visit_expr(
        g: &Grammar,
        e: &Expr,
        counts: &mut HashMap<Ident, u32>,
        reached: &mut SecondaryMap<RuleHandle, bool>,
    ) {
        match e {
            Expr::Name { name, .. } => {
                if let Some(&h) = g.by_name.get(name) {
                    visit_rule(g, h, counts, reached);
                }
            }
            Expr::Alternate(v) | Expr::UnorderedAlternate(v) | Expr::Sequence(v) => {
                for child in v {
                    visit_expr(g, child, counts, reached);
                }
            }
            Expr::PeekFor(c) | Expr::PeekNot(c) | Expr::Query(c) | Expr::Star(c)
            | Expr::Plus(c) => visit_expr(g, c, counts, reached),
            _ => {}
        }
    }

    let mut counts = HashMap::new();
    let mut reached = SecondaryMap::new();
    if let Some(&start) = g.rule_order.first() {
        visit_rule(g, start, &mut counts, &mut reached);
    }
    counts
}

/// Reports rules that can re-enter themselves without consuming input.
/// Sound but not complete: a clean result means every rule terminates, a
/// warning may be a false positive. Compilation proceeds either way.
fn check_left_recursion(g: &Grammar) -> Vec<String> {
    struct Cx<'a> {
        g: &'a Grammar,
        on_stack: SecondaryMap<RuleHandle, bool>,
        warnings: Vec<String>,
    }

    impl Cx<'_> {
        /// Whether the node is guaranteed to consume at least one byte on
        /// success.
        fn consumes(&mut self, e: &Expr) -> bool {
            match e {
                Expr::Alternate(v) => v.iter().all(|c| self.consumes(c)),
                Expr::Sequence(v) => v.iter().any(|c| self.consumes(c)),
                Expr::Name { name, .. } => match self.g.by_name.get(name) {
                    Some(&h) => self.rule_consumes(h),
                    None => false,
                },
                Expr::Plus(c) => self.consumes(c),
                Expr::Character(s) | Expr::String(s) => !s.is_empty(),
                Expr::Dot | Expr::Class { .. } => true,
                _ => false,
            }
        }

        fn rule_consumes(&mut self, h: RuleHandle) -> bool {
            if self.on_stack[h] {
                self.warnings.push(format!(
                    "possible infinite left recursion in rule '{}'",
                    self.g.rules[h].name
                ));
                return false;
            }
            self.on_stack[h] = true;
            let consumes = match &self.g.rules[h].expression {
                Some(e) => self.consumes(e),
                None => false,
            };
            self.on_stack[h] = false;
            consumes
        }
    }

    let mut cx = Cx {
        g,
        on_stack: SecondaryMap::new(),
        warnings: Vec::new(),
    };
    for h in g.rules.keys() {
        cx.rule_consumes(h);
    }
    cx.warnings
}

#[cfg(test)]
use cranelift_entity::EntityRef as _;

#[cfg(test)]
fn grammar(src: &str) -> Grammar {
    crate::parse::parse_grammar(src, false, false).unwrap()
}

#[test]
fn test_type_counts() {
    let g = grammar("A <- 'a' 'bc' / [0-9]+ / .\n");
    let a = Analysis::run(&g);
    assert_eq!(a.counts[Kind::Rule as usize], 1);
    assert_eq!(a.counts[Kind::Alternate as usize], 1);
    assert_eq!(a.counts[Kind::Sequence as usize], 1);
    assert_eq!(a.counts[Kind::Character as usize], 1);
    assert_eq!(a.counts[Kind::String as usize], 1);
    assert_eq!(a.counts[Kind::Class as usize], 1);
    assert_eq!(a.counts[Kind::Plus as usize], 1);
    assert_eq!(a.counts[Kind::Dot as usize], 1);
}

#[test]
fn test_use_counts_and_reachability() {
    let g = grammar("A <- B B\nB <- 'x'\nC <- 'y'\n");
    let a = Analysis::run(&g);
    assert_eq!(a.rules_count.get("A").copied(), Some(1));
    assert_eq!(a.rules_count.get("B").copied(), Some(2));
    // C is defined but unreachable from the start rule
    assert_eq!(a.rules_count.get("C"), None);
}

#[test]
fn test_rule_ids_dense() {
    let g = grammar("A <- B\nB <- C 'x'\n");
    // C is used but not defined: it still gets a dense id
    let mut ids: Vec<usize> = g.rule_order.iter().map(|h| h.index()).collect();
    ids.sort();
    assert_eq!(ids, (0..g.rules.len()).collect::<Vec<_>>());
}

#[test]
fn test_left_recursion_direct() {
    let g = grammar("A <- A 'x'\n");
    let a = Analysis::run(&g);
    assert_eq!(
        a.warnings,
        vec!["possible infinite left recursion in rule 'A'".to_string()]
    );
}

#[test]
fn test_left_recursion_indirect() {
    let g = grammar("A <- B\nB <- A 'x'\n");
    let a = Analysis::run(&g);
    assert!(!a.warnings.is_empty());
}

#[test]
fn test_no_left_recursion_after_consume() {
    let g = grammar("A <- 'x' A / 'y'\n");
    let a = Analysis::run(&g);
    assert!(a.warnings.is_empty());
}
