//! Tree-level optimizations: leaf-rule inlining and the rewrite of ordered
//! alternations into byte-dispatched unordered ones.

use std::collections::VecDeque;
use std::mem;

use cranelift_entity::SecondaryMap;

use crate::charclass::{first_byte, CharClass};
use crate::emit::Stats;
use crate::grammar::{Expr, Grammar, Rule, RuleHandle};

/// Optimizations selected with `-O`, a colon-separated list of
/// single-character keys or the literal `all`. Unknown keys are ignored.
#[derive(Clone, Copy, Default, Debug)]
pub struct OptiFlags {
    /// `1`: inside an unordered alternation the dispatched byte is already
    /// known to match, so the first item can skip re-testing it.
    pub unordered_first_item: bool,
    /// `p`: peek at single-byte lookaheads without moving the position.
    pub peek: bool,
    /// `r`: save and restore only the state a backtracking region can
    /// actually change.
    pub elim_restore: bool,
    /// `l`: splice leaf rules into their call sites.
    pub inline_leafs: bool,
    /// `s`: turn a run of leading `!'x'` lookaheads into a switch.
    pub seq_peek_not: bool,
}

impl OptiFlags {
    pub const ALL: &'static str = "1:l:p:r:s";

    pub fn parse(flags: &str) -> OptiFlags {
        let flags = if flags == "all" { Self::ALL } else { flags };
        let mut o = OptiFlags::default();
        for f in flags.split(':') {
            match f.as_bytes().first() {
                Some(b'1') => o.unordered_first_item = true,
                Some(b'p') => o.peek = true,
                Some(b'r') => o.elim_restore = true,
                Some(b'l') => o.inline_leafs = true,
                Some(b's') => o.seq_peek_not = true,
                _ => {}
            }
        }
        o
    }
}

/// A leaf expression a `Name` reference can be replaced with: a plain
/// matcher, or a plain matcher under a single repetition or lookahead.
fn leaf_target(rule: &Rule) -> Option<&Expr> {
    fn is_matcher(e: &Expr) -> bool {
        matches!(
            e,
            Expr::Character(_) | Expr::Dot | Expr::Class { .. } | Expr::String(_)
        )
    }

    let e = rule.expression.as_ref()?;
    match e {
        _ if is_matcher(e) => Some(e),
        Expr::Plus(c) | Expr::Star(c) | Expr::Query(c) | Expr::PeekNot(c) | Expr::PeekFor(c)
            if is_matcher(c) =>
        {
            Some(e)
        }
        _ => None,
    }
}

pub fn inline_leafs(g: &mut Grammar, stats: &mut Stats) {
    fn walk(g: &Grammar, e: &mut Expr, stats: &mut Stats) {
        match e {
            Expr::Name { name, .. } => {
                let Some(&h) = g.by_name.get(name) else { return };
                if let Some(target) = leaf_target(&g.rules[h]) {
                    stats.inline_leafs += 1;
                    *e = target.clone();
                }
            }
            Expr::Sequence(v) | Expr::Alternate(v) => {
                for child in v {
                    walk(g, child, stats);
                }
            }
            Expr::Plus(c) | Expr::Star(c) | Expr::Query(c) | Expr::PeekNot(c)
            | Expr::PeekFor(c) => walk(g, c, stats),
            _ => {}
        }
    }

    let handles: Vec<RuleHandle> = g.rules.keys().collect();
    for h in handles {
        let mut expr = g.rules[h].expression.take();
        if let Some(e) = &mut expr {
            walk(g, e, stats);
        }
        g.rules[h].expression = expr;
    }
}

/// FIRST-set knowledge about a fragment.
#[derive(Clone, Copy, Debug)]
pub(crate) enum First {
    /// Could begin with any byte; nothing to dispatch on.
    Any,
    Set(CharClass),
}

impl First {
    fn union(self, other: First) -> First {
        match (self, other) {
            (First::Set(mut a), First::Set(b)) => {
                a.union(&b);
                First::Set(a)
            }
            _ => First::Any,
        }
    }

    fn intersect(self, other: First) -> First {
        match (self, other) {
            (First::Set(mut a), First::Set(b)) => {
                a.intersection(&b);
                First::Set(a)
            }
            (First::Any, b) => b,
            (a, First::Any) => a,
        }
    }

    fn intersects(&self, other: &First) -> bool {
        match (self, other) {
            (First::Set(a), First::Set(b)) => a.intersects(b),
            _ => true,
        }
    }
}

/// What the alternation optimizer tracks per node: whether the node always
/// advances on success, whether it can succeed at end of input, whether all
/// success paths are lookaheads, and the FIRST set. `first` is `None` for
/// fragments that neither read nor constrain the next byte.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Info {
    pub consumes: bool,
    pub eof: bool,
    pub peek: bool,
    pub first: Option<First>,
}

impl Info {
    fn empty_set() -> Info {
        Info {
            consumes: false,
            eof: false,
            peek: false,
            first: Some(First::Set(CharClass::empty())),
        }
    }
}

#[derive(Clone, Copy, Default)]
enum CacheEntry {
    #[default]
    Unvisited,
    InProgress,
    Done(Info),
}

struct AltCx {
    cache: SecondaryMap<RuleHandle, CacheEntry>,
}

/// Rewrites alternations whose branches have pairwise-disjoint FIRST sets so
/// they can be dispatched with a single-byte switch. Walks the grammar from
/// the start rule, memoizing per-rule results.
pub fn optimize_alternates(g: &mut Grammar) {
    let Some(&start) = g.rule_order.first() else {
        return;
    };
    let mut cx = AltCx {
        cache: SecondaryMap::new(),
    };
    cx.rule_info(g, start);
}

impl AltCx {
    fn rule_info(&mut self, g: &mut Grammar, h: RuleHandle) -> Info {
        if g.switch_excl.contains(&g.rules[h].name) {
            return Info {
                consumes: false,
                eof: false,
                peek: false,
                first: Some(First::Any),
            };
        }
        match self.cache[h] {
            CacheEntry::Done(info) => return info,
            // re-entered while still computing: a left-recursive cycle,
            // give up on byte dispatch for anything that depends on it
            CacheEntry::InProgress => return Info::empty_set(),
            CacheEntry::Unvisited => {}
        }
        self.cache[h] = CacheEntry::InProgress;
        let mut expr = g.rules[h].expression.take();
        let info = match &mut expr {
            Some(e) => self.expr_info(g, e),
            None => Info::empty_set(),
        };
        g.rules[h].expression = expr;
        self.cache[h] = CacheEntry::Done(info);
        info
    }

    fn expr_info(&mut self, g: &mut Grammar, e: &mut Expr) -> Info {
        match e {
            Expr::Dot => Info {
                consumes: true,
                eof: false,
                peek: false,
                first: Some(First::Set(CharClass::full())),
            },
            Expr::Character(s) | Expr::String(s) => {
                let first = if s.is_empty() {
                    First::Any
                } else {
                    let mut c = CharClass::empty();
                    c.add(first_byte(s));
                    First::Set(c)
                };
                Info {
                    consumes: true,
                    eof: false,
                    peek: false,
                    first: Some(first),
                }
            }
            Expr::Class { class, .. } => Info {
                consumes: true,
                eof: false,
                peek: false,
                first: Some(First::Set(*class)),
            },
            Expr::Name { name, .. } => match g.by_name.get(&**name).copied() {
                Some(h) => self.rule_info(g, h),
                None => Info::empty_set(),
            },
            Expr::Alternate(_) => self.alternate_info(g, e),
            Expr::Sequence(items) => {
                let mut consumes = false;
                let mut eof = false;
                let mut peek = false;
                let mut prefix: Vec<(bool, Option<First>)> = Vec::new();
                let mut idx = 0;
                while idx < items.len() && !consumes {
                    let info = self.expr_info(g, &mut items[idx]);
                    consumes = info.consumes;
                    eof |= info.eof;
                    peek |= info.peek;
                    prefix.push((info.peek, info.first));
                    idx += 1;
                }
                // the first set is what the leading consumer and any
                // optional matchers before it can start with, narrowed by
                // the constraints the preceding lookaheads impose
                let mut first = First::Set(CharClass::empty());
                for (is_peek, f) in prefix.iter().rev() {
                    if let Some(f) = *f {
                        first = if *is_peek {
                            first.intersect(f)
                        } else {
                            first.union(f)
                        };
                    }
                }
                for rest in items[idx..].iter_mut() {
                    self.expr_info(g, rest);
                }
                Info {
                    consumes,
                    eof: !consumes && eof,
                    peek: !consumes && peek,
                    first: Some(first),
                }
            }
            Expr::PeekNot(child) => {
                let i = self.expr_info(g, child);
                let first = match i.first {
                    Some(First::Set(c)) => c.complemented(),
                    // nothing is left for the negation to succeed on
                    // before end of input
                    Some(First::Any) | None => CharClass::empty(),
                };
                Info {
                    consumes: false,
                    eof: !i.eof,
                    peek: true,
                    first: Some(First::Set(first)),
                }
            }
            Expr::PeekFor(child) => {
                let i = self.expr_info(g, child);
                Info {
                    consumes: false,
                    eof: i.eof,
                    peek: true,
                    first: i.first,
                }
            }
            Expr::Query(child) | Expr::Star(child) => {
                let i = self.expr_info(g, child);
                // both match the empty string, so they succeed at end of
                // input no matter what the child does
                Info {
                    consumes: false,
                    eof: true,
                    peek: false,
                    first: i.first,
                }
            }
            Expr::Plus(child) => self.expr_info(g, child),
            Expr::Action(_) | Expr::Nil => Info::empty_set(),
            Expr::Predicate(_) | Expr::Commit | Expr::Begin | Expr::End => Info {
                consumes: false,
                eof: false,
                peek: false,
                first: None,
            },
            Expr::UnorderedAlternate(_) => Info {
                consumes: false,
                eof: false,
                peek: false,
                first: None,
            },
        }
    }

    fn alternate_info(&mut self, g: &mut Grammar, node: &mut Expr) -> Info {
        let Expr::Alternate(branches) = node else {
            unreachable!()
        };

        let mut infos = Vec::with_capacity(branches.len());
        let mut consumes = true;
        let mut eof = false;
        let mut peek = true;
        let mut union = CharClass::empty();
        let mut any = false;
        let mut empty = false;
        for b in branches.iter_mut() {
            let info = self.expr_info(g, b);
            consumes &= info.consumes;
            eof |= info.eof;
            peek &= info.peek;
            match info.first {
                Some(First::Any) => any = true,
                Some(First::Set(c)) => {
                    union.union(&c);
                    if c.is_empty() {
                        empty = true;
                    }
                }
                None => empty = true,
            }
            infos.push(info);
        }

        let info = Info {
            consumes,
            eof,
            peek,
            first: Some(if any { First::Any } else { First::Set(union) }),
        };

        // a branch that can succeed at end of input must stay ordered: the
        // switch reads the current byte unconditionally
        if eof {
            return info;
        }
        // a branch with no first byte at all can never be dispatched
        if empty {
            return Info {
                consumes: false,
                eof,
                peek,
                first: Some(First::Set(CharClass::empty())),
            };
        }

        // a branch stays ordered when its first set overlaps some later
        // branch, or is unbounded
        let n = infos.len();
        let mut marked = vec![false; n];
        for i in 0..n {
            if matches!(infos[i].first, Some(First::Any)) {
                marked[i] = true;
                continue;
            }
            for j in i + 1..n {
                if infos[i]
                    .first
                    .as_ref()
                    .unwrap()
                    .intersects(infos[j].first.as_ref().unwrap())
                {
                    marked[i] = true;
                    break;
                }
            }
        }
        let marked_count = marked.iter().filter(|&&m| m).count();

        if marked_count < n && n >= 2 {
            let taken = mem::take(branches);
            let mut ordered: Vec<Expr> = Vec::new();
            let mut unordered: VecDeque<Expr> = VecDeque::new();
            let mut max = 0usize;
            for (i, branch) in taken.into_iter().enumerate() {
                if marked[i] {
                    ordered.push(branch);
                    continue;
                }
                let Some(First::Set(class)) = infos[i].first else {
                    ordered.push(branch);
                    continue;
                };
                let length = class.len();
                let keep_order = matches!(&branch, Expr::Nil)
                    || matches!(&branch, Expr::String(s) if s.is_empty());
                let guarded = Expr::Sequence(vec![
                    Expr::PeekFor(Box::new(Expr::Class {
                        text: class.to_string().into(),
                        class,
                    })),
                    branch,
                ]);
                // bias the widest first set towards the back so it becomes
                // the switch's default arm
                if keep_order {
                    unordered.push_back(guarded);
                } else if length > max {
                    unordered.push_back(guarded);
                    max = length;
                } else {
                    unordered.push_front(guarded);
                }
            }

            if ordered.is_empty() {
                *node = Expr::UnorderedAlternate(unordered.into());
            } else {
                if unordered.len() == 1 {
                    match unordered.pop_front() {
                        Some(Expr::Sequence(mut items)) if items.len() == 2 => {
                            ordered.push(items.pop().unwrap());
                        }
                        Some(other) => ordered.push(other),
                        None => {}
                    }
                } else {
                    ordered.push(Expr::UnorderedAlternate(unordered.into()));
                }
                *node = Expr::Alternate(ordered);
            }
        }

        info
    }
}

#[cfg(test)]
fn optimized(src: &str) -> Grammar {
    let mut g = crate::parse::parse_grammar(src, false, true).unwrap();
    optimize_alternates(&mut g);
    g
}

#[cfg(test)]
fn start_expr(g: &Grammar) -> &Expr {
    g.rules[g.rule_order[0]].expression.as_ref().unwrap()
}

#[cfg(test)]
fn guard_body(branch: &Expr) -> (&CharClass, &Expr) {
    let Expr::Sequence(items) = branch else {
        panic!("expected a guarded sequence, got {branch:?}");
    };
    let Expr::PeekFor(guard) = &items[0] else {
        panic!("expected a lookahead guard");
    };
    let Expr::Class { class, .. } = guard.as_ref() else {
        panic!("expected a class guard");
    };
    (class, &items[1])
}

#[test]
fn test_disjoint_alternate_becomes_unordered() {
    let g = optimized("A <- 'a' / 'b' / 'c'\n");
    let Expr::UnorderedAlternate(branches) = start_expr(&g) else {
        panic!("expected an unordered alternate, got {:?}", start_expr(&g));
    };
    assert_eq!(branches.len(), 3);
    for b in branches {
        let (class, body) = guard_body(b);
        assert_eq!(class.len(), 1);
        assert!(matches!(body, Expr::Character(_)));
    }
}

#[test]
fn test_shared_prefix_stays_ordered() {
    let g = optimized("A <- 'ab' / 'ac'\n");
    let Expr::Alternate(branches) = start_expr(&g) else {
        panic!("expected the alternate to survive");
    };
    assert_eq!(branches.len(), 2);
    assert!(branches.iter().all(|b| matches!(b, Expr::String(_))));
}

#[test]
fn test_mixed_alternate_keeps_order_then_dispatches() {
    let g = optimized("A <- 'ab' / 'ac' / 'x'\n");
    let Expr::Alternate(branches) = start_expr(&g) else {
        panic!("expected an ordered shell");
    };
    // 'ab' overlaps 'ac' and stays first; the disjoint tail is dispatched
    assert!(matches!(&branches[0], Expr::String(s) if &**s == "ab"));
    let last = branches.last().unwrap();
    match last {
        Expr::UnorderedAlternate(inner) => assert_eq!(inner.len(), 2),
        // two leftovers collapse differently; a single one is unwrapped
        other => assert!(matches!(other, Expr::String(_) | Expr::Character(_))),
    }
}

#[test]
fn test_widest_class_lands_at_back() {
    let g = optimized("A <- 'a' / [0-9] / 'b'\n");
    let Expr::UnorderedAlternate(branches) = start_expr(&g) else {
        panic!("expected an unordered alternate");
    };
    let widths: Vec<usize> = branches.iter().map(|b| guard_body(b).0.len()).collect();
    assert_eq!(widths, vec![1, 1, 10]);
}

#[test]
fn test_negative_lookahead_narrows_first_set() {
    // !'a' constrains the branch to bytes other than 'a', so the branches
    // are disjoint and the whole alternate can dispatch
    let g = optimized("A <- !'a' 'x' / 'a'\n");
    assert!(matches!(start_expr(&g), Expr::UnorderedAlternate(_)));
}

#[test]
fn test_empty_matching_branch_blocks_rewrite() {
    let g = optimized("A <- 'a' / 'b' / {yy = 0}\n");
    assert!(matches!(start_expr(&g), Expr::Alternate(_)));
}

#[test]
fn test_optional_branch_blocks_rewrite() {
    // 'a'? succeeds at end of input, which a byte switch cannot represent
    let g = optimized("A <- 'a'? / 'b'\n");
    assert!(matches!(start_expr(&g), Expr::Alternate(_)));
}

#[test]
fn test_switch_excluded_rule_untouched() {
    let mut g = crate::parse::parse_grammar(
        "%{switchexcl} A\nA <- 'a' / 'b' / 'c'\n",
        false,
        true,
    )
    .unwrap();
    optimize_alternates(&mut g);
    assert!(matches!(start_expr(&g), Expr::Alternate(_)));
}

#[test]
fn test_inline_leafs() {
    let mut g =
        crate::parse::parse_grammar("A <- B C\nB <- 'x'\nC <- [0-9]+\n", false, false).unwrap();
    let mut stats = Stats::default();
    inline_leafs(&mut g, &mut stats);
    assert_eq!(stats.inline_leafs, 2);
    let Some(Expr::Sequence(items)) = &g.rule("A").unwrap().expression else {
        panic!("expected a sequence");
    };
    assert!(matches!(&items[0], Expr::Character(_)));
    assert!(matches!(&items[1], Expr::Plus(c) if matches!(c.as_ref(), Expr::Class { .. })));
}

#[test]
fn test_inline_leafs_skips_compound_rules() {
    let mut g =
        crate::parse::parse_grammar("A <- B\nB <- 'x' 'y'\n", false, false).unwrap();
    let mut stats = Stats::default();
    inline_leafs(&mut g, &mut stats);
    assert_eq!(stats.inline_leafs, 0);
    assert!(matches!(
        g.rule("A").unwrap().expression,
        Some(Expr::Name { .. })
    ));
}
