//! The Go rendition of the parser preamble: the parser type, its driver
//! methods, the thunk machinery for deferred actions, and the match
//! primitives the rule bodies call. Only primitives the emitted bodies
//! actually use are declared, since Go rejects unused locals.

use std::fmt::Write as _;

use super::{Emitter, TemplateHoles};

pub struct GoEmitter;

const PRINT_ERROR_BODY: &str = "\
	line := 1
	character := 0
	for i, c := range p.Buffer[0:] {
		if c == '\\n' {
			line++
			character = 0
		} else {
			character++
		}
		if i == p.Min {
			if p.Min != p.Max {
				fmt.Printf(\"parse error after line %v character %v\\n\", line, character)
			} else {
				break
			}
		} else if i == p.Max {
			break
		}
	}
	fmt.Printf(\"parse error: unexpected \")
	if p.Max >= len(p.Buffer) {
		fmt.Printf(\"end of file found\\n\")
	} else {
		fmt.Printf(\"'%c' at line %v character %v\\n\", p.Buffer[p.Max], line, character)
	}
}
";

const MATCH_DOT: &str = "
	matchDot := func() bool {
		if position < len(p.Buffer) {
			position++
			return true
		} else if position >= p.Max {
			p.Max = position
		}
		return false
	}
";

const MATCH_CHAR: &str = "
	matchChar := func(c byte) bool {
		if (position < len(p.Buffer)) && (p.Buffer[position] == c) {
			position++
			return true
		} else if position >= p.Max {
			p.Max = position
		}
		return false
	}
";

const PEEK_CHAR: &str = "
	peekChar := func(c byte) bool {
		return position < len(p.Buffer) && p.Buffer[position] == c
	}
";

const MATCH_STRING: &str = "
	matchString := func(s string) bool {
		length := len(s)
		next := position + length
		if (next <= len(p.Buffer)) && (p.Buffer[position:next] == s) {
			position = next
			return true
		} else if position >= p.Max {
			p.Max = position
		}
		return false
	}
";

const MATCH_CLASS: &str = "
	matchClass := func(class uint) bool {
		if (position < len(p.Buffer)) &&
			((classes[class][p.Buffer[position]>>3] & (1 << (p.Buffer[position] & 7))) != 0) {
			position++
			return true
		} else if position >= p.Max {
			p.Max = position
		}
		return false
	}
";

const PEEK_CLASS: &str = "
	peekClass := func(class uint) bool {
		return position < len(p.Buffer) &&
			((classes[class][p.Buffer[position]>>3] & (1 << (p.Buffer[position] & 7))) != 0)
	}
";

impl Emitter for GoEmitter {
    fn preamble(&self, t: &TemplateHoles<'_>, out: &mut String) {
        for header in t.headers {
            _ = write!(out, "{header}");
        }
        if !t.package.is_empty() {
            _ = write!(out, "\npackage {}\n\nimport (\n\t\"fmt\"\n)\n", t.package);
        }

        _ = write!(out, "\nconst (\n");
        for (id, ident) in &t.rules {
            if *id == 0 {
                _ = write!(out, "\trule{ident} = iota\n");
            } else {
                _ = write!(out, "\trule{ident}\n");
            }
        }
        _ = write!(out, ")\n");

        let peg = t.peg;
        _ = write!(out, "\ntype {peg} struct {{\n");
        if !t.userstate.is_empty() {
            _ = write!(out, "\t{}\n", t.userstate);
        }
        _ = write!(
            out,
            "\tBuffer string\n\tMin, Max int\n\trules [{}]func() bool\n\tResetBuffer func(string) string\n}}\n",
            t.num_rules
        );

        _ = write!(
            out,
            "\nfunc (p *{peg}) Parse(ruleId int) bool {{\n\tif p.rules[ruleId]() {{\n\t\treturn true\n\t}}\n\treturn false\n}}\n"
        );

        _ = write!(out, "\nfunc (p *{peg}) PrintError() {{\n{PRINT_ERROR_BODY}");

        _ = write!(out, "\nfunc (p *{peg}) Init() {{\n\tvar position int\n");
        if t.nvar > 0 {
            _ = write!(
                out,
                "\tvar yyp int\n\tvar yy {0}\n\tvar yyval = make([]{0}, 200)\n",
                t.yystype
            );
        }

        let has_actions = !t.actions.is_empty();
        if has_actions {
            _ = write!(out, "\n\tactions := [...]func(string, int){{\n");
            for a in &t.actions {
                _ = write!(
                    out,
                    "\t\t/* {} {} */\n\t\tfunc(yytext string, _ int) {{\n",
                    a.id, a.rule
                );
                for (name, offset) in &a.vars {
                    _ = write!(out, "\t\t\t{name} := yyval[yyp{offset}]\n");
                }
                _ = write!(out, "\t\t\t{}\n", a.text);
                for (name, offset) in &a.vars {
                    _ = write!(out, "\t\t\tyyval[yyp{offset}] = {name}\n");
                }
                _ = write!(out, "\t\t}},\n");
            }
            if t.nvar > 0 {
                _ = write!(
                    out,
                    "\t\t/* yyPush */\n\t\tfunc(_ string, count int) {{\n\t\t\tyyp += count\n\t\t\tif yyp >= len(yyval) {{\n\t\t\t\ts := make([]{}, cap(yyval)+200)\n\t\t\t\tcopy(s, yyval)\n\t\t\t\tyyval = s\n\t\t\t}}\n\t\t}},\n",
                    t.yystype
                );
                _ = write!(
                    out,
                    "\t\t/* yyPop */\n\t\tfunc(_ string, count int) {{\n\t\t\tyyp -= count\n\t\t}},\n"
                );
                _ = write!(
                    out,
                    "\t\t/* yySet */\n\t\tfunc(_ string, count int) {{\n\t\t\tyyval[yyp+count] = yy\n\t\t}},\n\t}}\n"
                );
                _ = write!(
                    out,
                    "\tconst (\n\t\tyyPush = {} + iota\n\t\tyyPop\n\t\tyySet\n\t)\n",
                    t.actions.len()
                );
            } else {
                _ = write!(out, "\t}}\n");
            }

            let bits = t.action_bits;
            _ = write!(
                out,
                "\n\ttype thunk struct {{\n\t\taction uint{bits}\n\t\tbegin, end int\n\t}}\n\tvar thunkPosition, begin, end int\n\tthunks := make([]thunk, 32)\n"
            );
            _ = write!(
                out,
                "\tdoarg := func(action uint{bits}, arg int) {{\n\t\tif thunkPosition == len(thunks) {{\n\t\t\tnewThunks := make([]thunk, 2*len(thunks))\n\t\t\tcopy(newThunks, thunks)\n\t\t\tthunks = newThunks\n\t\t}}\n\t\tthunks[thunkPosition].action = action\n\t\tif arg != 0 {{\n\t\t\tthunks[thunkPosition].begin = arg\n\t\t}} else {{\n\t\t\tthunks[thunkPosition].begin = begin\n\t\t}}\n\t\tthunks[thunkPosition].end = end\n\t\tthunkPosition++\n\t}}\n"
            );
            _ = write!(
                out,
                "\tdo := func(action uint{bits}) {{\n\t\tdoarg(action, 0)\n\t}}\n"
            );
        }

        _ = write!(
            out,
            "\n\tp.ResetBuffer = func(s string) (old string) {{\n\t\tif p.Max < len(p.Buffer) {{\n\t\t\told = p.Buffer[p.Max:]\n\t\t}}\n\t\tp.Buffer = s\n"
        );
        if has_actions {
            _ = write!(out, "\t\tthunkPosition = 0\n");
        }
        _ = write!(
            out,
            "\t\tposition = 0\n\t\tp.Min = 0\n\t\tp.Max = 0\n\t\treturn\n\t}}\n"
        );

        if has_actions && t.has_commit {
            _ = write!(
                out,
                "\n\tcommit := func(thunkPosition0 int) bool {{\n\t\tif thunkPosition0 == 0 {{\n\t\t\tfor i := 0; i < thunkPosition; i++ {{\n\t\t\t\tb := thunks[i].begin\n\t\t\t\te := thunks[i].end\n\t\t\t\ts := \"\"\n\t\t\t\tif b >= 0 && e <= len(p.Buffer) && b <= e {{\n\t\t\t\t\ts = p.Buffer[b:e]\n\t\t\t\t}}\n\t\t\t\tmagic := b\n\t\t\t\tactions[thunks[i].action](s, magic)\n\t\t\t}}\n\t\t\tp.Min = position\n\t\t\tthunkPosition = 0\n\t\t\treturn true\n\t\t}}\n\t\treturn false\n\t}}\n"
            );
        }

        let stats = &t.stats;
        if stats.match_dot > 0 {
            out.push_str(MATCH_DOT);
        }
        if stats.match_char > 0 {
            out.push_str(MATCH_CHAR);
        }
        if stats.peek_char > 0 {
            out.push_str(PEEK_CHAR);
        }
        if stats.match_string > 0 {
            out.push_str(MATCH_STRING);
        }
        if (stats.match_class > 0 || stats.peek_class > 0) && !t.classes.is_empty() {
            _ = write!(out, "\n\tclasses := [...][32]uint8{{\n");
            for class in &t.classes {
                _ = write!(out, "\t\t{{");
                for (i, byte) in class.bitmap().iter().enumerate() {
                    if i > 0 {
                        _ = write!(out, ", ");
                    }
                    _ = write!(out, "{byte}");
                }
                _ = write!(out, "}},\n");
            }
            _ = write!(out, "\t}}\n");
        }
        if stats.match_class > 0 {
            out.push_str(MATCH_CLASS);
        }
        if stats.peek_class > 0 {
            out.push_str(PEEK_CLASS);
        }

        _ = write!(out, "\n\tp.rules = [...]func() bool{{");
    }
}

#[test]
fn test_preamble_without_actions_has_no_thunks() {
    use crate::optimize::OptiFlags;

    let mut g = crate::parse::parse_grammar("A <- 'x'\n", false, false).unwrap();
    let mut out = String::new();
    g.compile(&OptiFlags::default(), &GoEmitter, &mut out);
    assert!(!out.contains("thunks"));
    assert!(!out.contains("doarg"));
    assert!(out.contains("p.ResetBuffer = func(s string) (old string) {"));
    assert!(!out.contains("thunkPosition = 0"));
}

#[test]
fn test_action_bits_widths() {
    use super::Stats;
    use crate::analysis::Analysis;

    let make = |n: usize| {
        let mut src = String::from("A <- 'x'");
        for _ in 0..n {
            src.push_str(" {yy = 1}");
        }
        src.push('\n');
        let g = crate::parse::parse_grammar(&src, false, false).unwrap();
        let analysis = Analysis::run(&g);
        TemplateHoles::new(&g, &analysis, Stats::default()).action_bits
    };
    assert_eq!(make(1), 8);
    assert_eq!(make(127), 8);
    assert_eq!(make(128), 16);
}
