//! Output writer for the two-phase emission walk. The dry run discards all
//! text but records, per label, which parser-state fields a `restore` will
//! need; the real run then emits saves for exactly those fields.

use std::fmt::{Arguments, Write as _};

/// Whether a fragment may have changed `position` / `thunkPosition` on the
/// exit path it describes.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct ChgFlags {
    pub pos: bool,
    pub th_pos: bool,
}

impl ChgFlags {
    pub fn merge(&mut self, other: ChgFlags) {
        self.pos |= other.pos;
        self.th_pos |= other.th_pos;
    }
}

#[derive(Clone, Copy, Default)]
struct SaveFlags {
    pos: bool,
    th_pos: bool,
}

struct LabelState {
    /// Save-slot id used in generated variable names; usually the label id,
    /// but the rule-level label always uses slot 0 so `commit` can name it.
    sid: usize,
    used: bool,
    block_open: bool,
}

/// A backtracking site in the generated code. Indexes into the writer's
/// label table; both passes allocate labels in the same order, which is what
/// ties a dry-run record to its real-run label.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Label(usize);

impl Label {
    pub fn id(self) -> usize {
        self.0
    }
}

/// Emission counters. They gate which match primitives the preamble
/// declares, and double as the `-verbose` report.
#[derive(Clone, Copy, Default, Debug)]
pub struct Stats {
    pub match_dot: u32,
    pub match_char: u32,
    pub match_string: u32,
    pub match_class: u32,
    pub peek_char: u32,
    pub peek_class: u32,
    pub elim_restore_pos: u32,
    pub elim_restore_thunk_pos: u32,
    pub opt_first_char: u32,
    pub opt_first_dot: u32,
    pub opt_first_string: u32,
    pub opt_first_class: u32,
    pub seq_peek_not: u32,
    pub inline_leafs: u32,
}

pub struct Writer {
    out: String,
    pub indent: usize,
    saved_indent: usize,
    dry: bool,
    n_labels: usize,
    labels: Vec<LabelState>,
    save_flags: Vec<SaveFlags>,
    pub elim_restore: bool,
    /// Whether the generated parser has thunk state at all. Without actions
    /// there is no `thunkPosition` to save, so those restores are dropped
    /// even when elimination is off.
    pub thunk_state: bool,
    pub stats: Stats,
}

impl Writer {
    pub fn new() -> Writer {
        Writer {
            out: String::new(),
            indent: 2,
            saved_indent: 2,
            dry: false,
            n_labels: 0,
            labels: Vec::new(),
            save_flags: Vec::new(),
            elim_restore: false,
            thunk_state: true,
            stats: Stats::default(),
        }
    }

    pub fn into_output(self) -> String {
        self.out
    }

    pub fn out_mut(&mut self) -> &mut String {
        &mut self.out
    }

    pub fn set_dry(&mut self, on: bool) {
        self.dry = on;
        if on {
            self.saved_indent = self.indent;
        } else {
            self.indent = self.saved_indent;
            self.n_labels = 0;
            self.labels.clear();
        }
    }

    /// Appends without a line break; no-op during the dry run.
    pub fn print(&mut self, args: Arguments) {
        if !self.dry {
            let _ = self.out.write_fmt(args);
        }
    }

    /// Starts a new indented line; no-op during the dry run.
    pub fn line(&mut self, args: Arguments) {
        if self.dry {
            return;
        }
        self.out.push('\n');
        for _ in 0..self.indent {
            self.out.push('\t');
        }
        let _ = self.out.write_fmt(args);
    }

    pub fn begin(&mut self) {
        self.line(format_args!("{{"));
        self.indent += 1;
    }

    pub fn end(&mut self) {
        self.indent -= 1;
        self.line(format_args!("}}"));
    }

    pub fn new_label(&mut self) -> Label {
        let id = self.n_labels;
        self.n_labels += 1;
        if self.dry {
            self.save_flags.push(SaveFlags::default());
        }
        debug_assert!(id < self.save_flags.len(), "label allocation out of sync");
        self.labels.push(LabelState {
            sid: id,
            used: false,
            block_open: false,
        });
        Label(id)
    }

    pub fn set_sid(&mut self, l: Label, sid: usize) {
        self.labels[l.0].sid = sid;
    }

    pub fn used(&self, l: Label) -> bool {
        self.labels[l.0].used
    }

    /// Whether the label's guarded region needs any state saved at all.
    pub fn is_unsafe(&self, l: Label) -> bool {
        let f = self.save_flags[l.0];
        f.pos || f.th_pos
    }

    /// Emits the label anchor, outdented one step.
    pub fn anchor(&mut self, l: Label) {
        self.indent -= 1;
        self.line(format_args!("l{}:", l.0));
        self.indent += 1;
    }

    pub fn jump(&mut self, l: Label) {
        self.line(format_args!("goto l{}", l.0));
        self.labels[l.0].used = true;
    }

    /// Emits a conditional jump to `l`, taken when `cond` matches
    /// `jump_if_true`.
    pub fn cjump(&mut self, l: Label, jump_if_true: bool, cond: Arguments) {
        self.labels[l.0].used = true;
        if self.dry {
            return;
        }
        if jump_if_true {
            self.line(format_args!("if {cond} {{"));
        } else {
            self.line(format_args!("if !{cond} {{"));
        }
        self.line(format_args!("\tgoto l{}", l.0));
        self.line(format_args!("}}"));
    }

    /// Emits the state snapshot for `l`, limited to the fields the dry run
    /// recorded as needed.
    pub fn save(&mut self, l: Label) {
        let f = self.save_flags[l.0];
        let sid = self.labels[l.0].sid;
        match (f.pos, f.th_pos) {
            (true, true) => self.line(format_args!(
                "position{sid}, thunkPosition{sid} := position, thunkPosition"
            )),
            (false, true) => self.line(format_args!("thunkPosition{sid} := thunkPosition")),
            (true, false) => self.line(format_args!("position{sid} := position")),
            (false, false) => {}
        }
    }

    /// Like [`save`](Self::save), inside its own block when anything needs
    /// saving; the matching [`restore_at`](Self::restore_at) closes it.
    pub fn save_block(&mut self, l: Label) {
        if self.is_unsafe(l) {
            self.begin();
            self.save(l);
            self.labels[l.0].block_open = true;
        }
    }

    pub fn restore(&mut self, l: Label, pos: bool, th_pos: bool) {
        self.restore_at(l, Some(l), pos, th_pos);
    }

    /// Restores the state saved for `slot`, anchoring `anchor` first if it
    /// was jumped to. During the dry run this is where the slot's save
    /// flags are accumulated.
    pub fn restore_at(&mut self, slot: Label, anchor: Option<Label>, pos: bool, th_pos: bool) {
        if let Some(a) = anchor {
            if self.labels[a.0].used {
                self.anchor(a);
            }
        }
        let (pos, th_pos) = if self.elim_restore {
            (pos, th_pos)
        } else {
            (true, true)
        };
        let th_pos = th_pos && self.thunk_state;
        let sid = self.labels[slot.0].sid;
        match (pos, th_pos) {
            (true, true) => self.line(format_args!(
                "position, thunkPosition = position{sid}, thunkPosition{sid}"
            )),
            (false, true) => {
                self.line(format_args!("thunkPosition = thunkPosition{sid}"));
                self.stats.elim_restore_pos += 1;
            }
            (true, false) => {
                self.line(format_args!("position = position{sid}"));
                self.stats.elim_restore_thunk_pos += 1;
            }
            (false, false) => {
                self.stats.elim_restore_pos += 1;
                self.stats.elim_restore_thunk_pos += 1;
            }
        }
        if self.dry {
            let f = &mut self.save_flags[slot.0];
            f.pos |= pos;
            f.th_pos |= th_pos;
        }
        if self.labels[slot.0].block_open {
            self.end();
            self.labels[slot.0].block_open = false;
        }
    }
}

#[test]
fn test_dry_run_records_save_flags() {
    let mut w = Writer::new();
    w.elim_restore = true;

    w.set_dry(true);
    let a = w.new_label();
    let b = w.new_label();
    w.jump(a);
    w.restore(a, true, false);
    w.restore(b, false, true);
    w.set_dry(false);

    let a = w.new_label();
    let b = w.new_label();
    assert!(w.is_unsafe(a));
    assert!(w.is_unsafe(b));
    w.save(a);
    w.save(b);
    let out = w.into_output();
    assert!(out.contains("position0 := position"));
    assert!(!out.contains("thunkPosition0"));
    assert!(out.contains("thunkPosition1 := thunkPosition"));
    assert!(!out.contains("position1, "));
}

#[test]
fn test_no_text_during_dry_run() {
    let mut w = Writer::new();
    w.set_dry(true);
    let l = w.new_label();
    w.line(format_args!("matchDot()"));
    w.cjump(l, false, format_args!("matchChar('x')"));
    w.jump(l);
    assert!(w.used(l));
    w.set_dry(false);
    assert!(w.into_output().is_empty());
}

#[test]
fn test_restore_everything_without_elimination() {
    let mut w = Writer::new();
    w.set_dry(true);
    let l = w.new_label();
    w.restore(l, false, false);
    w.set_dry(false);

    let l = w.new_label();
    // without -O r the full state is saved and restored
    assert!(w.is_unsafe(l));
    w.restore(l, false, false);
    let out = w.into_output();
    assert!(out.contains("position, thunkPosition = position0, thunkPosition0"));
}
