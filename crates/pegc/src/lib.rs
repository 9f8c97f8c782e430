//! Compiles Parsing Expression Grammars into self-contained recursive
//! descent parsers. The interesting parts are the middle end: FIRST-set
//! driven rewriting of ordered alternations into byte-dispatched switches,
//! and a dry emission pass that discovers which backtracking points need
//! which state saved.

pub mod analysis;
pub mod charclass;
pub mod emit;
pub mod error;
pub mod grammar;
pub mod optimize;
pub mod parse;

pub use charclass::CharClass;
pub use emit::{Emitter, GoEmitter, Stats, TemplateHoles};
pub use error::ParseError;
pub use grammar::{Grammar, GrammarBuilder};
pub use optimize::OptiFlags;
pub use parse::parse_grammar;
