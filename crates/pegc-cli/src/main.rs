use std::io::Write;
use std::path::{Path, PathBuf};

use pegc::{parse_grammar, GoEmitter, OptiFlags};

trait IoError<T> {
    fn pretty_error(self, path: &Path, message: &str) -> Result<T, ()>;
}

impl<T> IoError<T> for std::io::Result<T> {
    fn pretty_error(self, path: &Path, message: &str) -> Result<T, ()> {
        self.map_err(|e| {
            let path = path.display();
            eprintln!("{message} `{path}`\n  {e}");
        })
    }
}

fn main() {
    if run().is_err() {
        std::process::exit(1);
    }
}

fn usage() {
    eprintln!("usage: pegc [-inline] [-switch] [-O flags] [-verbose] FILE");
    eprintln!("  -inline   splice single-use rules into their call site");
    eprintln!("  -switch   dispatch disjoint alternations on their first byte");
    eprintln!("  -O        colon-separated optimization keys (1 l p r s), or 'all'");
    eprintln!("  FILE      the peg file to compile; output goes to stdout");
}

fn line_col(src: &str, offset: u32) -> (u32, u32) {
    let mut line = 1;
    let mut col = 1;
    for (i, b) in src.bytes().enumerate() {
        if i as u32 >= offset {
            break;
        }
        if b == b'\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

fn run() -> Result<(), ()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut inline = false;
    let mut switch = false;
    let mut verbose = false;
    let mut opti = String::new();
    let mut files = Vec::new();

    let mut iter = args.iter().map(String::as_str);
    while let Some(arg) = iter.next() {
        match arg {
            "-inline" | "--inline" => inline = true,
            "-switch" | "--switch" => switch = true,
            "-verbose" | "--verbose" => verbose = true,
            "-O" => match iter.next() {
                Some(flags) => opti = flags.to_string(),
                None => {
                    usage();
                    return Err(());
                }
            },
            _ if arg.starts_with('-') => {
                usage();
                return Err(());
            }
            _ => files.push(arg),
        }
    }

    if files.len() != 1 {
        usage();
        return Err(());
    }
    let path = PathBuf::from(files[0]);

    let src = std::fs::read_to_string(&path).pretty_error(&path, "Failed to read")?;

    let mut grammar = match parse_grammar(&src, inline, switch) {
        Ok(g) => g,
        Err(e) => {
            let (line, col) = line_col(&src, e.offset);
            eprintln!("{}:{line}:{col} {}", path.display(), e.message);
            return Err(());
        }
    };

    let mut out = String::new();
    let stats = grammar.compile(&OptiFlags::parse(&opti), &GoEmitter, &mut out);
    if verbose {
        eprintln!("{stats:#?}");
    }

    std::io::stdout()
        .write_all(out.as_bytes())
        .pretty_error(&path, "Failed to write output for")?;
    Ok(())
}

#[test]
fn test_line_col() {
    let src = "ab\ncd\n";
    assert_eq!(line_col(src, 0), (1, 1));
    assert_eq!(line_col(src, 1), (1, 2));
    assert_eq!(line_col(src, 3), (2, 1));
    assert_eq!(line_col(src, 4), (2, 2));
}
