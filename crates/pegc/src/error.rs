use std::fmt::{self, Display};

/// A fatal front-end error: the byte offset it was detected at and what was
/// expected there.
#[derive(Clone, Debug)]
pub struct ParseError {
    pub offset: u32,
    pub message: String,
}

impl Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.offset)
    }
}

impl std::error::Error for ParseError {}
