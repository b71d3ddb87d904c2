// Engine control flow and host-facing errors.
//
// Inside the engine, non-local exits travel as a one-byte `Control`
// value; the actual error payload (a Value) lives on the VM so the
// Result stays small. The host-facing `VmError` is produced only at
// the outermost API boundary.

use thiserror::Error;

/// Non-local exit raised by instruction handlers and API calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// A runtime error; the error value is in `Vm::error_value`.
    Raise,
    /// Allocation failure. Fatal: passes through protected calls.
    OutOfMemory,
    /// A coroutine yield; transfer values are in `Vm::transfer`.
    Yield,
    /// Debug interrupt requested a break at a safe point.
    Break,
}

pub type VmResult<T> = Result<T, Control>;

/// Error surfaced to the embedding host.
#[derive(Debug, Error)]
pub enum VmError {
    /// Uncaught script error, with full `source:line: message` text.
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("not enough memory")]
    OutOfMemory,
    /// `resume`/`close` on a thread in the wrong state.
    #[error("{0}")]
    CoroutineStatus(String),
    /// Execution stopped at a break point set by the interrupt hook.
    #[error("execution interrupted")]
    Break,
}

/// Engine error taxonomy. Each kind formats to the message text the
/// error value carries; script-raised errors get a `source:line:`
/// prefix attached by the raise path.
#[derive(Debug)]
pub enum ErrorKind<'a> {
    /// Operator or argument applied to a wrong-typed operand.
    IndexNonTable { type_name: &'a str, key: Option<&'a str> },
    CallNonFunction { type_name: &'a str },
    Arithmetic { verb: &'a str, lhs: &'a str, rhs: Option<&'a str> },
    Comparison { lhs: &'a str, rhs: &'a str },
    Concatenation { type_name: &'a str },
    Length { type_name: &'a str },
    ReadOnly,
    StackOverflow,
    Argument { index: usize, func: Option<&'a str>, expected: &'a str, got: &'a str },
    BufferBounds,
    YieldOutsideCoroutine,
    YieldAcrossNativeCall,
}

impl ErrorKind<'_> {
    pub fn message(&self) -> String {
        match self {
            ErrorKind::IndexNonTable { type_name, key } => match key {
                Some(k) => format!("attempt to index {} with '{}'", type_name, k),
                None => format!("attempt to index a {} value", type_name),
            },
            ErrorKind::CallNonFunction { type_name } => {
                format!("attempt to call a {} value", type_name)
            }
            ErrorKind::Arithmetic { verb, lhs, rhs } => match rhs {
                Some(rhs) if rhs != lhs => format!(
                    "attempt to perform arithmetic ({}) on {} and {}",
                    verb, lhs, rhs
                ),
                _ => format!("attempt to perform arithmetic ({}) on {}", verb, lhs),
            },
            ErrorKind::Comparison { lhs, rhs } => {
                if lhs == rhs {
                    format!("attempt to compare two {} values", lhs)
                } else {
                    format!("attempt to compare {} < {}", lhs, rhs)
                }
            }
            ErrorKind::Concatenation { type_name } => {
                format!("attempt to concatenate a {} value", type_name)
            }
            ErrorKind::Length { type_name } => {
                format!("attempt to get length of a {} value", type_name)
            }
            ErrorKind::ReadOnly => "attempt to modify a readonly table".to_string(),
            ErrorKind::StackOverflow => "stack overflow".to_string(),
            ErrorKind::Argument { index, func, expected, got } => match func {
                Some(f) => format!(
                    "invalid argument #{} to '{}' ({} expected, got {})",
                    index, f, expected, got
                ),
                None => format!(
                    "invalid argument #{} ({} expected, got {})",
                    index, expected, got
                ),
            },
            ErrorKind::BufferBounds => "buffer access out of bounds".to_string(),
            ErrorKind::YieldOutsideCoroutine => {
                "attempt to yield from outside a coroutine".to_string()
            }
            ErrorKind::YieldAcrossNativeCall => {
                "attempt to yield across a native call boundary".to_string()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn message_texts() {
        assert_eq!(
            ErrorKind::IndexNonTable { type_name: "nil", key: Some("x") }.message(),
            "attempt to index nil with 'x'"
        );
        assert_eq!(
            ErrorKind::Comparison { lhs: "table", rhs: "table" }.message(),
            "attempt to compare two table values"
        );
        assert_eq!(
            ErrorKind::Arithmetic { verb: "add", lhs: "string", rhs: Some("string") }.message(),
            "attempt to perform arithmetic (add) on string"
        );
        assert_eq!(
            ErrorKind::Argument { index: 2, func: Some("resume"), expected: "thread", got: "nil" }
                .message(),
            "invalid argument #2 to 'resume' (thread expected, got nil)"
        );
    }
}
