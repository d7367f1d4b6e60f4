use std::fmt;

use crate::memory::heap::OutOfMemory;

/// Failure categories surfaced to scripts and hosts.
///
/// `UndefinedOperation` is a dispatch failure (no method, function, or
/// primitive matched a name); `BadCall` is its counterpart for calls that
/// matched but were malformed (wrong argument types, arity, or receiver).
/// The two are deliberately distinct so callers can tell "nothing to call"
/// from "called wrongly".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    OutOfMemory,
    UnboundVariable,
    UndefinedOperation,
    BadCall,
    Halted,
}

/// A script-level failure. Faults stop the offending task and leave it in
/// the debugee slot; the host process and unrelated tasks are unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn bad_call(message: impl Into<String>) -> Fault {
        Fault {
            kind: FaultKind::BadCall,
            message: message.into(),
        }
    }

    pub fn undefined(name: &str) -> Fault {
        Fault {
            kind: FaultKind::UndefinedOperation,
            message: format!("Undefined function: {}", name),
        }
    }

    pub fn unbound(name: &str) -> Fault {
        Fault {
            kind: FaultKind::UnboundVariable,
            message: format!("Unknown variable: {}", name),
        }
    }

    pub fn halted(message: impl Into<String>) -> Fault {
        Fault {
            kind: FaultKind::Halted,
            message: message.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Fault {}

impl From<OutOfMemory> for Fault {
    fn from(oom: OutOfMemory) -> Fault {
        Fault {
            kind: FaultKind::OutOfMemory,
            message: oom.to_string(),
        }
    }
}
