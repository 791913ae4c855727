use thiserror::Error;

/// Runtime result codes of the abstract machine. Everything is reported by
/// return value; `Halt` is the one non-fault code, raised by the HALT
/// instruction with the program's exit value left in PRI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AmxError {
    #[error("data access violation")]
    AccessViolation,
    #[error("code access violation")]
    AccessViolationCode,
    #[error("invalid instruction")]
    InvalidInstruction,
    #[error("invalid operand")]
    InvalidOperand,
    #[error("division with zero")]
    DivisionWithZero,
    #[error("halted")]
    Halt,
    #[error("bounds check failed")]
    Bounds,
    #[error("aborted by callback")]
    CallbackAbort,
}
