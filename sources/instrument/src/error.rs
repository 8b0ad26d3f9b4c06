use thiserror::Error;

#[derive(Error, Debug)]
pub enum InstrumentError {
    #[error("could not read class file: {0}")]
    ClassFormat(anyhow::Error),

    #[error("skipped {method}: {reason}")]
    Skipped { method: String, reason: String },

    #[error("constant pool of {class} cannot take {requested} more entries")]
    PoolExhausted { class: String, requested: u16 },

    #[error("code of {method} would grow to {length} bytes")]
    CodeTooLarge { method: String, length: usize },

    #[error("no method ids left to assign")]
    MethodIdsExhausted,

    #[error("{method} has no bytecode to scan")]
    Unscannable { method: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl InstrumentError {
    /// Bugs in the engine or its caller, as opposed to conditions of the
    /// class being instrumented.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            InstrumentError::Internal(_) | InstrumentError::Unscannable { .. }
        )
    }

    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            InstrumentError::PoolExhausted { .. }
                | InstrumentError::CodeTooLarge { .. }
                | InstrumentError::MethodIdsExhausted
        )
    }
}

pub type InstrumentResult<T> = Result<T, InstrumentError>;

#[macro_export]
macro_rules! internal {
    ($msg:literal $(,)?) => {
        $crate::error::InstrumentError::Internal(anyhow::anyhow!($msg))
    };
    ($err:expr $(,)?) => {
        $crate::error::InstrumentError::Internal(anyhow::anyhow!($err))
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::InstrumentError::Internal(anyhow::anyhow!($fmt, $($arg)*))
    };
}
