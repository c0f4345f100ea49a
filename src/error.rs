use crate::config::DeviceKind;
use crate::diagnostic::CompileError;

pub type Result<T> = std::result::Result<T, KernelError>;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("execution failed on {device}: {reason}")]
    Execution { device: DeviceKind, reason: String },

    #[error("kernel `{0}` is already executing")]
    Busy(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("binding error: {0}")]
    Binding(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KernelError {
    pub fn execution<S: Into<String>>(device: DeviceKind, reason: S) -> Self {
        KernelError::Execution {
            device,
            reason: reason.into(),
        }
    }

    pub fn binding<S: Into<String>>(msg: S) -> Self {
        KernelError::Binding(msg.into())
    }

    pub fn range<S: Into<String>>(msg: S) -> Self {
        KernelError::InvalidRange(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        KernelError::Config(msg.into())
    }

    /// Errors a fallback device may retry transparently.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KernelError::Execution {
                device: DeviceKind::Accelerator,
                ..
            }
        )
    }
}
