use std::process::ExitCode;

/// How an instance ended, mapped onto its process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Normal,
    Fatal,
    NegotiationFailed,
    /// Shutdown wait timed out or was aborted; secondaries were force-reaped.
    ShutdownForced,
}

impl ExitKind {
    pub fn code(self) -> u8 {
        match self {
            ExitKind::Normal => 0,
            ExitKind::Fatal => 1,
            ExitKind::NegotiationFailed => 2,
            ExitKind::ShutdownForced => 3,
        }
    }
}

impl From<ExitKind> for ExitCode {
    fn from(kind: ExitKind) -> Self {
        ExitCode::from(kind.code())
    }
}
