use thiserror::Error;

/// Errors surfaced by the TCP transmit path.
///
/// A send that enqueued any bytes never returns one of these; the byte
/// count shadows the error and the condition is picked up again on the
/// next call.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("operation would block")]
    WouldBlock,
    #[error("interrupted by signal")]
    Interrupted,
    #[error("bad user buffer")]
    Fault,
    #[error("broken pipe")]
    Pipe,
    #[error("connection reset by peer")]
    ConnReset,
    #[error("connection aborted")]
    ConnAborted,
    #[error("endpoint not connected")]
    NotConnected,
    #[error("packet buffer wait aborted")]
    NoPktBufs,
    #[error("buffer outside packet payload region")]
    InvalidBuffer,
    #[error("connection timed out")]
    TimedOut,
    #[error("errno {0}")]
    Other(i32),
}

impl SendError {
    pub fn errno(self) -> i32 {
        match self {
            SendError::WouldBlock => libc::EAGAIN,
            SendError::Interrupted => libc::EINTR,
            SendError::Fault => libc::EFAULT,
            SendError::Pipe => libc::EPIPE,
            SendError::ConnReset => libc::ECONNRESET,
            SendError::ConnAborted => libc::ECONNABORTED,
            SendError::NotConnected => libc::ENOTCONN,
            SendError::NoPktBufs => libc::ENOMEM,
            SendError::InvalidBuffer => libc::EINVAL,
            SendError::TimedOut => libc::ETIMEDOUT,
            SendError::Other(e) => e,
        }
    }

    /// Inverse of [`errno`]: used to surface latched `tx_errno` values.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EAGAIN => SendError::WouldBlock,
            libc::EINTR => SendError::Interrupted,
            libc::EFAULT => SendError::Fault,
            libc::EPIPE => SendError::Pipe,
            libc::ECONNRESET => SendError::ConnReset,
            libc::ECONNABORTED => SendError::ConnAborted,
            libc::ENOTCONN => SendError::NotConnected,
            libc::ENOMEM => SendError::NoPktBufs,
            libc::EINVAL => SendError::InvalidBuffer,
            libc::ETIMEDOUT => SendError::TimedOut,
            e => SendError::Other(e),
        }
    }
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool must hold at least one packet")]
    Empty,
    #[error("shmem error")]
    Shmem(#[from] shared_memory::ShmemError),
}
