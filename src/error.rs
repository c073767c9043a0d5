use thiserror::Error;

use solana_program::program_error::ProgramError;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// An active stream already exists for this device and buyer
    #[error("Stream already active for this device and buyer")]
    DuplicateStream,
    #[error("Insufficient deposit")]
    InsufficientDeposit,
    #[error("Rate below the configured minimum")]
    RateTooLow,
    #[error("No active stream")]
    NoActiveStream,
    #[error("Unauthorized")]
    Unauthorized,
    /// A lamport move would underflow or break rent exemption
    #[error("Transfer failed")]
    TransferFailed,
    #[error("Invalid device id")]
    InvalidDeviceId,
    #[error("Device not registered")]
    DeviceNotRegistered,
    #[error("Device already registered")]
    DeviceAlreadyRegistered,
    #[error("Ledger already initialised")]
    AlreadyInitialized,
    #[error("Nothing to withdraw")]
    NothingToWithdraw,
    #[error("Account does not match the derived address")]
    InvalidStreamAccount,
    #[error("Arithmetic overflow")]
    Overflow,
}

impl From<StreamError> for ProgramError {
    fn from(e: StreamError) -> Self {
        ProgramError::Custom(e as u32)
    }
}
