//! Lifecycle events. They are the only way observers learn about streams, so
//! every one carries the device id and the counterparty it concerns.

use borsh::{BorshDeserialize, BorshSerialize};
use solana_program::{log::sol_log_data, msg, program_error::ProgramError, pubkey::Pubkey};

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    DeviceRegistered {
        device_id: String,
        owner: Pubkey,
        timestamp: i64,
    },
    StreamStarted {
        device_id: String,
        buyer: Pubkey,
        provider: Pubkey,
        rate: u64,
        deposit: u64,
        timestamp: i64,
    },
    DepositAdded {
        device_id: String,
        buyer: Pubkey,
        amount: u64,
    },
    PaymentProcessed {
        device_id: String,
        buyer: Pubkey,
        provider: Pubkey,
        amount: u64,
    },
    /// Also emitted, with a zero refund, when a stream runs out of deposit.
    StreamStopped {
        device_id: String,
        buyer: Pubkey,
        refund: u64,
    },
    EarningsWithdrawn {
        device_id: String,
        owner: Pubkey,
        amount: u64,
    },
}

impl StreamEvent {
    pub fn device_id(&self) -> &str {
        match self {
            StreamEvent::DeviceRegistered { device_id, .. }
            | StreamEvent::StreamStarted { device_id, .. }
            | StreamEvent::DepositAdded { device_id, .. }
            | StreamEvent::PaymentProcessed { device_id, .. }
            | StreamEvent::StreamStopped { device_id, .. }
            | StreamEvent::EarningsWithdrawn { device_id, .. } => device_id,
        }
    }

    /// Writes the event to the transaction log as `Program data: <base64>`.
    pub fn emit(&self) -> Result<(), ProgramError> {
        let data = borsh::to_vec(self).map_err(|_| ProgramError::BorshIoError("event".to_string()))?;
        msg!("[DepinStream] event {:?}", self);
        sol_log_data(&[&data]);
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        Self::try_from_slice(data).ok()
    }
}
