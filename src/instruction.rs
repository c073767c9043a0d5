use borsh::{BorshDeserialize, BorshSerialize};
use solana_program::{
    instruction::{AccountMeta, Instruction},
    program_error::ProgramError,
    pubkey::Pubkey,
    system_program,
};

use crate::state::{
    find_config_address, find_device_address, find_stream_address, validate_device_id,
};

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum StreamInstruction {
    /// Create the ledger configuration
    ///
    /// Accounts expected:
    /// 0. `[writable, signer]` Authority, pays for the config account
    /// 1. `[writable]` Config PDA
    /// 2. `[]` System program
    Initialize { min_rate: u64 },

    /// Change the minimum stream rate
    ///
    /// Accounts expected:
    /// 0. `[signer]` Authority recorded in the config
    /// 1. `[writable]` Config PDA
    SetMinRate { min_rate: u64 },

    /// Register a device so it can be streamed from
    ///
    /// Accounts expected:
    /// 0. `[writable, signer]` Device owner (provider)
    /// 1. `[writable]` Device PDA
    /// 2. `[]` System program
    RegisterDevice { device_id: String },

    /// Open a stream and fund it with `deposit` lamports
    ///
    /// Accounts expected:
    /// 0. `[writable, signer]` Buyer
    /// 1. `[]` Config PDA
    /// 2. `[writable]` Device PDA
    /// 3. `[writable]` Stream PDA for (device, buyer)
    /// 4. `[]` System program
    StartStream {
        device_id: String,
        rate: u64,
        deposit: u64,
    },

    /// Top up an active stream
    ///
    /// Accounts expected:
    /// 0. `[writable, signer]` Buyer
    /// 1. `[writable]` Stream PDA
    /// 2. `[]` System program
    AddDeposit { device_id: String, amount: u64 },

    /// Settle accrued payment into the device's earnings. Anyone may call.
    ///
    /// Accounts expected:
    /// 0. `[writable]` Device PDA
    /// 1. `[writable]` Stream PDA
    ProcessPayment { device_id: String, buyer: Pubkey },

    /// Settle, then refund the remaining deposit to the buyer
    ///
    /// Accounts expected:
    /// 0. `[writable, signer]` Buyer of the stream, receives the refund
    /// 1. `[writable]` Device PDA
    /// 2. `[writable]` Stream PDA for (device, buyer)
    StopStream { device_id: String, buyer: Pubkey },

    /// Settle the buyer's stream, then pay the device earnings to its owner
    ///
    /// Accounts expected:
    /// 0. `[writable, signer]` Device owner
    /// 1. `[writable]` Device PDA
    /// 2. `[writable]` Stream PDA for (device, buyer)
    Withdraw { device_id: String, buyer: Pubkey },
}

impl StreamInstruction {
    pub fn unpack(input: &[u8]) -> Result<Self, ProgramError> {
        Self::try_from_slice(input).map_err(|_| ProgramError::InvalidInstructionData)
    }

    pub fn pack(&self) -> Result<Vec<u8>, ProgramError> {
        borsh::to_vec(self).map_err(|_| ProgramError::InvalidInstructionData)
    }
}

pub fn initialize(
    program_id: Pubkey,
    authority: Pubkey,
    min_rate: u64,
) -> Result<Instruction, ProgramError> {
    let (config, _) = find_config_address(&program_id);
    let accounts = vec![
        AccountMeta::new(authority, true),
        AccountMeta::new(config, false),
        AccountMeta::new_readonly(system_program::id(), false),
    ];

    Ok(Instruction {
        program_id,
        accounts,
        data: StreamInstruction::Initialize { min_rate }.pack()?,
    })
}

pub fn set_min_rate(
    program_id: Pubkey,
    authority: Pubkey,
    min_rate: u64,
) -> Result<Instruction, ProgramError> {
    let (config, _) = find_config_address(&program_id);
    let accounts = vec![
        AccountMeta::new_readonly(authority, true),
        AccountMeta::new(config, false),
    ];

    Ok(Instruction {
        program_id,
        accounts,
        data: StreamInstruction::SetMinRate { min_rate }.pack()?,
    })
}

pub fn register_device(
    program_id: Pubkey,
    owner: Pubkey,
    device_id: &str,
) -> Result<Instruction, ProgramError> {
    validate_device_id(device_id)?;
    let (device, _) = find_device_address(&program_id, device_id);
    let accounts = vec![
        AccountMeta::new(owner, true),
        AccountMeta::new(device, false),
        AccountMeta::new_readonly(system_program::id(), false),
    ];

    Ok(Instruction {
        program_id,
        accounts,
        data: StreamInstruction::RegisterDevice {
            device_id: device_id.to_string(),
        }
        .pack()?,
    })
}

pub fn start_stream(
    program_id: Pubkey,
    buyer: Pubkey,
    device_id: &str,
    rate: u64,
    deposit: u64,
) -> Result<Instruction, ProgramError> {
    validate_device_id(device_id)?;
    let (config, _) = find_config_address(&program_id);
    let (device, _) = find_device_address(&program_id, device_id);
    let (stream, _) = find_stream_address(&program_id, device_id, &buyer);
    let accounts = vec![
        AccountMeta::new(buyer, true),
        AccountMeta::new_readonly(config, false),
        AccountMeta::new(device, false),
        AccountMeta::new(stream, false),
        AccountMeta::new_readonly(system_program::id(), false),
    ];

    Ok(Instruction {
        program_id,
        accounts,
        data: StreamInstruction::StartStream {
            device_id: device_id.to_string(),
            rate,
            deposit,
        }
        .pack()?,
    })
}

pub fn add_deposit(
    program_id: Pubkey,
    buyer: Pubkey,
    device_id: &str,
    amount: u64,
) -> Result<Instruction, ProgramError> {
    validate_device_id(device_id)?;
    let (stream, _) = find_stream_address(&program_id, device_id, &buyer);
    let accounts = vec![
        AccountMeta::new(buyer, true),
        AccountMeta::new(stream, false),
        AccountMeta::new_readonly(system_program::id(), false),
    ];

    Ok(Instruction {
        program_id,
        accounts,
        data: StreamInstruction::AddDeposit {
            device_id: device_id.to_string(),
            amount,
        }
        .pack()?,
    })
}

pub fn process_payment(
    program_id: Pubkey,
    device_id: &str,
    buyer: Pubkey,
) -> Result<Instruction, ProgramError> {
    validate_device_id(device_id)?;
    let (device, _) = find_device_address(&program_id, device_id);
    let (stream, _) = find_stream_address(&program_id, device_id, &buyer);
    let accounts = vec![AccountMeta::new(device, false), AccountMeta::new(stream, false)];

    Ok(Instruction {
        program_id,
        accounts,
        data: StreamInstruction::ProcessPayment {
            device_id: device_id.to_string(),
            buyer,
        }
        .pack()?,
    })
}

pub fn stop_stream(
    program_id: Pubkey,
    buyer: Pubkey,
    device_id: &str,
) -> Result<Instruction, ProgramError> {
    validate_device_id(device_id)?;
    let (device, _) = find_device_address(&program_id, device_id);
    let (stream, _) = find_stream_address(&program_id, device_id, &buyer);
    let accounts = vec![
        AccountMeta::new(buyer, true),
        AccountMeta::new(device, false),
        AccountMeta::new(stream, false),
    ];

    Ok(Instruction {
        program_id,
        accounts,
        data: StreamInstruction::StopStream {
            device_id: device_id.to_string(),
            buyer,
        }
        .pack()?,
    })
}

pub fn withdraw(
    program_id: Pubkey,
    owner: Pubkey,
    device_id: &str,
    buyer: Pubkey,
) -> Result<Instruction, ProgramError> {
    validate_device_id(device_id)?;
    let (device, _) = find_device_address(&program_id, device_id);
    let (stream, _) = find_stream_address(&program_id, device_id, &buyer);
    let accounts = vec![
        AccountMeta::new(owner, true),
        AccountMeta::new(device, false),
        AccountMeta::new(stream, false),
    ];

    Ok(Instruction {
        program_id,
        accounts,
        data: StreamInstruction::Withdraw {
            device_id: device_id.to_string(),
            buyer,
        }
        .pack()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::StreamError, state::MAX_DEVICE_ID_LEN};

    #[test]
    fn unpacks_packed_start_stream() {
        let ix = StreamInstruction::StartStream {
            device_id: "soil-sensor".to_string(),
            rate: 3,
            deposit: 900,
        };
        let data = ix.pack().unwrap();
        assert_eq!(data[0], 3);
        assert_eq!(StreamInstruction::unpack(&data).unwrap(), ix);
    }

    #[test]
    fn rejects_unknown_tag_and_truncated_data() {
        assert_eq!(
            StreamInstruction::unpack(&[42]),
            Err(ProgramError::InvalidInstructionData)
        );
        assert_eq!(
            StreamInstruction::unpack(&[]),
            Err(ProgramError::InvalidInstructionData)
        );
        let data = StreamInstruction::Initialize { min_rate: 1 }.pack().unwrap();
        assert_eq!(
            StreamInstruction::unpack(&data[..data.len() - 1]),
            Err(ProgramError::InvalidInstructionData)
        );
    }

    #[test]
    fn builders_reject_unusable_device_ids() {
        let program_id = Pubkey::new_unique();
        let owner = Pubkey::new_unique();
        let too_long = "d".repeat(MAX_DEVICE_ID_LEN + 1);
        for device_id in ["", too_long.as_str()] {
            assert_eq!(
                register_device(program_id, owner, device_id),
                Err(StreamError::InvalidDeviceId.into())
            );
            assert_eq!(
                start_stream(program_id, owner, device_id, 1, 1),
                Err(StreamError::InvalidDeviceId.into())
            );
        }
    }

    #[test]
    fn stream_builder_targets_the_pair_address() {
        let program_id = Pubkey::new_unique();
        let buyer = Pubkey::new_unique();
        let ix = start_stream(program_id, buyer, "cam-9", 5, 100).unwrap();
        let (stream, _) = find_stream_address(&program_id, "cam-9", &buyer);
        assert_eq!(ix.accounts[3].pubkey, stream);
        assert!(ix.accounts[0].is_signer);
        assert!(!ix.accounts[1].is_writable);
    }
}
