use borsh::{BorshDeserialize, BorshSerialize};
use solana_program::{
    program_error::ProgramError,
    program_pack::{IsInitialized, Sealed},
    pubkey::Pubkey,
};

use crate::error::StreamError;

pub const CONFIG_SEED: &[u8] = b"config";
pub const DEVICE_SEED: &[u8] = b"device";
pub const STREAM_SEED: &[u8] = b"stream";

/// Device ids are used as PDA seeds, which cap a single seed at 32 bytes.
pub const MAX_DEVICE_ID_LEN: usize = 32;

pub fn validate_device_id(device_id: &str) -> Result<(), StreamError> {
    if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(StreamError::InvalidDeviceId);
    }
    Ok(())
}

pub fn find_config_address(program_id: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[CONFIG_SEED], program_id)
}

pub fn find_device_address(program_id: &Pubkey, device_id: &str) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[DEVICE_SEED, device_id.as_bytes()], program_id)
}

pub fn find_stream_address(program_id: &Pubkey, device_id: &str, buyer: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(
        &[STREAM_SEED, device_id.as_bytes(), buyer.as_ref()],
        program_id,
    )
}

/// Borsh (de)serialisation of program owned account data.
///
/// Accounts are allocated at `LEN` bytes when created; decoding tolerates the
/// unused tail of a variable length record.
pub trait LedgerAccount: BorshSerialize + BorshDeserialize {
    const LEN: usize;

    fn unpack(data: &[u8]) -> Result<Self, ProgramError> {
        let mut buf = data;
        Self::deserialize(&mut buf).map_err(|_| ProgramError::InvalidAccountData)
    }

    fn pack(&self, dst: &mut [u8]) -> Result<(), ProgramError> {
        let mut writer = dst;
        self.serialize(&mut writer)
            .map_err(|_| ProgramError::AccountDataTooSmall)
    }
}

/// Ledger wide settings, stored at the config PDA
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConfigAccount {
    pub is_initialized: bool,
    pub authority: Pubkey,
    /// Lowest accepted rate, in lamports per second
    pub min_rate: u64,
}

impl Sealed for ConfigAccount {}

impl IsInitialized for ConfigAccount {
    fn is_initialized(&self) -> bool {
        self.is_initialized
    }
}

impl LedgerAccount for ConfigAccount {
    const LEN: usize = 1 + 32 + 8;
}

/// Payment side of a registered device: who gets paid, what they have
/// earned and who has ever streamed from it.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceAccount {
    pub is_initialized: bool,
    pub owner: Pubkey,
    pub device_id: String,
    pub registered_at: i64,
    /// Settled earnings not yet paid out to the owner
    pub withdrawable: u64,
    pub total_earned: u64,
    pub buyers: Vec<Pubkey>,
}

impl Sealed for DeviceAccount {}

impl IsInitialized for DeviceAccount {
    fn is_initialized(&self) -> bool {
        self.is_initialized
    }
}

impl LedgerAccount for DeviceAccount {
    /// Size at registration, before any buyer is recorded
    const LEN: usize = Self::BASE_LEN + MAX_DEVICE_ID_LEN;
}

impl DeviceAccount {
    const BASE_LEN: usize = 1 + 32 + 4 + 8 + 8 + 8 + 4;
    const BUYER_LEN: usize = 32;

    /// Bytes needed to store the record as it is now. The buyer list grows
    /// the account by one key per new buyer.
    pub fn space(&self) -> usize {
        (Self::BASE_LEN + self.device_id.len() + Self::BUYER_LEN * self.buyers.len()).max(Self::LEN)
    }

    pub fn new(owner: Pubkey, device_id: String, registered_at: i64) -> Self {
        Self {
            is_initialized: true,
            owner,
            device_id,
            registered_at,
            withdrawable: 0,
            total_earned: 0,
            buyers: Vec::new(),
        }
    }

    /// Records `buyer` once and reports whether it was new.
    pub fn add_buyer(&mut self, buyer: Pubkey) -> bool {
        if self.buyers.contains(&buyer) {
            return false;
        }
        self.buyers.push(buyer);
        true
    }

    pub fn credit(&mut self, amount: u64) -> Result<(), StreamError> {
        self.withdrawable = self
            .withdrawable
            .checked_add(amount)
            .ok_or(StreamError::Overflow)?;
        self.total_earned = self
            .total_earned
            .checked_add(amount)
            .ok_or(StreamError::Overflow)?;
        Ok(())
    }

    pub fn take_withdrawable(&mut self) -> u64 {
        std::mem::take(&mut self.withdrawable)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    Uninitialized = 0,
    Active,
    /// Deposit ran out during settlement
    Exhausted,
    /// Stopped by the buyer
    Terminated,
}

/// Outcome of moving accrued payment from the deposit to the provider.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Settlement {
    pub amount: u64,
    pub paid_through: i64,
    pub exhausted: bool,
}

/// One metered stream for a (device, buyer) pair
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct StreamAccount {
    pub status: u8,
    pub device: Pubkey,
    pub buyer: Pubkey,
    pub provider: Pubkey,
    pub start_time: i64,
    /// Lamports per second
    pub rate: u64,
    pub last_settlement_time: i64,
    pub deposit_balance: u64,
}

impl Sealed for StreamAccount {}

impl IsInitialized for StreamAccount {
    fn is_initialized(&self) -> bool {
        self.status != StreamStatus::Uninitialized as u8
    }
}

impl LedgerAccount for StreamAccount {
    const LEN: usize = 1 + 32 * 3 + 8 + 8 + 8 + 8;
}

impl StreamAccount {
    pub fn open(
        device: Pubkey,
        buyer: Pubkey,
        provider: Pubkey,
        rate: u64,
        deposit: u64,
        now: i64,
    ) -> Self {
        Self {
            status: StreamStatus::Active as u8,
            device,
            buyer,
            provider,
            start_time: now,
            rate,
            last_settlement_time: now,
            deposit_balance: deposit,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == StreamStatus::Active as u8
    }

    pub fn is_exhausted(&self) -> bool {
        self.status == StreamStatus::Exhausted as u8
    }

    pub fn is_terminated(&self) -> bool {
        self.status == StreamStatus::Terminated as u8
    }

    /// Seconds since the last settlement; a clock behind it counts as zero.
    pub fn elapsed(&self, now: i64) -> u64 {
        now.saturating_sub(self.last_settlement_time).max(0) as u64
    }

    fn owed(&self, now: i64) -> u128 {
        self.elapsed(now) as u128 * self.rate as u128
    }

    /// What the next settlement at `now` would move to the provider.
    pub fn pending_payment(&self, now: i64) -> u64 {
        if !self.is_active() {
            return 0;
        }
        self.owed(now).min(self.deposit_balance as u128) as u64
    }

    /// True when settling at `now` would use up the whole deposit.
    pub fn is_exhausted_at(&self, now: i64) -> bool {
        self.is_active() && self.owed(now) >= self.deposit_balance as u128
    }

    /// Moves accrued payment out of the deposit.
    ///
    /// On a shortfall the whole balance is paid, the settlement time only
    /// advances by the seconds that balance covers (rounded up) and the
    /// stream is exhausted.
    pub fn settle(&mut self, now: i64) -> Settlement {
        if !self.is_active() {
            return Settlement {
                amount: 0,
                paid_through: self.last_settlement_time,
                exhausted: false,
            };
        }

        let owed = self.owed(now);
        let balance = self.deposit_balance;

        if owed < balance as u128 {
            let amount = owed as u64;
            self.deposit_balance = balance - amount;
            if now > self.last_settlement_time {
                self.last_settlement_time = now;
            }
            return Settlement {
                amount,
                paid_through: self.last_settlement_time,
                exhausted: false,
            };
        }

        let paid_seconds = if self.rate == 0 {
            0
        } else {
            balance.div_ceil(self.rate)
        };
        self.last_settlement_time = self.last_settlement_time.saturating_add(paid_seconds as i64);
        self.deposit_balance = 0;
        self.status = StreamStatus::Exhausted as u8;

        Settlement {
            amount: balance,
            paid_through: self.last_settlement_time,
            exhausted: true,
        }
    }

    pub fn add_deposit(&mut self, amount: u64) -> Result<(), StreamError> {
        self.deposit_balance = self
            .deposit_balance
            .checked_add(amount)
            .ok_or(StreamError::Overflow)?;
        Ok(())
    }

    /// Ends the stream and returns the refund owed to the buyer.
    pub fn stop(&mut self) -> u64 {
        self.status = StreamStatus::Terminated as u8;
        std::mem::take(&mut self.deposit_balance)
    }
}
