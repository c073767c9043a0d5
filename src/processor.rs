use solana_program::{
    account_info::{next_account_info, AccountInfo},
    clock::Clock,
    entrypoint::ProgramResult,
    msg,
    program::{invoke, invoke_signed},
    program_error::ProgramError,
    program_pack::IsInitialized,
    pubkey::Pubkey,
    rent::Rent,
    system_instruction, system_program,
    sysvar::Sysvar,
};

use crate::{
    error::StreamError,
    event::StreamEvent,
    instruction::StreamInstruction,
    state::{
        find_config_address, find_device_address, find_stream_address, validate_device_id,
        ConfigAccount, DeviceAccount, LedgerAccount, Settlement, StreamAccount, CONFIG_SEED,
        DEVICE_SEED, STREAM_SEED,
    },
};

pub struct Processor;
impl Processor {
    pub fn process(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = StreamInstruction::unpack(instruction_data)?;

        match instruction {
            StreamInstruction::Initialize { min_rate } => {
                Self::initialize(accounts, program_id, min_rate)
            }
            StreamInstruction::SetMinRate { min_rate } => {
                Self::set_min_rate(accounts, program_id, min_rate)
            }
            StreamInstruction::RegisterDevice { device_id } => {
                Self::register_device(accounts, program_id, &device_id)
            }
            StreamInstruction::StartStream {
                device_id,
                rate,
                deposit,
            } => Self::start_stream(accounts, program_id, &device_id, rate, deposit),
            StreamInstruction::AddDeposit { device_id, amount } => {
                Self::add_deposit(accounts, program_id, &device_id, amount)
            }
            StreamInstruction::ProcessPayment { device_id, buyer } => {
                Self::process_payment(accounts, program_id, &device_id, &buyer)
            }
            StreamInstruction::StopStream { device_id, buyer } => {
                Self::stop_stream(accounts, program_id, &device_id, &buyer)
            }
            StreamInstruction::Withdraw { device_id, buyer } => {
                Self::withdraw(accounts, program_id, &device_id, &buyer)
            }
        }
    }

    fn initialize(accounts: &[AccountInfo], program_id: &Pubkey, min_rate: u64) -> ProgramResult {
        let accounts_iter = &mut accounts.iter();
        let authority = next_account_info(accounts_iter)?;
        let config_account = next_account_info(accounts_iter)?;
        let system_account = next_account_info(accounts_iter)?;

        Self::check_signer(authority)?;
        Self::check_system_program(system_account)?;

        let (config_key, bump) = find_config_address(program_id);
        Self::check_address(config_account, &config_key)?;

        if config_account.owner == program_id {
            msg!("[DepinStream] Ledger already initialised");
            return Err(StreamError::AlreadyInitialized.into());
        }

        if min_rate == 0 {
            msg!("[DepinStream] Minimum rate must be positive");
            return Err(StreamError::RateTooLow.into());
        }

        Self::create_pda_account(
            authority,
            config_account,
            system_account,
            program_id,
            ConfigAccount::LEN,
            &[CONFIG_SEED, &[bump]],
        )?;

        let config = ConfigAccount {
            is_initialized: true,
            authority: *authority.key,
            min_rate,
        };
        config.pack(&mut config_account.try_borrow_mut_data()?)?;

        msg!("[DepinStream] Initialised ledger: {:?}", config);

        Ok(())
    }

    fn set_min_rate(accounts: &[AccountInfo], program_id: &Pubkey, min_rate: u64) -> ProgramResult {
        let accounts_iter = &mut accounts.iter();
        let authority = next_account_info(accounts_iter)?;
        let config_account = next_account_info(accounts_iter)?;

        Self::check_signer(authority)?;
        let mut config = Self::load_config(program_id, config_account)?;

        if config.authority != *authority.key {
            msg!("[DepinStream] Signer is not the ledger authority");
            return Err(StreamError::Unauthorized.into());
        }

        if min_rate == 0 {
            msg!("[DepinStream] Minimum rate must be positive");
            return Err(StreamError::RateTooLow.into());
        }

        msg!("[DepinStream] Minimum rate {} -> {}", config.min_rate, min_rate);
        config.min_rate = min_rate;
        config.pack(&mut config_account.try_borrow_mut_data()?)?;

        Ok(())
    }

    fn register_device(accounts: &[AccountInfo], program_id: &Pubkey, device_id: &str) -> ProgramResult {
        let accounts_iter = &mut accounts.iter();
        let owner = next_account_info(accounts_iter)?;
        let device_account = next_account_info(accounts_iter)?;
        let system_account = next_account_info(accounts_iter)?;

        validate_device_id(device_id)?;
        Self::check_signer(owner)?;
        Self::check_system_program(system_account)?;

        let (device_key, bump) = find_device_address(program_id, device_id);
        Self::check_address(device_account, &device_key)?;

        if device_account.owner == program_id {
            msg!("[DepinStream] Device {} already registered", device_id);
            return Err(StreamError::DeviceAlreadyRegistered.into());
        }

        Self::create_pda_account(
            owner,
            device_account,
            system_account,
            program_id,
            DeviceAccount::LEN,
            &[DEVICE_SEED, device_id.as_bytes(), &[bump]],
        )?;

        let now = Clock::get()?.unix_timestamp;
        let device = DeviceAccount::new(*owner.key, device_id.to_string(), now);
        device.pack(&mut device_account.try_borrow_mut_data()?)?;

        msg!("[DepinStream] Registered device {} for {}", device_id, owner.key);

        StreamEvent::DeviceRegistered {
            device_id: device_id.to_string(),
            owner: *owner.key,
            timestamp: now,
        }
        .emit()
    }

    fn start_stream(
        accounts: &[AccountInfo],
        program_id: &Pubkey,
        device_id: &str,
        rate: u64,
        deposit: u64,
    ) -> ProgramResult {
        let accounts_iter = &mut accounts.iter();
        let buyer = next_account_info(accounts_iter)?;
        let config_account = next_account_info(accounts_iter)?;
        let device_account = next_account_info(accounts_iter)?;
        let stream_account = next_account_info(accounts_iter)?;
        let system_account = next_account_info(accounts_iter)?;

        validate_device_id(device_id)?;
        Self::check_signer(buyer)?;
        Self::check_system_program(system_account)?;

        let config = Self::load_config(program_id, config_account)?;
        if rate < config.min_rate {
            msg!("[DepinStream] Rate {} below minimum {}", rate, config.min_rate);
            return Err(StreamError::RateTooLow.into());
        }

        if deposit == 0 {
            msg!("[DepinStream] Stream needs a deposit");
            return Err(StreamError::InsufficientDeposit.into());
        }

        let mut device = Self::load_device(program_id, device_account, device_id)?;

        let (stream_key, bump) = find_stream_address(program_id, device_id, buyer.key);
        Self::check_address(stream_account, &stream_key)?;

        let now = Clock::get()?.unix_timestamp;

        // A previous record for the pair only blocks us while it still has
        // unspent deposit.
        let mut previous = None;
        if stream_account.owner == program_id {
            let mut existing = StreamAccount::unpack(&stream_account.try_borrow_data()?)?;
            if existing.is_active() {
                let settlement = existing.settle(now);
                if !settlement.exhausted {
                    msg!("[DepinStream] Stream already active for {} on {}", buyer.key, device_id);
                    return Err(StreamError::DuplicateStream.into());
                }
                previous = Some((existing, settlement));
            }
        } else {
            Self::create_pda_account(
                buyer,
                stream_account,
                system_account,
                program_id,
                StreamAccount::LEN,
                &[STREAM_SEED, device_id.as_bytes(), buyer.key.as_ref(), &[bump]],
            )?;
        }

        invoke(
            &system_instruction::transfer(buyer.key, stream_account.key, deposit),
            &[buyer.clone(), stream_account.clone(), system_account.clone()],
        )?;

        if device.add_buyer(*buyer.key) {
            Self::grow_device_account(buyer, device_account, system_account, &device)?;
        }

        if let Some((existing, settlement)) = previous {
            Self::apply_settlement(
                device_id,
                &existing,
                settlement,
                &mut device,
                device_account,
                stream_account,
            )?;
        }

        let stream = StreamAccount::open(
            *device_account.key,
            *buyer.key,
            device.owner,
            rate,
            deposit,
            now,
        );

        stream.pack(&mut stream_account.try_borrow_mut_data()?)?;
        device.pack(&mut device_account.try_borrow_mut_data()?)?;

        msg!("[DepinStream] Started stream: {:?}", stream);

        StreamEvent::StreamStarted {
            device_id: device_id.to_string(),
            buyer: *buyer.key,
            provider: device.owner,
            rate,
            deposit,
            timestamp: now,
        }
        .emit()
    }

    fn add_deposit(
        accounts: &[AccountInfo],
        program_id: &Pubkey,
        device_id: &str,
        amount: u64,
    ) -> ProgramResult {
        let accounts_iter = &mut accounts.iter();
        let buyer = next_account_info(accounts_iter)?;
        let stream_account = next_account_info(accounts_iter)?;
        let system_account = next_account_info(accounts_iter)?;

        validate_device_id(device_id)?;
        Self::check_signer(buyer)?;
        Self::check_system_program(system_account)?;

        if amount == 0 {
            msg!("[DepinStream] Deposit must be positive");
            return Err(StreamError::InsufficientDeposit.into());
        }

        let mut stream = Self::load_stream(program_id, stream_account, device_id, buyer.key)?;
        let now = Clock::get()?.unix_timestamp;

        if !stream.is_active() || stream.is_exhausted_at(now) {
            msg!("[DepinStream] Stream is not active");
            return Err(StreamError::NoActiveStream.into());
        }

        invoke(
            &system_instruction::transfer(buyer.key, stream_account.key, amount),
            &[buyer.clone(), stream_account.clone(), system_account.clone()],
        )?;

        stream.add_deposit(amount)?;
        stream.pack(&mut stream_account.try_borrow_mut_data()?)?;

        msg!("[DepinStream] Deposit of {} added: {:?}", amount, stream);

        StreamEvent::DepositAdded {
            device_id: device_id.to_string(),
            buyer: *buyer.key,
            amount,
        }
        .emit()
    }

    fn process_payment(
        accounts: &[AccountInfo],
        program_id: &Pubkey,
        device_id: &str,
        buyer: &Pubkey,
    ) -> ProgramResult {
        let accounts_iter = &mut accounts.iter();
        let device_account = next_account_info(accounts_iter)?;
        let stream_account = next_account_info(accounts_iter)?;

        validate_device_id(device_id)?;
        let mut device = Self::load_device(program_id, device_account, device_id)?;
        let mut stream = Self::load_stream(program_id, stream_account, device_id, buyer)?;

        if !stream.is_active() {
            msg!("[DepinStream] Stream is not active");
            return Err(StreamError::NoActiveStream.into());
        }

        let now = Clock::get()?.unix_timestamp;
        let settlement = stream.settle(now);
        Self::apply_settlement(
            device_id,
            &stream,
            settlement,
            &mut device,
            device_account,
            stream_account,
        )?;

        stream.pack(&mut stream_account.try_borrow_mut_data()?)?;
        device.pack(&mut device_account.try_borrow_mut_data()?)?;

        Ok(())
    }

    fn stop_stream(
        accounts: &[AccountInfo],
        program_id: &Pubkey,
        device_id: &str,
        buyer: &Pubkey,
    ) -> ProgramResult {
        let accounts_iter = &mut accounts.iter();
        let signer = next_account_info(accounts_iter)?;
        let device_account = next_account_info(accounts_iter)?;
        let stream_account = next_account_info(accounts_iter)?;

        validate_device_id(device_id)?;
        Self::check_signer(signer)?;

        let mut device = Self::load_device(program_id, device_account, device_id)?;
        let mut stream = Self::load_stream(program_id, stream_account, device_id, buyer)?;

        if stream.buyer != *signer.key {
            msg!("[DepinStream] Signer doesn't match buyer {}", stream.buyer);
            return Err(StreamError::Unauthorized.into());
        }

        if !stream.is_active() {
            msg!("[DepinStream] Stream is not active");
            return Err(StreamError::NoActiveStream.into());
        }

        let now = Clock::get()?.unix_timestamp;
        let settlement = stream.settle(now);
        Self::apply_settlement(
            device_id,
            &stream,
            settlement,
            &mut device,
            device_account,
            stream_account,
        )?;

        // Exhaustion has already closed the stream with nothing left to refund
        if !settlement.exhausted {
            let refund = stream.stop();
            Self::transfer_lamports(stream_account, signer, refund)?;

            msg!("[DepinStream] Stopped stream, refunded {}", refund);

            StreamEvent::StreamStopped {
                device_id: device_id.to_string(),
                buyer: *signer.key,
                refund,
            }
            .emit()?;
        }

        stream.pack(&mut stream_account.try_borrow_mut_data()?)?;
        device.pack(&mut device_account.try_borrow_mut_data()?)?;

        Ok(())
    }

    fn withdraw(
        accounts: &[AccountInfo],
        program_id: &Pubkey,
        device_id: &str,
        buyer: &Pubkey,
    ) -> ProgramResult {
        let accounts_iter = &mut accounts.iter();
        let owner = next_account_info(accounts_iter)?;
        let device_account = next_account_info(accounts_iter)?;
        let stream_account = next_account_info(accounts_iter)?;

        validate_device_id(device_id)?;
        Self::check_signer(owner)?;

        let mut device = Self::load_device(program_id, device_account, device_id)?;
        if device.owner != *owner.key {
            msg!("[DepinStream] Signer doesn't match device owner");
            return Err(StreamError::Unauthorized.into());
        }

        let mut stream = Self::load_stream(program_id, stream_account, device_id, buyer)?;
        if stream.is_active() {
            let now = Clock::get()?.unix_timestamp;
            let settlement = stream.settle(now);
            Self::apply_settlement(
                device_id,
                &stream,
                settlement,
                &mut device,
                device_account,
                stream_account,
            )?;
            stream.pack(&mut stream_account.try_borrow_mut_data()?)?;
        }

        let amount = device.take_withdrawable();
        if amount == 0 {
            msg!("[DepinStream] Nothing to withdraw for {}", device_id);
            return Err(StreamError::NothingToWithdraw.into());
        }

        Self::transfer_lamports(device_account, owner, amount)?;
        device.pack(&mut device_account.try_borrow_mut_data()?)?;

        msg!("[DepinStream] Withdrawal of {} to {}", amount, owner.key);

        StreamEvent::EarningsWithdrawn {
            device_id: device_id.to_string(),
            owner: *owner.key,
            amount,
        }
        .emit()
    }

    /// Moves a settled amount into the device's earnings and reports it.
    fn apply_settlement(
        device_id: &str,
        stream: &StreamAccount,
        settlement: Settlement,
        device: &mut DeviceAccount,
        device_account: &AccountInfo,
        stream_account: &AccountInfo,
    ) -> ProgramResult {
        if settlement.amount > 0 {
            Self::transfer_lamports(stream_account, device_account, settlement.amount)?;
            device.credit(settlement.amount)?;

            msg!(
                "[DepinStream] Settled {} through {}",
                settlement.amount,
                settlement.paid_through
            );

            StreamEvent::PaymentProcessed {
                device_id: device_id.to_string(),
                buyer: stream.buyer,
                provider: stream.provider,
                amount: settlement.amount,
            }
            .emit()?;
        }

        if settlement.exhausted {
            msg!("[DepinStream] Deposit exhausted for {} on {}", stream.buyer, device_id);

            StreamEvent::StreamStopped {
                device_id: device_id.to_string(),
                buyer: stream.buyer,
                refund: 0,
            }
            .emit()?;
        }

        Ok(())
    }

    /// Reallocates the device account when its buyer list outgrew it; the
    /// new buyer pays the extra rent.
    fn grow_device_account<'a>(
        payer: &AccountInfo<'a>,
        device_account: &AccountInfo<'a>,
        system_account: &AccountInfo<'a>,
        device: &DeviceAccount,
    ) -> ProgramResult {
        let current = device_account.data_len();
        let needed = device.space();
        if needed <= current {
            return Ok(());
        }

        let rent = Rent::get()?;
        let top_up = rent
            .minimum_balance(needed)
            .saturating_sub(rent.minimum_balance(current));
        if top_up > 0 {
            invoke(
                &system_instruction::transfer(payer.key, device_account.key, top_up),
                &[payer.clone(), device_account.clone(), system_account.clone()],
            )?;
        }
        device_account.realloc(needed, false)?;

        msg!("[DepinStream] Device account grown {} -> {} bytes", current, needed);

        Ok(())
    }

    /// Debits a program owned account, keeping it rent exempt.
    fn transfer_lamports(from: &AccountInfo, to: &AccountInfo, amount: u64) -> ProgramResult {
        if amount == 0 {
            return Ok(());
        }

        let minimum = Rent::get()?.minimum_balance(from.data_len());
        let remaining = from
            .lamports()
            .checked_sub(amount)
            .filter(|remaining| *remaining >= minimum)
            .ok_or_else(|| {
                msg!(
                    "[DepinStream] Cannot move {} out of {} lamports",
                    amount,
                    from.lamports()
                );
                StreamError::TransferFailed
            })?;
        let credited = to
            .lamports()
            .checked_add(amount)
            .ok_or(StreamError::TransferFailed)?;

        **from.try_borrow_mut_lamports()? = remaining;
        **to.try_borrow_mut_lamports()? = credited;

        Ok(())
    }

    fn create_pda_account<'a>(
        payer: &AccountInfo<'a>,
        target: &AccountInfo<'a>,
        system_account: &AccountInfo<'a>,
        program_id: &Pubkey,
        space: usize,
        signer_seeds: &[&[u8]],
    ) -> ProgramResult {
        let required = Rent::get()?.minimum_balance(space);

        if target.lamports() == 0 {
            return invoke_signed(
                &system_instruction::create_account(
                    payer.key,
                    target.key,
                    required,
                    space as u64,
                    program_id,
                ),
                &[payer.clone(), target.clone(), system_account.clone()],
                &[signer_seeds],
            );
        }

        // Someone already sent lamports to the address
        let top_up = required.saturating_sub(target.lamports());
        if top_up > 0 {
            invoke(
                &system_instruction::transfer(payer.key, target.key, top_up),
                &[payer.clone(), target.clone(), system_account.clone()],
            )?;
        }
        invoke_signed(
            &system_instruction::allocate(target.key, space as u64),
            &[target.clone(), system_account.clone()],
            &[signer_seeds],
        )?;
        invoke_signed(
            &system_instruction::assign(target.key, program_id),
            &[target.clone(), system_account.clone()],
            &[signer_seeds],
        )
    }

    fn load_config(program_id: &Pubkey, config_account: &AccountInfo) -> Result<ConfigAccount, ProgramError> {
        let (config_key, _) = find_config_address(program_id);
        Self::check_address(config_account, &config_key)?;

        if config_account.owner != program_id {
            msg!("[DepinStream] Ledger is not initialised");
            return Err(ProgramError::UninitializedAccount);
        }

        let config = ConfigAccount::unpack(&config_account.try_borrow_data()?)?;
        if !config.is_initialized() {
            msg!("[DepinStream] Ledger is not initialised");
            return Err(ProgramError::UninitializedAccount);
        }

        Ok(config)
    }

    fn load_device(
        program_id: &Pubkey,
        device_account: &AccountInfo,
        device_id: &str,
    ) -> Result<DeviceAccount, ProgramError> {
        let (device_key, _) = find_device_address(program_id, device_id);
        Self::check_address(device_account, &device_key)?;

        if !device_account.is_writable {
            msg!("[DepinStream] Device account is not writable");
            return Err(ProgramError::InvalidArgument);
        }

        if device_account.owner != program_id {
            msg!("[DepinStream] Device {} is not registered", device_id);
            return Err(StreamError::DeviceNotRegistered.into());
        }

        let device = DeviceAccount::unpack(&device_account.try_borrow_data()?)?;
        if !device.is_initialized() {
            msg!("[DepinStream] Device {} is not registered", device_id);
            return Err(StreamError::DeviceNotRegistered.into());
        }

        Ok(device)
    }

    fn load_stream(
        program_id: &Pubkey,
        stream_account: &AccountInfo,
        device_id: &str,
        buyer: &Pubkey,
    ) -> Result<StreamAccount, ProgramError> {
        let (stream_key, _) = find_stream_address(program_id, device_id, buyer);
        Self::check_address(stream_account, &stream_key)?;

        if !stream_account.is_writable {
            msg!("[DepinStream] Stream account is not writable");
            return Err(ProgramError::InvalidArgument);
        }

        if stream_account.owner != program_id {
            msg!("[DepinStream] No stream for {} on {}", buyer, device_id);
            return Err(StreamError::NoActiveStream.into());
        }

        let stream = StreamAccount::unpack(&stream_account.try_borrow_data()?)?;
        if !stream.is_initialized() {
            msg!("[DepinStream] No stream for {} on {}", buyer, device_id);
            return Err(StreamError::NoActiveStream.into());
        }

        Ok(stream)
    }

    fn check_address(account: &AccountInfo, expected: &Pubkey) -> ProgramResult {
        if account.key != expected {
            msg!("[DepinStream] Account {} != derived {}", account.key, expected);
            return Err(StreamError::InvalidStreamAccount.into());
        }
        Ok(())
    }

    fn check_signer(account: &AccountInfo) -> ProgramResult {
        if !account.is_signer {
            msg!("[DepinStream] {} needs to be signer", account.key);
            return Err(ProgramError::MissingRequiredSignature);
        }
        Ok(())
    }

    fn check_system_program(account: &AccountInfo) -> ProgramResult {
        if !system_program::check_id(account.key) {
            msg!("[DepinStream] Expected the system program");
            return Err(ProgramError::IncorrectProgramId);
        }
        Ok(())
    }
}
