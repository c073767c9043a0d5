//! Off-chain view of devices and streams, kept up to date by folding program
//! events in the order the cluster confirmed them. Lets a marketplace answer
//! "which devices exist" and "who is streaming what" without rescanning
//! history.

use std::collections::{BTreeMap, BTreeSet};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use solana_program::pubkey::Pubkey;

use crate::event::StreamEvent;

const PROGRAM_DATA_PREFIX: &str = "Program data: ";

/// Decodes a `Program data:` transaction log line into an event.
pub fn parse_log_line(line: &str) -> Option<StreamEvent> {
    let payload = line.strip_prefix(PROGRAM_DATA_PREFIX)?;
    let field = payload.split_whitespace().next()?;
    let data = STANDARD.decode(field).ok()?;
    StreamEvent::decode(&data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedStream {
    pub rate: u64,
    pub started_at: i64,
    /// Initial deposit plus every top up
    pub deposited: u64,
    pub settled: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedDevice {
    pub owner: Pubkey,
    pub registered_at: Option<i64>,
    pub buyers: BTreeSet<Pubkey>,
    pub active: BTreeMap<Pubkey, IndexedStream>,
    pub total_settled: u64,
    pub total_withdrawn: u64,
}

impl IndexedDevice {
    fn new(owner: Pubkey) -> Self {
        Self {
            owner,
            registered_at: None,
            buyers: BTreeSet::new(),
            active: BTreeMap::new(),
            total_settled: 0,
            total_withdrawn: 0,
        }
    }

    /// Earnings settled to the device but not yet withdrawn by its owner.
    pub fn unwithdrawn(&self) -> u64 {
        self.total_settled.saturating_sub(self.total_withdrawn)
    }
}

#[derive(Debug, Default, Clone)]
pub struct StreamIndex {
    devices: BTreeMap<String, IndexedDevice>,
    applied: u64,
}

impl StreamIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn apply(&mut self, event: &StreamEvent) {
        self.applied += 1;

        match event {
            StreamEvent::DeviceRegistered {
                device_id,
                owner,
                timestamp,
            } => {
                let device = self
                    .devices
                    .entry(device_id.clone())
                    .or_insert_with(|| IndexedDevice::new(*owner));
                device.owner = *owner;
                device.registered_at = Some(*timestamp);
            }
            StreamEvent::StreamStarted {
                device_id,
                buyer,
                provider,
                rate,
                deposit,
                timestamp,
            } => {
                let device = self
                    .devices
                    .entry(device_id.clone())
                    .or_insert_with(|| IndexedDevice::new(*provider));
                device.buyers.insert(*buyer);
                device.active.insert(
                    *buyer,
                    IndexedStream {
                        rate: *rate,
                        started_at: *timestamp,
                        deposited: *deposit,
                        settled: 0,
                    },
                );
            }
            StreamEvent::DepositAdded {
                device_id,
                buyer,
                amount,
            } => {
                if let Some(stream) = self.stream_mut(device_id, buyer) {
                    stream.deposited = stream.deposited.saturating_add(*amount);
                }
            }
            StreamEvent::PaymentProcessed {
                device_id,
                buyer,
                amount,
                ..
            } => {
                if let Some(stream) = self.stream_mut(device_id, buyer) {
                    stream.settled = stream.settled.saturating_add(*amount);
                }
                if let Some(device) = self.devices.get_mut(device_id) {
                    device.total_settled = device.total_settled.saturating_add(*amount);
                }
            }
            StreamEvent::StreamStopped {
                device_id, buyer, ..
            } => {
                if let Some(device) = self.devices.get_mut(device_id) {
                    device.active.remove(buyer);
                }
            }
            StreamEvent::EarningsWithdrawn {
                device_id, amount, ..
            } => {
                if let Some(device) = self.devices.get_mut(device_id) {
                    device.total_withdrawn = device.total_withdrawn.saturating_add(*amount);
                }
            }
        }
    }

    /// Applies every event found in a transaction's log messages and returns
    /// how many were applied.
    pub fn ingest_logs<I, S>(&mut self, logs: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut count = 0;
        for line in logs {
            if let Some(event) = parse_log_line(line.as_ref()) {
                self.apply(&event);
                count += 1;
            }
        }
        count
    }

    pub fn device(&self, device_id: &str) -> Option<&IndexedDevice> {
        self.devices.get(device_id)
    }

    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    pub fn provider_devices(&self, owner: &Pubkey) -> Vec<&str> {
        self.devices
            .iter()
            .filter(|(_, device)| device.owner == *owner)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn buyers(&self, device_id: &str) -> Vec<Pubkey> {
        self.devices
            .get(device_id)
            .map(|device| device.buyers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn active_streams(&self, device_id: &str) -> Vec<(Pubkey, IndexedStream)> {
        self.devices
            .get(device_id)
            .map(|device| device.active.iter().map(|(b, s)| (*b, *s)).collect())
            .unwrap_or_default()
    }

    fn stream_mut(&mut self, device_id: &str, buyer: &Pubkey) -> Option<&mut IndexedStream> {
        self.devices.get_mut(device_id)?.active.get_mut(buyer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_line(event: &StreamEvent) -> String {
        format!(
            "{}{}",
            PROGRAM_DATA_PREFIX,
            STANDARD.encode(borsh::to_vec(event).unwrap())
        )
    }

    #[test]
    fn tracks_a_stream_through_its_lifecycle() {
        let owner = Pubkey::new_unique();
        let buyer = Pubkey::new_unique();
        let device_id = "weather-12".to_string();
        let mut index = StreamIndex::new();

        index.apply(&StreamEvent::DeviceRegistered {
            device_id: device_id.clone(),
            owner,
            timestamp: 100,
        });
        index.apply(&StreamEvent::StreamStarted {
            device_id: device_id.clone(),
            buyer,
            provider: owner,
            rate: 2,
            deposit: 50,
            timestamp: 200,
        });
        index.apply(&StreamEvent::DepositAdded {
            device_id: device_id.clone(),
            buyer,
            amount: 10,
        });
        index.apply(&StreamEvent::PaymentProcessed {
            device_id: device_id.clone(),
            buyer,
            provider: owner,
            amount: 8,
        });

        let active = index.active_streams(&device_id);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].1.deposited, 60);
        assert_eq!(active[0].1.settled, 8);

        index.apply(&StreamEvent::StreamStopped {
            device_id: device_id.clone(),
            buyer,
            refund: 52,
        });
        index.apply(&StreamEvent::EarningsWithdrawn {
            device_id: device_id.clone(),
            owner,
            amount: 8,
        });

        assert!(index.active_streams(&device_id).is_empty());
        assert_eq!(index.buyers(&device_id), vec![buyer]);
        let device = index.device(&device_id).unwrap();
        assert_eq!(device.total_settled, 8);
        assert_eq!(device.unwithdrawn(), 0);
        assert_eq!(device.registered_at, Some(100));
        assert_eq!(index.applied(), 6);
    }

    #[test]
    fn groups_devices_by_provider() {
        let alice = Pubkey::new_unique();
        let bob = Pubkey::new_unique();
        let mut index = StreamIndex::new();
        for (id, owner) in [("a-1", alice), ("b-1", bob), ("a-2", alice)] {
            index.apply(&StreamEvent::DeviceRegistered {
                device_id: id.to_string(),
                owner,
                timestamp: 0,
            });
        }

        assert_eq!(index.provider_devices(&alice), vec!["a-1", "a-2"]);
        assert_eq!(index.device_ids().count(), 3);
        assert!(index.buyers("missing").is_empty());
    }

    #[test]
    fn ingests_only_program_data_lines() {
        let owner = Pubkey::new_unique();
        let event = StreamEvent::DeviceRegistered {
            device_id: "gps-4".to_string(),
            owner,
            timestamp: 7,
        };
        let logs = vec![
            "Program 11111111111111111111111111111111 invoke [1]".to_string(),
            "Program log: [DepinStream] Registered device gps-4".to_string(),
            log_line(&event),
            "Program data: not-base64!".to_string(),
        ];

        let mut index = StreamIndex::new();
        assert_eq!(index.ingest_logs(&logs), 1);
        assert_eq!(index.device("gps-4").unwrap().owner, owner);
        assert_eq!(parse_log_line(&logs[2]), Some(event));
    }
}
