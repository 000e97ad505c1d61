//! In-memory hardware records, keyed by MAC and IP.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use macaddr::MacAddr6;

use super::{BackendError, BackendReader, HardwareRecord};

#[derive(Default)]
pub struct MemoryBackend {
    by_mac: HashMap<MacAddr6, HardwareRecord>,
    by_ip: HashMap<IpAddr, HardwareRecord>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mac: MacAddr6, record: HardwareRecord) {
        if let Some(ip) = record.dhcp.ip {
            self.by_ip.insert(IpAddr::V4(ip), record.clone());
        }
        self.by_mac.insert(mac, record);
    }
}

#[async_trait]
impl BackendReader for MemoryBackend {
    async fn get_by_mac(&self, mac: MacAddr6) -> Result<HardwareRecord, BackendError> {
        self.by_mac
            .get(&mac)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(mac.to_string()))
    }

    async fn get_by_ip(&self, ip: IpAddr) -> Result<HardwareRecord, BackendError> {
        self.by_ip
            .get(&ip)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(ip.to_string()))
    }
}
