//! Process-wide subnet cache
//!
//! A subnet's CIDR and security-list attachments never change after
//! creation, so entries are kept for the lifetime of the process.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use ipnet::IpNet;
use tracing::debug;

use super::types::Subnet;

#[derive(Debug, Default)]
pub struct SubnetCache {
    subnets: Mutex<HashMap<String, Subnet>>,
}

impl SubnetCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Subnet>> {
        match self.subnets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Subnet> {
        self.lock().get(id).cloned()
    }

    pub fn insert(&self, subnet: Subnet) {
        debug!("Caching subnet {} ({})", subnet.id, subnet.cidr_block);
        self.lock().insert(subnet.id.clone(), subnet);
    }

    /// The cached subnet whose CIDR contains `ip`.
    pub fn find_by_ip(&self, ip: IpAddr) -> Option<Subnet> {
        self.lock()
            .values()
            .find(|subnet| {
                subnet
                    .cidr_block
                    .parse::<IpNet>()
                    .map(|net| net.contains(&ip))
                    .unwrap_or(false)
            })
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
