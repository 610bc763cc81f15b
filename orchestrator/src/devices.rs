use serde::{Deserialize, Serialize};

use crate::{OrchestratorError, Result};

/// A compute device the host environment makes available to the replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: usize,
    #[serde(default)]
    pub name: String,
    /// Available memory in MiB, as reported by the host.
    pub free_memory: u64,
}

/// The devices supplied by the host, in the order it listed them.
///
/// The catalog never probes the hardware, it only ranks what it was given.
#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    devices: Vec<Device>,
}

impl DeviceCatalog {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Picks the `n` devices with the most free memory, one per replica.
    ///
    /// Devices are ranked by descending free memory, ties keep the catalog order.
    ///
    /// # Returns
    /// The selected devices, the first one being the one with the most free memory,
    /// or an error if the catalog holds less than `n` devices.
    pub fn select(&self, n: usize) -> Result<Vec<&Device>> {
        if n > self.devices.len() {
            return Err(OrchestratorError::InvalidConfig(format!(
                "{n} devices requested but only {} are available",
                self.devices.len()
            )));
        }

        let mut ranked: Vec<&Device> = self.devices.iter().collect();
        ranked.sort_by(|a, b| b.free_memory.cmp(&a.free_memory));
        ranked.truncate(n);
        Ok(ranked)
    }

    /// The comma separated ids of the selected devices, the way device visibility lists
    /// are usually handed to accelerator runtimes.
    pub fn visible_devices(&self, n: usize) -> Result<String> {
        let ids: Vec<String> = self.select(n)?.iter().map(|d| d.id.to_string()).collect();
        Ok(ids.join(","))
    }
}
