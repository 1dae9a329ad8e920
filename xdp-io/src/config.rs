//! AF_XDP socket and XDP program configuration.
//!
//! Loaded from YAML; every field has a default so an empty document is a
//! valid configuration.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, XdpError};

/// Largest chunk size the kernel accepts in aligned UMEM mode.
pub const MAX_FRAME_SIZE: u32 = 4096;

/// Smallest chunk size the kernel accepts (`XDP_UMEM_MIN_CHUNK_SIZE`).
pub const MIN_FRAME_SIZE: u32 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMode {
    /// Zero-copy first, then a single retry in copy mode.
    Auto,
    ZeroCopy,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachMode {
    /// Driver mode first, SKB (generic) mode if the driver refuses.
    Auto,
    Native,
    Skb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BusyPollConfig {
    /// `SO_BUSY_POLL` timeout in microseconds.
    pub timeout_us: u32,
    /// `SO_BUSY_POLL_BUDGET`, max packets per busy-poll cycle.
    pub budget: u32,
}

impl Default for BusyPollConfig {
    fn default() -> Self {
        Self {
            timeout_us: 20,
            budget: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct XdpConfig {
    pub frame_count: u32,
    pub frame_size: u32,
    pub frame_headroom: u32,
    pub fill_ring_size: u32,
    pub completion_ring_size: u32,
    pub rx_ring_size: u32,
    pub tx_ring_size: u32,
    pub bind_mode: BindMode,
    pub attach_mode: AttachMode,
    pub need_wakeup: bool,
    pub batch_size: u32,
    pub xsk_map_entries: u32,
    pub port_map_entries: u32,
    pub busy_poll: Option<BusyPollConfig>,
}

impl Default for XdpConfig {
    fn default() -> Self {
        Self {
            frame_count: 8192,
            frame_size: 4096,
            frame_headroom: 0,
            fill_ring_size: 4096,
            completion_ring_size: 4096,
            rx_ring_size: 4096,
            tx_ring_size: 4096,
            bind_mode: BindMode::Auto,
            attach_mode: AttachMode::Auto,
            need_wakeup: true,
            batch_size: 64,
            xsk_map_entries: 64,
            port_map_entries: 16,
            busy_poll: None,
        }
    }
}

impl XdpConfig {
    /// Read and validate a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            XdpError::InvalidConfig(format!("reading {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: XdpConfig = serde_yaml::from_str(text)
            .map_err(|e| XdpError::InvalidConfig(format!("parsing YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let pow2 = [
            ("frame_count", self.frame_count),
            ("frame_size", self.frame_size),
            ("fill_ring_size", self.fill_ring_size),
            ("completion_ring_size", self.completion_ring_size),
            ("rx_ring_size", self.rx_ring_size),
            ("tx_ring_size", self.tx_ring_size),
        ];
        for (name, value) in pow2 {
            if !value.is_power_of_two() {
                return Err(XdpError::InvalidConfig(format!(
                    "{} must be a power of two, got {}",
                    name, value
                )));
            }
        }

        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&self.frame_size) {
            return Err(XdpError::InvalidConfig(format!(
                "frame_size must be within {}..={}, got {}",
                MIN_FRAME_SIZE, MAX_FRAME_SIZE, self.frame_size
            )));
        }
        if self.frame_headroom >= self.frame_size {
            return Err(XdpError::InvalidConfig(format!(
                "frame_headroom {} leaves no room in a {}-byte frame",
                self.frame_headroom, self.frame_size
            )));
        }
        if self.fill_ring_size > self.frame_count {
            return Err(XdpError::InvalidConfig(format!(
                "fill_ring_size {} exceeds frame_count {}",
                self.fill_ring_size, self.frame_count
            )));
        }

        let smallest_ring = self
            .fill_ring_size
            .min(self.completion_ring_size)
            .min(self.rx_ring_size)
            .min(self.tx_ring_size);
        if self.batch_size == 0 || self.batch_size > smallest_ring {
            return Err(XdpError::InvalidConfig(format!(
                "batch_size must be within 1..={}, got {}",
                smallest_ring, self.batch_size
            )));
        }
        if self.xsk_map_entries == 0 || self.port_map_entries == 0 {
            return Err(XdpError::InvalidConfig(
                "map sizes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Total UMEM size in bytes.
    pub fn umem_len(&self) -> usize {
        self.frame_count as usize * self.frame_size as usize
    }
}
