//! Inner payload padding

use serde::{Deserialize, Serialize};

/// Padding strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// No padding
    None,
    /// Pad to a multiple of `block_size`
    Block,
    /// Pad to the next power of two
    PowerOfTwo,
}

/// Padding configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaddingConfig {
    pub mode: PaddingMode,
    /// Block size for [`PaddingMode::Block`]
    pub block_size: usize,
    /// Upper bound on padding added to one packet
    pub max_padding: usize,
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            mode: PaddingMode::Block,
            block_size: 16,
            max_padding: 255,
        }
    }
}

impl PaddingConfig {
    pub fn none() -> Self {
        Self {
            mode: PaddingMode::None,
            block_size: 1,
            max_padding: 0,
        }
    }

    /// Padding to add after `data_len` bytes
    pub fn calculate_padding(&self, data_len: usize) -> usize {
        let padding = match self.mode {
            PaddingMode::None => 0,
            PaddingMode::Block => {
                let block_size = self.block_size.max(1);
                let remainder = data_len % block_size;
                if remainder == 0 {
                    0
                } else {
                    block_size - remainder
                }
            }
            PaddingMode::PowerOfTwo => data_len.next_power_of_two() - data_len,
        };
        padding.min(self.max_padding)
    }

    /// Most padding any packet can receive
    pub fn bound(&self) -> usize {
        match self.mode {
            PaddingMode::None => 0,
            _ => self.max_padding,
        }
    }
}
