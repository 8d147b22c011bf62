use serde::{Deserialize, Serialize};

use crate::protocol::tactile::PREFERRED_BAUD_RATE;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub boards: Vec<BoardConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BoardConfig {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Global element index mapped to local slot 0 on this board.
    /// Boards sharing one logical array each get a different origin.
    #[serde(default)]
    pub origin: usize,
    /// Firmware family on the board. Only "tactile" is supported.
    #[serde(default = "default_firmware")]
    pub firmware: String,
    /// Amplitude modulation step (0-31) applied once after connect.
    /// Higher values increase the firmware's modulation frequency.
    pub amp_mod_step: Option<u8>,
}

fn default_baud_rate() -> u32 {
    PREFERRED_BAUD_RATE
}

fn default_firmware() -> String {
    "tactile".to_string()
}
