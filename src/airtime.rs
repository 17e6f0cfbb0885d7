//! On-air transmission time for the acoustic modem.
//!
//! The modem transmits symbols of `bits_per_symbol` bits, each repeated
//! `symbol_repetitions` times and lasting `symbol_duration_us`. The gross bit
//! rate is therefore
//!
//! ```text
//! R_gross = n / (s * t)    bits per second
//! ```
//!
//! and the optional rate-1/2 error coding halves it. Every frame carries a
//! fixed header of `header_bits` in addition to the payload, so the on-air
//! time of a payload of `p` bits is
//!
//! ```text
//! T = (p + h) / R_net      seconds
//! ```
//!
//! The slot scheduler uses this figure to size the per-node response windows.

use serde::Deserialize;

/// Modulation parameters of the acoustic modem.
///
/// Defaults match the reference hardware: 4 bits per symbol, 2.56 ms symbol
/// duration, 3 repetitions per symbol, 48 header bits, rate-1/2 coding
/// enabled. That works out to a net rate of ~260 bit/s; the header alone
/// occupies the channel for 184 320 us.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ModemTimings {
    pub bits_per_symbol: u32,
    pub symbol_duration_us: f64,
    pub symbol_repetitions: u32,
    pub header_bits: u32,
    pub error_coding: bool,
}

impl Default for ModemTimings {
    fn default() -> Self {
        Self {
            bits_per_symbol: 4,
            symbol_duration_us: 2560.0,
            symbol_repetitions: 3,
            header_bits: 48,
            error_coding: true,
        }
    }
}

impl ModemTimings {
    /// Raw channel bit rate in bits per second, before error coding.
    pub fn gross_bit_rate(&self) -> f64 {
        f64::from(self.bits_per_symbol)
            / (f64::from(self.symbol_repetitions) * self.symbol_duration_us * 1e-6)
    }

    /// Usable bit rate in bits per second. Rate-1/2 coding halves the gross
    /// rate.
    pub fn net_bit_rate(&self) -> f64 {
        if self.error_coding {
            self.gross_bit_rate() * 0.5
        } else {
            self.gross_bit_rate()
        }
    }

    /// On-air duration of a frame carrying `payload_bits`, in microseconds.
    pub fn transmission_time_us(&self, payload_bits: u64) -> u64 {
        let total_bits = payload_bits as f64 + f64::from(self.header_bits);
        (total_bits / self.net_bit_rate() * 1e6).round() as u64
    }
}
