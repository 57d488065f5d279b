//! Media format payload and unit conversions.
//!
//! All threshold math in the engine runs on time in microseconds for PCM and
//! packetized streams, and on bytes for raw compressed streams. The
//! conversions live here because both the engine and its peers need the same
//! rounding behavior.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// Sample rates accepted on the wire, in Hz.
pub const SUPPORTED_SAMPLE_RATES: [u32; 15] = [
    8_000, 11_025, 12_000, 16_000, 22_050, 24_000, 32_000, 44_100, 48_000, 88_200, 96_000,
    176_400, 192_000, 352_800, 384_000,
];

/// Most variants allow up to 128 channels; embedded builds cap at 32.
pub const MAX_CHANNELS: u16 = 128;
pub const MAX_CHANNELS_EMBEDDED: u16 = 32;

pub const US_PER_SEC: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFormat {
    FixedPoint,
    FloatingPoint,
    /// Compressed stream with known frame sizes, thresholds in bytes.
    RawCompressed,
    GenericCompressed,
    /// IEC 61937 packetized; underruns are filled with null bursts.
    Iec61937Packetized,
    Iec60958Packetized,
    Iec60958NonLinear,
    ComprOverPcmPacketized,
}

impl DataFormat {
    /// PCM proper: sample values laid out per the PCM fields of the format.
    pub fn is_pcm(self) -> bool {
        matches!(self, DataFormat::FixedPoint | DataFormat::FloatingPoint)
    }

    /// PCM or a packetized format that carries PCM timing (rate/channels are
    /// meaningful, so time-unit conversions apply).
    pub fn is_packetized_or_pcm(self) -> bool {
        !matches!(self, DataFormat::RawCompressed | DataFormat::GenericCompressed)
    }

    /// Formats whose underrun fill is the IEC null-burst pattern.
    pub fn uses_null_burst_fill(self) -> bool {
        matches!(
            self,
            DataFormat::Iec61937Packetized | DataFormat::Iec60958NonLinear
        )
    }

    /// Formats whose underrun fill is zero samples with the erasure flag.
    pub fn uses_zero_fill(self) -> bool {
        matches!(
            self,
            DataFormat::FixedPoint
                | DataFormat::FloatingPoint
                | DataFormat::GenericCompressed
                | DataFormat::ComprOverPcmPacketized
                | DataFormat::Iec60958Packetized
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interleaving {
    Interleaved,
    DeinterleavedPacked,
    DeinterleavedUnpacked,
}

/// Media format as carried on the wire and held per port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub data_format: DataFormat,
    pub num_channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub interleaving: Interleaving,
    /// Per-channel type array; length must equal `num_channels`.
    pub channel_map: Vec<u8>,
}

impl MediaFormat {
    /// A standard PCM format with an identity channel map.
    pub fn pcm(num_channels: u16, sample_rate: u32, bits_per_sample: u16) -> Self {
        Self {
            data_format: DataFormat::FixedPoint,
            num_channels,
            sample_rate,
            bits_per_sample,
            interleaving: Interleaving::DeinterleavedUnpacked,
            channel_map: (1..=num_channels as u8).collect(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_format.is_packetized_or_pcm()
            && !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate)
        {
            return Err(ProtocolError::UnsupportedSampleRate(self.sample_rate));
        }
        if self.num_channels == 0 || self.num_channels > MAX_CHANNELS {
            return Err(ProtocolError::InvalidChannelCount {
                got: self.num_channels,
                max: MAX_CHANNELS,
            });
        }
        if self.data_format.is_pcm() && !matches!(self.bits_per_sample, 16 | 24 | 32) {
            return Err(ProtocolError::InvalidBitWidth(self.bits_per_sample));
        }
        Ok(())
    }

    pub fn bytes_per_sample(&self) -> u32 {
        (self.bits_per_sample as u32) / 8
    }

    /// Bytes per second across all channels.
    pub fn bytes_per_sec(&self) -> u64 {
        self.sample_rate as u64 * self.num_channels as u64 * self.bytes_per_sample() as u64
    }

    /// Number of channel buffers a port with this format owns.
    pub fn num_bufs(&self) -> usize {
        match self.interleaving {
            Interleaving::DeinterleavedUnpacked => self.num_channels as usize,
            _ => 1,
        }
    }

    pub fn is_unpacked(&self) -> bool {
        self.data_format.is_pcm() && self.interleaving == Interleaving::DeinterleavedUnpacked
    }

    /// Total bytes (all channels) to microseconds. Truncating.
    pub fn bytes_to_us(&self, bytes: u64) -> u64 {
        let bps = self.bytes_per_sec();
        if bps == 0 {
            return 0;
        }
        bytes * US_PER_SEC / bps
    }

    /// Per-channel bytes to microseconds. Truncating.
    pub fn bytes_per_ch_to_us(&self, bytes_per_ch: u64) -> u64 {
        let per_ch = self.sample_rate as u64 * self.bytes_per_sample() as u64;
        if per_ch == 0 {
            return 0;
        }
        bytes_per_ch * US_PER_SEC / per_ch
    }

    /// Microseconds to total bytes (all channels). Truncating.
    pub fn us_to_bytes(&self, us: u64) -> u64 {
        self.us_to_samples_per_ch(us)
            * self.num_channels as u64
            * self.bytes_per_sample() as u64
    }

    /// Microseconds to per-channel bytes.
    pub fn us_to_bytes_per_ch(&self, us: u64) -> u64 {
        self.us_to_samples_per_ch(us) * self.bytes_per_sample() as u64
    }

    /// Microseconds to samples per channel. Truncating.
    pub fn us_to_samples_per_ch(&self, us: u64) -> u64 {
        us * self.sample_rate as u64 / US_PER_SEC
    }

    /// Total bytes to samples per channel.
    pub fn bytes_to_samples_per_ch(&self, bytes: u64) -> u64 {
        let denom = self.num_channels as u64 * self.bytes_per_sample() as u64;
        if denom == 0 {
            return 0;
        }
        bytes / denom
    }

    /// Samples per channel to total bytes.
    pub fn samples_per_ch_to_bytes(&self, samples: u64) -> u64 {
        samples * self.num_channels as u64 * self.bytes_per_sample() as u64
    }

    /// Samples per channel to microseconds. Truncating.
    pub fn samples_per_ch_to_us(&self, samples: u64) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        samples * US_PER_SEC / self.sample_rate as u64
    }

    /// Rescale a byte count sized for `self` into the equivalent byte count
    /// for `other`, preserving duration. Used when threshold propagation
    /// crosses a media-format boundary.
    pub fn rescale_bytes_to(&self, bytes: u64, other: &MediaFormat) -> u64 {
        other.us_to_bytes(self.bytes_to_us(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_48k_16bit_5ms() {
        let mf = MediaFormat::pcm(2, 48_000, 16);
        assert_eq!(mf.us_to_samples_per_ch(5_000), 240);
        assert_eq!(mf.us_to_bytes(5_000), 960);
        assert_eq!(mf.us_to_bytes_per_ch(5_000), 480);
    }

    #[test]
    fn bytes_us_bytes_identity_for_sample_aligned_counts() {
        for rate in SUPPORTED_SAMPLE_RATES {
            let mf = MediaFormat::pcm(2, rate, 16);
            // one container frame at 20ms is sample-aligned at every
            // supported rate
            let bytes = mf.us_to_bytes(20_000);
            assert_eq!(mf.us_to_bytes(mf.bytes_to_us(bytes)), bytes, "rate {rate}");
        }
    }

    #[test]
    fn validate_rejects_odd_rate() {
        let mut mf = MediaFormat::pcm(2, 48_000, 16);
        mf.sample_rate = 47_999;
        assert!(matches!(
            mf.validate(),
            Err(ProtocolError::UnsupportedSampleRate(47_999))
        ));
    }

    #[test]
    fn validate_rejects_channel_overflow() {
        let mf = MediaFormat::pcm(0, 48_000, 16);
        assert!(mf.validate().is_err());
        let mf = MediaFormat {
            num_channels: 129,
            ..MediaFormat::pcm(2, 48_000, 16)
        };
        assert!(mf.validate().is_err());
    }

    #[test]
    fn raw_compressed_skips_rate_check() {
        let mf = MediaFormat {
            data_format: DataFormat::RawCompressed,
            sample_rate: 0,
            interleaving: Interleaving::Interleaved,
            ..MediaFormat::pcm(1, 48_000, 16)
        };
        assert!(mf.validate().is_ok());
    }

    #[test]
    fn rescale_preserves_duration() {
        let a = MediaFormat::pcm(2, 48_000, 16);
        let b = MediaFormat::pcm(1, 16_000, 32);
        // 5 ms in a = 960 bytes; in b = 80 samples * 4 = 320 bytes
        assert_eq!(a.rescale_bytes_to(960, &b), 320);
    }

    #[test]
    fn num_bufs_follows_interleaving() {
        let mut mf = MediaFormat::pcm(4, 48_000, 16);
        assert_eq!(mf.num_bufs(), 4);
        mf.interleaving = Interleaving::Interleaved;
        assert_eq!(mf.num_bufs(), 1);
        mf.interleaving = Interleaving::DeinterleavedPacked;
        assert_eq!(mf.num_bufs(), 1);
    }
}
