//! Power voting: KPPS/BW aggregation and island (low-power) participation.

use crate::config::PRE_ISLAND_FRAMES_TO_PROCESS;
use crate::container::Container;
use crate::graph::port::{DataFlowState, PortState};
use cadenza_protocol::MediaFormat;
use std::time::{Duration, Instant};
use tracing::debug;

const EXTRA_BW_FOR_HIGH_SR: u64 = 6 * 1024 * 1024;
const EXTRA_BW_FOR_MANY_CH: u64 = 7 * 1024 * 1024;

/// Bandwidth contribution of one external port. The base figure is counted
/// twice: once for the copy in and once for the copy out of the port buffer.
pub fn port_bw(mf: &MediaFormat) -> u64 {
    if !mf.data_format.is_packetized_or_pcm() {
        return 0;
    }
    let mut bw = 2 * mf.bytes_per_sec();
    if mf.sample_rate > 48_000 {
        bw += EXTRA_BW_FOR_HIGH_SR;
    }
    if mf.num_channels > 2 {
        bw += EXTRA_BW_FOR_MANY_CH;
    }
    bw
}

/// Packets-per-second cost of moving this stream, in kilo-packets.
/// Estimates one op per 8 bytes moved.
pub fn port_kpps(mf: &MediaFormat) -> u32 {
    if !mf.data_format.is_packetized_or_pcm() {
        return 0;
    }
    (mf.bytes_per_sec() / 8 / 1000) as u32
}

#[derive(Debug, Default)]
pub struct IslandState {
    pub participating: bool,
    pub steady_frames: u32,
    pub last_vote_change: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct PowerState {
    pub kpps: u32,
    pub bw_bytes_per_sec: u64,
    pub voted: bool,
    pub island: IslandState,
}

impl Container {
    /// Aggregate KPPS/BW over started external ports and record the vote.
    /// With `force` the started-state filter is skipped (used at prepare to
    /// pre-warm the vote).
    pub fn update_kpps_bw(&mut self, force: bool) {
        let mut bw = 0u64;
        let mut kpps = 0u32;

        for p in &self.ext_in {
            let common = &self.graph.in_port(p.in_port).common;
            if !force && common.state != PortState::Started {
                continue;
            }
            if let Some(mf) = &common.media_fmt {
                bw += port_bw(mf);
                kpps += port_kpps(mf);
            }
        }
        for p in &self.ext_out {
            let common = &self.graph.out_port(p.out_port).common;
            if !force && common.state != PortState::Started {
                continue;
            }
            if let Some(mf) = &common.media_fmt {
                bw += port_bw(mf);
                kpps += port_kpps(mf);
            }
        }

        if bw != self.power.bw_bytes_per_sec || kpps != self.power.kpps {
            self.power.bw_bytes_per_sec = bw;
            self.power.kpps = kpps;
            self.power.island.last_vote_change = Some(Instant::now());
            self.power.island.steady_frames = 0;
            debug!(kpps, bw, "container vote updated");
        }
        self.power.voted = true;
    }

    pub fn release_votes(&mut self) {
        if self.power.voted {
            self.power.kpps = 0;
            self.power.bw_bytes_per_sec = 0;
            self.power.voted = false;
            self.exit_island();
            debug!("container votes released");
        }
    }

    /// A port in started state with data flowing is the only state that may
    /// contribute to power votes.
    pub fn any_port_contributing(&self) -> bool {
        self.ext_in.iter().any(|p| {
            let c = &self.graph.in_port(p.in_port).common;
            c.state == PortState::Started && c.data_flow_state == DataFlowState::Flowing
        }) || self.ext_out.iter().any(|p| {
            let c = &self.graph.out_port(p.out_port).common;
            c.state == PortState::Started && c.data_flow_state == DataFlowState::Flowing
        })
    }

    /// Island entry: only after two frames of steady processing and the
    /// equivalent wall-clock delay since the last vote change.
    pub fn consider_island_entry(&mut self) {
        if self.power.island.participating {
            return;
        }
        self.power.island.steady_frames += 1;
        if self.power.island.steady_frames < PRE_ISLAND_FRAMES_TO_PROCESS {
            return;
        }
        let frame_us = self.frame.len_us();
        let delay = Duration::from_micros(frame_us * PRE_ISLAND_FRAMES_TO_PROCESS as u64);
        let since_change = self
            .power
            .island
            .last_vote_change
            .map(|t| t.elapsed() >= delay)
            .unwrap_or(true);
        if since_change {
            self.power.island.participating = true;
            debug!("entering island");
        }
    }

    /// Exit immediately on any event or when an external port is at gap.
    pub fn exit_island(&mut self) {
        if self.power.island.participating {
            debug!("exiting island");
        }
        self.power.island.participating = false;
        self.power.island.steady_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bw_extras() {
        let base = MediaFormat::pcm(2, 48_000, 16);
        assert_eq!(port_bw(&base), 2 * 48_000 * 2 * 2);
        let hi_rate = MediaFormat::pcm(2, 96_000, 16);
        assert_eq!(port_bw(&hi_rate), 2 * 96_000 * 2 * 2 + EXTRA_BW_FOR_HIGH_SR);
        let many_ch = MediaFormat::pcm(6, 48_000, 16);
        assert_eq!(port_bw(&many_ch), 2 * 48_000 * 6 * 2 + EXTRA_BW_FOR_MANY_CH);
    }

    #[test]
    fn raw_streams_do_not_vote() {
        let raw = MediaFormat {
            data_format: cadenza_protocol::DataFormat::RawCompressed,
            ..MediaFormat::pcm(2, 48_000, 16)
        };
        assert_eq!(port_bw(&raw), 0);
        assert_eq!(port_kpps(&raw), 0);
    }
}
