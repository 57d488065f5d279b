//! Threshold-and-buffering algebra.
//!
//! The container's operating frame length is the least common multiple of
//! module-declared thresholds: in microseconds for PCM and packetized
//! streams, in bytes for raw compressed streams. Once chosen, the frame
//! length propagates to every port, rescaled across media-format boundaries,
//! and each module whose own threshold is smaller runs `num_proc_loops`
//! times per container frame.

use crate::config::{ContainerConfig, MAX_LCM_THRESHOLD_US, MAX_PROPAGATION_DEPTH};
use crate::error::{EngineError, Result};
use crate::graph::module::{ModuleFlags, ModuleId};
use crate::graph::Graph;
use cadenza_protocol::MediaFormat;
use std::collections::VecDeque;
use tracing::debug;

pub fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

pub fn lcm(a: u64, b: u64) -> u64 {
    if a == 0 || b == 0 {
        return a.max(b);
    }
    a / gcd(a, b) * b
}

/// The container-wide threshold in its operating unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LcmUnit {
    Time {
        us: u64,
        samples: u64,
        sample_rate: u32,
    },
    Bytes {
        bytes: u64,
        /// Failsafe time threshold for PCM ports living alongside a
        /// raw-compressed path, preventing zero thresholds there.
        pcm_us: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdOutcome {
    pub unit: LcmUnit,
    /// Module whose threshold anchored the LCM, when one declared any.
    pub source_module: Option<ModuleId>,
    pub cannot_be_pure_signal_triggered: bool,
    /// Some port could not be sized because its media format is unknown;
    /// rerun once MF arrives.
    pub any_not_complete: bool,
    /// Any port received a new effective threshold this pass.
    pub changed: bool,
}

impl ThresholdOutcome {
    pub fn frame_len_us(&self) -> u64 {
        match self.unit {
            LcmUnit::Time { us, .. } => us,
            LcmUnit::Bytes { .. } => 0,
        }
    }

    pub fn frame_len_samples(&self) -> u64 {
        match self.unit {
            LcmUnit::Time { samples, .. } => samples,
            LcmUnit::Bytes { .. } => 0,
        }
    }
}

fn port_mf(graph: &Graph, module: ModuleId) -> Option<&MediaFormat> {
    let node = graph.node(module);
    node.in_ports
        .iter()
        .filter_map(|&ip| graph.in_port(ip).common.media_fmt.as_ref())
        .chain(node.out_ports.iter().filter_map(|&op| graph.out_port(op).common.media_fmt.as_ref()))
        .next()
}

/// Threshold-carrying ports of a module, as (bytes, media format) pairs.
fn raised_thresholds(graph: &Graph, module: ModuleId) -> Vec<(u64, Option<MediaFormat>)> {
    let node = graph.node(module);
    let ins = node.in_ports.iter().filter_map(|&ip| {
        let c = &graph.in_port(ip).common;
        c.threshold.raised_bytes.map(|b| (b, c.media_fmt.clone()))
    });
    let outs = node.out_ports.iter().filter_map(|&op| {
        let c = &graph.out_port(op).common;
        c.threshold.raised_bytes.map(|b| (b, c.media_fmt.clone()))
    });
    ins.chain(outs).collect()
}

/// A module's own threshold in microseconds, when it raised one on a port
/// with a valid PCM/packetized media format.
fn module_thresh_us(graph: &Graph, module: ModuleId) -> Option<u64> {
    raised_thresholds(graph, module).into_iter().find_map(|(bytes, mf)| {
        let mf = mf?;
        mf.data_format.is_packetized_or_pcm().then(|| mf.bytes_to_us(bytes))
    })
}

/// Run the complete check-and-propagate pass. Idempotent: with no
/// intervening events a second run computes identical thresholds and reports
/// `changed == false`.
pub fn check_and_propagate(graph: &mut Graph, config: &ContainerConfig) -> Result<ThresholdOutcome> {
    reset_working_state(graph);

    let (unit, source_module) = select_lcm(graph, config)?;
    validate_endpoint_multiplicity(graph)?;

    let mut changed = false;
    let mut any_not_complete = false;
    let mut cannot_be_pure_st = false;

    if let Some(start) = source_module {
        propagate_from(graph, start, unit)?;
    }

    // Size every port from the chosen LCM and derive per-module loop counts.
    let modules: Vec<ModuleId> = graph.sorted.clone();
    for m in modules {
        let own_us = module_thresh_us(graph, m);
        let node = graph.node(m);
        let is_stm_with_own = node.is_signal_triggered() && own_us.is_some();
        let (in_ids, out_ids) = (node.in_ports.clone(), node.out_ports.clone());

        for ip in in_ids {
            let common = &mut graph.in_port_mut(ip).common;
            match apply_unit_to_port(&unit, common.media_fmt.as_ref()) {
                Some(bytes) => {
                    if common.threshold.thresh_bytes != bytes {
                        if !is_stm_with_own {
                            common.threshold.pending_new_bytes = Some(bytes);
                        }
                        common.threshold.thresh_bytes = bytes;
                        changed = true;
                    }
                    common.threshold.not_complete = false;
                }
                None => {
                    common.threshold.not_complete = true;
                    any_not_complete = true;
                }
            }
        }
        for op in out_ids {
            let common = &mut graph.out_port_mut(op).common;
            match apply_unit_to_port(&unit, common.media_fmt.as_ref()) {
                Some(bytes) => {
                    if common.threshold.thresh_bytes != bytes {
                        if !is_stm_with_own {
                            common.threshold.pending_new_bytes = Some(bytes);
                        }
                        common.threshold.thresh_bytes = bytes;
                        changed = true;
                    }
                    common.threshold.not_complete = false;
                }
                None => {
                    common.threshold.not_complete = true;
                    any_not_complete = true;
                }
            }
        }

        if let (LcmUnit::Time { us, .. }, Some(own)) = (unit, own_us) {
            if own > 0 && us > own {
                let loops = us.div_ceil(own) as u32;
                let node = graph.node_mut(m);
                node.num_proc_loops = loops;
                if loops > 1 {
                    if node.inplace {
                        debug!(module = %node.iid, loops, "clearing inplace for looped module");
                        node.inplace = false;
                    }
                    cannot_be_pure_st = true;
                }
            }
        }
    }

    Ok(ThresholdOutcome {
        unit,
        source_module,
        cannot_be_pure_signal_triggered: cannot_be_pure_st,
        any_not_complete,
        changed,
    })
}

fn reset_working_state(graph: &mut Graph) {
    for ip in &mut graph.in_ports {
        ip.common.marker = false;
        ip.common.threshold.has_threshold = ip.common.threshold.raised_bytes.is_some();
    }
    for op in &mut graph.out_ports {
        op.common.marker = false;
        op.common.threshold.has_threshold = op.common.threshold.raised_bytes.is_some();
    }
    let sorted = graph.sorted.clone();
    for m in sorted {
        graph.node_mut(m).num_proc_loops = 1;
    }
}

/// Steps 2–6: choose the container LCM threshold.
fn select_lcm(graph: &Graph, config: &ContainerConfig) -> Result<(LcmUnit, Option<ModuleId>)> {
    let mut time_lcm: Option<(u64, u64, u32)> = None; // us, samples, rate
    let mut bytes_lcm: Option<u64> = None;
    let mut packetized_fixed = false;
    let mut source: Option<ModuleId> = None;

    // pseudo threshold sources (packetizer/depacketizer) participate only
    // when no true threshold module exists: second pass
    for pass in 0..2 {
        for &m in &graph.sorted {
            let node = graph.node(m);
            let is_pseudo = node.flags.contains(ModuleFlags::PSEUDO_THRESHOLD);
            if (pass == 0 && is_pseudo) || (pass == 1 && !is_pseudo) {
                continue;
            }
            for (bytes, mf) in raised_thresholds(graph, m) {
                let Some(mf) = mf else { continue };
                if !mf.data_format.is_packetized_or_pcm() {
                    bytes_lcm.get_or_insert(bytes);
                    source.get_or_insert(m);
                    continue;
                }
                let port_us = mf.bytes_to_us(bytes);
                let port_samples = mf.bytes_to_samples_per_ch(bytes);
                if port_us == 0 {
                    continue;
                }
                source.get_or_insert(m);
                if !mf.data_format.is_pcm() {
                    // first packetized threshold wins outright
                    if !packetized_fixed {
                        time_lcm = Some((port_us, port_samples, mf.sample_rate));
                        packetized_fixed = true;
                    }
                    continue;
                }
                if packetized_fixed {
                    continue;
                }
                time_lcm = Some(match time_lcm {
                    None => (port_us, port_samples, mf.sample_rate),
                    Some((cur_us, cur_samples, cur_rate)) => {
                        if mf.sample_rate == cur_rate {
                            let samples = lcm(cur_samples, port_samples);
                            let us = samples * 1_000_000 / cur_rate as u64;
                            (us, samples, cur_rate)
                        } else {
                            let us = lcm(cur_us, port_us);
                            (us, us * cur_rate as u64 / 1_000_000, cur_rate)
                        }
                    }
                });
                if let Some((us, _, rate)) = time_lcm {
                    if us > MAX_LCM_THRESHOLD_US {
                        let clamped = MAX_LCM_THRESHOLD_US;
                        time_lcm =
                            Some((clamped, clamped * rate as u64 / 1_000_000, rate));
                    }
                }
            }
        }
        if time_lcm.is_some() || bytes_lcm.is_some() {
            break;
        }
    }

    if let Some((us, samples, rate)) = time_lcm {
        return Ok((LcmUnit::Time { us, samples, sample_rate: rate }, source));
    }

    if let Some(bytes) = bytes_lcm {
        // failsafe: parallel PCM paths must not end up with zero thresholds
        let pcm_us = first_pcm_mf(graph).map(|mf| {
            let us = mf.bytes_to_us(bytes);
            if us == 0 {
                default_frame_us(config)
            } else {
                us
            }
        });
        return Ok((LcmUnit::Bytes { bytes, pcm_us }, source));
    }

    // No module raised a threshold: derive a default from configuration on
    // the first port with a valid media format.
    let Some(mf) = first_valid_mf(graph) else {
        return Ok((
            LcmUnit::Time {
                us: default_frame_us(config),
                samples: 0,
                sample_rate: 0,
            },
            None,
        ));
    };
    let us = config
        .configured_frame_us
        .or_else(|| config.configured_frame_samples.map(|s| mf.samples_per_ch_to_us(s)))
        .unwrap_or_else(|| default_frame_us(config));
    Ok((
        LcmUnit::Time {
            us,
            samples: mf.us_to_samples_per_ch(us),
            sample_rate: mf.sample_rate,
        },
        None,
    ))
}

fn default_frame_us(config: &ContainerConfig) -> u64 {
    config.perf_mode.default_frame_us().unwrap_or(1_000)
}

fn first_valid_mf(graph: &Graph) -> Option<MediaFormat> {
    for &m in &graph.sorted {
        if let Some(mf) = port_mf(graph, m) {
            if mf.data_format.is_packetized_or_pcm() {
                return Some(mf.clone());
            }
        }
    }
    None
}

fn first_pcm_mf(graph: &Graph) -> Option<MediaFormat> {
    for &m in &graph.sorted {
        if let Some(mf) = port_mf(graph, m) {
            if mf.data_format.is_pcm() {
                return Some(mf.clone());
            }
        }
    }
    None
}

/// Size a port from the container unit, in that port's media format. `None`
/// when the port's media format is unknown and the unit is time-based.
fn apply_unit_to_port(unit: &LcmUnit, mf: Option<&MediaFormat>) -> Option<u64> {
    match unit {
        LcmUnit::Bytes { bytes, pcm_us } => match mf {
            Some(mf) if mf.data_format.is_packetized_or_pcm() => {
                pcm_us.map(|us| mf.us_to_bytes(us))
            }
            _ => Some(*bytes),
        },
        LcmUnit::Time { us, .. } => {
            let mf = mf?;
            if mf.data_format.is_packetized_or_pcm() {
                Some(mf.us_to_bytes(*us))
            } else {
                // raw port under a time-based container: keep the raised
                // size; the module declared it in bytes
                None
            }
        }
    }
}

/// Steps 7–8: walk outward from the threshold source with a bounded
/// worklist, marking visited ports and carrying sibling maxima across
/// SIMO/MISO fans. MIMO modules are refused; they must self-declare.
fn propagate_from(graph: &mut Graph, start: ModuleId, unit: LcmUnit) -> Result<()> {
    let mut work: VecDeque<(ModuleId, usize)> = VecDeque::new();
    work.push_back((start, 0));

    while let Some((m, depth)) = work.pop_front() {
        if depth > MAX_PROPAGATION_DEPTH {
            return Err(EngineError::topology("threshold propagation depth exceeded"));
        }
        let node = graph.node(m);
        if !node.can_propagate_threshold() && m != start {
            continue;
        }
        let (in_ids, out_ids) = (node.in_ports.clone(), node.out_ports.clone());

        // sibling max across this module's output fan, rescaled per port
        let sibling_max_us: u64 = out_ids
            .iter()
            .filter_map(|&op| {
                let c = &graph.out_port(op).common;
                let mf = c.media_fmt.as_ref()?;
                c.threshold
                    .raised_bytes
                    .map(|b| mf.bytes_to_us(b))
            })
            .max()
            .unwrap_or(match unit {
                LcmUnit::Time { us, .. } => us,
                LcmUnit::Bytes { .. } => 0,
            });

        for &op in &out_ids {
            let port = graph.out_port_mut(op);
            if port.common.marker {
                continue;
            }
            port.common.marker = true;
            if port.common.threshold.raised_bytes.is_none() {
                if let Some(mf) = port.common.media_fmt.as_ref() {
                    if mf.data_format.is_packetized_or_pcm() && sibling_max_us > 0 {
                        port.common.threshold.thresh_bytes = mf.us_to_bytes(sibling_max_us);
                        port.common.threshold.has_threshold = true;
                    }
                }
            }
            if let Some(next_in) = port.conn {
                let next = graph.in_port(next_in).module;
                work.push_back((next, depth + 1));
            }
        }

        for &ip in &in_ids {
            let port = graph.in_port_mut(ip);
            if port.common.marker {
                continue;
            }
            port.common.marker = true;
            if let Some(prev_out) = port.conn {
                let prev = graph.out_port(prev_out).module;
                work.push_back((prev, depth + 1));
            }
        }
    }
    Ok(())
}

/// The endpoint (signal-triggered) module's threshold must be an integer
/// multiple of every other PCM module's threshold.
fn validate_endpoint_multiplicity(graph: &Graph) -> Result<()> {
    let Some(stm) = graph.stm_module()? else {
        return Ok(());
    };
    let Some(stm_us) = module_thresh_us(graph, stm) else {
        return Ok(());
    };
    for &m in &graph.sorted {
        if m == stm {
            continue;
        }
        if let Some(m_us) = module_thresh_us(graph, m) {
            if m_us > 0 && stm_us % m_us != 0 {
                return Err(EngineError::topology(format!(
                    "multiple thresholds not multiple: endpoint {stm_us} us vs module {m_us} us"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::StreamData;
    use crate::config::PerfMode;
    use crate::events::EventCtx;
    use crate::graph::module::AudioModule;
    use cadenza_protocol::{MediaFormat, ModuleIid, PortId, SubgraphId};

    struct Nop;
    impl AudioModule for Nop {
        fn process(
            &mut self,
            _ctx: &mut EventCtx,
            _i: &mut [StreamData],
            _o: &mut [StreamData],
        ) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        graph: Graph,
        mods: Vec<ModuleId>,
    }

    /// A linear chain of SISO modules, PCM stereo 48k/16 everywhere.
    fn pcm_chain(n: usize) -> Fixture {
        let mut graph = Graph::new();
        let sg = graph.add_subgraph(SubgraphId::new(1));
        let mf = MediaFormat::pcm(2, 48_000, 16);
        let mods: Vec<ModuleId> = (0..n)
            .map(|i| {
                graph
                    .add_module(
                        ModuleIid::new(0x1000 + i as u32),
                        sg,
                        crate::graph::module::ModuleFlags::empty(),
                        Box::new(Nop),
                    )
                    .unwrap()
            })
            .collect();
        for (i, &m) in mods.iter().enumerate() {
            if i > 0 {
                let ip = graph.add_in_port(m, PortId::new(2));
                graph.in_port_mut(ip).common.media_fmt = Some(mf.clone());
            }
            if i + 1 < n {
                let op = graph.add_out_port(m, PortId::new(1));
                graph.out_port_mut(op).common.media_fmt = Some(mf.clone());
            }
        }
        for w in mods.windows(2) {
            let from = graph.node(w[0]).out_ports[0];
            let to = graph.node(w[1]).in_ports[0];
            graph.connect(from, to).unwrap();
        }
        graph.refresh().unwrap();
        Fixture { graph, mods }
    }

    fn raise_on_in(f: &mut Fixture, idx: usize, bytes: u64) {
        let ip = f.graph.node(f.mods[idx]).in_ports[0];
        f.graph.in_port_mut(ip).common.threshold.raised_bytes = Some(bytes);
    }

    #[test]
    fn default_perf_mode_frame() {
        // Scenario 1: SISO PCM 48k/16/stereo, 5 ms perf mode, no threshold
        let mut f = pcm_chain(2);
        let config = ContainerConfig { perf_mode: PerfMode::LowPower, ..Default::default() };
        let out = check_and_propagate(&mut f.graph, &config).unwrap();
        match out.unit {
            LcmUnit::Time { us, samples, .. } => {
                assert_eq!(us, 5_000);
                assert_eq!(samples, 240);
            }
            _ => panic!("expected time unit"),
        }
        let ip = f.graph.node(f.mods[1]).in_ports[0];
        // total = 960 bytes, per-channel = 480
        assert_eq!(f.graph.in_port(ip).common.threshold.thresh_bytes, 960);
    }

    #[test]
    fn lcm_of_two_thresholds_sets_proc_loops() {
        // Scenario 2: 5 ms and 2 ms at 48 kHz -> LCM 10 ms, loops 2 and 5
        let mut f = pcm_chain(3);
        let mf = MediaFormat::pcm(2, 48_000, 16);
        raise_on_in(&mut f, 1, mf.us_to_bytes(5_000)); // module A: 5 ms
        raise_on_in(&mut f, 2, mf.us_to_bytes(2_000)); // module B: 2 ms
        f.graph.node_mut(f.mods[1]).inplace = true;
        let out = check_and_propagate(&mut f.graph, &ContainerConfig::default()).unwrap();
        match out.unit {
            LcmUnit::Time { us, samples, .. } => {
                assert_eq!(us, 10_000);
                assert_eq!(samples, 480);
            }
            _ => panic!("expected time unit"),
        }
        assert_eq!(f.graph.node(f.mods[1]).num_proc_loops, 2);
        assert_eq!(f.graph.node(f.mods[2]).num_proc_loops, 5);
        assert!(!f.graph.node(f.mods[1]).inplace);
        assert!(out.cannot_be_pure_signal_triggered);
    }

    #[test]
    fn endpoint_not_multiple_is_rejected() {
        // Scenario 3: endpoint 1 ms, inner 2 ms -> rejected
        let mut f = pcm_chain(3);
        let mf = MediaFormat::pcm(2, 48_000, 16);
        f.graph.node_mut(f.mods[0]).flags |=
            crate::graph::module::ModuleFlags::NEEDS_SIGNAL_TRIGGER;
        let op = f.graph.node(f.mods[0]).out_ports[0];
        f.graph.out_port_mut(op).common.threshold.raised_bytes = Some(mf.us_to_bytes(1_000));
        raise_on_in(&mut f, 2, mf.us_to_bytes(2_000));
        let err = check_and_propagate(&mut f.graph, &ContainerConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::TopologyInvalid(_)));
    }

    #[test]
    fn clamp_at_200ms() {
        let mut f = pcm_chain(3);
        let mf = MediaFormat::pcm(2, 48_000, 16);
        // 30 ms and 70 ms -> LCM 210 ms > 200 ms -> clamp
        raise_on_in(&mut f, 1, mf.us_to_bytes(30_000));
        raise_on_in(&mut f, 2, mf.us_to_bytes(70_000));
        let out = check_and_propagate(&mut f.graph, &ContainerConfig::default()).unwrap();
        assert_eq!(out.frame_len_us(), MAX_LCM_THRESHOLD_US);
    }

    #[test]
    fn no_clamp_at_exactly_200ms() {
        let mut f = pcm_chain(2);
        let mf = MediaFormat::pcm(2, 48_000, 16);
        raise_on_in(&mut f, 1, mf.us_to_bytes(200_000));
        let out = check_and_propagate(&mut f.graph, &ContainerConfig::default()).unwrap();
        assert_eq!(out.frame_len_us(), 200_000);
    }

    #[test]
    fn idempotent_when_converged() {
        let mut f = pcm_chain(3);
        let mf = MediaFormat::pcm(2, 48_000, 16);
        raise_on_in(&mut f, 1, mf.us_to_bytes(5_000));
        let first = check_and_propagate(&mut f.graph, &ContainerConfig::default()).unwrap();
        assert!(first.changed);
        // consume pending notifications the way the reconciler would
        for ip in &mut f.graph.in_ports {
            ip.common.threshold.pending_new_bytes = None;
        }
        let second = check_and_propagate(&mut f.graph, &ContainerConfig::default()).unwrap();
        assert_eq!(first.unit, second.unit);
        assert!(!second.changed);
    }

    #[test]
    fn equal_rate_lcm_uses_samples() {
        let mut f = pcm_chain(3);
        let mf = MediaFormat::pcm(2, 44_100, 16);
        let ip1 = f.graph.node(f.mods[1]).in_ports[0];
        let ip2 = f.graph.node(f.mods[2]).in_ports[0];
        f.graph.in_port_mut(ip1).common.media_fmt = Some(mf.clone());
        f.graph.in_port_mut(ip2).common.media_fmt = Some(mf.clone());
        // 441 and 147 samples -> lcm 441 samples = 10 ms
        f.graph.in_port_mut(ip1).common.threshold.raised_bytes =
            Some(mf.samples_per_ch_to_bytes(441));
        f.graph.in_port_mut(ip2).common.threshold.raised_bytes =
            Some(mf.samples_per_ch_to_bytes(147));
        let out = check_and_propagate(&mut f.graph, &ContainerConfig::default()).unwrap();
        assert_eq!(out.frame_len_samples(), 441);
        assert_eq!(out.frame_len_us(), 10_000);
    }

    #[test]
    fn missing_mf_marks_not_complete() {
        let mut f = pcm_chain(3);
        let mf = MediaFormat::pcm(2, 48_000, 16);
        raise_on_in(&mut f, 1, mf.us_to_bytes(5_000));
        let ip = f.graph.node(f.mods[2]).in_ports[0];
        f.graph.in_port_mut(ip).common.media_fmt = None;
        let out = check_and_propagate(&mut f.graph, &ContainerConfig::default()).unwrap();
        assert!(out.any_not_complete);
        assert!(f.graph.in_port(ip).common.threshold.not_complete);
    }

    #[test]
    fn raw_only_threshold_is_bytes() {
        let mut f = pcm_chain(2);
        let raw = MediaFormat {
            data_format: cadenza_protocol::DataFormat::RawCompressed,
            interleaving: cadenza_protocol::Interleaving::Interleaved,
            ..MediaFormat::pcm(1, 48_000, 16)
        };
        let ip = f.graph.node(f.mods[1]).in_ports[0];
        f.graph.in_port_mut(ip).common.media_fmt = Some(raw);
        f.graph.in_port_mut(ip).common.threshold.raised_bytes = Some(4096);
        // no other port has a format
        let op = f.graph.node(f.mods[0]).out_ports[0];
        f.graph.out_port_mut(op).common.media_fmt = None;
        let out = check_and_propagate(&mut f.graph, &ContainerConfig::default()).unwrap();
        assert_eq!(out.unit, LcmUnit::Bytes { bytes: 4096, pcm_us: None });
        assert_eq!(f.graph.in_port(ip).common.threshold.thresh_bytes, 4096);
    }

    #[test]
    fn lcm_helpers() {
        assert_eq!(gcd(12, 8), 4);
        assert_eq!(lcm(5_000, 2_000), 10_000);
        assert_eq!(lcm(0, 7), 7);
    }
}
