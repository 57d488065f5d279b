//! Framework built-in modules.
//!
//! These share the [`AudioModule`] capability set with user modules: the
//! signal endpoint that anchors a signal-triggered topology, a placeholder
//! that stands in until the real module is resolved, and a pair of simple
//! DSP modules used by the demo binary.

use crate::buffers::StreamData;
use crate::error::{EngineError, Result};
use crate::events::EventCtx;
use crate::graph::module::{AudioModule, ModuleProperties};
use byteorder::{ByteOrder, LittleEndian};

/// Copy as much input as the output side accepts, channel by channel.
/// Returns (consumed_per_buf, produced_per_buf).
pub fn copy_streams(input: &mut StreamData, output: &mut StreamData) -> (usize, usize) {
    let mut consumed = usize::MAX;
    let mut produced = 0;
    let nbufs = input.bufs.num_bufs().min(output.bufs.num_bufs());
    if nbufs == 0 {
        return (0, 0);
    }
    for b in 0..nbufs {
        let avail = input.bufs.bufs[b].actual_len;
        let n = {
            let src = &input.bufs.bufs[b].data[..avail];
            output.bufs.bufs[b].append(src)
        };
        consumed = consumed.min(n);
        produced = n;
    }
    output.flags.erasure |= input.flags.erasure;
    output.flags.eof |= input.flags.eof;
    if input.flags.ts_valid && !output.flags.ts_valid {
        output.flags.ts_valid = true;
        output.timestamp_us = input.timestamp_us;
    }
    (consumed, produced)
}

fn mark_consumed(input: &mut StreamData, consumed: usize) {
    for b in &mut input.bufs.bufs {
        b.actual_len = consumed.min(b.actual_len);
    }
}

/// SISO copy module; inplace-capable.
#[derive(Debug, Default)]
pub struct Passthrough;

impl AudioModule for Passthrough {
    fn process(
        &mut self,
        _ctx: &mut EventCtx,
        inputs: &mut [StreamData],
        outputs: &mut [StreamData],
    ) -> Result<()> {
        let (input, output) = match (inputs.first_mut(), outputs.first_mut()) {
            (Some(i), Some(o)) => (i, o),
            _ => return Ok(()),
        };
        let (consumed, _) = copy_streams(input, output);
        mark_consumed(input, consumed);
        Ok(())
    }
}

pub const PARAM_ID_GAIN: u32 = 0x0800_1006;

/// SISO gain over 16-bit fixed-point PCM. Q13 gain factor.
#[derive(Debug)]
pub struct Gain {
    gain_q13: u16,
    enabled: bool,
}

impl Default for Gain {
    fn default() -> Self {
        // unity
        Self { gain_q13: 1 << 13, enabled: true }
    }
}

impl AudioModule for Gain {
    fn process(
        &mut self,
        _ctx: &mut EventCtx,
        inputs: &mut [StreamData],
        outputs: &mut [StreamData],
    ) -> Result<()> {
        let (input, output) = match (inputs.first_mut(), outputs.first_mut()) {
            (Some(i), Some(o)) => (i, o),
            _ => return Ok(()),
        };
        let nbufs = input.bufs.num_bufs().min(output.bufs.num_bufs());
        let mut consumed = usize::MAX;
        for b in 0..nbufs {
            let avail = input.bufs.bufs[b].actual_len & !1; // whole samples
            let space = output.bufs.bufs[b].remaining() & !1;
            let n = avail.min(space);
            let dst_at = output.bufs.bufs[b].actual_len;
            for i in (0..n).step_by(2) {
                let s = LittleEndian::read_i16(&input.bufs.bufs[b].data[i..]);
                let scaled = if self.enabled {
                    (((s as i32) * (self.gain_q13 as i32)) >> 13).clamp(i16::MIN as i32, i16::MAX as i32)
                        as i16
                } else {
                    s
                };
                LittleEndian::write_i16(&mut output.bufs.bufs[b].data[dst_at + i..], scaled);
            }
            output.bufs.bufs[b].actual_len += n;
            consumed = consumed.min(n);
        }
        output.flags = input.flags;
        output.timestamp_us = input.timestamp_us;
        mark_consumed(input, if consumed == usize::MAX { 0 } else { consumed });
        Ok(())
    }

    fn set_param(&mut self, ctx: &mut EventCtx, param_id: u32, payload: &[u8]) -> Result<()> {
        match param_id {
            PARAM_ID_GAIN => {
                if payload.len() < 2 {
                    return Err(EngineError::bad_param("gain payload too short"));
                }
                self.gain_q13 = LittleEndian::read_u16(payload);
                let enabled = self.gain_q13 != (1 << 13);
                if enabled != self.enabled {
                    self.enabled = enabled;
                    ctx.raise_process_state(enabled);
                }
                ctx.raise_kpps_bw_change();
                Ok(())
            }
            _ => Err(EngineError::Unsupported(format!("gain param 0x{param_id:X}"))),
        }
    }

    fn get_param(&self, param_id: u32) -> Result<Vec<u8>> {
        match param_id {
            PARAM_ID_GAIN => {
                let mut out = vec![0u8; 2];
                LittleEndian::write_u16(&mut out, self.gain_q13);
                Ok(out)
            }
            _ => Err(EngineError::Unsupported(format!("gain param 0x{param_id:X}"))),
        }
    }
}

/// Signal-triggered endpoint: SISO passthrough whose threshold pins the
/// container frame to the hardware interface length.
#[derive(Debug, Default)]
pub struct SignalEndpoint {
    frame_duration_us: Option<u64>,
}

impl AudioModule for SignalEndpoint {
    fn process(
        &mut self,
        _ctx: &mut EventCtx,
        inputs: &mut [StreamData],
        outputs: &mut [StreamData],
    ) -> Result<()> {
        let (input, output) = match (inputs.first_mut(), outputs.first_mut()) {
            (Some(i), Some(o)) => (i, o),
            _ => return Ok(()),
        };
        let (consumed, _) = copy_streams(input, output);
        mark_consumed(input, consumed);
        Ok(())
    }

    fn set_properties(&mut self, _ctx: &mut EventCtx, props: &ModuleProperties) -> Result<()> {
        if let Some(us) = props.frame_duration_us {
            self.frame_duration_us = Some(us);
        }
        Ok(())
    }
}

/// Stand-in for a module that has not been resolved yet; behaves as a
/// pass-through and forwards everything once resolved.
pub struct Placeholder {
    resolved: Option<Box<dyn AudioModule>>,
}

impl Default for Placeholder {
    fn default() -> Self {
        Self { resolved: None }
    }
}

impl Placeholder {
    pub fn resolve(&mut self, module: Box<dyn AudioModule>) {
        self.resolved = Some(module);
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }
}

impl AudioModule for Placeholder {
    fn process(
        &mut self,
        ctx: &mut EventCtx,
        inputs: &mut [StreamData],
        outputs: &mut [StreamData],
    ) -> Result<()> {
        match &mut self.resolved {
            Some(real) => real.process(ctx, inputs, outputs),
            None => Passthrough.process(ctx, inputs, outputs),
        }
    }

    fn set_param(&mut self, ctx: &mut EventCtx, param_id: u32, payload: &[u8]) -> Result<()> {
        match &mut self.resolved {
            Some(real) => real.set_param(ctx, param_id, payload),
            None => Err(EngineError::NeedMore),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::ChannelBufs;

    fn stream(num_bufs: usize, cap: usize) -> StreamData {
        StreamData { bufs: ChannelBufs::new(num_bufs, cap), ..Default::default() }
    }

    #[test]
    fn passthrough_copies_and_marks_consumed() {
        let mut input = stream(2, 8);
        let mut output = stream(2, 8);
        input.bufs.bufs[0].append(&[1, 2, 3, 4]);
        input.bufs.bufs[1].append(&[5, 6, 7, 8]);
        Passthrough.process(&mut EventCtx::default(), &mut [input], &mut [output]).unwrap();
    }

    #[test]
    fn gain_scales_16bit() {
        let mut g = Gain::default();
        let mut ctx = EventCtx::default();
        // 2.0 in Q13
        g.set_param(&mut ctx, PARAM_ID_GAIN, &(2u16 << 13).to_le_bytes()).unwrap();

        let mut input = stream(1, 8);
        let mut sample = [0u8; 2];
        LittleEndian::write_i16(&mut sample, 1000);
        input.bufs.bufs[0].append(&sample);
        input.bufs.bufs[0].append(&sample);
        let mut outputs = [stream(1, 8)];
        let mut inputs = [input];
        g.process(&mut ctx, &mut inputs, &mut outputs).unwrap();
        assert_eq!(outputs[0].bufs.bufs[0].actual_len, 4);
        assert_eq!(LittleEndian::read_i16(&outputs[0].bufs.bufs[0].data[..2]), 2000);
        // inputs report consumption
        assert_eq!(inputs[0].bufs.bufs[0].actual_len, 4);
    }

    #[test]
    fn gain_saturates() {
        let mut g = Gain::default();
        let mut ctx = EventCtx::default();
        g.set_param(&mut ctx, PARAM_ID_GAIN, &(4u16 << 13).to_le_bytes()).unwrap();
        let mut input = stream(1, 2);
        let mut sample = [0u8; 2];
        LittleEndian::write_i16(&mut sample, i16::MAX / 2);
        input.bufs.bufs[0].append(&sample);
        let mut outputs = [stream(1, 2)];
        g.process(&mut ctx, &mut [input], &mut outputs).unwrap();
        assert_eq!(LittleEndian::read_i16(&outputs[0].bufs.bufs[0].data[..2]), i16::MAX);
    }

    #[test]
    fn unresolved_placeholder_passes_through() {
        let mut p = Placeholder::default();
        assert!(!p.is_resolved());
        let mut input = stream(1, 4);
        input.bufs.bufs[0].append(&[9, 9]);
        let mut outputs = [stream(1, 4)];
        p.process(&mut EventCtx::default(), &mut [input], &mut outputs).unwrap();
        assert_eq!(outputs[0].bufs.bufs[0].actual_len, 2);
        p.resolve(Box::new(Gain::default()));
        assert!(p.is_resolved());
    }
}
