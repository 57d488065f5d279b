//! Cadenza engine demo.
//!
//! Runs a signal-triggered gain chain for a few seconds: a timer drives the
//! container, a feeder thread supplies PCM frames on the external input, and
//! a drain thread returns buffers on the external output.
//!
//! Usage:
//!     cadenza-engine --frame-ms 5 --seconds 2

use anyhow::Result;
use cadenza_engine::modules::{Gain, SignalEndpoint, PARAM_ID_GAIN};
use cadenza_engine::{
    Command, ConnDef, Container, ContainerConfig, ExtInDecl, ExtOutDecl, GraphOpenPayload,
    MediaFmtDecl, ModuleDef, ModuleFlags, PortRef, ThresholdDecl,
};
use cadenza_protocol::{DataBuf, DataMsg, InPortMsg, MediaFormat, ModuleIid, OutPortMsg, PortId, SubgraphId};
use clap::Parser;
use crossbeam_channel::bounded;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "cadenza-engine", about = "Generic audio container demo")]
struct Args {
    /// Container frame length in milliseconds
    #[arg(long, default_value_t = 5)]
    frame_ms: u64,

    /// How long to run
    #[arg(long, default_value_t = 2)]
    seconds: u64,

    /// Verbose logging
    #[arg(long, short)]
    verbose: bool,
}

const EP_IID: ModuleIid = ModuleIid::new(0x2001);
const GAIN_IID: ModuleIid = ModuleIid::new(0x2002);
const SG: SubgraphId = SubgraphId::new(1);

fn main() -> Result<()> {
    let args = Args::parse();
    cadenza_logging::init_logging(cadenza_logging::LogConfig {
        app_name: "cadenza-engine",
        verbose: args.verbose,
        log_dir: None,
    })?;

    let mf = MediaFormat::pcm(2, 48_000, 16);
    let frame_bytes = mf.us_to_bytes(args.frame_ms * 1_000);
    let per_ch = (frame_bytes / 2) as usize;

    let mut container = Container::new(ContainerConfig::default());
    let handle = container.handle();
    container.attach_timer(crossbeam_channel::tick(Duration::from_millis(args.frame_ms)));

    let (in_tx, in_rx) = bounded::<InPortMsg>(16);
    let (out_tx, out_rx) = bounded::<OutPortMsg>(16);
    let (ret_tx, ret_rx) = bounded::<DataMsg>(16);

    let open = GraphOpenPayload {
        subgraphs: vec![SG],
        modules: vec![
            ModuleDef {
                iid: EP_IID,
                sg: SG,
                flags: ModuleFlags::NEEDS_SIGNAL_TRIGGER | ModuleFlags::NEEDS_THRESHOLD_CFG,
                inplace: false,
                headroom_bytes_per_ch: 0,
                in_ports: vec![PortId::new(2)],
                out_ports: vec![PortId::new(1)],
                thresholds: vec![ThresholdDecl {
                    port: PortRef { id: PortId::new(2), is_input: true },
                    bytes: frame_bytes,
                }],
                media_fmts: vec![MediaFmtDecl {
                    port: PortRef { id: PortId::new(2), is_input: true },
                    mf: mf.clone(),
                }],
                processor: Box::new(SignalEndpoint::default()),
            },
            ModuleDef {
                iid: GAIN_IID,
                sg: SG,
                flags: ModuleFlags::empty(),
                inplace: true,
                headroom_bytes_per_ch: 0,
                in_ports: vec![PortId::new(2)],
                out_ports: vec![PortId::new(1)],
                thresholds: vec![],
                media_fmts: vec![],
                processor: Box::new(Gain::default()),
            },
        ],
        connections: vec![ConnDef {
            from: (EP_IID, PortId::new(1)),
            to: (GAIN_IID, PortId::new(2)),
        }],
        ext_ins: vec![ExtInDecl { module: EP_IID, port: PortId::new(2), rx: in_rx }],
        ext_outs: vec![ExtOutDecl {
            module: GAIN_IID,
            port: PortId::new(1),
            tx: out_tx,
            buf_rx: ret_rx,
        }],
    };

    // feeder: a 1 kHz-ish square wave, one frame ahead of the timer
    let feeder = std::thread::spawn(move || {
        let frame_ms = args.frame_ms;
        let total = (args.seconds * 1_000 / frame_ms) as usize;
        let mut phase = 0u32;
        for n in 0..total {
            let mut msg = DataMsg::empty_v2(2, per_ch);
            if let DataBuf::V2 { data, channels } = &mut msg.buf {
                for sample in data.chunks_exact_mut(2) {
                    let v: i16 = if (phase / 24) % 2 == 0 { 6000 } else { -6000 };
                    sample.copy_from_slice(&v.to_le_bytes());
                    phase += 1;
                }
                for c in channels.iter_mut() {
                    c.actual_len = per_ch as u32;
                }
            }
            msg.timestamp_us = Some((n as u64 * frame_ms * 1_000) as i64);
            if in_tx.send(InPortMsg::Data(msg)).is_err() {
                break;
            }
            std::thread::sleep(Duration::from_millis(frame_ms));
        }
    });

    // drain: count frames, recycle buffers
    let drain = std::thread::spawn(move || {
        let mut frames = 0u64;
        let mut bytes = 0u64;
        // prime the rotation with two empties
        for _ in 0..2 {
            let _ = ret_tx.send(DataMsg::empty_v2(2, per_ch));
        }
        while let Ok(msg) = out_rx.recv_timeout(Duration::from_secs(2)) {
            if let OutPortMsg::Data(mut data) = msg {
                frames += 1;
                bytes += data.actual_len_total() as u64;
                if let DataBuf::V2 { channels, .. } = &mut data.buf {
                    for c in channels.iter_mut() {
                        c.actual_len = 0;
                    }
                }
                data.metadata.clear();
                if ret_tx.send(data).is_err() {
                    break;
                }
            }
        }
        (frames, bytes)
    });

    let worker = std::thread::spawn(move || container.run());

    assert!(handle.call(Command::GraphOpen(open)).code.is_ok());
    assert!(handle.call(Command::GraphPrepare(vec![SG])).code.is_ok());
    // 0.5x gain
    assert!(handle
        .call(Command::SetCfg {
            module: GAIN_IID,
            param_id: PARAM_ID_GAIN,
            payload: (1u16 << 12).to_le_bytes().to_vec(),
        })
        .code
        .is_ok());
    assert!(handle.call(Command::GraphStart(vec![SG])).code.is_ok());

    std::thread::sleep(Duration::from_secs(args.seconds));

    assert!(handle.call(Command::GraphStop(vec![SG])).code.is_ok());
    let _ = handle.call(Command::Destroy);

    feeder.join().ok();
    let _ = worker.join();
    if let Ok((frames, bytes)) = drain.join() {
        println!("delivered {frames} frames, {bytes} bytes");
    }
    Ok(())
}
