//! Signal-triggered operation: timer-driven frames, underrun fill, overrun
//! drop, and endpoint threshold validation.

use cadenza_engine::Command;
use cadenza_protocol::{DataBuf, DataMsg, InPortMsg, OutPortMsg};
use cadenza_test_utils::{build_siso, exec, frame_v2, SisoFixture, SisoOptions, SG};
use std::time::{Duration, Instant};

const FRAME_BYTES: u64 = 960; // 5 ms stereo 48 kHz 16-bit

fn st_fixture() -> SisoFixture {
    build_siso(SisoOptions { endpoint_thresh_bytes: Some(FRAME_BYTES), ..Default::default() })
}

fn start(fx: &mut SisoFixture) {
    let ack = exec(&mut fx.container, &fx.handle, Command::GraphPrepare(vec![SG]));
    assert!(ack.code.is_ok());
    let ack = exec(&mut fx.container, &fx.handle, Command::GraphStart(vec![SG]));
    assert!(ack.code.is_ok());
}

fn tick(fx: &mut SisoFixture) {
    fx.timer_tx.send(Instant::now()).unwrap();
    assert!(fx.container.poll_once(Some(Duration::from_millis(50))));
}

fn next_data(fx: &mut SisoFixture) -> DataMsg {
    for _ in 0..20 {
        match fx.out_rx.try_recv() {
            Ok(OutPortMsg::Data(d)) => return d,
            Ok(_) => continue,
            Err(_) => {
                fx.container.poll_once(Some(Duration::from_millis(5)));
            }
        }
    }
    panic!("no data frame delivered");
}

#[test]
fn tick_drives_one_frame() {
    let mut fx = st_fixture();
    start(&mut fx);

    fx.in_tx.send(InPortMsg::Data(frame_v2(2, 480, 0x55))).unwrap();
    fx.ret_tx.send(DataMsg::empty_v2(2, 480)).unwrap();
    tick(&mut fx);

    let data = next_data(&mut fx);
    assert_eq!(data.actual_len_total(), 960);
    if let DataBuf::V2 { data, .. } = &data.buf {
        assert!(data.iter().all(|&b| b == 0x55));
    }
}

#[test]
fn underrun_zero_fills_with_erasure() {
    let mut fx = st_fixture();
    start(&mut fx);

    // first frame with real data so processing begins
    fx.in_tx.send(InPortMsg::Data(frame_v2(2, 480, 0x55))).unwrap();
    fx.ret_tx.send(DataMsg::empty_v2(2, 480)).unwrap();
    tick(&mut fx);
    let first = next_data(&mut fx);
    assert_eq!(first.actual_len_total(), 960);

    // second tick with no input: the remaining region is zero-filled
    fx.ret_tx.send(DataMsg::empty_v2(2, 480)).unwrap();
    tick(&mut fx);
    let second = next_data(&mut fx);
    assert_eq!(second.actual_len_total(), 960);
    if let DataBuf::V2 { data, .. } = &second.buf {
        assert!(data.iter().all(|&b| b == 0), "underrun must deliver silence");
    }

    // the erasure flag was raised on the stream inside the container
    let src = fx.container.graph.find_module(cadenza_test_utils::SRC_IID).unwrap();
    let ip = fx.container.graph.node(src).in_ports[0];
    assert!(fx.container.graph.in_port(ip).common.flags.erasure);
}

#[test]
fn partial_underrun_preserves_prefix() {
    let mut fx = st_fixture();
    start(&mut fx);

    fx.in_tx.send(InPortMsg::Data(frame_v2(2, 480, 0x11))).unwrap();
    fx.ret_tx.send(DataMsg::empty_v2(2, 480)).unwrap();
    tick(&mut fx);
    let _ = next_data(&mut fx);

    // half a frame of real data, the rest is erasure
    fx.in_tx.send(InPortMsg::Data(frame_v2(2, 240, 0x22))).unwrap();
    fx.ret_tx.send(DataMsg::empty_v2(2, 480)).unwrap();
    tick(&mut fx);
    let data = next_data(&mut fx);
    assert_eq!(data.actual_len_total(), 960);
    if let DataBuf::V2 { data, channels } = &data.buf {
        for c in channels {
            let seg = &data[c.offset as usize..(c.offset + c.actual_len) as usize];
            assert!(seg[..240].iter().all(|&b| b == 0x22));
            assert!(seg[240..].iter().all(|&b| b == 0));
        }
    }
}

#[test]
fn overrun_drops_the_tick() {
    let mut fx = st_fixture();
    start(&mut fx);

    // no empty buffer downstream: the produced frame is dropped
    fx.in_tx.send(InPortMsg::Data(frame_v2(2, 480, 0x77))).unwrap();
    tick(&mut fx);
    assert!(fx
        .out_rx
        .try_iter()
        .all(|m| !matches!(m, OutPortMsg::Data(_))));

    // the internal output buffer was emptied, not carried over
    let mid = fx.container.graph.find_module(cadenza_test_utils::MID_IID).unwrap();
    let op = fx.container.graph.node(mid).out_ports[0];
    assert_eq!(fx.container.graph.out_port(op).common.bufs.actual_len_total(), 0);

    // next tick underruns and delivers silence
    fx.ret_tx.send(DataMsg::empty_v2(2, 480)).unwrap();
    tick(&mut fx);
    let data = next_data(&mut fx);
    if let DataBuf::V2 { data, .. } = &data.buf {
        assert!(data.iter().all(|&b| b == 0));
    }
}

#[test]
fn signal_miss_is_counted() {
    let mut fx = st_fixture();
    start(&mut fx);

    fx.ret_tx.send(DataMsg::empty_v2(2, 480)).unwrap();
    // two ticks land before the container wakes: one miss
    fx.timer_tx.send(Instant::now()).unwrap();
    fx.timer_tx.send(Instant::now()).unwrap();
    fx.container.poll_once(Some(Duration::from_millis(50)));
    assert_eq!(fx.container.stm.signal_miss_count, 1);
}

#[test]
fn endpoint_threshold_must_be_multiple_of_module_thresholds() {
    // endpoint 1 ms, inner module 2 ms: rejected at prepare
    let mf = cadenza_protocol::MediaFormat::pcm(2, 48_000, 16);
    let mut fx = build_siso(SisoOptions {
        endpoint_thresh_bytes: Some(mf.us_to_bytes(1_000)),
        mid_thresh_bytes: Some(mf.us_to_bytes(2_000)),
        ..Default::default()
    });
    let ack = exec(&mut fx.container, &fx.handle, Command::GraphPrepare(vec![SG]));
    assert_eq!(ack.code, cadenza_protocol::AckCode::Failed);
}

#[test]
fn endpoint_multiple_thresholds_accepted_with_loops() {
    // endpoint 10 ms, inner module 5 ms: accepted, inner runs twice per frame
    let mf = cadenza_protocol::MediaFormat::pcm(2, 48_000, 16);
    let mut fx = build_siso(SisoOptions {
        endpoint_thresh_bytes: Some(mf.us_to_bytes(10_000)),
        mid_thresh_bytes: Some(mf.us_to_bytes(5_000)),
        ..Default::default()
    });
    let ack = exec(&mut fx.container, &fx.handle, Command::GraphPrepare(vec![SG]));
    assert!(ack.code.is_ok());
    let mid = fx.container.graph.find_module(cadenza_test_utils::MID_IID).unwrap();
    assert_eq!(fx.container.graph.node(mid).num_proc_loops, 2);
    assert!(fx.container.cannot_be_pure_signal_triggered);
}
