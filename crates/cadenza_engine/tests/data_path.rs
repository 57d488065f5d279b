//! End-to-end data-triggered processing through a two-module container.

use cadenza_engine::Command;
use cadenza_protocol::{DataMsg, InPortMsg, MetadataItem, OutPortMsg};
use cadenza_test_utils::{build_siso, exec, frame_v2, SisoFixture, SisoOptions, SG};
use std::time::Duration;

fn start(fx: &mut SisoFixture) {
    let ack = exec(&mut fx.container, &fx.handle, Command::GraphPrepare(vec![SG]));
    assert!(ack.code.is_ok());
    let ack = exec(&mut fx.container, &fx.handle, Command::GraphStart(vec![SG]));
    assert!(ack.code.is_ok());
}

fn next_data(fx: &mut SisoFixture) -> DataMsg {
    for _ in 0..50 {
        if let Ok(msg) = fx.out_rx.try_recv() {
            match msg {
                OutPortMsg::Data(d) => return d,
                _ => continue,
            }
        }
        fx.container.poll_once(Some(Duration::from_millis(10)));
    }
    panic!("no data frame delivered");
}

#[test]
fn frame_flows_through_container() {
    let mut fx = build_siso(SisoOptions::default());
    start(&mut fx);

    // default low-power frame: 5 ms of stereo 48 kHz 16-bit = 960 bytes
    fx.ret_tx.send(DataMsg::empty_v2(2, 480)).unwrap();
    fx.in_tx.send(InPortMsg::Data(frame_v2(2, 480, 0x42))).unwrap();

    let data = next_data(&mut fx);
    assert_eq!(data.actual_len_total(), 960);
    if let cadenza_protocol::DataBuf::V2 { data, channels } = &data.buf {
        assert_eq!(channels.len(), 2);
        assert!(data.iter().all(|&b| b == 0x42));
    } else {
        panic!("expected v2 layout");
    }
}

#[test]
fn output_media_format_precedes_data() {
    let mut fx = build_siso(SisoOptions::default());
    start(&mut fx);

    fx.ret_tx.send(DataMsg::empty_v2(2, 480)).unwrap();
    fx.in_tx.send(InPortMsg::Data(frame_v2(2, 480, 1))).unwrap();

    let mut saw_mf = false;
    for _ in 0..50 {
        if let Ok(msg) = fx.out_rx.try_recv() {
            match msg {
                OutPortMsg::MediaFormat(mf) => {
                    saw_mf = true;
                    assert_eq!(mf.sample_rate, 48_000);
                }
                OutPortMsg::Data(_) => {
                    assert!(saw_mf, "data before media format");
                    return;
                }
                OutPortMsg::FrameLen(update) => {
                    assert_eq!(update.frame_len_us, 5_000);
                }
            }
        } else {
            fx.container.poll_once(Some(Duration::from_millis(10)));
        }
    }
    panic!("no data frame delivered");
}

#[test]
fn metadata_emerges_in_offset_order() {
    let mut fx = build_siso(SisoOptions::default());
    start(&mut fx);

    fx.ret_tx.send(DataMsg::empty_v2(2, 480)).unwrap();
    let mut frame = frame_v2(2, 480, 7);
    frame.metadata.push(MetadataItem::new(100, cadenza_protocol::MetadataKind::Eof));
    frame.metadata.push(MetadataItem::dfg(900));
    frame.metadata.push(MetadataItem::new(40, cadenza_protocol::MetadataKind::Eof));
    fx.in_tx.send(InPortMsg::Data(frame)).unwrap();

    let data = next_data(&mut fx);
    let offsets: Vec<u64> = data.metadata.iter().map(|i| i.offset).collect();
    let mut sorted = offsets.clone();
    sorted.sort();
    assert_eq!(offsets, sorted, "metadata out of offset order: {offsets:?}");
    assert_eq!(offsets.len(), 3);
}

#[test]
fn consecutive_frames_in_order() {
    let mut fx = build_siso(SisoOptions::default());
    start(&mut fx);

    for n in 0..3u8 {
        fx.ret_tx.send(DataMsg::empty_v2(2, 480)).unwrap();
        fx.in_tx.send(InPortMsg::Data(frame_v2(2, 480, n + 1))).unwrap();
        let data = next_data(&mut fx);
        if let cadenza_protocol::DataBuf::V2 { data, .. } = &data.buf {
            assert!(data.iter().all(|&b| b == n + 1), "frame {n} out of order");
        }
    }
}

#[test]
fn stop_then_start_preserves_buffer_sizes() {
    let mut fx = build_siso(SisoOptions::default());
    start(&mut fx);

    let src = fx.container.graph.find_module(cadenza_test_utils::SRC_IID).unwrap();
    let ip = fx.container.graph.node(src).in_ports[0];
    let before = fx.container.graph.in_port(ip).common.bufs.max_len_per_buf;
    assert_eq!(before, 480);

    let ack = exec(&mut fx.container, &fx.handle, Command::GraphStop(vec![SG]));
    assert!(ack.code.is_ok());
    // stopped ports hold no data
    assert_eq!(fx.container.graph.in_port(ip).common.bufs.actual_len_total(), 0);

    let ack = exec(&mut fx.container, &fx.handle, Command::GraphStart(vec![SG]));
    assert!(ack.code.is_ok());
    assert_eq!(fx.container.graph.in_port(ip).common.bufs.max_len_per_buf, before);
}

#[test]
fn destroy_acks_terminated() {
    let mut fx = build_siso(SisoOptions::default());
    let ack = exec(&mut fx.container, &fx.handle, Command::Destroy);
    assert_eq!(ack.code, cadenza_protocol::AckCode::Terminated);
}
