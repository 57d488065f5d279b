//! Gap closure: upstream stop, close, and flush semantics.

use cadenza_engine::{Command, PeerPortProperty, PortState};
use cadenza_protocol::{DataMsg, InPortMsg, MetadataKind, OutPortMsg};
use cadenza_test_utils::{build_siso, exec, frame_v2, SisoFixture, SisoOptions, IN_PORT, SG, SRC_IID};
use std::time::Duration;

fn start(fx: &mut SisoFixture) {
    let ack = exec(&mut fx.container, &fx.handle, Command::GraphPrepare(vec![SG]));
    assert!(ack.code.is_ok());
    let ack = exec(&mut fx.container, &fx.handle, Command::GraphStart(vec![SG]));
    assert!(ack.code.is_ok());
}

fn flow_one_frame(fx: &mut SisoFixture) {
    fx.ret_tx.send(DataMsg::empty_v2(2, 480)).unwrap();
    fx.in_tx.send(InPortMsg::Data(frame_v2(2, 480, 0x33))).unwrap();
    for _ in 0..50 {
        if fx.out_rx.try_iter().any(|m| matches!(m, OutPortMsg::Data(_))) {
            return;
        }
        fx.container.poll_once(Some(Duration::from_millis(10)));
    }
    panic!("frame did not flow");
}

fn drain_for_eos(fx: &mut SisoFixture) -> Option<cadenza_protocol::MetadataItem> {
    for _ in 0..50 {
        for msg in fx.out_rx.try_iter() {
            if let OutPortMsg::Data(d) = msg {
                for item in d.metadata {
                    if item.is_flushing_eos() {
                        return Some(item);
                    }
                }
            }
        }
        fx.container.poll_once(Some(Duration::from_millis(10)));
    }
    None
}

#[test]
fn upstream_stop_synthesizes_internal_eos() {
    let mut fx = build_siso(SisoOptions::default());
    start(&mut fx);
    flow_one_frame(&mut fx);

    // a buffer is available so the gap can be delivered at once
    fx.ret_tx.send(DataMsg::empty_v2(2, 480)).unwrap();
    let ack = exec(
        &mut fx.container,
        &fx.handle,
        Command::UpstreamStopped { module: SRC_IID, port: IN_PORT },
    );
    assert!(ack.code.is_ok());

    let eos = drain_for_eos(&mut fx).expect("flushing EOS must reach downstream");
    match eos.kind {
        MetadataKind::Eos { flags, .. } => {
            assert!(flags.is_flushing);
            assert!(flags.is_internal);
        }
        other => panic!("unexpected metadata: {other:?}"),
    }

    // the port observed the gap
    let src = fx.container.graph.find_module(SRC_IID).unwrap();
    let ip = fx.container.graph.node(src).in_ports[0];
    assert_eq!(
        fx.container.graph.in_port(ip).common.data_flow_state,
        cadenza_engine::DataFlowState::AtGap
    );
}

#[test]
fn peer_stop_property_downgrades_port_state() {
    let mut fx = build_siso(SisoOptions::default());
    start(&mut fx);
    flow_one_frame(&mut fx);

    fx.ret_tx.send(DataMsg::empty_v2(2, 480)).unwrap();
    let ack = exec(
        &mut fx.container,
        &fx.handle,
        Command::PeerPortPropertyUpdate {
            module: SRC_IID,
            port: IN_PORT,
            property: PeerPortProperty::PortState(PortState::Stopped),
        },
    );
    assert!(ack.code.is_ok());

    assert!(drain_for_eos(&mut fx).is_some(), "EOS delivered before downgrade");

    let src = fx.container.graph.find_module(SRC_IID).unwrap();
    let ip = fx.container.graph.node(src).in_ports[0];
    let common = &fx.container.graph.in_port(ip).common;
    assert_eq!(common.state, PortState::Stopped);
    // stopped ports hold no data and no metadata
    assert_eq!(common.bufs.actual_len_total(), 0);
    assert!(common.md_list.is_empty());
}

#[test]
fn close_sends_eos_on_flowing_outputs() {
    let mut fx = build_siso(SisoOptions::default());
    start(&mut fx);
    flow_one_frame(&mut fx);

    let ack = exec(&mut fx.container, &fx.handle, Command::GraphClose(vec![SG]));
    assert!(ack.code.is_ok());

    let mut saw_eos = false;
    for msg in fx.out_rx.try_iter() {
        if let OutPortMsg::Data(d) = msg {
            saw_eos |= d.metadata.iter().any(|i| i.is_flushing_eos());
        }
    }
    assert!(saw_eos, "close must guarantee gap closure downstream");
    assert!(fx.container.graph.sorted.is_empty());
}

#[test]
fn flush_drops_staged_input() {
    let mut fx = build_siso(SisoOptions::default());
    start(&mut fx);

    // half a frame staged, no buffer downstream yet
    fx.in_tx.send(InPortMsg::Data(frame_v2(2, 240, 0x99))).unwrap();
    fx.container.poll_once(Some(Duration::from_millis(10)));

    let ack = exec(&mut fx.container, &fx.handle, Command::GraphFlush(vec![SG]));
    assert!(ack.code.is_ok());

    let src = fx.container.graph.find_module(SRC_IID).unwrap();
    let ip = fx.container.graph.node(src).in_ports[0];
    assert_eq!(fx.container.graph.in_port(ip).common.bufs.actual_len_total(), 0);

    // a fresh full frame flows cleanly after the flush
    flow_one_frame(&mut fx);
}

#[test]
fn suspend_releases_votes() {
    let mut fx = build_siso(SisoOptions::default());
    start(&mut fx);
    flow_one_frame(&mut fx);
    assert!(fx.container.power.bw_bytes_per_sec > 0);

    let ack = exec(&mut fx.container, &fx.handle, Command::GraphSuspend(vec![SG]));
    assert!(ack.code.is_ok());
    assert_eq!(fx.container.power.bw_bytes_per_sec, 0);
    assert!(!fx.container.power.island.participating);
}
