//! End-to-end dispatch scenarios
//!
//! Drives the whole engine the way the kernel shim would: raw packets and
//! conntrack events in, verdicts and dictionary writes out. Playback runs
//! through the in-memory kernel driver.

use nfdispatch::dict::Dictionary;
use nfdispatch::dispatch::{DispatchEngine, DispatchSettings, NfqueueFunc, NfqueueResult};
use nfdispatch::kernel::{
    CaptureWriter, ConntrackEvent, ConntrackEventType, NetloggerEvent, PlaybackDriver, Verdict,
    NEW_FLOW_MARK,
};
use nfdispatch::protocol::ipv4::{Ipv4Builder, Protocol};
use nfdispatch::protocol::tcp::{self, TcpFlags};
use nfdispatch::telemetry::MetricsRegistry;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn engine() -> Arc<DispatchEngine> {
    engine_with(DispatchSettings::default())
}

fn engine_with(settings: DispatchSettings) -> Arc<DispatchEngine> {
    Arc::new(DispatchEngine::new(
        settings,
        Arc::new(Dictionary::new()),
        Arc::new(MetricsRegistry::new()),
    ))
}

/// TCP packet from the given endpoints, SYN flag set.
fn tcp_packet(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Vec<u8> {
    let flags = TcpFlags {
        syn: true,
        ..Default::default()
    };
    let segment = tcp::build_segment(src_port, dst_port, flags, &[]);
    Ipv4Builder::new()
        .src_addr(src)
        .dst_addr(dst)
        .protocol(Protocol::Tcp as u8)
        .payload(&segment)
        .build()
}

fn client_syn() -> Vec<u8> {
    tcp_packet(
        Ipv4Addr::new(10, 0, 0, 1),
        50000,
        Ipv4Addr::new(93, 184, 216, 34),
        443,
    )
}

fn server_reply() -> Vec<u8> {
    tcp_packet(
        Ipv4Addr::new(93, 184, 216, 34),
        443,
        Ipv4Addr::new(10, 0, 0, 1),
        50000,
    )
}

fn passive_plugin(owner: &'static str, mark: u32) -> NfqueueFunc {
    Arc::new(move |_mess, _ctid, _new_session| NfqueueResult {
        owner: owner.to_string(),
        packet_mark: mark,
        session_release: false,
    })
}

fn conntrack_new(ctid: u32) -> ConntrackEvent {
    ConntrackEvent {
        event_type: ConntrackEventType::New,
        conntrack_id: ctid,
        protocol: 6,
        src_address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        dst_address: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
        src_port: 50000,
        dst_port: 443,
        orig_bytes: 60,
        repl_bytes: 0,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_tcp_flow_with_two_passive_plugins() {
    let engine = engine();
    engine.insert_nfqueue_subscription("a", 0, passive_plugin("a", 0x01));
    engine.insert_nfqueue_subscription("b", 1, passive_plugin("b", 0x02));

    let packet = client_syn();
    let length = packet.len();
    let (verdict, mark) = engine
        .nfqueue_callback(100, &packet, length, NEW_FLOW_MARK)
        .await;

    assert_eq!(verdict, Verdict::Accept);
    assert_eq!(mark, NEW_FLOW_MARK | 0x03);

    let sessions = engine.session_table();
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(
        session.client_side_tuple,
        "6|10.0.0.1:50000-93.184.216.34:443"
    );
    assert_eq!(session.conntrack_id, 100);
    assert_eq!(session.packet_count, 1);
    assert_eq!(session.byte_count, length as u64);
    assert!(!session.conntrack_confirmed);
    assert_eq!(session.subscriptions, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn reply_packet_reuses_session_in_reverse_direction() {
    let engine = engine();
    let directions: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = directions.clone();
    engine.insert_nfqueue_subscription(
        "dir",
        0,
        Arc::new(move |mess, _ctid, _new_session| {
            seen.lock().unwrap().push(mess.client_to_server);
            NfqueueResult {
                owner: "dir".to_string(),
                packet_mark: 0,
                session_release: false,
            }
        }),
    );

    let syn = client_syn();
    engine
        .nfqueue_callback(100, &syn, syn.len(), NEW_FLOW_MARK)
        .await;

    let reply = server_reply();
    engine.nfqueue_callback(100, &reply, reply.len(), 0).await;

    assert_eq!(*directions.lock().unwrap(), vec![true, false]);
    let sessions = engine.session_table();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].packet_count, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn midflow_packet_is_bypassed_without_session() {
    let engine = engine();
    engine.insert_nfqueue_subscription("a", 0, passive_plugin("a", 0x01));

    let packet = client_syn();
    let (verdict, mark) = engine.nfqueue_callback(77, &packet, packet.len(), 0).await;

    assert_eq!(verdict, Verdict::Accept);
    assert_eq!(mark, 0);
    assert_eq!(engine.session_count(), 0);
    assert!(engine.dictionary().is_bypassed(77));
}

#[tokio::test(flavor = "multi_thread")]
async fn releasing_last_plugin_sets_bypass() {
    let engine = engine();
    engine.insert_nfqueue_subscription(
        "oneshot",
        0,
        Arc::new(|_mess, _ctid, _new_session| NfqueueResult {
            owner: "oneshot".to_string(),
            packet_mark: 0,
            session_release: true,
        }),
    );

    let packet = client_syn();
    engine
        .nfqueue_callback(42, &packet, packet.len(), NEW_FLOW_MARK)
        .await;

    let sessions = engine.session_table();
    assert_eq!(sessions[0].subscriptions, 0);
    assert!(engine.dictionary().is_bypassed(42));
}

#[tokio::test(flavor = "multi_thread")]
async fn unconfirmed_collision_is_evicted_and_recreated() {
    let engine = engine();

    let packet = client_syn();
    engine
        .nfqueue_callback(100, &packet, packet.len(), NEW_FLOW_MARK)
        .await;
    let old_id = engine.session_table()[0].session_id;

    // same tuple arrives flagged as a new flow under a different ctid
    engine
        .nfqueue_callback(101, &packet, packet.len(), NEW_FLOW_MARK)
        .await;

    let sessions = engine.session_table();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].conntrack_id, 101);
    assert!(sessions[0].session_id > old_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn confirmed_collision_keeps_existing_session() {
    let engine = engine();

    let packet = client_syn();
    engine
        .nfqueue_callback(100, &packet, packet.len(), NEW_FLOW_MARK)
        .await;
    engine.conntrack_callback(conntrack_new(100));
    let old_id = engine.session_table()[0].session_id;

    engine
        .nfqueue_callback(101, &packet, packet.len(), NEW_FLOW_MARK)
        .await;

    let sessions = engine.session_table();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, old_id);
    assert_eq!(sessions[0].conntrack_id, 100);
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_plugin_is_timed_out_and_released() {
    let engine = engine_with(DispatchSettings {
        plugin_timeout: Duration::from_millis(50),
        ..Default::default()
    });

    let calls = Arc::new(Mutex::new(0usize));
    let calls_in_handler = calls.clone();
    engine.insert_nfqueue_subscription(
        "slow",
        0,
        Arc::new(move |_mess, _ctid, _new_session| {
            *calls_in_handler.lock().unwrap() += 1;
            std::thread::sleep(Duration::from_millis(400));
            NfqueueResult {
                owner: "slow".to_string(),
                packet_mark: 0x40,
                session_release: false,
            }
        }),
    );

    let packet = client_syn();
    let (verdict, mark) = engine
        .nfqueue_callback(9, &packet, packet.len(), NEW_FLOW_MARK)
        .await;

    assert_eq!(verdict, Verdict::Accept);
    assert_eq!(mark, NEW_FLOW_MARK); // the slow plugin's mark is discarded
    assert_eq!(engine.session_table()[0].subscriptions, 0);

    // later packets on the flow never reach the plugin again
    let reply = server_reply();
    engine.nfqueue_callback(9, &reply, reply.len(), 0).await;
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn conntrack_events_confirm_and_destroy_sessions() {
    let engine = engine();

    let packet = client_syn();
    engine
        .nfqueue_callback(100, &packet, packet.len(), NEW_FLOW_MARK)
        .await;
    assert!(!engine.session_table()[0].conntrack_confirmed);

    engine.conntrack_callback(conntrack_new(100));
    assert!(engine.session_table()[0].conntrack_confirmed);
    assert_eq!(engine.conntrack_table().len(), 1);
    assert_eq!(engine.conntrack_table()[0].orig_bytes, 60);

    let destroy = ConntrackEvent {
        event_type: ConntrackEventType::Destroy,
        ..conntrack_new(100)
    };
    engine.conntrack_callback(destroy);
    assert_eq!(engine.session_count(), 0);
    assert!(engine.conntrack_table().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn warehouse_playback_and_cleanup() {
    let engine = engine();
    engine.insert_nfqueue_subscription("a", 0, passive_plugin("a", 0x01));

    let prefixes: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = prefixes.clone();
    engine.insert_netlogger_subscription(
        "nflog",
        0,
        Arc::new(move |event: &NetloggerEvent| {
            seen.lock().unwrap().push(event.prefix.clone());
        }),
    );

    let path = capture_path("playback");
    {
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = CaptureWriter::new(file).unwrap();
        writer
            .write_packet(500, NEW_FLOW_MARK, &client_syn())
            .unwrap();
        writer.write_conntrack(&conntrack_new(500)).unwrap();
        // loopback event must be filtered out by the shim-side rules
        let loopback = ConntrackEvent {
            conntrack_id: 501,
            src_address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            ..conntrack_new(501)
        };
        writer.write_conntrack(&loopback).unwrap();
        writer
            .write_netlogger(&NetloggerEvent {
                version: 1,
                protocol: 6,
                icmp_type: 0,
                src_interface: 1,
                dst_interface: 2,
                src_address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                dst_address: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
                src_port: 50000,
                dst_port: 443,
                mark: 0,
                prefix: "fw-log".to_string(),
            })
            .unwrap();
    }

    let driver = PlaybackDriver::new(engine.clone());
    engine
        .handle_warehouse_playback(&driver, &path)
        .await
        .unwrap();
    std::fs::remove_file(&path).unwrap();

    let verdicts = driver.verdicts();
    assert_eq!(verdicts.len(), 1);
    assert_eq!(verdicts[0].conntrack_id, 500);
    assert_eq!(verdicts[0].verdict, Verdict::Accept);
    assert_eq!(verdicts[0].mark, NEW_FLOW_MARK | 0x01);

    assert_eq!(engine.session_count(), 1);
    assert!(engine.session_table()[0].conntrack_confirmed);
    assert_eq!(engine.conntrack_table().len(), 1); // loopback row filtered
    assert_eq!(*prefixes.lock().unwrap(), vec!["fw-log".to_string()]);

    engine.handle_warehouse_cleanup();
    assert_eq!(engine.session_count(), 0);
    assert!(engine.conntrack_table().is_empty());
    assert!(engine.dictionary().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_and_bounded_shutdown() {
    let engine = engine();
    engine.startup();

    let packet = client_syn();
    engine
        .nfqueue_callback(1, &packet, packet.len(), NEW_FLOW_MARK)
        .await;

    engine.shutdown().await.expect("cleaner should acknowledge");
}

fn capture_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "nfdispatch-{}-{}.nfw",
        tag,
        std::process::id()
    ))
}
