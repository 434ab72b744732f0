//! Tests for channel lifecycle and record handling

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use conduit_protocol::codec::{
    EXT_HEARTBEAT_TYPE, ExtensionHeader, LEGACY_TRANSFER_TYPE, TlvCodec, encode_extension_frame,
};
use conduit_protocol::{Codec, CountingOpsReporter, DecodeType, OpsReporter, Record};
use conduit_routing::{ConfigEvent, EventKind, RouteKeyMode};
use conduit_sinks::{ExporterContext, ExporterFactory, ExporterSettings};
use conduit_sources::ReceiverConfig;
use serde_json::json;

use crate::channel::{Channel, ChannelConf, ChannelDeps};
use crate::error::PipelineError;
use crate::router::ChannelIdRouter;
use crate::testutil::{CaptureFactory, registry_with, settings};

struct Fixture {
    channel: Channel,
    factory: Arc<CaptureFactory>,
    ops: Arc<CountingOpsReporter>,
}

fn conf() -> ChannelConf {
    let mut conf = ChannelConf::new(
        "udp_ingest",
        DecodeType::Extension,
        ReceiverConfig::udp("127.0.0.1", 0),
    );
    conf.workers = 2;
    conf.exporters = vec![settings(1, "file_all")];
    conf
}

fn fixture(conf: ChannelConf) -> Fixture {
    let ops = Arc::new(CountingOpsReporter::new());
    let factory = Arc::new(CaptureFactory::with_context(ExporterContext::new(
        Arc::clone(&ops) as Arc<dyn OpsReporter>,
    )));
    let deps = ChannelDeps::new(Arc::clone(&factory) as Arc<dyn ExporterFactory>)
        .with_ops(Arc::clone(&ops) as Arc<dyn OpsReporter>);
    Fixture {
        channel: Channel::new(conf.name.clone(), deps).with_conf(conf),
        factory,
        ops,
    }
}

/// Fixture whose channel shares a router with exporter `t1` (id 7) bound
/// to channel 1001
async fn routed_fixture(conf: ChannelConf) -> (Fixture, Arc<CaptureFactory>) {
    let sink_factory = Arc::new(CaptureFactory::default());
    let registry = registry_with(&sink_factory, &[(7, "t1")]).await;
    let router = Arc::new(ChannelIdRouter::new(RouteKeyMode::ChannelId, registry));
    let payload = json!({
        "metadata": {"channel_id": 1001},
        "route": [{
            "name": "to-t1",
            "stream_to": {"stream_to_id": 7, "kafka": {"topic_name": "topic_a"}}
        }]
    })
    .to_string();
    router
        .apply(&ConfigEvent::route(EventKind::Create, 1001, payload))
        .await
        .unwrap();

    let mut fx = fixture(conf);
    let deps = ChannelDeps::new(Arc::clone(&fx.factory) as Arc<dyn ExporterFactory>)
        .with_ops(Arc::clone(&fx.ops) as Arc<dyn OpsReporter>)
        .with_router(router);
    let conf = fx.channel.conf().unwrap();
    fx.channel = Channel::new(conf.name.clone(), deps).with_conf(conf);
    (fx, sink_factory)
}

fn ext_frame(channel_id: u32, extensions: &[&str], payload: &[u8]) -> Record {
    let mut out = BytesMut::new();
    let header = ExtensionHeader {
        channel_id,
        timestamp: 1_700_000_000,
        ..Default::default()
    };
    encode_extension_frame(&mut out, header, extensions, payload).unwrap();
    Record::new(out, Default::default())
}

async fn deal(channel: &Channel, record: Record) {
    use crate::worker::RecordHandler;
    let running = channel.current().unwrap();
    running.dispatch.core.deal_data(record).await;
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_start_requires_conf() {
    let factory = Arc::new(CaptureFactory::default());
    let channel = Channel::new("bare", ChannelDeps::new(factory));

    let err = channel.start().await.unwrap_err();
    assert!(matches!(err, PipelineError::NotConfigured(name) if name == "bare"));
    assert!(!channel.is_running());
}

#[tokio::test]
async fn test_start_and_stop() {
    let fx = fixture(conf());
    fx.channel.start().await.unwrap();

    assert!(fx.channel.is_running());
    assert!(fx.channel.local_addr().unwrap().port() > 0);
    assert_eq!(fx.channel.exporter_names(), vec!["file_all".to_string()]);
    assert_eq!(fx.channel.queue_depths(), vec![0, 0]);

    fx.channel.stop().await;
    assert!(!fx.channel.is_running());
    assert!(fx.factory.get("file_all").stopped.load(Ordering::Relaxed));
    assert!(fx.channel.local_addr().is_none());

    // stopping twice is harmless
    fx.channel.stop().await;
}

#[tokio::test]
async fn test_receiver_failure_leaves_channel_stopped() {
    let mut bad = conf();
    bad.receiver = ReceiverConfig::udp("not-an-ip", 0);
    let fx = fixture(bad);

    let err = fx.channel.start().await.unwrap_err();
    assert!(matches!(err, PipelineError::Receiver(_)));
    assert!(!fx.channel.is_running());
}

#[tokio::test]
async fn test_failing_exporter_is_dropped() {
    let mut with_bad = conf();
    with_bad.exporters = vec![settings(2, "refuse-1"), settings(1, "file_all")];
    let fx = fixture(with_bad);

    fx.channel.start().await.unwrap();
    assert_eq!(fx.channel.exporter_names(), vec!["file_all".to_string()]);
    fx.channel.stop().await;
}

#[tokio::test]
async fn test_update_conf_applies_on_restart() {
    let fx = fixture(conf());
    fx.channel.start().await.unwrap();
    assert_eq!(fx.channel.queue_depths().len(), 2);

    let mut next = conf();
    next.workers = 3;
    fx.channel.update_conf(next);
    assert_eq!(fx.channel.queue_depths().len(), 2);

    fx.channel.start().await.unwrap();
    assert_eq!(fx.channel.queue_depths().len(), 3);
    fx.channel.stop().await;
}

#[tokio::test]
async fn test_operations_need_running_channel() {
    let fx = fixture(conf());
    let mut record = ext_frame(0, &[], b"x");

    assert!(!fx.channel.handle_record(ext_frame(0, &[], b"x")));
    assert!(matches!(
        fx.channel.decode_msg(&mut record),
        Err(PipelineError::NotRunning(_))
    ));
    assert!(matches!(
        fx.channel.export_data(&mut record).await,
        Err(PipelineError::NotRunning(_))
    ));
}

// =============================================================================
// Record handling
// =============================================================================

#[tokio::test]
async fn test_static_exporters_receive_every_record() {
    let fx = fixture(conf());
    fx.channel.start().await.unwrap();

    deal(&fx.channel, ext_frame(0, &[], b"hello")).await;

    let file_all = fx.factory.get("file_all");
    assert_eq!(file_all.writes.lock()[0].0, b"hello");
    let ops = fx.ops.snapshot();
    assert_eq!(ops.dealing, 1);
    assert_eq!(ops.output, 1);
    fx.channel.stop().await;
}

#[tokio::test]
async fn test_data_id_entries_share_one_sink() {
    let legacy = |id: u32, data_id: u32| {
        ExporterSettings::parse(&format!(
            r#"{{"id":{id},"name":"legacy","type":"file","data_id":{data_id},"table":"t{data_id}"}}"#
        ))
        .unwrap()
    };
    let mut conf = conf();
    conf.exporters = vec![legacy(1, 1001), legacy(2, 1002)];
    let fx = fixture(conf);
    fx.channel.start().await.unwrap();

    assert_eq!(fx.factory.creations.load(Ordering::SeqCst), 1);
    assert_eq!(fx.channel.exporter_names(), vec!["legacy".to_string()]);

    deal(&fx.channel, ext_frame(1001, &[], b"a")).await;
    deal(&fx.channel, ext_frame(1002, &[], b"b")).await;
    deal(&fx.channel, ext_frame(1003, &[], b"c")).await;

    let sink = fx.factory.get("legacy");
    assert_eq!(
        sink.tables(),
        vec![vec!["t1001".to_string()], vec!["t1002".to_string()]]
    );
    fx.channel.stop().await;
}

#[tokio::test]
async fn test_routed_delivery_sets_table() {
    let (fx, sinks) = routed_fixture(conf()).await;
    fx.channel.start().await.unwrap();

    deal(&fx.channel, ext_frame(1001, &["region=eu"], b"hello")).await;

    let t1 = sinks.get("t1");
    assert_eq!(t1.writes.lock()[0].0, b"hello");
    assert_eq!(t1.tables(), vec![vec!["topic_a".to_string()]]);
    assert_eq!(fx.factory.get("file_all").write_count(), 1);
    fx.channel.stop().await;
}

#[tokio::test]
async fn test_decode_failure_is_lost() {
    let fx = fixture(conf());
    fx.channel.start().await.unwrap();

    deal(&fx.channel, Record::from_slice(&[0xAB; 40])).await;

    let m = fx.channel.metrics_handle().snapshot();
    assert_eq!(m.lost, 1);
    assert_eq!(fx.ops.snapshot().lost, 1);
    assert_eq!(fx.factory.get("file_all").write_count(), 0);
    fx.channel.stop().await;
}

#[tokio::test]
async fn test_heartbeat_is_skipped() {
    let fx = fixture(conf());
    fx.channel.start().await.unwrap();

    let mut out = BytesMut::new();
    let header = ExtensionHeader {
        msg_type: EXT_HEARTBEAT_TYPE,
        ..Default::default()
    };
    encode_extension_frame::<&str>(&mut out, header, &[], b"ping").unwrap();
    deal(&fx.channel, Record::new(out, Default::default())).await;

    assert_eq!(fx.channel.metrics_handle().snapshot().skipped, 1);
    assert_eq!(fx.ops.snapshot().dealing, 0);
    assert_eq!(fx.factory.get("file_all").write_count(), 0);
    fx.channel.stop().await;
}

#[tokio::test]
async fn test_transfer_message_goes_to_transfer_exporter() {
    let mut legacy = conf();
    legacy.decode = DecodeType::Legacy;
    legacy.transfer_exporter = Some(settings(9, "relay"));
    let fx = fixture(legacy);
    fx.channel.start().await.unwrap();

    let mut frame = BytesMut::new();
    frame.put_u32(LEGACY_TRANSFER_TYPE);
    frame.put_u32(5);
    frame.put_u32(1_700_000_000);
    frame.put_u32(4);
    frame.put_u32(0);
    frame.put_u32(0);
    frame.put_slice(b"body");
    let wire = frame.to_vec();
    deal(&fx.channel, Record::new(frame, Default::default())).await;

    let relay = fx.factory.get("relay");
    assert_eq!(relay.writes.lock()[0].0, wire);
    assert_eq!(fx.channel.metrics_handle().snapshot().transferred, 1);
    assert_eq!(fx.factory.get("file_all").write_count(), 0);

    fx.channel.stop().await;
    assert!(relay.stopped.load(Ordering::Relaxed));
}

#[tokio::test]
async fn test_ops_record_resolves_channel_id() {
    let mut tlv = conf();
    tlv.decode = DecodeType::Tlv;
    tlv.ops_services = HashMap::from([(42, 1001)]);
    let (fx, sinks) = routed_fixture(tlv).await;
    fx.channel.start().await.unwrap();

    let mut source = Record::from_slice(b"self-telemetry");
    source.is_ops = true;
    source.service_id = 42;
    let mut wire = BytesMut::new();
    TlvCodec::new().encode(&source, &mut wire).unwrap();
    deal(&fx.channel, Record::new(wire, Default::default())).await;

    assert_eq!(sinks.get("t1").writes.lock()[0].0, b"self-telemetry");
    fx.channel.stop().await;
}

#[tokio::test]
async fn test_queued_dispatch_releases_records() {
    let fx = fixture(conf());
    fx.channel.start().await.unwrap();

    for i in 0..4u8 {
        assert!(fx.channel.handle_record(ext_frame(0, &[], &[i])));
    }
    let metrics = fx.channel.metrics_handle();
    wait_for(|| metrics.snapshot().released == 4).await;

    let m = metrics.snapshot();
    assert_eq!(m.enqueued, 4);
    assert_eq!(m.in_flight(), 0);
    assert_eq!(fx.factory.get("file_all").write_count(), 4);
    fx.channel.stop().await;
}

#[tokio::test]
async fn test_direct_mode_bypasses_queues() {
    let mut direct = conf();
    direct.direct = true;
    let fx = fixture(direct);
    fx.channel.start().await.unwrap();

    assert!(fx.channel.handle_record(ext_frame(0, &[], b"inline")));
    let metrics = fx.channel.metrics_handle();
    wait_for(|| metrics.snapshot().released == 1).await;

    assert_eq!(metrics.snapshot().enqueued, 0);
    assert_eq!(fx.factory.get("file_all").write_count(), 1);
    fx.channel.stop().await;
}

#[tokio::test]
async fn test_direct_mode_sheds_at_ceiling() {
    let mut direct = conf();
    direct.direct = true;
    direct.queue_ceiling = 2;
    let fx = fixture(direct);
    fx.channel.start().await.unwrap();

    // Single-threaded runtime: nothing in flight completes until we yield
    let accepted = (0..10)
        .filter(|_| fx.channel.handle_record(ext_frame(0, &[], b"burst")))
        .count();
    assert_eq!(accepted, 2);

    let metrics = fx.channel.metrics_handle();
    assert_eq!(metrics.snapshot().dropped, 8);
    assert_eq!(fx.ops.snapshot().dropped, 8);

    wait_for(|| metrics.snapshot().released == 2).await;
    assert_eq!(fx.factory.get("file_all").write_count(), 2);

    // Permits come back once records are released
    assert!(fx.channel.handle_record(ext_frame(0, &[], b"after")));
    wait_for(|| metrics.snapshot().released == 3).await;
    fx.channel.stop().await;
}

#[tokio::test]
async fn test_records_arrive_over_udp() {
    let fx = fixture(conf());
    fx.channel.start().await.unwrap();
    let addr = fx.channel.local_addr().unwrap();

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let record = ext_frame(0, &[], b"over the wire");
    client.send_to(record.payload(), addr).await.unwrap();

    let file_all = fx.factory.get("file_all");
    wait_for(|| file_all.write_count() == 1).await;
    assert_eq!(file_all.writes.lock()[0].0, b"over the wire");
    assert_eq!(
        fx.channel.receiver_metrics().unwrap().snapshot().messages_received,
        1
    );
    fx.channel.stop().await;
}

// =============================================================================
// Exporter replacement
// =============================================================================

#[tokio::test]
async fn test_replace_exporter_retires_previous() {
    let fx = fixture(conf());
    fx.channel.start().await.unwrap();
    let old = fx.factory.get("file_all");

    fx.channel
        .replace_exporter(&settings(1, "file_v2"))
        .await
        .unwrap();
    assert_eq!(fx.channel.exporter_names(), vec!["file_v2".to_string()]);

    deal(&fx.channel, ext_frame(0, &[], b"after swap")).await;
    assert_eq!(old.write_count(), 0);
    assert_eq!(fx.factory.get("file_v2").write_count(), 1);

    assert_eq!(fx.channel.sweep_pending_at(Instant::now()).await, 0);
    assert!(!old.stopped.load(Ordering::Relaxed));
    let later = Instant::now() + Duration::from_secs(61);
    assert_eq!(fx.channel.sweep_pending_at(later).await, 1);
    assert!(old.stopped.load(Ordering::Relaxed));

    fx.channel.stop().await;
}

#[tokio::test]
async fn test_replace_with_new_id_appends() {
    let fx = fixture(conf());
    fx.channel.start().await.unwrap();

    fx.channel
        .replace_exporter(&settings(5, "extra"))
        .await
        .unwrap();
    assert_eq!(
        fx.channel.exporter_names(),
        vec!["file_all".to_string(), "extra".to_string()]
    );
    assert_eq!(fx.channel.sweep_pending_at(Instant::now()).await, 0);
    fx.channel.stop().await;
}
