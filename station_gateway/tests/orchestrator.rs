
use serde_json::json;
use station_gateway::channel::Channel;
use station_gateway::config::settings::{DispatcherSettings, Settings, TriggerRule};
use station_gateway::dispatch::dispatcher::TriggerDispatcher;
use station_gateway::dispatch::message::{TriggerPriority, TriggerSource};
use station_gateway::drivers::simulation::{SimulationDriver, SimulationSettings};
use station_gateway::error::GatewayError;
use station_gateway::orchestrator::{CommunicationOrchestrator, ReloadOutcome};
use station_gateway::tags::engine::TagEngine;
use station_gateway::tags::structures::{DataType, Quality, TagChangeEvent, TagSnapshot, ValueVariant};
use station_gateway::triggers::TriggerRouter;
use std::sync::Arc;
use test_utils::test_ops::wait_for_condition;
use test_utils::{CallCounter, RecordingSubscriber, SystemConfigFixture};
use tokio::time::Duration;

const WAIT: Duration = Duration::from_secs(2);
const STEP: Duration = Duration::from_millis(10);

async fn running(settings: &Settings) -> Arc<CommunicationOrchestrator> {
    let orchestrator = CommunicationOrchestrator::new();
    assert_eq!(orchestrator.reload(settings).await.unwrap(), ReloadOutcome::Applied);
    orchestrator
}

fn is_good(orchestrator: &CommunicationOrchestrator, tag: &str, expected: &ValueVariant) -> bool {
    let snapshot = orchestrator.get_tag_value(tag);
    snapshot.is_good() && &snapshot.value == expected
}

#[tokio::test]
async fn simulated_channel_polls_tags_to_good() {
    let orchestrator = running(&SystemConfigFixture::single_line()).await;

    assert!(
        wait_for_condition(
            || is_good(&orchestrator, "line1/label", &ValueVariant::String("idle".into())),
            WAIT,
            STEP
        )
        .await
    );
    assert!(is_good(&orchestrator, "line1/flag", &ValueVariant::Bool(false)));
    assert!(is_good(&orchestrator, "line1/count", &ValueVariant::Int(0)));
    assert!(orchestrator.get_tag_value("line1/count").timestamp > 0);

    let statuses = orchestrator.channel_statuses().await;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].name, "line1");
    assert_eq!(statuses[0].driver, "simulation");
    assert!(statuses[0].running);
    assert!(statuses[0].connected);
    assert_eq!(statuses[0].tag_count, 3);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn unknown_tag_reads_bad_and_null() {
    let orchestrator = running(&SystemConfigFixture::single_line()).await;
    assert_eq!(orchestrator.get_tag_value("line9/nothing"), TagSnapshot::bad(0));
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn failing_reads_leave_tags_bad() {
    let settings = Settings {
        channels: vec![SystemConfigFixture::simulation_channel(
            "broken",
            json!({ "fail_reads": true }),
        )],
        tags: vec![SystemConfigFixture::tag("broken/value", "broken", DataType::Int32)],
        ..Settings::default()
    };
    let orchestrator = running(&settings).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = orchestrator.get_tag_value("broken/value");
    assert_eq!(snapshot.quality, Quality::Bad);
    assert_eq!(snapshot.value, ValueVariant::Null);
    assert_eq!(snapshot.timestamp, 0);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn refused_connection_keeps_channel_disconnected() {
    let settings = Settings {
        channels: vec![SystemConfigFixture::simulation_channel(
            "offline",
            json!({ "fail_connect": true }),
        )],
        tags: vec![SystemConfigFixture::tag("offline/value", "offline", DataType::Float)],
        ..Settings::default()
    };
    let orchestrator = running(&settings).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(orchestrator.get_tag_value("offline/value").quality, Quality::Bad);
    let statuses = orchestrator.channel_statuses().await;
    assert!(statuses[0].running);
    assert!(!statuses[0].connected);

    let err = orchestrator
        .write_tag("offline/value", &ValueVariant::Float(1.5))
        .await
        .unwrap_err();
    assert!(err.is_connection_loss());

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn writes_reach_the_device_and_come_back_on_poll() {
    let orchestrator = running(&SystemConfigFixture::single_line()).await;

    orchestrator
        .write_tag("line1/count", &ValueVariant::Int(7))
        .await
        .unwrap();
    assert!(wait_for_condition(|| is_good(&orchestrator, "line1/count", &ValueVariant::Int(7)), WAIT, STEP).await);

    let err = orchestrator
        .write_tag("line1/count", &ValueVariant::String("seven".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidValue(_)));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn write_errors_distinguish_missing_tag_and_missing_channel() {
    let mut settings = SystemConfigFixture::single_line();
    settings
        .tags
        .push(SystemConfigFixture::tag("ghost/value", "ghost", DataType::Int16));
    let orchestrator = running(&settings).await;

    let err = orchestrator
        .write_tag("line1/nope", &ValueVariant::Int(1))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NotFound(_)));

    let err = orchestrator
        .write_tag("ghost/value", &ValueVariant::Int(1))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Configuration(_)));

    // Registered but never polled
    assert!(orchestrator.engine().get_tag_details("ghost/value").is_some());
    assert_eq!(orchestrator.get_tag_value("ghost/value").quality, Quality::Bad);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn overlapping_reload_is_skipped() {
    let settings = SystemConfigFixture::single_line();
    let orchestrator = running(&settings).await;

    let (first, second) = tokio::join!(orchestrator.reload(&settings), orchestrator.reload(&settings));
    assert_eq!(first.unwrap(), ReloadOutcome::Applied);
    assert_eq!(second.unwrap(), ReloadOutcome::Skipped);

    // Once the first finishes, reloads are accepted again
    assert_eq!(orchestrator.reload(&settings).await.unwrap(), ReloadOutcome::Applied);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn reload_replaces_channels_and_tags() {
    let orchestrator = running(&SystemConfigFixture::single_line()).await;
    let old_channel = orchestrator.channel("line1").unwrap();

    let replacement = Settings {
        channels: vec![SystemConfigFixture::simulation_channel("line2", json!({}))],
        tags: vec![SystemConfigFixture::tag("line2/speed", "line2", DataType::Float)],
        ..Settings::default()
    };
    assert_eq!(orchestrator.reload(&replacement).await.unwrap(), ReloadOutcome::Applied);

    assert!(!old_channel.is_running());
    assert!(orchestrator.channel("line1").is_none());
    assert!(orchestrator.engine().get_tag_details("line1/count").is_none());
    assert_eq!(orchestrator.engine().get_all_tag_paths(), vec!["line2/speed".to_string()]);
    assert!(wait_for_condition(|| is_good(&orchestrator, "line2/speed", &ValueVariant::Float(0.0)), WAIT, STEP).await);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn invalid_channel_settings_keep_the_running_set() {
    let orchestrator = running(&SystemConfigFixture::single_line()).await;

    let mut broken = SystemConfigFixture::single_line();
    broken.channels[0].settings = json!({ "ramp": "sometimes" });
    assert!(orchestrator.reload(&broken).await.is_err());

    let channel = orchestrator.channel("line1").unwrap();
    assert!(channel.is_running());
    orchestrator.shutdown().await;
    assert!(!channel.is_running());
}

#[tokio::test]
async fn change_stream_reports_first_good_reads() {
    let orchestrator = CommunicationOrchestrator::new();
    let mut changes = orchestrator.subscribe();
    orchestrator
        .reload(&SystemConfigFixture::single_line())
        .await
        .unwrap();

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let event = tokio::time::timeout(WAIT, changes.recv()).await.unwrap().unwrap();
        assert!(event.snapshot.is_good());
        seen.push(event.tag);
    }
    seen.sort();
    assert_eq!(seen, vec!["line1/count", "line1/flag", "line1/label"]);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn unchanged_polls_do_not_notify() {
    let engine = TagEngine::new();
    for tag in SystemConfigFixture::single_line().tags {
        engine.register_tag(tag.to_tag());
    }
    let driver = Arc::new(SimulationDriver::new(SimulationSettings::default()));
    let counter = CallCounter::default();
    let sink = counter.clone();
    let channel = Channel::new(
        SystemConfigFixture::simulation_channel("line1", json!({})),
        driver.clone(),
        engine.clone(),
        Arc::new(move |_event: TagChangeEvent| sink.hit()),
    );

    channel.poll_now().await;
    assert_eq!(counter.get(), 3);
    channel.poll_now().await;
    assert_eq!(counter.get(), 3);

    driver.set_value("line1/count", ValueVariant::Int(5));
    channel.poll_now().await;
    assert_eq!(counter.get(), 4);
    assert_eq!(engine.get("line1/count").value, ValueVariant::Int(5));
}

#[tokio::test]
async fn ramping_counter_changes_every_poll() {
    let engine = TagEngine::new();
    engine.register_tag(SystemConfigFixture::tag("sim/ramp", "sim", DataType::UInt16).to_tag());
    let driver = Arc::new(SimulationDriver::new(SimulationSettings {
        ramp: true,
        ..SimulationSettings::default()
    }));
    let channel = Channel::new(
        SystemConfigFixture::simulation_channel("sim", json!({})),
        driver,
        engine.clone(),
        Arc::new(|_event: TagChangeEvent| {}),
    );

    for expected in 1..=3u64 {
        channel.poll_now().await;
        assert_eq!(engine.get("sim/ramp").value, ValueVariant::UInt(expected));
    }
}

#[tokio::test]
async fn rising_edge_raises_one_trigger_per_edge() {
    let rule = TriggerRule {
        station: "st1".to_string(),
        source: TriggerSource::Plc,
        priority: TriggerPriority::High,
        debounce_key: None,
        on_rising_edge: true,
    };
    let mut settings = SystemConfigFixture::single_line();
    settings
        .tags
        .push(SystemConfigFixture::triggered_tag("line1/scan", "line1", rule));
    settings.channels[0].settings = json!({ "initial": { "line1/scan": false } });

    let dispatcher = TriggerDispatcher::new(DispatcherSettings::default());
    let subscriber = RecordingSubscriber::new("station");
    dispatcher.subscribe(subscriber.clone());
    dispatcher.start();

    let orchestrator = CommunicationOrchestrator::new();
    let router = TriggerRouter::new(Arc::clone(&dispatcher), settings.trigger_rules());
    let routing = router.spawn(orchestrator.change_feed(16));
    orchestrator.reload(&settings).await.unwrap();

    let flag = |value: bool| ValueVariant::Bool(value);
    assert!(wait_for_condition(|| is_good(&orchestrator, "line1/scan", &flag(false)), WAIT, STEP).await);

    for round in 1..=2 {
        orchestrator.write_tag("line1/scan", &flag(true)).await.unwrap();
        assert!(wait_for_condition(|| subscriber.count() == round, WAIT, STEP).await);
        orchestrator.write_tag("line1/scan", &flag(false)).await.unwrap();
        assert!(wait_for_condition(|| is_good(&orchestrator, "line1/scan", &flag(false)), WAIT, STEP).await);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(subscriber.payloads(), vec!["true", "true"]);
    let message = subscriber.received.lock().unwrap()[0].clone();
    assert_eq!(message.station_id, "st1");
    assert_eq!(message.priority, TriggerPriority::High);

    routing.abort();
    orchestrator.shutdown().await;
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn high_triggers_survive_a_stalled_dispatcher() {
    const PARTS: usize = 1500;
    let rule = TriggerRule {
        station: "bulk".to_string(),
        source: TriggerSource::Plc,
        priority: TriggerPriority::High,
        debounce_key: None,
        on_rising_edge: true,
    };
    let mut initial = serde_json::Map::new();
    let mut tags = Vec::with_capacity(PARTS);
    for i in 0..PARTS {
        let name = format!("bulk/part{:04}", i);
        initial.insert(name.clone(), json!(true));
        tags.push(SystemConfigFixture::triggered_tag(&name, "bulk", rule.clone()));
    }
    let settings = Settings {
        channels: vec![SystemConfigFixture::simulation_channel(
            "bulk",
            json!({ "initial": initial }),
        )],
        tags,
        ..Settings::default()
    };

    let dispatcher = TriggerDispatcher::new(DispatcherSettings {
        high_capacity: 1,
        ..DispatcherSettings::default()
    });
    let subscriber = RecordingSubscriber::new("station");
    dispatcher.subscribe(subscriber.clone());

    let orchestrator = CommunicationOrchestrator::new();
    let router = TriggerRouter::new(Arc::clone(&dispatcher), settings.trigger_rules());
    let routing = router.spawn(orchestrator.change_feed(8));
    orchestrator.reload(&settings).await.unwrap();

    // Consumers start late: the first poll backs up behind the full High queue.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(subscriber.count(), 0);
    dispatcher.start();

    assert!(wait_for_condition(|| subscriber.count() == PARTS, Duration::from_secs(10), STEP).await);
    let stats = dispatcher.stats();
    assert_eq!(stats.accepted, PARTS as u64);
    assert_eq!(stats.evicted, 0);
    assert!(orchestrator.get_tag_value("bulk/part1499").is_good());

    routing.abort();
    orchestrator.shutdown().await;
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn full_change_feed_holds_the_poll_tick() {
    let engine = TagEngine::new();
    for name in ["sim/a", "sim/b", "sim/c"] {
        engine.register_tag(SystemConfigFixture::tag(name, "sim", DataType::Boolean).to_tag());
    }
    let config = SystemConfigFixture::simulation_channel("sim", json!({}));
    let driver = Arc::new(SimulationDriver::new(SimulationSettings {
        initial: [("sim/a", true), ("sim/b", true), ("sim/c", true)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect(),
        ..SimulationSettings::default()
    }));
    let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    let channel = Channel::with_feed(
        config,
        driver,
        engine.clone(),
        Arc::new(|_event: TagChangeEvent| {}),
        Some(tx),
    );

    let tick = tokio::spawn({
        let channel = Arc::clone(&channel);
        async move { channel.poll_now().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!tick.is_finished());

    let mut seen = Vec::new();
    while seen.len() < 3 {
        seen.push(rx.recv().await.unwrap().tag);
    }
    tick.await.unwrap();
    seen.sort();
    assert_eq!(seen, vec!["sim/a", "sim/b", "sim/c"]);
}
