use std::sync::Arc;

use swapline_core::config::ConnectionConfig;
use swapline_core::transport::bandwidth::BandwidthSettings;
use swapline_core::transport::mock::MockRtcFactory;
use swapline_core::transport::peer::PeerEventKind;
use swapline_core::transport::rtc::{ChannelPayload, IceState};
use swapline_core::transport::{
    ConnectionState, IceCandidate, PeerConnection, PeerEvent, PeerId, SessionDescription, TransportError,
};

async fn open(factory: &Arc<MockRtcFactory>, name: &str) -> Arc<PeerConnection> {
    PeerConnection::open(
        PeerId::new(name),
        factory.as_ref(),
        &ConnectionConfig::default(),
        BandwidthSettings::default(),
    )
    .await
    .unwrap()
}

fn candidate(n: u16) -> IceCandidate {
    IceCandidate::new(format!("candidate:{n} 1 udp 1 192.0.2.{n} 9 typ host"), Some("0".into()), Some(0))
}

#[test_timeout::tokio_timeout_test]
async fn early_candidates_are_applied_in_arrival_order() {
    let factory = MockRtcFactory::new();
    let connection = open(&factory, "remote").await;
    let session = factory.session(&PeerId::new("remote")).unwrap();

    for n in 1..=3 {
        connection.add_ice_candidate(candidate(n)).await.unwrap();
    }
    assert_eq!(connection.pending_candidates().await, 3);
    assert!(session.log().candidates.is_empty());

    let offer = SessionDescription::offer("v=0 remote");
    connection.set_remote_description(offer.clone()).await.unwrap();
    connection.set_remote_description(offer).await.unwrap();
    connection.add_ice_candidate(candidate(4)).await.unwrap();

    let log = session.log();
    assert_eq!(log.remote.len(), 1, "identical remote description applied twice");
    assert_eq!(log.candidates, (1..=4).map(candidate).collect::<Vec<_>>());
    assert_eq!(connection.pending_candidates().await, 0);
}

#[test_timeout::tokio_timeout_test]
async fn rejected_remote_description_keeps_candidates_queued() {
    let factory = MockRtcFactory::new();
    let connection = open(&factory, "remote").await;
    let session = factory.session(&PeerId::new("remote")).unwrap();
    session.fail_remote_descriptions(true);

    connection.add_ice_candidate(candidate(1)).await.unwrap();
    let err = connection
        .set_remote_description(SessionDescription::answer("v=0 broken"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Signaling(_)));
    assert_eq!(connection.pending_candidates().await, 1);
}

#[test_timeout::tokio_timeout_test]
async fn data_channel_is_created_once_per_label() {
    let factory = MockRtcFactory::new();
    let connection = open(&factory, "peer").await;

    let (first, second) = tokio::join!(
        connection.create_data_channel("trade"),
        connection.create_data_channel("trade")
    );
    assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
    connection.create_data_channel("chat").await.unwrap();

    let mut labels = connection.channel_labels();
    labels.sort();
    assert_eq!(labels, vec!["chat".to_string(), "trade".to_string()]);
}

#[test_timeout::tokio_timeout_test]
async fn sending_requires_an_open_channel() {
    let factory = MockRtcFactory::new();
    let connection = open(&factory, "peer").await;

    assert!(matches!(
        connection.send_string("trade", "early").await,
        Err(TransportError::ChannelNotOpen(label)) if label == "trade"
    ));

    connection.create_data_channel("trade").await.unwrap();
    assert!(matches!(
        connection.send_binary("trade", vec![1u8, 2, 3]).await,
        Err(TransportError::ChannelNotOpen(_))
    ));

    let channel = factory.session(&PeerId::new("peer")).unwrap().channel("trade").unwrap();
    channel.open();
    connection.send_string("trade", "hello").await.unwrap();
    connection.send_binary("trade", vec![1u8, 2, 3]).await.unwrap();

    assert_eq!(channel.sent_text(), vec!["hello".to_string()]);
    assert!(matches!(channel.sent().last(), Some(ChannelPayload::Binary(bytes)) if bytes.as_ref() == [1, 2, 3]));
}

#[test_timeout::tokio_timeout_test]
async fn ice_states_drive_connection_state() {
    let factory = MockRtcFactory::new();
    let connection = open(&factory, "peer").await;
    let mut states = connection.subscribe(PeerEventKind::StateChanged);
    let session = factory.session(&PeerId::new("peer")).unwrap();

    session.set_ice_state(IceState::Checking);
    session.set_ice_state(IceState::Connected);
    session.set_ice_state(IceState::Completed);
    session.set_ice_state(IceState::Disconnected);
    session.set_ice_state(IceState::Failed);

    let mut seen = Vec::new();
    while seen.len() < 4 {
        match states.next().await {
            Some(PeerEvent::StateChanged { current, .. }) => seen.push(current),
            Some(_) => continue,
            None => break,
        }
    }
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Failed,
        ]
    );
    assert_eq!(connection.state(), ConnectionState::Failed);
}

#[test_timeout::tokio_timeout_test]
async fn remote_channels_and_frames_surface_as_events() {
    let factory = MockRtcFactory::new();
    let connection = open(&factory, "peer").await;
    let mut events = connection.subscribe_all();
    let session = factory.session(&PeerId::new("peer")).unwrap();

    session.announce_channel("trade");
    session.deliver_text("trade", "ping");

    let mut opened = None;
    let mut message = None;
    while message.is_none() {
        match events.next().await {
            Some(PeerEvent::ChannelOpened { label, .. }) => opened = Some(label),
            Some(PeerEvent::Message { label, payload, .. }) => message = Some((label, payload)),
            Some(_) => {}
            None => break,
        }
    }
    assert_eq!(opened.as_deref(), Some("trade"));
    assert_eq!(
        message,
        Some(("trade".to_string(), ChannelPayload::Text("ping".into())))
    );
    assert!(connection.channel("trade").is_some_and(|channel| channel.is_open()));
}

#[test_timeout::tokio_timeout_test]
async fn closed_connection_refuses_work() {
    let factory = MockRtcFactory::with_open_channels();
    let connection = open(&factory, "peer").await;
    connection.create_data_channel("trade").await.unwrap();
    let session = factory.session(&PeerId::new("peer")).unwrap();
    let channel = session.channel("trade").unwrap();

    connection.close().await;
    connection.close().await;

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(session.is_closed());
    assert!(channel.is_closed());
    assert!(connection.channel_labels().is_empty());
    assert!(matches!(connection.create_offer().await, Err(TransportError::Signaling(_))));
    assert!(matches!(connection.send_string("trade", "late").await, Err(TransportError::Closed)));
    assert!(matches!(connection.add_ice_candidate(candidate(1)).await, Err(TransportError::Closed)));
    assert!(!connection.mark_failed());

    let mut events = connection.subscribe_all();
    assert!(events.next().await.is_none());
}
