//! End-to-end cluster scenarios over real TCP and the real broadcast
//! hub.

use pulse_e2e::{connect_agent, connect_manager, expect_event, sample, TestCluster, MAX_FRAME};
use pulse_types::RegistrationOutcome;
use pulse_wire::frame::{read_frame, write_frame};
use pulse_wire::messages::{BusEvent, ClientMessage};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_manager_sees_agents_on_other_workers() {
    let cluster = TestCluster::start(2).await.expect("cluster start");

    // Manager on worker 0, agent on worker 1.
    let mut manager = connect_manager(&cluster.workers[0].addr).await.expect("manager");
    // Give the forward task a moment to subscribe before events flow.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut agent = connect_agent(&cluster.workers[1].addr).await.expect("agent");
    let registration = sample("11:22:33:44:55:66");
    write_frame(
        &mut agent,
        &ClientMessage::InitialRegistration {
            hardware_id: registration.hardware_id.clone(),
            sample: registration,
        },
        MAX_FRAME,
    )
    .await
    .expect("registration write");

    let online = expect_event(&mut manager, WAIT, |event| {
        matches!(event, BusEvent::AgentOnline { .. })
    })
    .await
    .expect("agent-online event");
    assert_eq!(online.hardware_id(), "11:22:33:44:55:66");

    write_frame(
        &mut agent,
        &ClientMessage::Sample {
            sample: sample("11:22:33:44:55:66"),
        },
        MAX_FRAME,
    )
    .await
    .expect("sample write");

    let streamed = expect_event(&mut manager, WAIT, |event| {
        matches!(event, BusEvent::Sample { .. })
    })
    .await
    .expect("sample event");
    assert_eq!(streamed.hardware_id(), "11:22:33:44:55:66");
}

#[tokio::test]
async fn test_registration_is_idempotent_across_reconnects() {
    let cluster = TestCluster::start(1).await.expect("cluster start");
    let addr = cluster.workers[0].addr.clone();

    let mut manager = connect_manager(&addr).await.expect("manager");
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Same host registers twice, as it would after a reconnect.
    for expected in [RegistrationOutcome::Created, RegistrationOutcome::Existing] {
        let mut agent = connect_agent(&addr).await.expect("agent");
        let registration = sample("aa:aa:aa:aa:aa:aa");
        write_frame(
            &mut agent,
            &ClientMessage::InitialRegistration {
                hardware_id: registration.hardware_id.clone(),
                sample: registration,
            },
            MAX_FRAME,
        )
        .await
        .expect("registration write");

        let online = expect_event(&mut manager, WAIT, |event| {
            matches!(event, BusEvent::AgentOnline { .. })
        })
        .await
        .expect("agent-online event");
        match online {
            BusEvent::AgentOnline { outcome, .. } => assert_eq!(outcome, expected),
            other => panic!("expected AgentOnline, got {:?}", other),
        }
        drop(agent);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(cluster.stored_records(), 1, "one record per hardware id");
}

#[tokio::test]
async fn test_unknown_auth_key_closes_without_side_effects() {
    let cluster = TestCluster::start(1).await.expect("cluster start");
    let addr = cluster.workers[0].addr.clone();

    let mut manager = connect_manager(&addr).await.expect("manager");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut impostor = tokio::net::TcpStream::connect(&addr).await.expect("connect");
    write_frame(
        &mut impostor,
        &ClientMessage::Auth {
            key: "bogus".to_string(),
        },
        MAX_FRAME,
    )
    .await
    .expect("auth write");

    // The server closes; the next read hits EOF.
    let closed: Option<BusEvent> = read_frame(&mut impostor, MAX_FRAME)
        .await
        .expect("read after rejected auth");
    assert!(closed.is_none());

    // Nothing was registered and nothing reached the bus.
    assert_eq!(cluster.stored_records(), 0);
    let quiet = expect_event(&mut manager, Duration::from_millis(300), |_| true).await;
    assert!(quiet.is_err(), "no events should follow a rejected auth");
}

#[tokio::test]
async fn test_messages_before_auth_close_the_connection() {
    let cluster = TestCluster::start(1).await.expect("cluster start");
    let addr = cluster.workers[0].addr.clone();

    let mut stream = tokio::net::TcpStream::connect(&addr).await.expect("connect");
    let early = sample("bb:bb:bb:bb:bb:bb");
    write_frame(
        &mut stream,
        &ClientMessage::Sample { sample: early },
        MAX_FRAME,
    )
    .await
    .expect("pre-auth write");

    let closed: Option<BusEvent> = read_frame(&mut stream, MAX_FRAME)
        .await
        .expect("read after pre-auth message");
    assert!(closed.is_none());
    assert_eq!(cluster.stored_records(), 0);
}
