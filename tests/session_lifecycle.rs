// End-to-end tests over both bindings.
//
// Each test starts a server on ephemeral localhost ports and drives it with
// real clients: the RPC client over WebSocket and the stream client over
// raw TCP. Assertions are made on what the clients' views receive, plus a
// look at the registry where the server-side state matters.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use codex_table::game::card::CornerPosition;
use codex_table::game::codex::Position;
use codex_table::network::client::{ClientAction, ClientConfig, ClientError, ClientView};
use codex_table::network::protocol::{ErrorCode, Reply};
use codex_table::network::rpc::RpcClient;
use codex_table::network::server::{GameServer, ServerConfig};
use codex_table::network::stream::StreamClient;
use codex_table::{GameStatus, PlayerAction};

struct TestServer {
    server: Arc<GameServer>,
    rpc: SocketAddr,
    stream: SocketAddr,
}

impl TestServer {
    async fn start() -> Self {
        let config = ServerConfig {
            rpc_addr: "127.0.0.1:0".parse().unwrap(),
            stream_addr: "127.0.0.1:0".parse().unwrap(),
            heartbeat_timeout: Duration::from_millis(1000),
            watchdog_period: Duration::from_millis(50),
            seed: Some(7),
            ..Default::default()
        };
        let server = Arc::new(GameServer::new(config));
        let listeners = server.bind().await.unwrap();
        let rpc = listeners.rpc_addr().unwrap();
        let stream = listeners.stream_addr().unwrap();

        let runner = server.clone();
        tokio::spawn(async move { runner.serve(listeners).await });

        Self { server, rpc, stream }
    }
}

fn pinging() -> ClientConfig {
    ClientConfig {
        heartbeat_interval: Some(Duration::from_millis(100)),
        ..Default::default()
    }
}

fn silent() -> ClientConfig {
    ClientConfig {
        heartbeat_interval: None,
        ..Default::default()
    }
}

/// Poll a view until `pred` holds, panicking after a few seconds.
async fn wait_for(view: &Arc<Mutex<ClientView>>, what: &str, pred: impl Fn(&ClientView) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if pred(&view.lock().unwrap()) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}: {:?}", view.lock().unwrap());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn action_of(view: &ClientView, nickname: &str) -> Option<PlayerAction> {
    view.snapshot()?.model.player(nickname).map(|p| p.action)
}

async fn create_sized(client: &dyn ClientAction, nickname: &str, size: u8) -> u32 {
    let Reply::Session { session_id, .. } = client.create_game(nickname).await.unwrap() else {
        panic!("expected a session reply");
    };
    assert_eq!(client.set_size(size).await.unwrap(), Reply::Done);
    session_id
}

#[tokio::test]
async fn create_and_join_across_bindings() {
    let server = TestServer::start().await;

    let alice_view = ClientView::shared();
    let alice = RpcClient::connect(server.rpc, alice_view.clone(), pinging()).await.unwrap();
    let bob_view = ClientView::shared();
    let bob = StreamClient::connect(server.stream, bob_view.clone(), pinging()).await.unwrap();

    // stream rejections come back as events
    assert_eq!(bob.place_starter(true).await.unwrap(), Reply::Queued);
    wait_for(&bob_view, "not-in-session rejection", |v| {
        v.last_rejection().map(|r| r.code) == Some(ErrorCode::NotInSession)
    })
    .await;

    let session_id = create_sized(alice.as_ref(), "alice", 2).await;
    assert_eq!(bob.join_specific("bob", session_id).await.unwrap(), Reply::Queued);

    for view in [&alice_view, &bob_view] {
        wait_for(view, "active session", |v| {
            v.snapshot().map_or(false, |s| {
                s.model.status == GameStatus::Active
                    && s.model.players.len() == 2
                    && s.model.players.iter().all(|p| p.action == PlayerAction::FirstMoves)
            })
        })
        .await;
    }
    assert!(alice_view.lock().unwrap().notices.contains(&"bob joined".to_string()));

    alice.send_chat("good luck").await.unwrap();
    wait_for(&bob_view, "chat line", |v| {
        v.chat.iter().any(|m| m.sender == "alice" && m.text == "good luck")
    })
    .await;

    assert_eq!(server.server.session_count().await, 1);
    assert_eq!(bob_view.lock().unwrap().corrupt_snapshots, 0);
}

#[tokio::test]
async fn heartbeat_lapse_then_reconnect() {
    let server = TestServer::start().await;

    let alice_view = ClientView::shared();
    let alice = RpcClient::connect(server.rpc, alice_view.clone(), silent()).await.unwrap();
    let bob_view = ClientView::shared();
    let bob = StreamClient::connect(server.stream, bob_view.clone(), pinging()).await.unwrap();

    let session_id = create_sized(alice.as_ref(), "alice", 2).await;
    bob.join_specific("bob", session_id).await.unwrap();
    wait_for(&alice_view, "active session", |v| action_of(v, "alice") == Some(PlayerAction::FirstMoves)).await;

    alice.place_starter(true).await.unwrap();
    alice.select_objective(0).await.unwrap();
    bob.place_starter(true).await.unwrap();
    bob.select_objective(1).await.unwrap();

    // turn play starts with alice, who never pings
    wait_for(&bob_view, "alice to place", |v| action_of(v, "alice") == Some(PlayerAction::Place)).await;
    let hand_before = bob_view.lock().unwrap().snapshot().unwrap().model.player("alice").unwrap().hand.clone();

    wait_for(&bob_view, "alice disconnected", |v| {
        v.notices.contains(&"alice disconnected".to_string())
            && action_of(v, "alice") == Some(PlayerAction::Disconnected)
    })
    .await;
    // her turn was skipped
    wait_for(&bob_view, "bob to place", |v| action_of(v, "bob") == Some(PlayerAction::Place)).await;

    // a late ping tells her she has been dropped
    let err = alice.ping().await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected(ref r) if r.code == ErrorCode::NotInSession));
    assert_eq!(
        alice_view.lock().unwrap().last_rejection().map(|r| r.code),
        Some(ErrorCode::NotInSession)
    );

    let alice2_view = ClientView::shared();
    let alice2 = RpcClient::connect(server.rpc, alice2_view.clone(), pinging()).await.unwrap();
    let reply = alice2.reconnect("alice").await.unwrap();
    assert_eq!(
        reply,
        Reply::Session {
            session_id,
            nickname: "alice".to_string()
        }
    );

    wait_for(&bob_view, "alice rejoined", |v| v.notices.contains(&"alice rejoined".to_string())).await;
    wait_for(&alice2_view, "restored state", |v| action_of(v, "alice") == Some(PlayerAction::Wait)).await;

    let view = alice2_view.lock().unwrap();
    let restored = view.snapshot().unwrap().model.player("alice").unwrap();
    assert_eq!(restored.hand, hand_before);
    assert!(restored.connected);
    drop(view);

    // the stale connection can no longer act for alice
    let err = alice.send_chat("still here?").await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected(ref r) if r.code == ErrorCode::NotInSession));
}

#[tokio::test]
async fn gold_card_without_resources_is_refused() {
    let server = TestServer::start().await;

    let alice_view = ClientView::shared();
    let alice = RpcClient::connect(server.rpc, alice_view.clone(), pinging()).await.unwrap();
    let bob = RpcClient::connect(server.rpc, ClientView::shared(), pinging()).await.unwrap();

    let session_id = create_sized(alice.as_ref(), "alice", 2).await;
    bob.join_specific("bob", session_id).await.unwrap();

    // the starter's back shows one of each kingdom; every gold card needs two
    alice.place_starter(false).await.unwrap();
    alice.select_objective(0).await.unwrap();
    bob.place_starter(true).await.unwrap();
    bob.select_objective(0).await.unwrap();

    wait_for(&alice_view, "alice to place", |v| action_of(v, "alice") == Some(PlayerAction::Place)).await;
    let gold_index = {
        let view = alice_view.lock().unwrap();
        let hand = &view.snapshot().unwrap().model.player("alice").unwrap().hand;
        hand.iter().position(|c| c.is_gold()).unwrap()
    };

    let target = Position::ORIGIN.neighbour(CornerPosition::BottomRight);
    let err = alice.place_card(gold_index, true, target).await.unwrap_err();
    match err {
        ClientError::Rejected(rejection) => {
            assert_eq!(rejection.code, ErrorCode::RequirementsNotRespected);
            assert_eq!(rejection.message, "requirements not respected");
        }
        other => panic!("expected a rejection, got {other:?}"),
    }
    assert_eq!(
        alice_view.lock().unwrap().last_rejection().map(|r| r.code),
        Some(ErrorCode::RequirementsNotRespected)
    );

    let session = server.server.registry().get(session_id).await.unwrap();
    let session = session.lock().await;
    let player = session.model().player("alice").unwrap();
    assert_eq!(player.codex.len(), 1);
    assert_eq!(player.hand.len(), 3);
    assert_eq!(player.action, PlayerAction::Place);
}

#[tokio::test]
async fn racing_joins_for_last_seat() {
    let server = TestServer::start().await;

    let alice = RpcClient::connect(server.rpc, ClientView::shared(), pinging()).await.unwrap();
    let session_id = create_sized(alice.as_ref(), "alice", 2).await;

    let bob = RpcClient::connect(server.rpc, ClientView::shared(), pinging()).await.unwrap();
    let carol = RpcClient::connect(server.rpc, ClientView::shared(), pinging()).await.unwrap();

    let (b, c) = tokio::join!(bob.join_specific("bob", session_id), carol.join_first_available("carol"));
    let outcomes = [b, c];

    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = outcomes.iter().find_map(|r| r.as_ref().err()).unwrap();
    match loser {
        ClientError::Rejected(r) => assert!(matches!(r.code, ErrorCode::GameFull | ErrorCode::NoJoinableSession)),
        other => panic!("expected a rejection, got {other:?}"),
    }

    let session = server.server.registry().get(session_id).await.unwrap();
    let session = session.lock().await;
    assert_eq!(session.model().players.len(), 2);
    assert_eq!(session.model().status, GameStatus::Active);
}

#[tokio::test]
async fn dropped_connection_is_reported_to_others() {
    let server = TestServer::start().await;

    let alice_view = ClientView::shared();
    let alice = StreamClient::connect(server.stream, alice_view.clone(), pinging()).await.unwrap();
    let bob_view = ClientView::shared();
    let bob = StreamClient::connect(server.stream, bob_view.clone(), pinging()).await.unwrap();

    alice.create_game("alice").await.unwrap();
    alice.set_size(2).await.unwrap();
    wait_for(&alice_view, "sized session", |v| {
        v.snapshot().map_or(false, |s| s.model.target_size == Some(2))
    })
    .await;
    bob.join_first_available("bob").await.unwrap();
    wait_for(&bob_view, "active session", |v| action_of(v, "bob") == Some(PlayerAction::FirstMoves)).await;

    alice.close();
    assert!(!alice.is_connected());

    wait_for(&bob_view, "alice disconnected", |v| action_of(v, "alice") == Some(PlayerAction::Disconnected)).await;
    // a deliberate close is not a lost link
    assert!(!alice_view.lock().unwrap().connection_lost);
}

#[tokio::test]
async fn shutdown_is_announced_and_link_lost() {
    let server = TestServer::start().await;

    let view = ClientView::shared();
    let client = RpcClient::connect(server.rpc, view.clone(), pinging()).await.unwrap();
    client.create_game("alice").await.unwrap();

    server.server.shutdown().await;

    wait_for(&view, "shutdown notice", |v| v.shutdown_reason.is_some()).await;
    wait_for(&view, "lost link", |v| v.connection_lost).await;
    assert!(matches!(client.ping().await, Err(ClientError::ConnectionLost)));
}
