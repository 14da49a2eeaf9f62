// End-to-end tests for `DccClient` against a loopback command station.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use dccex_throttle::{
    BrowseBatch, BrowseChange, ChannelBrowser, ClientConfig, ConsoleDirection, DccClient,
    DiscoveryEvent, ProgrammingKind, ProgrammingResponse, ServiceEndpoint, SessionEvent,
    SessionState, Station, TrackId, TrackMode, TrackPower,
};

const WAIT: Duration = Duration::from_secs(5);

async fn station_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn client(port: u16) -> (ChannelBrowser, DccClient) {
    let browser = ChannelBrowser::new();
    let config = ClientConfig {
        default_port: port,
        health_check_interval_ms: 60_000,
        ..ClientConfig::default()
    };
    let client = DccClient::with_browser(Arc::new(browser.clone()), config);
    (browser, client)
}

/// Connect directly and hand back the station's end of the socket
async fn connect(client: &DccClient, listener: &TcpListener, port: u16) -> TcpStream {
    client.connect(&Station::new("layout", "127.0.0.1", port));
    let (socket, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut connected = client.connectivity();
    timeout(WAIT, connected.wait_for(|c| *c)).await.unwrap().unwrap();
    socket
}

#[tokio::test]
async fn split_response_is_decoded_and_logged() {
    let (listener, port) = station_listener().await;
    let (_browser, client) = client(port);
    let mut socket = connect(&client, &listener, port).await;

    socket.write_all(b"<r ").await.unwrap();
    socket.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    socket.write_all(b"5>\n").await.unwrap();

    let mut responses = client.last_programming_response();
    let response = timeout(WAIT, responses.wait_for(|r| r.is_some()))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(
        response,
        Some(ProgrammingResponse {
            kind: ProgrammingKind::ReadAddress,
            value: 5,
        })
    );

    timeout(WAIT, async {
        while client.console().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let entries = client.console().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].direction, ConsoleDirection::Received);
    assert_eq!(entries[0].content, "<r 5>");
    assert_eq!(*client.last_message().borrow(), Some("<r 5>".to_string()));
}

#[tokio::test]
async fn throttle_and_track_commands_reach_the_station() {
    let (listener, port) = station_listener().await;
    let (_browser, client) = client(port);
    let socket = connect(&client, &listener, port).await;
    let mut lines = BufReader::new(socket).lines();

    client.set_speed(3, 0.5, true).unwrap();
    client.set_function(3, 0, true).unwrap();
    client.set_track_mode(TrackId::B, TrackMode::Program).unwrap();
    client.set_all_tracks_power(true).unwrap();
    client.read_cv(29).unwrap();

    let mut received = Vec::new();
    for _ in 0..5 {
        let line = timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
        received.push(line.unwrap());
    }
    assert_eq!(
        received,
        vec!["<t 3 63 1>", "<F 3 0 1>", "<= B PROG>", "<1>", "<R 29>"]
    );

    let sent: Vec<String> = client
        .console()
        .entries()
        .into_iter()
        .filter(|e| e.direction == ConsoleDirection::Sent)
        .map(|e| e.content)
        .collect();
    assert_eq!(sent, received);

    let track_b = client.track(TrackId::B);
    assert_eq!(track_b.mode, TrackMode::Program);
    assert_eq!(track_b.power, TrackPower::On);
    assert_eq!(client.track(TrackId::A).mode, TrackMode::Main);
}

#[tokio::test]
async fn lost_station_drops_its_session() {
    let (listener, port) = station_listener().await;
    let (browser, client) = client(port);
    let mut discovery = client.discovery_events();

    client.scan().unwrap();
    let endpoint = ServiceEndpoint::new("DCC-EX", "local.").with_host("127.0.0.1");
    browser.push(BrowseBatch {
        changes: vec![BrowseChange::Added(endpoint.clone())],
        results: vec![endpoint.clone()],
    });
    timeout(WAIT, async {
        while discovery.recv().await.unwrap() != DiscoveryEvent::StationFound("DCC-EX".into()) {}
    })
    .await
    .unwrap();

    let station = client.registry().get("DCC-EX").unwrap();
    client.connect(&station);
    let _socket = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut states = client.session_states();
    timeout(WAIT, states.wait_for(SessionState::is_connected))
        .await
        .unwrap()
        .unwrap();

    browser.push(BrowseBatch {
        changes: vec![BrowseChange::Removed(endpoint)],
        results: vec![],
    });
    timeout(WAIT, states.wait_for(|s| *s == SessionState::Disconnected))
        .await
        .unwrap()
        .unwrap();

    assert!(client.connected_station().is_none());
    assert!(!client.registry().get("DCC-EX").unwrap().is_online);
    assert_eq!(
        *client.last_message().borrow(),
        Some("Disconnected from DCC-EX".to_string())
    );
}

#[tokio::test]
async fn unreachable_station_reports_failure() {
    let (listener, port) = station_listener().await;
    drop(listener);
    let (_browser, client) = client(port);
    let mut events = client.session_events();

    client.connect(&Station::new("layout", "127.0.0.1", port));
    let mut states = Vec::new();
    timeout(WAIT, async {
        while states.last() != Some(&SessionState::Disconnected) {
            if let SessionEvent::StateChanged(state) = events.recv().await.unwrap() {
                states.push(state);
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(states.len(), 3);
    assert_eq!(states[0], SessionState::Connecting);
    assert!(matches!(states[1], SessionState::Failed(_)));
    let notice = client.last_message().borrow().clone().unwrap();
    assert!(notice.starts_with("Connection failed"), "{notice}");
}
