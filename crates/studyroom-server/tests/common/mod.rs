use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use studyroom_core::net::messages::{
    ClientMessage, CommandResultMsg, CreateRoomMsg, EndSessionMsg, HelloMsg, InviteMsg,
    JoinRoomMsg, LeaveRoomMsg, Op, ReportProgressMsg, ServerMessage, SessionEndedMsg,
    StartSessionMsg,
};
use studyroom_core::net::protocol::{
    PROTOCOL_VERSION, decode_server_message, encode_client_message,
};
use studyroom_core::participant::ParticipantId;
use studyroom_server::config::ServerConfig;
use studyroom_server::state::AppState;
use studyroom_server::{build_app, spawn_background_tasks};
use tokio_util::sync::CancellationToken;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A running server bound to an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    cancel: CancellationToken,
    _handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Start a server with default configuration and an in-memory history.
    pub async fn new() -> Self {
        Self::with_config(ServerConfig::default()).await
    }

    pub async fn with_config(config: ServerConfig) -> Self {
        let (app, state) = build_app(config).await.unwrap();
        let cancel = CancellationToken::new();
        spawn_background_tasks(&state, cancel.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            addr,
            state,
            cancel,
            _handle: handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Open a raw WebSocket without identifying.
pub async fn ws_connect_raw(server: &TestServer) -> WsStream {
    let (stream, _) = connect_async(&server.ws_url()).await.unwrap();
    stream
}

/// Connect, send `Hello` and wait for the `Welcome`.
pub async fn ws_connect(server: &TestServer, id: &str, name: &str) -> WsStream {
    let mut stream = ws_connect_raw(server).await;
    ws_send(
        &mut stream,
        &ClientMessage::Hello(HelloMsg {
            participant_id: ParticipantId::from(id),
            display_name: name.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }),
    )
    .await;
    match ws_read_server_msg(&mut stream).await {
        ServerMessage::Welcome(welcome) => assert_eq!(welcome.participant_id.as_str(), id),
        other => panic!("Expected Welcome, got: {other:?}"),
    }
    stream
}

pub async fn ws_send(stream: &mut WsStream, msg: &ClientMessage) {
    let encoded = encode_client_message(msg).unwrap();
    stream.send(Message::Binary(encoded.into())).await.unwrap();
}

/// Read raw binary data from a WebSocket stream (5s timeout).
pub async fn ws_read_raw(stream: &mut WsStream) -> Vec<u8> {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return data.to_vec(),
                Some(Ok(Message::Close(_))) => panic!("WebSocket closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {e}"),
                None => panic!("WebSocket stream ended"),
                _ => continue,
            }
        }
    })
    .await
    .expect("Timed out waiting for WebSocket message")
}

/// Read the next ServerMessage from a WebSocket stream (5s timeout).
pub async fn ws_read_server_msg(stream: &mut WsStream) -> ServerMessage {
    let data = ws_read_raw(stream).await;
    decode_server_message(&data).unwrap()
}

/// Skip messages until one matches `pick`.
pub async fn ws_read_until<T>(
    stream: &mut WsStream,
    mut pick: impl FnMut(ServerMessage) -> Option<T>,
) -> T {
    loop {
        if let Some(found) = pick(ws_read_server_msg(stream).await) {
            return found;
        }
    }
}

/// Skip pushes until the `CommandResult` for `op` arrives.
pub async fn ws_expect_result(stream: &mut WsStream, op: Op) -> CommandResultMsg {
    ws_read_until(stream, |msg| match msg {
        ServerMessage::CommandResult(result) if result.op == op => Some(result),
        _ => None,
    })
    .await
}

pub async fn ws_expect_session_ended(stream: &mut WsStream) -> SessionEndedMsg {
    ws_read_until(stream, |msg| match msg {
        ServerMessage::SessionEnded(ended) => Some(*ended),
        _ => None,
    })
    .await
}

/// Wait until the stream reports a closed connection.
pub async fn ws_expect_closed(stream: &mut WsStream) {
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                _ => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection was not closed");
}

pub async fn ws_create_room(stream: &mut WsStream) -> String {
    ws_send(
        stream,
        &ClientMessage::CreateRoom(CreateRoomMsg {
            max_participants: None,
        }),
    )
    .await;
    let result = ws_expect_result(stream, Op::Create).await;
    assert!(result.ok, "create failed: {result:?}");
    result.room_code.unwrap()
}

pub async fn ws_join(stream: &mut WsStream, code: &str) -> CommandResultMsg {
    ws_send(
        stream,
        &ClientMessage::JoinRoom(JoinRoomMsg {
            room_code: code.to_string(),
        }),
    )
    .await;
    ws_expect_result(stream, Op::Join).await
}

pub async fn ws_start(stream: &mut WsStream, code: &str, target: i64) -> CommandResultMsg {
    ws_send(
        stream,
        &ClientMessage::StartSession(StartSessionMsg {
            room_code: code.to_string(),
            target_duration_secs: target,
        }),
    )
    .await;
    ws_expect_result(stream, Op::Start).await
}

pub fn progress_msg(code: &str, elapsed: u64) -> ClientMessage {
    ClientMessage::ReportProgress(ReportProgressMsg {
        room_code: code.to_string(),
        elapsed_seconds: elapsed,
    })
}

pub async fn ws_report(stream: &mut WsStream, code: &str, elapsed: u64) -> CommandResultMsg {
    ws_send(stream, &progress_msg(code, elapsed)).await;
    ws_expect_result(stream, Op::ReportProgress).await
}

pub async fn ws_end(stream: &mut WsStream, code: &str) -> CommandResultMsg {
    ws_send(
        stream,
        &ClientMessage::EndSession(EndSessionMsg {
            room_code: code.to_string(),
        }),
    )
    .await;
    ws_expect_result(stream, Op::End).await
}

pub async fn ws_invite(stream: &mut WsStream, code: &str, invitee: &str) -> CommandResultMsg {
    ws_send(
        stream,
        &ClientMessage::Invite(InviteMsg {
            room_code: code.to_string(),
            invitee_id: ParticipantId::from(invitee),
        }),
    )
    .await;
    ws_expect_result(stream, Op::Invite).await
}

pub async fn ws_leave(stream: &mut WsStream, code: &str) -> CommandResultMsg {
    ws_send(
        stream,
        &ClientMessage::LeaveRoom(LeaveRoomMsg {
            room_code: code.to_string(),
        }),
    )
    .await;
    ws_expect_result(stream, Op::Leave).await
}

/// Host `h` creates a room and `a`, `b` join it.
pub async fn three_in_room(server: &TestServer) -> (String, WsStream, WsStream, WsStream) {
    let mut h = ws_connect(server, "h", "Hana").await;
    let mut a = ws_connect(server, "a", "Ari").await;
    let mut b = ws_connect(server, "b", "Bo").await;
    let code = ws_create_room(&mut h).await;
    assert!(ws_join(&mut a, &code).await.ok);
    assert!(ws_join(&mut b, &code).await.ok);
    (code, h, a, b)
}
