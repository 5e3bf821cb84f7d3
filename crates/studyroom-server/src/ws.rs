use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use axum::extract::{FromRequest, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use studyroom_core::error::SessionError;
use studyroom_core::net::messages::{
    ClientMessage, CommandResultMsg, HelloMsg, Op, ServerMessage, WelcomeMsg,
};
use studyroom_core::net::protocol::{MAX_MESSAGE_SIZE, PROTOCOL_VERSION, decode_client_message};
use studyroom_core::participant::normalize_display_name;
use studyroom_core::room::{EndOutcome, is_valid_room_code};

use crate::broadcast::{ConnectionSender, encode};
use crate::rate_limit::{TokenBucket, client_ip};
use crate::room_manager::Member;
use crate::state::{AppState, ConnectionGuard, IpConnectionGuard};

/// How long a new connection may take to identify itself.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn ws_handler(
    State(state): State<AppState>,
    request: axum::extract::Request,
) -> Result<axum::response::Response, StatusCode> {
    let max_ws = state.config.limits.max_ws_connections;
    let current = state.ws_connection_count.load(Ordering::Relaxed);
    if current >= max_ws {
        tracing::warn!(current, max = max_ws, "WS connection limit reached");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let ip = client_ip(&request);
    let max_per_ip = state.config.limits.max_ws_per_ip;
    let ip_guard =
        IpConnectionGuard::try_acquire(ip, Arc::clone(&state.ws_per_ip), max_per_ip).await;
    let Some(ip_guard) = ip_guard else {
        tracing::warn!(%ip, max_per_ip, "Per-IP WS connection limit reached");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    };

    let ws = WebSocketUpgrade::from_request(request, &state)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, ip_guard))
        .into_response())
}

/// Check the identity a client presents in its `Hello`.
pub fn validate_hello(hello: &HelloMsg) -> Result<Member, String> {
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(format!(
            "protocol version mismatch: client={}, server={PROTOCOL_VERSION}",
            hello.protocol_version
        ));
    }
    if !hello.participant_id.is_valid() {
        return Err("invalid participant id".to_string());
    }
    let display_name =
        normalize_display_name(&hello.display_name).ok_or("invalid display name")?;
    Ok(Member {
        id: hello.participant_id.clone(),
        display_name,
    })
}

async fn handle_socket(socket: WebSocket, state: AppState, _ip_guard: IpConnectionGuard) {
    let _guard = ConnectionGuard::new(Arc::clone(&state.ws_connection_count));
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // The first frame must be a Hello.
    let first = match tokio::time::timeout(HELLO_TIMEOUT, ws_receiver.next()).await {
        Ok(Some(Ok(Message::Binary(data)))) => data,
        Ok(_) => return,
        Err(_) => {
            tracing::debug!("No Hello before timeout");
            close_with(&mut ws_sender, "hello timeout").await;
            return;
        },
    };
    let member = match decode_client_message(&first) {
        Ok(ClientMessage::Hello(hello)) => match validate_hello(&hello) {
            Ok(member) => member,
            Err(reason) => {
                tracing::info!(reason = %reason, "Rejected Hello");
                close_with(&mut ws_sender, &reason).await;
                return;
            },
        },
        _ => {
            close_with(&mut ws_sender, "expected Hello").await;
            return;
        },
    };

    let welcome = ServerMessage::Welcome(WelcomeMsg {
        participant_id: member.id.clone(),
        protocol_version: PROTOCOL_VERSION,
    });
    let Some(welcome) = encode(&welcome) else {
        return;
    };
    if ws_sender.send(Message::Binary(welcome)).await.is_err() {
        return;
    }

    let (tx, rx) = mpsc::channel::<Bytes>(state.config.limits.connection_message_buffer);
    spawn_writer(ws_sender, rx);

    if state
        .presence
        .register(member.id.clone(), tx.clone())
        .await
        .is_some()
    {
        tracing::info!(participant = %member.id, "Replacing older connection");
    }
    state.presence.broadcast_presence().await;
    tracing::info!(participant = %member.id, "Participant connected");

    let mut conn = Connection {
        member,
        sender: tx,
        rooms: HashSet::new(),
    };
    read_loop(&mut ws_receiver, &state, &mut conn).await;

    // Disconnection never touches room state, only subscriptions.
    state
        .rooms
        .disconnect(&conn.member.id, &conn.sender, &conn.rooms)
        .await;
    if state
        .presence
        .unregister(&conn.member.id, &conn.sender)
        .await
    {
        state.presence.broadcast_presence().await;
    }
    tracing::info!(
        participant = %conn.member.id,
        rooms = conn.rooms.len(),
        "Participant disconnected"
    );
}

async fn close_with(ws_sender: &mut SplitSink<WebSocket, Message>, reason: &str) {
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: reason.to_owned().into(),
    };
    if let Err(e) = ws_sender.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "Failed to send close frame");
    }
}

fn spawn_writer(mut ws_sender: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Bytes>) {
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if ws_sender.send(Message::Binary(data)).await.is_err() {
                break;
            }
        }
    });
}

/// One identified client connection.
struct Connection {
    member: Member,
    sender: ConnectionSender,
    /// Rooms this connection is subscribed to.
    rooms: HashSet<String>,
}

impl Connection {
    /// Queue a reply on this connection. Fails once the writer is gone.
    async fn reply(&self, result: CommandResultMsg) -> bool {
        let Some(data) = encode(&ServerMessage::CommandResult(result)) else {
            return true;
        };
        self.sender.send(data).await.is_ok()
    }
}

async fn read_loop(
    ws_receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
    conn: &mut Connection,
) {
    let rate = state.config.limits.ws_rate_limit_per_sec;
    let mut rate_limiter = TokenBucket::new(rate, rate);

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let data = match msg {
            Message::Binary(d) => d,
            Message::Close(_) => break,
            _ => continue,
        };

        if !rate_limiter.allow() {
            tracing::warn!(participant = %conn.member.id, "Rate limited");
            continue;
        }
        if data.is_empty() || data.len() > MAX_MESSAGE_SIZE {
            continue;
        }

        let command = match decode_client_message(&data) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!(
                    participant = %conn.member.id, error = %e,
                    "Dropping undecodable frame"
                );
                continue;
            },
        };

        let Some(result) = dispatch(state, conn, command).await else {
            continue;
        };
        if !conn.reply(result).await {
            break;
        }
    }
}

fn rejected(op: Op, room_code: &str, err: &SessionError) -> CommandResultMsg {
    CommandResultMsg::rejected(op, Some(room_code.to_string()), err.kind(), err.to_string())
}

/// Room codes are matched case-insensitively.
fn normalize_room_code(code: &str) -> Result<String, SessionError> {
    let code = code.trim().to_ascii_uppercase();
    if is_valid_room_code(&code) {
        Ok(code)
    } else {
        Err(SessionError::RoomNotFound(code))
    }
}

/// The op and raw room code of a room-targeted command.
fn room_target(command: &ClientMessage) -> Option<(Op, &str)> {
    match command {
        ClientMessage::Hello(_) | ClientMessage::CreateRoom(_) => None,
        ClientMessage::JoinRoom(req) => Some((Op::Join, &req.room_code)),
        ClientMessage::StartSession(req) => Some((Op::Start, &req.room_code)),
        ClientMessage::ReportProgress(req) => Some((Op::ReportProgress, &req.room_code)),
        ClientMessage::EndSession(req) => Some((Op::End, &req.room_code)),
        ClientMessage::Invite(req) => Some((Op::Invite, &req.room_code)),
        ClientMessage::LeaveRoom(req) => Some((Op::Leave, &req.room_code)),
    }
}

/// Run one command as the connection's participant.
async fn dispatch(
    state: &AppState,
    conn: &mut Connection,
    command: ClientMessage,
) -> Option<CommandResultMsg> {
    let code = match room_target(&command) {
        Some((op, raw)) => match normalize_room_code(raw) {
            Ok(code) => code,
            Err(e) => return Some(rejected(op, raw, &e)),
        },
        None => String::new(),
    };
    let rooms = &state.rooms;
    let me = &conn.member.id;
    let result = match command {
        ClientMessage::Hello(_) => {
            tracing::debug!(participant = %me, "Ignoring repeated Hello");
            return None;
        },
        ClientMessage::CreateRoom(req) => {
            let capacity = req.max_participants.map(usize::from);
            match rooms
                .create_room(&conn.member, capacity, Some(conn.sender.clone()))
                .await
            {
                Ok(snapshot) => {
                    conn.rooms.insert(snapshot.room_code.clone());
                    CommandResultMsg::accepted(Op::Create, snapshot.room_code)
                },
                Err(e) => CommandResultMsg::rejected(Op::Create, None, e.kind(), e.to_string()),
            }
        },
        ClientMessage::JoinRoom(_) => {
            match rooms
                .join_room(&code, &conn.member, Some(conn.sender.clone()))
                .await
            {
                Ok(_) => {
                    conn.rooms.insert(code.clone());
                    CommandResultMsg::accepted(Op::Join, code)
                },
                Err(e) => rejected(Op::Join, &code, &e),
            }
        },
        ClientMessage::StartSession(req) => {
            match rooms
                .start_session(&code, me, req.target_duration_secs)
                .await
            {
                Ok(_) => CommandResultMsg::accepted(Op::Start, code),
                Err(e) => rejected(Op::Start, &code, &e),
            }
        },
        ClientMessage::ReportProgress(req) => {
            match rooms.report_progress(&code, me, req.elapsed_seconds).await {
                Ok(_) => CommandResultMsg::accepted(Op::ReportProgress, code),
                Err(e) => rejected(Op::ReportProgress, &code, &e),
            }
        },
        ClientMessage::EndSession(_) => match rooms.end_session(&code, me).await {
            Ok(EndOutcome::Ended(_)) => CommandResultMsg::accepted(Op::End, code),
            Ok(EndOutcome::AlreadySettled(_)) => CommandResultMsg::settled(Op::End, code),
            Err(e) => rejected(Op::End, &code, &e),
        },
        ClientMessage::Invite(req) => {
            if !req.invitee_id.is_valid() {
                let err = SessionError::invalid_argument("invalid invitee id");
                return Some(rejected(Op::Invite, &code, &err));
            }
            match rooms.invite(&code, me, &req.invitee_id).await {
                Ok(_) => CommandResultMsg::accepted(Op::Invite, code),
                Err(e) => rejected(Op::Invite, &code, &e),
            }
        },
        ClientMessage::LeaveRoom(_) => match rooms.leave_room(&code, me).await {
            Ok(_) => {
                conn.rooms.remove(&code);
                CommandResultMsg::accepted(Op::Leave, code)
            },
            Err(e) => rejected(Op::Leave, &code, &e),
        },
    };
    Some(result)
}
