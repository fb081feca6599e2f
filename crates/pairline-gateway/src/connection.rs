use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use pairline_types::api::Claims;
use pairline_types::events::{GatewayCommand, GatewayEvent};
use pairline_types::models::{Message, User};
use pairline_types::{ChatError, Result};

use crate::directory::Directory;
use crate::identity::verify_token;
use crate::service::ChatService;
use crate::session::{ChannelSession, OpenOutcome, SessionState};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Events queued for the writer task. Bounded so a stalled socket stops the
/// reader from draining its subscription, which then gets dropped upstream.
const OUTBOUND_QUEUE: usize = 64;

type WsSender = SplitSink<WebSocket, WsMessage>;
type WsReceiver = SplitStream<WebSocket>;

/// Handle a single gateway connection: Identify handshake, then one channel
/// session driven by client commands.
pub async fn handle_connection(socket: WebSocket, service: ChatService, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    let claims = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(claims) => claims,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };
    let user_id = claims.sub.clone();

    // Every sign-in refreshes the directory entry
    let user = User {
        id: user_id.clone(),
        display_label: claims.email.clone(),
    };
    let directory = service.directory().clone();
    let registered = tokio::task::spawn_blocking(move || directory.register(&user)).await;
    match registered {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!("Directory registration for {} failed: {}", user_id, e);
            let _ = send_event(&mut sender, &GatewayEvent::from(&e)).await;
            return;
        }
        Err(e) => {
            warn!("Directory registration task for {} failed: {}", user_id, e);
            return;
        }
    }

    info!("{} connected to gateway", user_id);

    let ready = GatewayEvent::Ready {
        user_id: user_id.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    run_connection_loop(sender, receiver, service, claims).await;
}

async fn run_connection_loop(
    mut sender: WsSender,
    mut receiver: WsReceiver,
    service: ChatService,
    claims: Claims,
) {
    let user_id = claims.sub;
    let directory = service.directory().clone();

    // Subscribe before the snapshot so no transition falls between the two
    let mut presence_rx = directory.subscribe_presence();

    // Send existing online users to this client so they see who's already here
    let snapshot = {
        let directory = directory.clone();
        let user_id = user_id.clone();
        tokio::task::spawn_blocking(move || presence_snapshot(&directory, &user_id))
            .await
            .unwrap_or_default()
    };
    for event in snapshot {
        if send_event(&mut sender, &event).await.is_err() {
            return;
        }
    }

    directory.user_online(&user_id, claims.email);

    let (out_tx, mut out_rx) = mpsc::channel::<GatewayEvent>(OUTBOUND_QUEUE);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    // Writer: session events, presence broadcasts and heartbeat -> client
    let presence_self = user_id.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = out_rx.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                result = presence_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Presence receiver lagged by {} updates", n);
                            continue;
                        }
                        Err(_) => break,
                    };
                    if matches!(&event, GatewayEvent::PresenceUpdate { user_id, .. } if *user_id == presence_self) {
                        continue;
                    }
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: owns the session; commands and pushed messages -> writer
    let recv_user = user_id.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut session = service.session();

        loop {
            tokio::select! {
                frame = receiver.next() => {
                    let Some(Ok(frame)) = frame else { break };
                    match frame {
                        WsMessage::Text(text) => {
                            match serde_json::from_str::<GatewayCommand>(&text) {
                                Ok(cmd) => {
                                    // Store work blocks, so the session visits the blocking pool
                                    let svc = service.clone();
                                    let user = recv_user.clone();
                                    let joined = tokio::task::spawn_blocking(move || {
                                        let events = handle_command(&svc, &mut session, &user, cmd);
                                        (session, events)
                                    })
                                    .await;
                                    let events = match joined {
                                        Ok((returned, events)) => {
                                            session = returned;
                                            events
                                        }
                                        Err(e) => {
                                            warn!("{} command task failed: {}", recv_user, e);
                                            return;
                                        }
                                    };
                                    for event in events {
                                        if out_tx.send(event).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Err(e) => {
                                    warn!(
                                        "{} bad command: {} -- raw: {}",
                                        recv_user,
                                        e,
                                        text.chars().take(200).collect::<String>()
                                    );
                                }
                            }
                        }
                        WsMessage::Pong(_) => {
                            pong_flag_recv.store(true, Ordering::Release);
                        }
                        WsMessage::Close(_) => break,
                        _ => {}
                    }
                }
                delivery = next_delivery(&mut session) => {
                    let event = match delivery {
                        Ok(message) => GatewayEvent::MessageCreate { message },
                        Err(e) => GatewayEvent::from(&e),
                    };
                    if out_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        }
        // Session drop unsubscribes
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let offline_user = user_id.clone();
    let released = tokio::task::spawn_blocking(move || directory.user_offline(&offline_user)).await;
    if let Err(e) = released {
        warn!("Presence release for {} failed: {}", user_id, e);
    }
    info!("{} disconnected from gateway", user_id);
}

fn presence_snapshot(directory: &Directory, user_id: &str) -> Vec<GatewayEvent> {
    directory
        .online_users()
        .into_iter()
        .filter(|online| online != user_id)
        .map(|online| {
            let display_label = directory.get(&online).ok().flatten().and_then(|u| u.display_label);
            GatewayEvent::PresenceUpdate {
                user_id: online,
                display_label,
                online: true,
            }
        })
        .collect()
}

async fn wait_for_identify(receiver: &mut WsReceiver, jwt_secret: &str) -> Option<Claims> {
    let identify = async {
        while let Some(Ok(frame)) = receiver.next().await {
            if let WsMessage::Text(text) = frame {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    return verify_token(&token, jwt_secret);
                }
            }
        }
        None
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, identify).await.ok().flatten()
}

/// Next pushed message for the open channel. Pending while there is nothing
/// to wait on, so the surrounding select only wakes on commands.
async fn next_delivery(session: &mut ChannelSession) -> Result<Message> {
    if session.state() != SessionState::Active || !session.is_subscribed() {
        return std::future::pending().await;
    }
    session.next_message().await
}

fn handle_command(
    service: &ChatService,
    session: &mut ChannelSession,
    user_id: &str,
    cmd: GatewayCommand,
) -> Vec<GatewayEvent> {
    match cmd {
        GatewayCommand::Identify { .. } => Vec::new(), // Already handled

        GatewayCommand::OpenChannel { other_user_id } => {
            info!("{} opening channel with {}", user_id, other_user_id);
            match session.open(user_id, &other_user_id) {
                Ok(OpenOutcome::Opened {
                    channel_id,
                    backfill,
                }) => vec![GatewayEvent::ChannelOpened {
                    channel_id,
                    backfill,
                }],
                Ok(OpenOutcome::Unchanged { channel_id }) => vec![GatewayEvent::ChannelOpened {
                    channel_id,
                    backfill: Vec::new(),
                }],
                Err(e) => {
                    if session.state() == SessionState::Closed {
                        // A failed resolution ends the session, not the connection
                        *session = service.session();
                    }
                    vec![error_event(user_id, &e)]
                }
            }
        }

        GatewayCommand::SendMessage { text } => match session.send_text(&text) {
            Ok(message) => {
                trace!("{} committed #{} on {}", user_id, message.sequence, message.channel_id);
                vec![GatewayEvent::MessageAck {
                    sequence: message.sequence,
                }]
            }
            Err(e) => vec![error_event(user_id, &e)],
        },

        GatewayCommand::Resume { after_sequence } => match session.resume(after_sequence) {
            Ok(backfill) => match session.channel_id() {
                Some(channel_id) => vec![GatewayEvent::ChannelOpened {
                    channel_id: channel_id.clone(),
                    backfill,
                }],
                None => vec![error_event(user_id, &ChatError::SessionClosed)],
            },
            Err(e) => vec![error_event(user_id, &e)],
        },

        GatewayCommand::CloseChannel => {
            session.close();
            *session = service.session();
            Vec::new()
        }
    }
}

/// Retryable failures are the server's problem and get a warning; the rest
/// are client mistakes.
fn error_event(user_id: &str, error: &ChatError) -> GatewayEvent {
    if error.is_retryable() {
        warn!("{} command failed: {}", user_id, error);
    } else {
        debug!("{} command rejected: {}", user_id, error);
    }
    GatewayEvent::from(error)
}

async fn send_event(sender: &mut WsSender, event: &GatewayEvent) -> anyhow::Result<()> {
    let text = serde_json::to_string(event)?;
    sender.send(WsMessage::Text(text.into())).await?;
    Ok(())
}
