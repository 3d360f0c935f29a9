//! Room actors and the directory that owns them.
//!
//! ARCHITECTURE
//! ============
//! Every live room is one tokio task holding that room's entire mutable
//! state: the seq counter, the membership cache, attached sessions, the
//! typing set, and a bounded window of recent messages with unflushed
//! receipt stamps. Commands arrive over a bounded mpsc channel and are
//! processed strictly in order, which is the whole ordering story; there
//! is no lock to fight over and no way for two sends to race for a seq.
//!
//! LIFECYCLE
//! =========
//! Actors spawn lazily on first join, hydrating the room row, membership,
//! and seq high-water mark from the store before the directory lock is
//! taken. When the last session leaves, the directory asks the actor to
//! shut down; the actor confirms only if it is still empty, flushes its
//! dirty receipts, and exits. A join racing the shutdown simply fails its
//! channel send and retries against a fresh actor.
//!
//! ERROR HANDLING
//! ==============
//! A store failure during send is surfaced to the sender and the seq is
//! not advanced, so accepted history never has holes. Receipt stamps are
//! buffered and flushed on an interval; a failed flush keeps the dirty
//! mark and retries on the next tick.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{MemberInfo, Message, MessageKind, RoomError, RoomInfo, ServerEvent, now_ms};
use crate::services::delivery;
use crate::services::membership::RoomMembership;
use crate::services::presence::PresenceView;
use crate::services::registry::ConnectionRegistry;
use crate::services::store::{ChatStore, SessionUser};
use crate::services::typing::{TYPING_EXPIRY, TypingSet};
use crate::services::{env_parse, sleep_until_opt};

// =============================================================================
// CONFIG
// =============================================================================

const DEFAULT_BACKLOG_LIMIT: i64 = 50;
const DEFAULT_FLUSH_MS: u64 = 400;
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Recent messages kept in memory per room so receipt stamps stay cheap.
const LIVE_WINDOW: usize = 128;

#[derive(Debug, Clone, Copy)]
pub struct RoomConfig {
    /// Max messages served by one `join_room` backlog.
    pub backlog_limit: i64,
    /// How often buffered receipt stamps are written to the store.
    pub receipt_flush_interval: Duration,
    /// Command channel depth per room actor.
    pub channel_capacity: usize,
    /// Idle window before a typing user counts as stopped.
    pub typing_expiry: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            receipt_flush_interval: Duration::from_millis(DEFAULT_FLUSH_MS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            typing_expiry: TYPING_EXPIRY,
        }
    }
}

impl RoomConfig {
    /// Read `ROOM_BACKLOG_LIMIT`, `RECEIPT_FLUSH_MS`, `ROOM_CHANNEL_CAPACITY`,
    /// and `TYPING_EXPIRY_MS` from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            backlog_limit: env_parse("ROOM_BACKLOG_LIMIT", DEFAULT_BACKLOG_LIMIT),
            receipt_flush_interval: Duration::from_millis(env_parse("RECEIPT_FLUSH_MS", DEFAULT_FLUSH_MS)),
            channel_capacity: env_parse("ROOM_CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY),
            typing_expiry: Duration::from_millis(env_parse(
                "TYPING_EXPIRY_MS",
                u64::try_from(TYPING_EXPIRY.as_millis()).unwrap_or(2_000),
            )),
        }
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

/// Everything a fresh session needs to render the room.
#[derive(Debug, Clone)]
pub struct JoinSnapshot {
    pub room: RoomInfo,
    pub members: Vec<MemberInfo>,
    pub online_user_ids: Vec<Uuid>,
    pub messages: Vec<Message>,
}

enum RoomCommand {
    Join {
        conn_id: Uuid,
        user: SessionUser,
        last_seen_seq: Option<i64>,
        tx: mpsc::Sender<ServerEvent>,
        reply: oneshot::Sender<Result<JoinSnapshot, RoomError>>,
    },
    Leave {
        conn_id: Uuid,
        reply: oneshot::Sender<usize>,
    },
    Post {
        user: SessionUser,
        kind: MessageKind,
        content: String,
        reply_to: Option<Uuid>,
        forward_of: Option<Uuid>,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    Edit {
        user_id: Uuid,
        message_id: Uuid,
        content: String,
        kind: Option<MessageKind>,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    Delete {
        user_id: Uuid,
        message_id: Uuid,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    Typing {
        user_id: Uuid,
        active: bool,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    MarkReceipt {
        user_id: Uuid,
        message_id: Uuid,
        read: bool,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    FetchReceipts {
        user_id: Uuid,
        message_id: Uuid,
        reply: oneshot::Sender<Result<ServerEvent, RoomError>>,
    },
    PresenceChanged {
        user_id: Uuid,
        online: bool,
    },
    RefreshMembership {
        reply: oneshot::Sender<usize>,
    },
    Purge {
        reply: oneshot::Sender<Result<u64, RoomError>>,
    },
    Shutdown {
        reply: oneshot::Sender<bool>,
    },
}

fn receipts_event(msg: &Message) -> ServerEvent {
    ServerEvent::MessageReceipts {
        room_id: msg.room_id,
        message_id: msg.id,
        delivered_to: msg.delivered_to.clone(),
        read_by: msg.read_by.clone(),
        delivery: msg.delivery,
    }
}

// =============================================================================
// ACTOR
// =============================================================================

struct Session {
    user_id: Uuid,
    tx: mpsc::Sender<ServerEvent>,
}

struct RoomActor {
    room: RoomInfo,
    store: Arc<dyn ChatStore>,
    registry: ConnectionRegistry,
    presence: PresenceView,
    config: RoomConfig,
    membership: RoomMembership,
    /// conn_id -> attached session
    sessions: HashMap<Uuid, Session>,
    next_seq: i64,
    window: VecDeque<Message>,
    /// Message ids in the window with unflushed receipt stamps.
    dirty: HashSet<Uuid>,
    typing: TypingSet,
}

impl RoomActor {
    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        let mut flush = tokio::time::interval(self.config.receipt_flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(cmd) = maybe else { break };
                    if self.handle(cmd).await {
                        break;
                    }
                }
                _ = flush.tick() => self.flush_receipts().await,
                () = sleep_until_opt(self.typing.next_deadline()) => self.expire_typing(),
            }
        }
        self.flush_receipts().await;
        info!(room_id = %self.room.id, "room actor stopped");
    }

    /// Returns `true` when the actor should shut down.
    async fn handle(&mut self, cmd: RoomCommand) -> bool {
        match cmd {
            RoomCommand::Join {
                conn_id,
                user,
                last_seen_seq,
                tx,
                reply,
            } => {
                let result = self.handle_join(conn_id, user, last_seen_seq, tx).await;
                let _ = reply.send(result);
            }
            RoomCommand::Leave { conn_id, reply } => {
                self.handle_leave(conn_id);
                let _ = reply.send(self.sessions.len());
            }
            RoomCommand::Post {
                user,
                kind,
                content,
                reply_to,
                forward_of,
                reply,
            } => {
                let result = self.handle_post(user, kind, content, reply_to, forward_of).await;
                let _ = reply.send(result);
            }
            RoomCommand::Edit {
                user_id,
                message_id,
                content,
                kind,
                reply,
            } => {
                let result = self.handle_edit(user_id, message_id, content, kind).await;
                let _ = reply.send(result);
            }
            RoomCommand::Delete {
                user_id,
                message_id,
                reply,
            } => {
                let result = self.handle_delete(user_id, message_id).await;
                let _ = reply.send(result);
            }
            RoomCommand::Typing { user_id, active, reply } => {
                let _ = reply.send(self.handle_typing(user_id, active));
            }
            RoomCommand::MarkReceipt {
                user_id,
                message_id,
                read,
                reply,
            } => {
                let result = self.handle_mark_receipt(user_id, message_id, read).await;
                let _ = reply.send(result);
            }
            RoomCommand::FetchReceipts {
                user_id,
                message_id,
                reply,
            } => {
                let result = self.handle_fetch_receipts(user_id, message_id).await;
                let _ = reply.send(result);
            }
            RoomCommand::PresenceChanged { user_id, online } => self.handle_presence(user_id, online),
            RoomCommand::RefreshMembership { reply } => {
                self.handle_refresh_membership().await;
                let _ = reply.send(self.sessions.len());
            }
            RoomCommand::Purge { reply } => {
                let result = self.handle_purge().await;
                let _ = reply.send(result);
            }
            RoomCommand::Shutdown { reply } => {
                let empty = self.sessions.is_empty();
                let _ = reply.send(empty);
                return empty;
            }
        }
        false
    }

    // -------------------------------------------------------------------------
    // SESSIONS
    // -------------------------------------------------------------------------

    async fn handle_join(
        &mut self,
        conn_id: Uuid,
        user: SessionUser,
        last_seen_seq: Option<i64>,
        tx: mpsc::Sender<ServerEvent>,
    ) -> Result<JoinSnapshot, RoomError> {
        self.membership.authorize(user.id)?;
        let messages = self.backlog(&user, last_seen_seq).await?;
        self.sessions.insert(
            conn_id,
            Session {
                user_id: user.id,
                tx,
            },
        );
        info!(
            room_id = %self.room.id,
            user_id = %user.id,
            %conn_id,
            sessions = self.sessions.len(),
            "session joined room"
        );
        Ok(JoinSnapshot {
            room: self.room.clone(),
            members: self.membership.members().to_vec(),
            online_user_ids: self.presence.online_subset(&self.membership.user_ids()),
            messages,
        })
    }

    /// Serve the join backlog, stamping each served message as delivered
    /// to the joining user. The live window wins over the store copy for
    /// receipts, since it may hold stamps not yet flushed.
    async fn backlog(&mut self, user: &SessionUser, last_seen_seq: Option<i64>) -> Result<Vec<Message>, RoomError> {
        let room_id = self.room.id;
        let limit = self.config.backlog_limit;
        let mut messages = match last_seen_seq {
            Some(cursor) => self.store.messages_since(room_id, cursor, limit).await?,
            None => {
                let mut page = self.store.history_page(room_id, None, limit).await?;
                page.reverse();
                page
            }
        };

        let now = now_ms();
        let mut announce: Vec<Message> = Vec::new();
        for msg in &mut messages {
            if let Some(i) = self.window_index(msg.id) {
                *msg = self.window[i].clone();
            }
            let newly = delivery::mark_delivered(msg, user.id, now);
            if newly {
                if let Some(i) = self.window_index(msg.id) {
                    self.window[i] = msg.clone();
                    self.dirty.insert(msg.id);
                } else if let Err(err) = self.store.merge_receipts(room_id, msg.id, &[(user.id, now)], &[]).await {
                    warn!(%room_id, message_id = %msg.id, error = %err, "backlog delivery stamp failed");
                }
            }
            delivery::decorate(msg, self.room.kind, self.membership.recipient_count(msg.sender_id));
            if newly && msg.sender_id != user.id {
                announce.push(msg.clone());
            }
        }
        for msg in announce {
            self.registry.fan_out(msg.sender_id, &receipts_event(&msg));
        }
        Ok(messages)
    }

    fn handle_leave(&mut self, conn_id: Uuid) {
        let Some(session) = self.sessions.remove(&conn_id) else {
            return;
        };
        debug!(room_id = %self.room.id, %conn_id, sessions = self.sessions.len(), "session left room");
        let user_still_here = self.sessions.values().any(|s| s.user_id == session.user_id);
        if !user_still_here && self.typing.forget(session.user_id) {
            let event = ServerEvent::UserStoppedTyping {
                room_id: self.room.id,
                user_id: session.user_id,
                user_name: self.membership.name_of(session.user_id).unwrap_or_default().to_string(),
            };
            self.fan_sessions_except(session.user_id, &event);
        }
    }

    // -------------------------------------------------------------------------
    // MESSAGES
    // -------------------------------------------------------------------------

    async fn handle_post(
        &mut self,
        user: SessionUser,
        kind: MessageKind,
        content: String,
        reply_to: Option<Uuid>,
        forward_of: Option<Uuid>,
    ) -> Result<(), RoomError> {
        let role = self.membership.authorize(user.id)?;
        delivery::validate_post(self.room.kind, role, kind, &content)?;

        let seq = self.next_seq;
        let mut msg = delivery::build_message(self.room.id, seq, &user, kind, content, reply_to, forward_of);
        // Durable first: the seq only advances once the append landed, so
        // accepted history never has holes.
        self.store.append_message(&msg).await?;
        self.next_seq += 1;
        info!(room_id = %self.room.id, seq, sender_id = %user.id, "message accepted");

        let recipients = self.membership.recipient_count(msg.sender_id);
        delivery::decorate(&mut msg, self.room.kind, recipients);
        let event = ServerEvent::NewMessage {
            room_id: self.room.id,
            message: msg.clone(),
        };
        let now = now_ms();
        let mut stamped = false;
        for member in self.membership.user_ids() {
            let accepted = self.registry.fan_out(member, &event);
            if member != msg.sender_id && accepted > 0 {
                stamped |= delivery::mark_delivered(&mut msg, member, now);
            }
        }
        if stamped {
            self.dirty.insert(msg.id);
            let recipients = self.membership.recipient_count(msg.sender_id);
            delivery::decorate(&mut msg, self.room.kind, recipients);
            self.registry.fan_out(msg.sender_id, &receipts_event(&msg));
        }
        self.window.push_back(msg);
        self.trim_window();
        Ok(())
    }

    async fn handle_edit(
        &mut self,
        user_id: Uuid,
        message_id: Uuid,
        content: String,
        kind: Option<MessageKind>,
    ) -> Result<(), RoomError> {
        let role = self.membership.authorize(user_id)?;
        let current = self.find_message(message_id).await?;
        if current.sender_id != user_id {
            return Err(RoomError::Forbidden("only the sender can edit a message"));
        }
        delivery::validate_post(self.room.kind, role, kind.unwrap_or(current.kind), &content)?;

        let edited_at = now_ms();
        let applied = self
            .store
            .apply_edit(self.room.id, message_id, &content, kind, edited_at)
            .await?;
        if !applied {
            return Err(RoomError::MessageNotFound(message_id));
        }

        let mut updated = current;
        updated.content = content;
        if let Some(k) = kind {
            updated.kind = k;
        }
        updated.edited_at = Some(edited_at);
        if let Some(i) = self.window_index(message_id) {
            self.window[i] = updated.clone();
        }
        let recipients = self.membership.recipient_count(updated.sender_id);
        delivery::decorate(&mut updated, self.room.kind, recipients);
        let event = ServerEvent::MessageEdited {
            room_id: self.room.id,
            message: updated,
        };
        self.fan_members(&event);
        Ok(())
    }

    async fn handle_delete(&mut self, user_id: Uuid, message_id: Uuid) -> Result<(), RoomError> {
        self.membership.authorize(user_id)?;
        let current = self.find_message(message_id).await?;
        if current.sender_id != user_id {
            return Err(RoomError::Forbidden("only the sender can delete a message"));
        }
        let removed = self.store.delete_message(self.room.id, message_id).await?;
        if !removed {
            return Err(RoomError::MessageNotFound(message_id));
        }
        if let Some(i) = self.window_index(message_id) {
            self.window.remove(i);
        }
        self.dirty.remove(&message_id);
        info!(room_id = %self.room.id, %message_id, "message deleted");
        self.fan_members(&ServerEvent::MessageDeleted {
            room_id: self.room.id,
            message_id,
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // RECEIPTS
    // -------------------------------------------------------------------------

    async fn handle_mark_receipt(&mut self, user_id: Uuid, message_id: Uuid, read: bool) -> Result<(), RoomError> {
        self.membership.authorize(user_id)?;
        let now = now_ms();

        if let Some(i) = self.window_index(message_id) {
            let changed = {
                let msg = &mut self.window[i];
                if read {
                    delivery::mark_read(msg, user_id, now)
                } else {
                    delivery::mark_delivered(msg, user_id, now)
                }
            };
            if changed {
                self.dirty.insert(message_id);
                self.announce_receipts(i, user_id);
            }
            return Ok(());
        }

        // Out of the live window: read-modify-write against the store.
        let mut msg = self
            .store
            .fetch_message(self.room.id, message_id)
            .await?
            .ok_or(RoomError::MessageNotFound(message_id))?;
        let changed = if read {
            delivery::mark_read(&mut msg, user_id, now)
        } else {
            delivery::mark_delivered(&mut msg, user_id, now)
        };
        if changed {
            let delivered: Vec<(Uuid, i64)> = msg.delivered_to.get(&user_id).map(|at| (user_id, *at)).into_iter().collect();
            let read_pairs: Vec<(Uuid, i64)> = msg.read_by.get(&user_id).map(|at| (user_id, *at)).into_iter().collect();
            self.store
                .merge_receipts(self.room.id, message_id, &delivered, &read_pairs)
                .await?;
            let recipients = self.membership.recipient_count(msg.sender_id);
            delivery::decorate(&mut msg, self.room.kind, recipients);
            if msg.sender_id != user_id {
                self.registry.fan_out(msg.sender_id, &receipts_event(&msg));
            }
        }
        Ok(())
    }

    async fn handle_fetch_receipts(&mut self, user_id: Uuid, message_id: Uuid) -> Result<ServerEvent, RoomError> {
        self.membership.authorize(user_id)?;
        let mut msg = self.find_message(message_id).await?;
        let recipients = self.membership.recipient_count(msg.sender_id);
        delivery::decorate(&mut msg, self.room.kind, recipients);
        Ok(receipts_event(&msg))
    }

    /// Push the current receipt state of `window[i]` to its sender.
    fn announce_receipts(&self, i: usize, actor_user: Uuid) {
        let mut snapshot = self.window[i].clone();
        let recipients = self.membership.recipient_count(snapshot.sender_id);
        delivery::decorate(&mut snapshot, self.room.kind, recipients);
        if snapshot.sender_id != actor_user {
            self.registry.fan_out(snapshot.sender_id, &receipts_event(&snapshot));
        }
    }

    async fn flush_receipts(&mut self) {
        if self.dirty.is_empty() {
            return;
        }
        let ids: Vec<Uuid> = self.dirty.iter().copied().collect();
        for id in ids {
            let Some(i) = self.window_index(id) else {
                self.dirty.remove(&id);
                continue;
            };
            let delivered: Vec<(Uuid, i64)> = self.window[i].delivered_to.iter().map(|(u, at)| (*u, *at)).collect();
            let read: Vec<(Uuid, i64)> = self.window[i].read_by.iter().map(|(u, at)| (*u, *at)).collect();
            match self.store.merge_receipts(self.room.id, id, &delivered, &read).await {
                Ok(()) => {
                    // Only clear on success; a failed flush retries next tick.
                    self.dirty.remove(&id);
                }
                Err(err) => {
                    warn!(room_id = %self.room.id, message_id = %id, error = %err, "receipt flush failed");
                }
            }
        }
        self.trim_window();
    }

    // -------------------------------------------------------------------------
    // TYPING AND PRESENCE
    // -------------------------------------------------------------------------

    fn handle_typing(&mut self, user_id: Uuid, active: bool) -> Result<(), RoomError> {
        self.membership.authorize(user_id)?;
        let Some(name) = self.membership.name_of(user_id) else {
            return Ok(());
        };
        let user_name = name.to_string();
        let now = Instant::now();
        let announce = if active {
            self.typing.start_at(user_id, now).then(|| ServerEvent::UserTyping {
                room_id: self.room.id,
                user_id,
                user_name,
            })
        } else {
            self.typing.stop_at(user_id, now).then(|| ServerEvent::UserStoppedTyping {
                room_id: self.room.id,
                user_id,
                user_name,
            })
        };
        if let Some(event) = announce {
            self.fan_sessions_except(user_id, &event);
        }
        Ok(())
    }

    fn expire_typing(&mut self) {
        for user_id in self.typing.expire_due(Instant::now()) {
            debug!(room_id = %self.room.id, %user_id, "typing expired");
            let event = ServerEvent::UserStoppedTyping {
                room_id: self.room.id,
                user_id,
                user_name: self.membership.name_of(user_id).unwrap_or_default().to_string(),
            };
            self.fan_sessions_except(user_id, &event);
        }
    }

    fn handle_presence(&mut self, user_id: Uuid, online: bool) {
        if !self.membership.contains(user_id) {
            return;
        }
        let event = if online {
            ServerEvent::UserOnline { user_id }
        } else {
            ServerEvent::UserOffline { user_id }
        };
        self.fan_sessions_except(user_id, &event);
    }

    // -------------------------------------------------------------------------
    // MEMBERSHIP AND PURGE
    // -------------------------------------------------------------------------

    async fn handle_refresh_membership(&mut self) {
        match self.store.fetch_members(self.room.id).await {
            Ok(rows) => {
                self.membership = RoomMembership::from_rows(rows);
                let doomed: Vec<Uuid> = self
                    .sessions
                    .iter()
                    .filter(|(_, s)| !self.membership.contains(s.user_id))
                    .map(|(conn_id, _)| *conn_id)
                    .collect();
                for conn_id in doomed {
                    let Some(session) = self.sessions.remove(&conn_id) else {
                        continue;
                    };
                    info!(room_id = %self.room.id, user_id = %session.user_id, "session revoked by membership change");
                    let _ = session.tx.try_send(ServerEvent::RoomLeft { room_id: self.room.id });
                    if self.typing.forget(session.user_id) {
                        let event = ServerEvent::UserStoppedTyping {
                            room_id: self.room.id,
                            user_id: session.user_id,
                            user_name: String::new(),
                        };
                        self.fan_sessions_except(session.user_id, &event);
                    }
                }
            }
            Err(err) => {
                // Stale cache beats no cache; the next refresh will retry.
                warn!(room_id = %self.room.id, error = %err, "membership refresh failed, keeping cached view");
            }
        }
    }

    async fn handle_purge(&mut self) -> Result<u64, RoomError> {
        let purged = self.store.purge_room(self.room.id).await?;
        self.window.clear();
        self.dirty.clear();
        info!(room_id = %self.room.id, purged, "room history purged");
        self.fan_members(&ServerEvent::RoomPurged { room_id: self.room.id });
        Ok(purged)
    }

    // -------------------------------------------------------------------------
    // HELPERS
    // -------------------------------------------------------------------------

    fn window_index(&self, message_id: Uuid) -> Option<usize> {
        self.window.iter().position(|m| m.id == message_id)
    }

    /// Window copy if live, store copy otherwise.
    async fn find_message(&self, message_id: Uuid) -> Result<Message, RoomError> {
        if let Some(i) = self.window_index(message_id) {
            return Ok(self.window[i].clone());
        }
        self.store
            .fetch_message(self.room.id, message_id)
            .await?
            .ok_or(RoomError::MessageNotFound(message_id))
    }

    fn trim_window(&mut self) {
        while self.window.len() > LIVE_WINDOW {
            let Some(front) = self.window.front() else {
                break;
            };
            // Never drop unflushed stamps; the flush tick unblocks this.
            if self.dirty.contains(&front.id) {
                break;
            }
            self.window.pop_front();
        }
    }

    /// Fan to every member's registered connections, on every device.
    fn fan_members(&self, event: &ServerEvent) {
        for member in self.membership.user_ids() {
            self.registry.fan_out(member, event);
        }
    }

    /// Fan to sessions currently attached to this room, skipping the
    /// originating user's own sessions.
    fn fan_sessions_except(&self, except_user: Uuid, event: &ServerEvent) {
        for session in self.sessions.values() {
            if session.user_id == except_user {
                continue;
            }
            let _ = session.tx.try_send(event.clone());
        }
    }
}

// =============================================================================
// DIRECTORY
// =============================================================================

/// Owner of all live room actors. Spawns lazily on join, routes commands,
/// and evicts actors once their last session leaves.
#[derive(Clone)]
pub struct RoomDirectory {
    rooms: Arc<RwLock<HashMap<Uuid, mpsc::Sender<RoomCommand>>>>,
    store: Arc<dyn ChatStore>,
    registry: ConnectionRegistry,
    presence: PresenceView,
    config: RoomConfig,
}

impl RoomDirectory {
    #[must_use]
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: ConnectionRegistry,
        presence: PresenceView,
        config: RoomConfig,
    ) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            store,
            registry,
            presence,
            config,
        }
    }

    /// Attach a connection to a room, spawning the actor when needed. A
    /// join racing an eviction retries against a fresh actor.
    pub async fn join(
        &self,
        room_id: Uuid,
        conn_id: Uuid,
        user: &SessionUser,
        last_seen_seq: Option<i64>,
        tx: &mpsc::Sender<ServerEvent>,
    ) -> Result<JoinSnapshot, RoomError> {
        for _ in 0..3 {
            let handle = self.ensure_room(room_id).await?;
            let (reply_tx, reply_rx) = oneshot::channel();
            let cmd = RoomCommand::Join {
                conn_id,
                user: user.clone(),
                last_seen_seq,
                tx: tx.clone(),
                reply: reply_tx,
            };
            if handle.send(cmd).await.is_err() {
                self.remove_if_dead(room_id, &handle).await;
                continue;
            }
            match reply_rx.await {
                Ok(result) => return result,
                Err(_) => {
                    self.remove_if_dead(room_id, &handle).await;
                }
            }
        }
        Err(RoomError::StoreUnavailable("room is restarting, retry".into()))
    }

    pub async fn leave(&self, room_id: Uuid, conn_id: Uuid) {
        let Some(handle) = self.live(room_id).await else {
            return;
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if handle
            .send(RoomCommand::Leave {
                conn_id,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return;
        }
        if matches!(reply_rx.await, Ok(0)) {
            self.try_evict(room_id).await;
        }
    }

    pub async fn post_message(
        &self,
        room_id: Uuid,
        user: &SessionUser,
        kind: MessageKind,
        content: String,
        reply_to: Option<Uuid>,
        forward_of: Option<Uuid>,
    ) -> Result<(), RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(
            room_id,
            RoomCommand::Post {
                user: user.clone(),
                kind,
                content,
                reply_to,
                forward_of,
                reply: reply_tx,
            },
            reply_rx,
        )
        .await?
    }

    pub async fn edit_message(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
        content: String,
        kind: Option<MessageKind>,
    ) -> Result<(), RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(
            room_id,
            RoomCommand::Edit {
                user_id,
                message_id,
                content,
                kind,
                reply: reply_tx,
            },
            reply_rx,
        )
        .await?
    }

    pub async fn delete_message(&self, room_id: Uuid, user_id: Uuid, message_id: Uuid) -> Result<(), RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(
            room_id,
            RoomCommand::Delete {
                user_id,
                message_id,
                reply: reply_tx,
            },
            reply_rx,
        )
        .await?
    }

    pub async fn set_typing(&self, room_id: Uuid, user_id: Uuid, active: bool) -> Result<(), RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(
            room_id,
            RoomCommand::Typing {
                user_id,
                active,
                reply: reply_tx,
            },
            reply_rx,
        )
        .await?
    }

    pub async fn mark_receipt(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
        read: bool,
    ) -> Result<(), RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(
            room_id,
            RoomCommand::MarkReceipt {
                user_id,
                message_id,
                read,
                reply: reply_tx,
            },
            reply_rx,
        )
        .await?
    }

    pub async fn fetch_receipts(&self, room_id: Uuid, user_id: Uuid, message_id: Uuid) -> Result<ServerEvent, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(
            room_id,
            RoomCommand::FetchReceipts {
                user_id,
                message_id,
                reply: reply_tx,
            },
            reply_rx,
        )
        .await?
    }

    /// Purge the room's history. Routed through the actor when the room is
    /// live so its window and watchers stay consistent; straight to the
    /// store otherwise. The caller is responsible for the admin check.
    pub async fn purge(&self, room_id: Uuid) -> Result<u64, RoomError> {
        if self.live(room_id).await.is_some() {
            let (reply_tx, reply_rx) = oneshot::channel();
            return self.command(room_id, RoomCommand::Purge { reply: reply_tx }, reply_rx).await?;
        }
        Ok(self.store.purge_room(room_id).await?)
    }

    /// Tell a live actor its membership rows changed. Evicts the actor if
    /// the change revoked its last attached session.
    pub async fn invalidate_members(&self, room_id: Uuid) {
        let Some(handle) = self.live(room_id).await else {
            return;
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if handle
            .send(RoomCommand::RefreshMembership { reply: reply_tx })
            .await
            .is_err()
        {
            return;
        }
        if matches!(reply_rx.await, Ok(0)) {
            self.try_evict(room_id).await;
        }
    }

    /// Best-effort presence fan-in to every live room.
    pub async fn notify_presence(&self, user_id: Uuid, online: bool) {
        let handles: Vec<mpsc::Sender<RoomCommand>> = self.rooms.read().await.values().cloned().collect();
        for handle in handles {
            let _ = handle.try_send(RoomCommand::PresenceChanged { user_id, online });
        }
    }

    /// Number of live room actors.
    pub async fn live_rooms(&self) -> usize {
        self.rooms.read().await.len()
    }

    // -------------------------------------------------------------------------
    // INTERNALS
    // -------------------------------------------------------------------------

    async fn command<T>(
        &self,
        room_id: Uuid,
        cmd: RoomCommand,
        reply_rx: oneshot::Receiver<Result<T, RoomError>>,
    ) -> Result<Result<T, RoomError>, RoomError> {
        let Some(handle) = self.live(room_id).await else {
            return Err(RoomError::NotJoined(room_id));
        };
        if handle.send(cmd).await.is_err() {
            self.remove_if_dead(room_id, &handle).await;
            return Err(RoomError::NotJoined(room_id));
        }
        reply_rx.await.map_err(|_| RoomError::NotJoined(room_id))
    }

    async fn live(&self, room_id: Uuid) -> Option<mpsc::Sender<RoomCommand>> {
        self.rooms.read().await.get(&room_id).cloned()
    }

    /// Get or spawn the actor for `room_id`. Hydration runs before the
    /// write lock is taken; the loser of a spawn race drops its snapshot.
    async fn ensure_room(&self, room_id: Uuid) -> Result<mpsc::Sender<RoomCommand>, RoomError> {
        if let Some(handle) = self.live(room_id).await {
            return Ok(handle);
        }

        let record = self
            .store
            .fetch_room(room_id)
            .await?
            .ok_or(RoomError::RoomNotFound(room_id))?;
        let members = self.store.fetch_members(room_id).await?;
        let max_seq = self.store.max_seq(room_id).await?;

        let mut rooms = self.rooms.write().await;
        if let Some(handle) = rooms.get(&room_id) {
            return Ok(handle.clone());
        }
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let actor = RoomActor {
            room: record.to_info(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            presence: self.presence.clone(),
            config: self.config,
            membership: RoomMembership::from_rows(members),
            sessions: HashMap::new(),
            next_seq: max_seq + 1,
            window: VecDeque::new(),
            dirty: HashSet::new(),
            typing: TypingSet::with_expiry(self.config.typing_expiry),
        };
        tokio::spawn(actor.run(rx));
        rooms.insert(room_id, tx.clone());
        info!(%room_id, kind = record.kind.as_str(), "room actor spawned");
        Ok(tx)
    }

    async fn try_evict(&self, room_id: Uuid) {
        let Some(handle) = self.live(room_id).await else {
            return;
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if handle.send(RoomCommand::Shutdown { reply: reply_tx }).await.is_err() {
            self.remove_if_dead(room_id, &handle).await;
            return;
        }
        if matches!(reply_rx.await, Ok(true)) {
            self.remove_if_dead(room_id, &handle).await;
            debug!(%room_id, "room actor evicted");
        }
    }

    /// Unmap `room_id` only while it still points at `dead`, so a freshly
    /// respawned actor is never removed by a stale eviction.
    async fn remove_if_dead(&self, room_id: Uuid, dead: &mpsc::Sender<RoomCommand>) {
        let mut rooms = self.rooms.write().await;
        if let Some(current) = rooms.get(&room_id) {
            if current.same_channel(dead) {
                rooms.remove(&room_id);
            }
        }
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
