//! Text chat: messages, reactions, typing, mention notifications.

use std::sync::Arc;

use regex::Regex;
use std::sync::LazyLock;
use uuid::Uuid;

use crate::domain::{ChannelKind, DataStore, User};
use crate::infrastructure::dto::websocket::{
    DeleteMessageData, EditMessageData, MessageCreatePayload, MessageDeletePayload,
    MessageUpdatePayload, NotificationIdData, ReactionData, ReactionPayload, ReplyToPayload,
    SendMessageData, TypingData, TypingStartPayload, UserPayload, envelope,
};
use crate::infrastructure::registry::ConnectionRegistry;

const MAX_MESSAGE_LEN: usize = 4000;
const NOTIFICATION_PREVIEW_LEN: usize = 80;

static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@([a-f0-9-]{36})>").expect("mention regex"));

/// User ids mentioned as `<@uuid>` in a message body, deduplicated in order.
fn parse_mentions(content: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for capture in MENTION_RE.captures_iter(content) {
        let id = capture[1].to_string();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

fn is_valid_emoji(s: &str) -> bool {
    let chars = s.chars().count();
    (1..=10).contains(&chars) && s.len() <= 32
}

pub struct ChatUseCase {
    store: Arc<dyn DataStore>,
    registry: Arc<ConnectionRegistry>,
}

impl ChatUseCase {
    pub fn new(store: Arc<dyn DataStore>, registry: Arc<ConnectionRegistry>) -> Arc<Self> {
        Arc::new(Self { store, registry })
    }

    pub async fn send_message(&self, user: &User, d: SendMessageData) {
        if d.content.is_none() && d.attachment_ids.is_empty() {
            return;
        }
        if d.content.as_ref().is_some_and(|c| c.len() > MAX_MESSAGE_LEN) {
            return;
        }

        let Ok(Some(channel)) = self.store.get_channel(&d.channel_id).await else {
            return;
        };
        if channel.kind != ChannelKind::Text {
            return;
        }

        let message_id = Uuid::new_v4().to_string();
        let message = match self
            .store
            .create_message(
                &message_id,
                &d.channel_id,
                &user.id,
                d.content.as_deref(),
                d.reply_to_id.as_deref(),
            )
            .await
        {
            Ok(message) => message,
            Err(err) => {
                tracing::error!("create message: {err}");
                return;
            }
        };

        let attachments = if d.attachment_ids.is_empty() {
            Vec::new()
        } else {
            match self
                .store
                .link_attachments(&message_id, &d.attachment_ids)
                .await
            {
                Ok(attachments) => attachments,
                Err(err) => {
                    tracing::error!("link attachments: {err}");
                    Vec::new()
                }
            }
        };

        let mentions = match &d.content {
            Some(content) => parse_mentions(content),
            None => Vec::new(),
        };
        for mentioned in &mentions {
            if mentioned == &user.id {
                continue;
            }
            self.notify_mention(user, mentioned, &message.id, &channel.id, &channel.name, &d)
                .await;
        }

        let reply_to = match &message.reply_to_id {
            Some(reply_id) => {
                self.store
                    .get_reply_context(reply_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|rc| ReplyToPayload {
                        id: rc.id,
                        author: UserPayload {
                            id: rc.author_id.unwrap_or_default(),
                            username: rc.author_username,
                            is_admin: false,
                        },
                        content: rc.content,
                        deleted: rc.deleted,
                    })
            }
            None => None,
        };

        self.registry
            .broadcast_all(&envelope(
                "message_create",
                &MessageCreatePayload {
                    id: message.id.clone(),
                    channel_id: message.channel_id.clone(),
                    author: UserPayload::from(user),
                    content: message.content.clone(),
                    reply_to,
                    attachments,
                    mentions,
                    created_at: message.created_at.clone(),
                },
            ))
            .await;
    }

    async fn notify_mention(
        &self,
        author: &User,
        mentioned_id: &str,
        message_id: &str,
        channel_id: &str,
        channel_name: &str,
        d: &SendMessageData,
    ) {
        let preview = d
            .content
            .as_deref()
            .map(|content| {
                let mut preview: String = content.chars().take(NOTIFICATION_PREVIEW_LEN).collect();
                if content.chars().count() > NOTIFICATION_PREVIEW_LEN {
                    preview.push_str("...");
                }
                preview
            })
            .unwrap_or_default();

        let data = serde_json::json!({
            "message_id": message_id,
            "channel_id": channel_id,
            "channel_name": channel_name,
            "author_id": author.id,
            "author_username": author.username,
            "content_preview": preview,
        });

        let notification_id = Uuid::new_v4().to_string();
        match self
            .store
            .create_notification(&notification_id, mentioned_id, "mention", data)
            .await
        {
            Ok(notification) => {
                self.registry
                    .send_to_user(mentioned_id, &envelope("notification_create", &notification))
                    .await;
            }
            Err(err) => tracing::error!("create notification: {err}"),
        }
    }

    pub async fn edit_message(&self, user: &User, d: EditMessageData) {
        if d.content.is_empty() || d.content.len() > MAX_MESSAGE_LEN {
            return;
        }
        let Ok(Some(message)) = self.store.get_message(&d.message_id).await else {
            return;
        };
        if message.deleted_at.is_some() {
            return;
        }
        // only the author may edit
        if message.author_id.as_deref() != Some(user.id.as_str()) {
            return;
        }

        let updated = match self.store.edit_message(&d.message_id, &d.content).await {
            Ok(updated) => updated,
            Err(err) => {
                tracing::error!("edit message: {err}");
                return;
            }
        };
        let Some(edited_at) = updated.edited_at.clone() else {
            return;
        };

        self.registry
            .broadcast_all(&envelope(
                "message_update",
                &MessageUpdatePayload {
                    id: updated.id,
                    channel_id: updated.channel_id,
                    content: d.content,
                    edited_at,
                },
            ))
            .await;
    }

    pub async fn delete_message(&self, user: &User, d: DeleteMessageData) {
        let Ok(Some(message)) = self.store.get_message(&d.message_id).await else {
            return;
        };
        // author or admin
        let is_author = message.author_id.as_deref() == Some(user.id.as_str());
        if !is_author && !user.is_admin {
            return;
        }

        if let Err(err) = self.store.delete_message(&d.message_id).await {
            tracing::error!("delete message: {err}");
            return;
        }

        self.registry
            .broadcast_all(&envelope(
                "message_delete",
                &MessageDeletePayload {
                    id: d.message_id,
                    channel_id: message.channel_id,
                },
            ))
            .await;
    }

    pub async fn add_reaction(&self, user: &User, d: ReactionData) {
        if !is_valid_emoji(&d.emoji) {
            return;
        }
        let Ok(Some(message)) = self.store.get_message(&d.message_id).await else {
            return;
        };
        if message.deleted_at.is_some() {
            return;
        }

        match self
            .store
            .add_reaction(&d.message_id, &user.id, &d.emoji)
            .await
        {
            // already present: idempotent, nothing to announce
            Ok(false) => {}
            Ok(true) => {
                self.registry
                    .broadcast_all(&envelope(
                        "reaction_add",
                        &ReactionPayload {
                            message_id: d.message_id,
                            user_id: user.id.clone(),
                            emoji: d.emoji,
                        },
                    ))
                    .await;
            }
            Err(err) => tracing::error!("add reaction: {err}"),
        }
    }

    pub async fn remove_reaction(&self, user: &User, d: ReactionData) {
        match self
            .store
            .remove_reaction(&d.message_id, &user.id, &d.emoji)
            .await
        {
            // nothing to remove: no-op, not an error
            Ok(false) => {}
            Ok(true) => {
                self.registry
                    .broadcast_all(&envelope(
                        "reaction_remove",
                        &ReactionPayload {
                            message_id: d.message_id,
                            user_id: user.id.clone(),
                            emoji: d.emoji,
                        },
                    ))
                    .await;
            }
            Err(err) => tracing::error!("remove reaction: {err}"),
        }
    }

    pub async fn typing_start(&self, user: &User, d: TypingData) {
        self.registry
            .broadcast_except_user(
                &user.id,
                &envelope(
                    "typing_start",
                    &TypingStartPayload {
                        channel_id: d.channel_id,
                        user_id: user.id.clone(),
                    },
                ),
            )
            .await;
    }

    pub async fn mark_notification_read(&self, user: &User, d: NotificationIdData) {
        if let Err(err) = self.store.mark_notification_read(&d.id, &user.id).await {
            tracing::error!("mark notification read: {err}");
        }
    }

    pub async fn mark_all_notifications_read(&self, user: &User) {
        if let Err(err) = self.store.mark_all_notifications_read(&user.id).await {
            tracing::error!("mark all notifications read: {err}");
        }
    }
}
