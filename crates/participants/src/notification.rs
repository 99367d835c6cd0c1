//! Notification participant.
//!
//! Sending a notification never fails the saga: a failed send is reported
//! in the reply as `sent: false`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Payload;
use dispatcher::{CommandDispatcher, CommandHandler, HandlerError};
use event_bus::CommandEnvelope;
use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::fields::payload;

pub const SERVICE: &str = "notification";
pub const SEND_NOTIFICATION: &str = "send_notification";
pub const CANCEL_NOTIFICATION: &str = "cancel_notification";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Confirmation,
    Cancellation,
}

/// A notification as recorded by the outbox.
#[derive(Debug, Clone)]
pub struct Notice {
    pub notification_id: String,
    pub kind: NoticeKind,
    pub customer_id: Option<String>,
    pub order_id: Option<String>,
    pub delivered: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Outbox {
    notices: Vec<Notice>,
    fail_sends: bool,
}

#[derive(Clone, Default)]
pub struct NotificationParticipant {
    outbox: Arc<RwLock<Outbox>>,
}

impl NotificationParticipant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, dispatcher: &mut CommandDispatcher) {
        dispatcher.register_command(SEND_NOTIFICATION, SendNotification(self.clone()));
        dispatcher.register_command(CANCEL_NOTIFICATION, CancelNotification(self.clone()));
    }

    /// Simulates a failing delivery channel.
    pub async fn set_fail_sends(&self, fail: bool) {
        self.outbox.write().await.fail_sends = fail;
    }

    /// Returns every recorded notice, oldest first.
    pub async fn notices(&self) -> Vec<Notice> {
        self.outbox.read().await.notices.clone()
    }

    async fn record(&self, kind: NoticeKind, request: &Payload) -> Notice {
        let mut outbox = self.outbox.write().await;
        let field = |name: &str| request.get(name).and_then(Value::as_str).map(str::to_string);
        let notice = Notice {
            notification_id: format!("NTF-{:06}", outbox.notices.len() + 1),
            kind,
            customer_id: field("customer_id"),
            order_id: field("order_id"),
            delivered: kind == NoticeKind::Cancellation || !outbox.fail_sends,
            at: Utc::now(),
        };
        outbox.notices.push(notice.clone());
        notice
    }
}

struct SendNotification(NotificationParticipant);

#[async_trait]
impl CommandHandler for SendNotification {
    async fn handle(&self, request: Payload, _command: &CommandEnvelope) -> Result<Payload, HandlerError> {
        let notice = self.0.record(NoticeKind::Confirmation, &request).await;
        if !notice.delivered {
            tracing::warn!(notification_id = %notice.notification_id, "notification delivery failed");
            return Ok(payload([
                ("notification_id", json!(notice.notification_id)),
                ("sent", json!(false)),
                ("reason", json!("delivery channel unavailable")),
            ]));
        }
        Ok(payload([
            ("notification_id", json!(notice.notification_id)),
            ("sent", json!(true)),
        ]))
    }
}

struct CancelNotification(NotificationParticipant);

#[async_trait]
impl CommandHandler for CancelNotification {
    async fn handle(&self, request: Payload, _command: &CommandEnvelope) -> Result<Payload, HandlerError> {
        let notice = self.0.record(NoticeKind::Cancellation, &request).await;
        Ok(payload([
            ("notification_id", json!(notice.notification_id)),
            ("cancellation_sent", json!(true)),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::CorrelationId;

    fn command() -> CommandEnvelope {
        CommandEnvelope::new("test", Payload::new(), CorrelationId::new(), None, "replies", "test")
    }

    #[tokio::test]
    async fn test_failed_send_is_not_an_error() {
        let notifications = NotificationParticipant::new();
        notifications.set_fail_sends(true).await;

        let result = SendNotification(notifications.clone())
            .handle(Payload::new(), &command())
            .await
            .unwrap();
        assert_eq!(result["sent"], false);
        assert!(!notifications.notices().await[0].delivered);
    }

    #[tokio::test]
    async fn test_cancel_records_cancellation_notice() {
        let notifications = NotificationParticipant::new();
        let mut request = Payload::new();
        request.insert("customer_id".into(), json!("c-7"));

        SendNotification(notifications.clone()).handle(request.clone(), &command()).await.unwrap();
        CancelNotification(notifications.clone()).handle(request, &command()).await.unwrap();

        let notices = notifications.notices().await;
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[1].kind, NoticeKind::Cancellation);
        assert_eq!(notices[1].customer_id.as_deref(), Some("c-7"));
        assert_eq!(notices[1].notification_id, "NTF-000002");
    }
}
