use async_trait::async_trait;
use std::sync::Arc;
use weavecore::{StepError, StepKindTag, Value, ValueExt};
use weaveruntime::{DeliveryStatus, Notifier, NotifyError, StepExecutor, StepInvocation};

/// Hands a rendered message to the configured notifier
pub struct EmailExecutor {
    notifier: Arc<dyn Notifier>,
}

impl EmailExecutor {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

fn text_input(inv: &StepInvocation<'_>, name: &str) -> Result<String, StepError> {
    match inv.input(name)? {
        Value::Null => Err(StepError::invalid_input(name, "must not be null")),
        value => Ok(value.render()),
    }
}

#[async_trait]
impl StepExecutor for EmailExecutor {
    fn kind(&self) -> StepKindTag {
        StepKindTag::Email
    }

    fn description(&self) -> &str {
        "Send a message to a recipient through the notifier"
    }

    async fn execute(&self, inv: StepInvocation<'_>) -> Result<Value, StepError> {
        let to = text_input(&inv, "to")?;
        if to.trim().is_empty() {
            return Err(StepError::invalid_input("to", "recipient is empty"));
        }
        let subject = text_input(&inv, "subject")?;
        let body = text_input(&inv, "body")?;

        let status = self
            .notifier
            .send(&to, &subject, &body)
            .await
            .map_err(|e| StepError::execution(e.to_string()))?;
        if !status.delivered {
            return Err(StepError::execution(format!("message to {} was not delivered", to)));
        }

        serde_json::to_value(&status).map_err(|e| StepError::execution(e.to_string()))
    }
}

/// Notifier that only logs the message; handy for local runs
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<DeliveryStatus, NotifyError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(%recipient, %message_id, body_len = body.len(), "Email: {}", subject);
        Ok(DeliveryStatus {
            delivered: true,
            message_id: Some(message_id),
            recipient: recipient.to_string(),
        })
    }
}
