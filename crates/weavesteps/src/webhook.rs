use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};
use weavecore::{StepError, StepKind, StepKindTag, ValueExt};
use weaveruntime::{StepExecutor, StepInvocation};

/// Outbound HTTP request step
pub struct WebhookExecutor {
    client: reqwest::Client,
}

impl WebhookExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for WebhookExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for WebhookExecutor {
    fn kind(&self) -> StepKindTag {
        StepKindTag::Webhook
    }

    fn description(&self) -> &str {
        "Send an HTTP request; output carries status, headers and body"
    }

    async fn execute(&self, inv: StepInvocation<'_>) -> Result<Value, StepError> {
        let StepKind::Webhook {
            method,
            headers,
            expect_success,
        } = &inv.step.kind
        else {
            return Err(StepError::execution("webhook executor given a non-webhook step"));
        };

        let url = inv.input("url")?;
        let url = url.as_str().ok_or_else(|| {
            StepError::invalid_input("url", format!("expected a string, got {}", url.kind_name()))
        })?;
        let method = Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| StepError::invalid_input("method", format!("unsupported method '{}'", method)))?;

        tracing::info!(step_id = %inv.step.id, "{} {}", method, url);
        let mut request = self.client.request(method, url);

        for (key, value) in headers {
            request = request.header(key, value);
        }
        // Input headers are resolved per run and win over the declared ones
        if let Some(extra) = inv.inputs.get("headers") {
            let Some(extra) = extra.as_object() else {
                return Err(StepError::invalid_input("headers", "expected an object"));
            };
            for (key, value) in extra {
                request = request.header(key, value.render());
            }
        }

        request = match inv.inputs.get("body") {
            None | Some(Value::Null) => request,
            Some(Value::String(text)) => request.body(text.clone()),
            Some(other) => request.json(other),
        };

        let response = tokio::select! {
            sent = request.send() => sent
                .map_err(|e| StepError::execution(format!("HTTP request failed: {}", e)))?,
            _ = inv.cancel.cancelled() => return Err(StepError::Cancelled),
        };

        let status = response.status();
        let response_headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    Value::String(v.to_str().unwrap_or_default().to_string()),
                )
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| StepError::execution(format!("Failed to read response: {}", e)))?;

        tracing::debug!(step_id = %inv.step.id, status = status.as_u16(), "Response received");
        if *expect_success && !status.is_success() {
            return Err(StepError::execution(format!(
                "{} responded with status {}",
                url, status
            )));
        }

        let mut output = json!({
            "status": status.as_u16(),
            "headers": response_headers,
            "body": body,
        });
        if let Ok(parsed) = serde_json::from_str::<Value>(&body) {
            output["json"] = parsed;
        }
        Ok(output)
    }
}
