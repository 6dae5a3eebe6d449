//! Fallback chain for one logical model call.
//!
//! The preprocessing and postprocessing stages pass a provider-derived list
//! of alternates; each is tried in order until one answers.

use tracing::warn;

use crate::gateway::{ChatRequest, ChatResponse, ModelGateway, ProviderError};

/// Try `req.model`, then each entry of `fallback_models`, returning the
/// first successful response together with the model id that produced it.
pub async fn send_with_fallbacks(
    gateway: &dyn ModelGateway,
    req: &ChatRequest,
    fallback_models: &[String],
) -> Result<(ChatResponse, String), ProviderError> {
    let mut attempts = 0usize;
    let mut candidates = Vec::with_capacity(1 + fallback_models.len());
    candidates.push(req.model.clone());
    for m in fallback_models {
        if !candidates.contains(m) {
            candidates.push(m.clone());
        }
    }

    for model in &candidates {
        attempts += 1;
        let mut attempt_req = req.clone();
        attempt_req.model = model.clone();
        match gateway.send(&attempt_req).await {
            Ok(resp) => return Ok((resp, model.clone())),
            Err(e) => {
                warn!(model = %model, error = %e, "model call failed, trying next candidate");
            }
        }
    }

    Err(ProviderError::Exhausted { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::StopReason;
    use crate::scripted::ScriptedGateway;

    #[tokio::test]
    async fn falls_through_to_second_model() {
        let gateway = ScriptedGateway::new();
        gateway.fail_model("a/primary", "down");
        gateway.script_text("b/backup", "answer");

        let req = ChatRequest {
            model: "a/primary".into(),
            max_tokens: 128,
            ..Default::default()
        };
        let (resp, used) = send_with_fallbacks(&gateway, &req, &["b/backup".to_string()])
            .await
            .unwrap();
        assert_eq!(resp.content, "answer");
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
        assert_eq!(used, "b/backup");
    }

    #[tokio::test]
    async fn exhausted_when_all_fail() {
        let gateway = ScriptedGateway::new();
        gateway.fail_model("a/x", "down");
        gateway.fail_model("a/y", "down");

        let req = ChatRequest {
            model: "a/x".into(),
            max_tokens: 128,
            ..Default::default()
        };
        let err = send_with_fallbacks(&gateway, &req, &["a/y".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Exhausted { attempts: 2 }));
    }
}
