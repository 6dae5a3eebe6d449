//! Credit gate: the first preprocessing step.
//!
//! Reads the cached user (warming from storage on miss); with fewer than
//! the minimum credits it attempts one auto top-up when both the flag and
//! a payment method are present, then re-reads before rejecting. Skipped
//! entirely in self-hosted mode.

use std::time::Duration;

use tracing::{info, warn};

use convoy_core::types::{PreprocessingResult, RejectionReason};
use convoy_kv::CachedUser;

use crate::context::PipelineContext;
use crate::instructions::insufficient_credits_message;
use crate::storage::StorageGateway;

const MINIMUM_REQUEST_COST: i64 = 1;
/// Time for the payment to settle before re-reading credits.
const TOPUP_SETTLE_DELAY: Duration = Duration::from_secs(2);

pub enum CreditGate {
    Allowed,
    Rejected(Box<PreprocessingResult>),
}

pub async fn check_credits(ctx: &PipelineContext, task_id: &str, user_id: &str) -> CreditGate {
    if !ctx.config.pipeline.billing_enabled {
        info!(task_id, "billing disabled (self-hosted mode), skipping credit check");
        return CreditGate::Allowed;
    }

    if user_id.is_empty() {
        return rejected(
            RejectionReason::InternalErrorMissingUserId,
            "User identification is missing. Cannot proceed.",
        );
    }

    let Some(user) = load_user(ctx, task_id, user_id).await else {
        return rejected(
            RejectionReason::InternalErrorUserDataNotFound,
            "User information could not be retrieved for credit verification. \
             Please ensure your account is valid.",
        );
    };

    if user.credits >= MINIMUM_REQUEST_COST {
        return CreditGate::Allowed;
    }

    if user.auto_topup_enabled && user.has_payment_method {
        info!(task_id, user_id, "insufficient credits, attempting auto top-up");
        match ctx.storage.trigger_auto_topup(user_id).await {
            Ok(()) => {
                tokio::time::sleep(TOPUP_SETTLE_DELAY).await;
                if let Some(refreshed) = load_user_fresh(ctx, task_id, user_id).await {
                    if refreshed.credits >= MINIMUM_REQUEST_COST {
                        info!(task_id, user_id, credits = refreshed.credits, "auto top-up succeeded");
                        return CreditGate::Allowed;
                    }
                    warn!(task_id, user_id, credits = refreshed.credits, "auto top-up completed but credits still insufficient");
                }
            }
            Err(e) => warn!(task_id, user_id, error = %e, "auto top-up failed"),
        }
    } else if user.auto_topup_enabled {
        warn!(task_id, user_id, "auto top-up enabled but no payment method");
    }

    rejected(
        RejectionReason::InsufficientCredits,
        insufficient_credits_message("en"),
    )
}

fn rejected(reason: RejectionReason, message: &str) -> CreditGate {
    CreditGate::Rejected(Box::new(PreprocessingResult::rejected(reason, message)))
}

async fn load_user(ctx: &PipelineContext, task_id: &str, user_id: &str) -> Option<CachedUser> {
    match ctx.users.get(user_id).await {
        Ok(Some(user)) => return Some(user),
        Ok(None) => {}
        Err(e) => warn!(task_id, user_id, error = %e, "user cache read failed, warming from storage"),
    }
    load_user_fresh(ctx, task_id, user_id).await
}

/// Warm the cache from the storage gateway.
async fn load_user_fresh(
    ctx: &PipelineContext,
    task_id: &str,
    user_id: &str,
) -> Option<CachedUser> {
    match ctx.storage.fetch_user_record(user_id).await {
        Ok(Some(record)) => {
            let cached = CachedUser {
                user_id: record.user_id,
                vault_key_id: record.vault_key_id,
                credits: record.credits,
                auto_topup_enabled: record.auto_topup_enabled,
                has_payment_method: record.has_payment_method,
            };
            if let Err(e) = ctx.users.set(&cached).await {
                warn!(task_id, user_id, error = %e, "failed to cache warmed user record");
            }
            Some(cached)
        }
        Ok(None) => {
            warn!(task_id, user_id, "user not found in storage");
            None
        }
        Err(e) => {
            warn!(task_id, user_id, error = %e, "user record fetch failed");
            None
        }
    }
}
