//! Shared pipeline context: every service handle a stage needs, wired once
//! at worker boot and passed explicitly (no global singletons).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use convoy_bus::{chat_stream_channel, BusEvent, ChunkEvent, StreamBus};
use convoy_core::config::ConvoyConfig;
use convoy_kv::{
    ActiveTaskMarkers, CancellationFlags, ChatQueues, DisclaimerLog, EmbedIndex, KvStore,
    UserCache,
};
use convoy_model::ModelGateway;
use convoy_skills::{
    ContentSanitizer, HttpSkillHandler, RateLimiter, SkillExecutor, SkillRegistry, TaskDispatcher,
    TaskEnvelope, TaskHandler, TaskResult,
};

use crate::debug::DebugRecorder;
use crate::instructions::InstructionSet;
use crate::leaderboard::Leaderboard;
use crate::secrets::SecretsGateway;
use crate::storage::StorageGateway;
use crate::token::RunToken;

pub struct PipelineContext {
    pub config: Arc<ConvoyConfig>,
    pub instructions: Arc<InstructionSet>,

    pub store: Arc<dyn KvStore>,
    pub markers: ActiveTaskMarkers,
    pub queues: ChatQueues,
    pub flags: CancellationFlags,
    pub disclaimers: DisclaimerLog,
    pub embeds: EmbedIndex,
    pub users: UserCache,

    pub bus: Arc<StreamBus>,
    pub registry: Arc<SkillRegistry>,
    pub executor: Arc<SkillExecutor>,
    pub dispatcher: Arc<TaskDispatcher>,

    pub model_gateway: Arc<dyn ModelGateway>,
    pub storage: Arc<dyn StorageGateway>,
    pub secrets: Arc<dyn SecretsGateway>,

    pub leaderboard: Option<Leaderboard>,
    pub debug: DebugRecorder,

    /// Live run tokens by task id, so the transport layer can flip the
    /// revoked bit of an in-flight pipeline.
    pub run_tokens: DashMap<String, RunToken>,
}

impl PipelineContext {
    /// Wire the full substrate. The dispatcher's default handler is the
    /// HTTP skill executor; the gateway registers the ask-task handler on
    /// top after construction.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ConvoyConfig>,
        instructions: Arc<InstructionSet>,
        store: Arc<dyn KvStore>,
        bus: Arc<StreamBus>,
        model_gateway: Arc<dyn ModelGateway>,
        storage: Arc<dyn StorageGateway>,
        secrets: Arc<dyn SecretsGateway>,
        leaderboard: Option<Leaderboard>,
    ) -> Arc<Self> {
        let registry = Arc::new(SkillRegistry::from_manifests(&config.apps));
        registry.check_critical_apps(&config.pipeline.critical_apps);

        let flags = CancellationFlags::new(Arc::clone(&store));
        let rate_limiter = RateLimiter::new(Arc::clone(&store), Arc::clone(&config));
        let sanitizer = Arc::new(ContentSanitizer::new(
            Arc::clone(&model_gateway),
            config.pipeline.default_llms.sanitizer_model.clone(),
        ));
        let executor = Arc::new(SkillExecutor::new(
            Arc::clone(&registry),
            flags.clone(),
            rate_limiter,
            sanitizer,
        ));
        let dispatcher = TaskDispatcher::new(Arc::new(HttpSkillHandler::new(Arc::clone(
            &executor,
        ))));
        executor.set_dispatcher(Arc::clone(&dispatcher));
        executor.set_deferral_followup(Arc::new(DeferralFollowupHandler {
            bus: Arc::clone(&bus),
        }));

        let debug = DebugRecorder::new(Arc::clone(&store), Arc::clone(&secrets));

        Arc::new(Self {
            markers: ActiveTaskMarkers::new(Arc::clone(&store)),
            queues: ChatQueues::new(Arc::clone(&store)),
            disclaimers: DisclaimerLog::new(Arc::clone(&store)),
            embeds: EmbedIndex::new(Arc::clone(&store)),
            users: UserCache::new(Arc::clone(&store)),
            flags,
            store,
            config,
            instructions,
            bus,
            registry,
            executor,
            dispatcher,
            model_gateway,
            storage,
            secrets,
            leaderboard,
            debug,
            run_tokens: DashMap::new(),
        })
    }

    /// Flip the revoked bit of a live run. Returns false when the task id
    /// has no active pipeline.
    pub fn revoke_run(&self, task_id: &str) -> bool {
        self.dispatcher.revoke(task_id);
        match self.run_tokens.get(task_id) {
            Some(token) => {
                token.revoke();
                true
            }
            None => false,
        }
    }
}

/// Runs when a rate-limit-deferred skill finally completes: one closing
/// chunk on the chat stream so the client learns its scheduled call is
/// done.
struct DeferralFollowupHandler {
    bus: Arc<StreamBus>,
}

#[async_trait]
impl TaskHandler for DeferralFollowupHandler {
    async fn run(&self, task: &TaskEnvelope) -> TaskResult {
        let Some(chat_id) = task.kwargs.get("_chat_id").and_then(Value::as_str) else {
            // Deferred without chat context: nothing to notify.
            return Ok(Value::Null);
        };
        let user_message_id = task
            .kwargs
            .get("_message_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let failed = task
            .kwargs
            .get("parent_result")
            .map(|r| r.get("error").is_some())
            .unwrap_or(true);

        let content = if failed {
            "A scheduled skill call finished with an error."
        } else {
            "A scheduled skill call has completed; its results are ready."
        };
        self.bus.publish(
            &chat_stream_channel(chat_id),
            BusEvent::AiMessageChunk(ChunkEvent {
                task_id: task.task_id.clone(),
                chat_id: chat_id.to_string(),
                message_id: task.task_id.clone(),
                user_message_id: user_message_id.to_string(),
                full_content_so_far: content.to_string(),
                sequence: 1,
                is_final_chunk: true,
                interrupted_by_soft_limit: false,
                interrupted_by_revocation: false,
                error: failed,
            }),
        );
        Ok(Value::Null)
    }
}
