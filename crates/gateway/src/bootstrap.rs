//! Wires the runtime together from a loaded [`Config`].

use std::sync::Arc;

use sb_bus::{EventBus, EventKind};
use sb_domain::config::{Config, StorageBackend};
use sb_domain::error::Result;
use sb_providers::LlmProvider;
use sb_runtime::tools::TaskTool;
use sb_runtime::{
    ActiveSessionRegistry, CancelMap, EventProcessor, ProcessEventOptions, QueryExecutor,
    TaskManager, ToolRegistry,
};
use sb_sessions::{DiskStorage, MemoryStorage, SessionManager, Storage};

use crate::auth;
use crate::state::AppState;

/// Build the full application state: storage, session manager, bus, tool
/// registry, task manager, executor, and the event processor with its
/// `background_task.*` re-entry subscription.
pub fn build_state(config: Arc<Config>, provider: Arc<dyn LlmProvider>) -> Result<AppState> {
    let storage: Arc<dyn Storage> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        StorageBackend::Disk => Arc::new(DiskStorage::new(&config.storage.path)?),
    };

    let sessions = Arc::new(SessionManager::new(storage, config.sessions.clone()));
    let bus = Arc::new(EventBus::new());

    // The task manager and executor reference each other through the tool
    // registry; the invoker slot is filled once the executor exists.
    let tools = Arc::new(ToolRegistry::new());
    let tasks = Arc::new(TaskManager::new(
        sessions.clone(),
        bus.clone(),
        config.tasks.clone(),
    ));
    tools.register(Arc::new(TaskTool::new(tasks.clone())));

    let executor = Arc::new(QueryExecutor::new(
        sessions.clone(),
        bus.clone(),
        provider,
        tools,
        config.runtime.clone(),
    ));
    tasks.set_invoker(executor.clone());

    let active_sessions = Arc::new(ActiveSessionRegistry::new());
    let processor = Arc::new(EventProcessor::new(
        sessions.clone(),
        executor.clone(),
        active_sessions.clone(),
    ));

    // Completion/failure/timeout/stop events re-enter their trigger session.
    let reentry = {
        let processor = processor.clone();
        bus.subscribe(&EventKind::TASK_KINDS, move |event| {
            let processor = processor.clone();
            async move {
                processor
                    .process_event(&event, ProcessEventOptions::default())
                    .await
            }
        })
    };

    let api_token_hash = auth::token_hash_from_env(&config.server.api_token_env);

    Ok(AppState {
        config,
        sessions,
        bus,
        executor,
        tasks,
        processor,
        active_sessions,
        cancel_map: Arc::new(CancelMap::new()),
        reentry_subscription: Arc::new(reentry),
        api_token_hash,
    })
}
