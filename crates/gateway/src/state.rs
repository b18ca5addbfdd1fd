//! Shared application state handed to every API handler.

use std::sync::Arc;
use std::time::Duration;

use aw_domain::config::Config;
use aw_engine::EngineRegistry;

use crate::api::inbound::DedupeStore;
use crate::output_tracker::OutputTracker;
use crate::router::Router;
use crate::runtime::bus::Bus;
use crate::runtime::scheduler::Scheduler;
use crate::runtime::store::Store;

const INBOUND_DEDUPE_TTL: Duration = Duration::from_secs(86_400);

/// Everything an API handler needs: the config, the Router it hands
/// inbound requests to, the Bus/OutputTracker pair an SSE-style endpoint
/// subscribes through, and the Scheduler for admin introspection/cancel.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub scheduler: Arc<Scheduler>,
    pub router: Arc<Router>,
    pub bus: Arc<Bus>,
    pub output_tracker: Arc<OutputTracker>,
    pub store: Arc<dyn Store>,
    pub dedupe: Arc<DedupeStore>,
}

impl AppState {
    pub fn new(config: Arc<Config>, engines: Arc<EngineRegistry>, store: Arc<dyn Store>) -> Self {
        let bus = Bus::new();
        let scheduler = Scheduler::new(engines.clone(), store.clone(), bus.clone(), config.clone());
        let router = Arc::new(Router::new(scheduler.clone(), store.clone(), config.clone(), engines));
        let output_tracker = Arc::new(OutputTracker::new(bus.clone(), config.coalescing.clone()));
        let dedupe = DedupeStore::new(INBOUND_DEDUPE_TTL);
        Self { config, scheduler, router, bus, output_tracker, store, dedupe }
    }
}
