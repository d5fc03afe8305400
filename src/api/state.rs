use std::sync::Arc;

use crate::broadcaster::Broadcaster;
use crate::buffer::WriteBackBuffer;
use crate::config::Config;
use crate::logging::LogBuffer;
use crate::parameters::ParameterService;
use crate::registry::DeviceRegistry;
use crate::scheduler::Scheduler;
use crate::store::ReadingStore;

#[derive(Clone)]
pub struct AppState {
    pub registry: DeviceRegistry,
    pub store: ReadingStore,
    pub buffer: Arc<WriteBackBuffer>,
    pub scheduler: Arc<Scheduler>,
    pub broadcaster: Arc<Broadcaster>,
    pub params: Arc<ParameterService>,
    pub config: Config,
    pub log_buffer: Arc<LogBuffer>,
}
