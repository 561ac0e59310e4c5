pub mod api;
pub mod ws;

use std::sync::Arc;

use crate::config::Config;
use crate::rate_limit::ChatRateLimiter;
use crate::rooms::RoomRegistry;

pub use api::api_routes;
pub use ws::ws_handler;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub rate_limiter: ChatRateLimiter,
    pub config: Arc<Config>,
}
