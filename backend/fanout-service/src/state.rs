use std::sync::Arc;

use crate::queue::FanoutQueue;
use crate::stores::{FeedStore, SocialGraphStore};
use crate::websocket::PushHub;

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub feeds: Arc<dyn FeedStore>,
    pub graph: Arc<dyn SocialGraphStore>,
    pub hub: PushHub,
    pub queue: FanoutQueue,
}
