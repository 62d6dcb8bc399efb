mod layer;
mod middleware;
mod routes;

pub use layer::{PresetResponseHeaders, TrackedRoute, conditional_cache_layer, track};
pub use middleware::{RequestContext, log_responses, set_request_context};
pub use routes::{AppState, COMMENTS_TABLE, POSTS_TABLE, build_router};
