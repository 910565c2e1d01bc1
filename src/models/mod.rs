pub mod api_key;
pub mod app_state;
pub mod request_context;
pub mod usage_event;

pub use api_key::ApiKeyRecord;
pub use app_state::AppState;
pub use request_context::RequestContext;
pub use usage_event::UsageEvent;
