pub mod admin_handlers;
pub mod health;
pub mod proxy_handlers;
