pub mod buffers;
pub mod health;
pub mod webhooks;
