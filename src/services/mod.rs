pub mod ai_prompt_client;
pub mod ephemeral_store;
pub mod rate_limiter;
pub mod whatsapp_adapter;

pub use ai_prompt_client::*;
pub use ephemeral_store::*;
pub use rate_limiter::*;
pub use whatsapp_adapter::*;
