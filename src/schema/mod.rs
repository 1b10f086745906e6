pub mod contact;
pub mod conversation;
pub mod event;
pub mod flow;
pub mod message;
pub mod organization;
pub mod whatsapp_number;
pub mod window;

pub use contact::*;
pub use conversation::*;
pub use event::*;
pub use flow::*;
pub use message::*;
pub use organization::*;
pub use whatsapp_number::*;
pub use window::*;
