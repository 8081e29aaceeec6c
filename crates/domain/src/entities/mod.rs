//! 领域实体

pub mod message;
pub mod message_status;
pub mod moderation;
pub mod reaction;
pub mod user;

pub use message::*;
pub use message_status::*;
pub use moderation::*;
pub use reaction::*;
pub use user::*;
