//! 聊天核心领域模型
//!
//! 消息、回应、处罚记录、异步处理台账与事件信封。

pub mod entities;
pub mod errors;
pub mod events;
pub mod value_objects;

// 重新导出常用类型
pub use entities::*;
pub use errors::*;
pub use events::*;
pub use value_objects::*;
