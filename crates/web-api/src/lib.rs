//! Web API 层。
//!
//! 提供 Axum 路由与房间 WebSocket 接入，将请求委托给应用层的聊天、处罚与回应服务。

mod error;
mod routes;
mod state;
mod websocket;

pub use error::{ApiError, ErrorBody};
pub use routes::router;
pub use state::AppState;
pub use websocket::WebSocketConnection;
