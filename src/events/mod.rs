//! 事件模块
//!
//! - `types.rs`: 上传事件类型定义
//! - `bus.rs`: 同步发布/订阅的事件总线
//! - `throttle.rs`: 事件节流相关工具，用于控制进度事件的发布频率

mod bus;
mod throttle;
mod types;

pub use bus::*;
pub use throttle::*;
pub use types::*;
