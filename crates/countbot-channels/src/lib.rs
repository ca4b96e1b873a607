pub mod channel;
pub mod dedup;
pub mod dingtalk;
pub mod discord;
pub mod error;
pub mod feishu;
pub mod handler;
pub mod manager;
pub mod qq;
pub mod telegram;
pub mod wechat;

pub use channel::{Channel, InboundCallback, TestConnectionResult};
pub use error::ChannelError;
pub use handler::ChannelMessageHandler;
pub use manager::ChannelSupervisor;
