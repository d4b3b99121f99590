pub mod chart;
pub mod client;
pub mod pipeline;
pub mod render;
pub mod scheduler;
pub mod series;
pub mod subscription;
pub mod types;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;

pub const KLINE_TOPIC_PREFIX: &str = "/topic/kline";
pub const INITIAL_TOPIC_SUFFIX: &str = "/initial";
pub const SUBSCRIBE_DESTINATION: &str = "/app/kline/subscribe";
pub const UNSUBSCRIBE_DESTINATION: &str = "/app/kline/unsubscribe";
