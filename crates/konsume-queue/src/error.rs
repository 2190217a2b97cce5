use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connect(String),

    #[error("consume error: {0}")]
    Consume(String),

    #[error("close error: {0}")]
    Close(String),

    #[error("not connected")]
    NotConnected,

    #[error("configuration error: {0}")]
    Config(String),
}
