pub mod client;
pub mod error;
pub mod logging;
pub mod mock_client;
pub mod stream;

pub use client::{ByteStream, ChatBackend, ChatClient};
pub use error::ApiError;
pub use stream::{decode_stream, StreamDecoder};
