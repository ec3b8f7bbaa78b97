// Transport layer: REST calls, the WebSocket push channel and its reconnecting supervisor.

pub mod api;
pub mod backoff;
pub mod config;
pub mod http;
pub mod push;
pub mod transport;
pub mod ws;

mod error;

pub use api::{ChatApi, ProgressFn, UploadRequest};
pub use backoff::Backoff;
pub use config::TransportConfig;
pub use error::{NetError, Result};
pub use http::HttpApi;
pub use push::{PushConnector, PushSession};
pub use transport::{spawn_transport, ResyncOutcome, TransportCommand, TransportNotification};
pub use ws::WsConnector;
