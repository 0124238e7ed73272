//! fail2ban control-socket client.
//!
//! The daemon listens on a Unix socket and speaks pickled values framed by
//! a textual end-of-command sentinel. This module layers a typed status
//! client over that wire format.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐  get_all_jails   ┌────────────────────┐
//! │ Metrics scrape │─────────────────▶│  StatusClient      │
//! └────────────────┘                  │  (status.rs)       │
//!                                     └─────────┬──────────┘
//!                                               │ exchange(cmd)
//!                                     ┌─────────▼──────────┐
//!                                     │ ConnectionManager  │
//!                                     │ (connection.rs)    │
//!                                     └─────────┬──────────┘
//!                                               │ send / receive
//!                                     ┌─────────▼──────────┐     ┌──────────┐
//!                                     │ Framed transport   │────▶│ fail2ban │
//!                                     │ + value codec      │◀────│  socket  │
//!                                     └────────────────────┘     └──────────┘
//! ```

pub mod connection;
mod shape;
pub mod status;
pub mod transport;
pub mod value;

pub use connection::{
    Backoff, ConnectError, ConnectionConfig, ConnectionManager, ConnectionState, Dialer,
    RequestError, UnixDialer,
};
pub use status::{ExtractError, Jail, StatusClient};
pub use transport::{SentinelScan, TransportError};
pub use value::{Command, DecodingError, EncodingError, Value};
