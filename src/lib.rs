//! NIP-29 communities relay: SQLite storage, WebSocket sessions and the
//! NIP-11 document around the policy layer in `communities-core`.

pub mod api;
pub mod config;
pub mod relay;
pub mod session;
pub mod store;

pub use config::Config;
pub use relay::RelayState;
pub use session::Session;
pub use store::SqliteStore;
