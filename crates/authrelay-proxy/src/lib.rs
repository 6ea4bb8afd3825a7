//! authrelay: a local HTTP proxy that answers upstream proxy authentication
//! challenges on behalf of its clients.

pub mod cache;
pub mod config;
pub mod connection;
pub mod credential;
pub mod error;
pub mod http;
pub mod listener;
pub mod metrics;
pub mod metrics_server;
pub mod proxy;
pub mod resolver;
pub mod task;

pub use config::Config;
pub use credential::{CredentialInfo, CredentialPersistence, CredentialSource};
pub use error::{Error, Result};
pub use proxy::{Proxy, ProxySettings};
pub use task::StopTimeout;
