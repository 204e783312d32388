//! pgmux: a connection pooler for the PostgreSQL wire protocol
//!
//! Many short-lived client connections are multiplexed onto a bounded set of
//! reusable backend connections, per `(database, user)` route, in session or
//! transaction pooling mode.
//!
//! The pieces, leaves first:
//! - [`route`]: route identity, the route table and the per-route pools
//! - [`router`]: the single task that owns all pool state, and the attacher
//! - [`relay`]: message framing and steady-state forwarding
//! - [`deploy`]: session parameter synchronization on reused backends
//! - [`cancel`]: query cancellation through locally issued keys
//! - [`session`]: one task per client connection tying it all together

pub mod args;
pub mod backend;
pub mod cancel;
pub mod config;
pub mod console;
pub mod constants;
pub mod deploy;
pub mod error;
pub mod formatting;
pub mod logging;
pub mod network;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod route;
pub mod router;
pub mod runtime;
pub mod session;
pub mod stream;
pub mod types;

pub use config::{
    Config, PoolMode, RouteConfig, StorageConfig, create_default_config, load_config,
    write_default_config,
};
pub use error::{AttachError, BackendError, DeployError, RelayError, RouteError, SessionError};
pub use proxy::Pooler;
pub use router::{Router, RouterHandle};
pub use types::{CancelKey, ClientId, ServerId};
