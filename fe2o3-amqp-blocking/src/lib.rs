#![deny(missing_debug_implementations)]

//! A blocking AMQP 1.0 client state machine layered over an asynchronous engine
//!
//! The crate drives the `Connection -> Session -> Link -> MessageSender/MessageReceiver`
//! hierarchy. Every public operation that looks synchronous issues a request to the
//! underlying [`engine::Engine`] and then blocks the calling thread on an
//! [`AsyncOperationQueue`](queue::AsyncOperationQueue) until the engine callback posts
//! the result or the caller's [`Context`] is cancelled.
//!
//! # Engines
//!
//! [`engine::fe2o3::Fe2o3Engine`] speaks AMQP 1.0 over TCP through `fe2o3-amqp`.
//! With the `test-broker` feature, `engine::local` adds an in-process engine and
//! broker that follow the same callback contract.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use fe2o3_amqp_blocking::{
//!     engine::fe2o3::Fe2o3Engine, AmqpMessage, Connection, Context, DeliveryOutcome,
//!     SessionOptions,
//! };
//!
//! let ctx = Context::new().with_timeout(Duration::from_secs(5));
//! let connection = Connection::builder()
//!     .container_id("test")
//!     .engine(Fe2o3Engine::new())
//!     .open("localhost", &ctx)
//!     .unwrap();
//!
//! let session = connection.create_session(SessionOptions::default()).unwrap();
//! session.begin(&ctx).unwrap();
//!
//! let sender = session.create_message_sender("q1", Default::default(), None);
//! sender.open(true, &ctx).unwrap();
//! let outcome = sender.send(AmqpMessage::with_value("hello AMQP"), &ctx).unwrap();
//! assert!(matches!(outcome, DeliveryOutcome::Accepted(_)));
//!
//! sender.close(&ctx).unwrap();
//! session.end(&ctx).unwrap();
//! connection.close(&ctx).unwrap();
//! ```

/// Logs an engine callback at `debug` when tracing is enabled on the connection,
/// at `trace` otherwise
macro_rules! engine_event {
    ($enabled:expr, $($arg:tt)+) => {
        if $enabled {
            tracing::debug!($($arg)+)
        } else {
            tracing::trace!($($arg)+)
        }
    };
}

pub mod cbs;
pub mod connection;
pub mod constants;
pub mod context;
pub mod credential;
pub mod engine;
pub mod error;
pub mod global_state;
pub mod link;
pub mod message;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod terminus;

pub use cbs::{CbsState, ClaimsBasedSecurity};
pub use connection::{Connection, ConnectionOptions, ConnectionState};
pub use context::Context;
pub use error::AmqpError;
pub use global_state::GlobalState;
pub use link::{Link, LinkOptions, LinkState};
pub use message::{AmqpMessage, DeliveryOutcome};
pub use receiver::{MessageReceiver, MessageReceiverOptions};
pub use sender::{MessageSender, MessageSenderOptions};
pub use session::{Session, SessionOptions, SessionState};
pub use terminus::{MessageSource, MessageTarget, TerminusAddress};
