#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant, SystemTime},
};

use fe2o3_amqp_blocking::{
    credential::{AccessToken, CredentialError, TokenCredential, TokenRequestContext},
    engine::local::{LocalBroker, LocalEngine},
    Connection, Context, GlobalState,
};
use parking_lot::{const_mutex, Mutex, MutexGuard};

pub const PORT: u16 = 5672;

static SERIAL: Mutex<()> = const_mutex(());

/// Every test in a binary shares the process-wide engine state, so tests that
/// inspect it must not overlap
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock()
}

pub fn ctx() -> Context {
    Context::new().with_timeout(Duration::from_secs(5))
}

pub fn setup_broker() -> (LocalEngine, LocalBroker) {
    let engine = LocalEngine::new();
    let broker = LocalBroker::builder()
        .container_id("test-broker")
        .listen(&engine, PORT)
        .unwrap();
    (engine, broker)
}

pub fn open_connection(engine: &LocalEngine, container_id: &str) -> Connection {
    Connection::builder()
        .container_id(container_id)
        .port(PORT)
        .engine(engine.clone())
        .open("localhost", &ctx())
        .unwrap()
}

/// Polls `condition` until it holds or five seconds pass
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Waits for callbacks still running on the engine to let go of their references,
/// then asserts that nothing leaked
pub fn assert_idle_eventually() {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !GlobalState::instance().is_idle() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    GlobalState::instance().assert_idle();
}

/// Issues tokens valid for `lifetime` and counts how often it was asked
#[derive(Debug)]
pub struct CountingCredential {
    lifetime: Duration,
    calls: AtomicUsize,
}

impl CountingCredential {
    pub fn new(lifetime: Duration) -> Arc<Self> {
        Arc::new(Self {
            lifetime,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TokenCredential for CountingCredential {
    fn get_token(
        &self,
        request: &TokenRequestContext,
        _context: &Context,
    ) -> Result<AccessToken, CredentialError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let scope = request.scopes.first().cloned().unwrap_or_default();
        Ok(AccessToken::new(
            format!("token-{}-{}", call, scope),
            SystemTime::now() + self.lifetime,
        ))
    }
}

/// Always fails
#[derive(Debug)]
pub struct FailingCredential;

impl TokenCredential for FailingCredential {
    fn get_token(
        &self,
        _request: &TokenRequestContext,
        _context: &Context,
    ) -> Result<AccessToken, CredentialError> {
        Err(CredentialError::new("credential unavailable"))
    }
}
