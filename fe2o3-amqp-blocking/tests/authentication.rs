//! Claims-based security against the local broker

mod common;

use std::{
    sync::Arc,
    thread,
    time::{Duration, SystemTime},
};

use fe2o3_amqp_blocking::{
    cbs::{CbsError, CbsState, ClaimsBasedSecurity},
    connection::AuthenticationError,
    constants::JWT_TOKEN_TYPE,
    engine::local::LocalEngine,
    sender::SenderOpenError,
    Connection, SessionOptions,
};
use tokio_test::{assert_err, assert_ok};

use common::{ctx, serial, setup_broker, CountingCredential, FailingCredential, PORT};

const HOUR: Duration = Duration::from_secs(60 * 60);

fn open_with_credential(
    engine: &LocalEngine,
    container_id: &str,
    credential: Arc<dyn fe2o3_amqp_blocking::credential::TokenCredential>,
) -> Connection {
    Connection::builder()
        .container_id(container_id)
        .port(PORT)
        .credential(credential)
        .engine(engine.clone())
        .open("localhost", &ctx())
        .unwrap()
}

#[test]
fn opening_a_sender_puts_a_token() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    let credential = CountingCredential::new(HOUR);
    let connection = open_with_credential(&engine, "auth", credential.clone());
    let session = connection
        .create_session(SessionOptions::default())
        .unwrap();
    session.begin(&ctx).unwrap();

    let sender = session.create_message_sender("q", Default::default(), None);
    assert_ok!(sender.open(true, &ctx));

    assert_eq!(credential.calls(), 1);
    let tokens = broker.tokens();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].0, "amqp://localhost/q");
    assert_eq!(tokens[0].1, "token-0-amqp://localhost/q");
    // The CBS exchange does not count as a link on the node
    assert_eq!(broker.link_count(), 1);

    assert_ok!(sender.close(&ctx));
    assert_ok!(session.end(&ctx));
    assert_ok!(connection.close(&ctx));
}

#[test]
fn fresh_tokens_are_cached_per_audience() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    let credential = CountingCredential::new(HOUR);
    let connection = open_with_credential(&engine, "cache", credential.clone());
    let session = connection
        .create_session(SessionOptions::default())
        .unwrap();
    session.begin(&ctx).unwrap();

    let first = assert_ok!(connection.authenticate_audience(&session, "aud-1", &ctx));
    let second = assert_ok!(connection.authenticate_audience(&session, "aud-1", &ctx));
    assert_eq!(first.token, second.token);
    assert_eq!(credential.calls(), 1);
    assert_eq!(broker.tokens().len(), 1);

    assert_ok!(connection.authenticate_audience(&session, "aud-2", &ctx));
    assert_eq!(credential.calls(), 2);
    assert_eq!(broker.tokens().len(), 2);

    assert_ok!(session.end(&ctx));
    assert_ok!(connection.close(&ctx));
}

#[test]
fn tokens_close_to_expiry_are_refreshed() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    let credential = CountingCredential::new(Duration::from_secs(60));
    let connection = open_with_credential(&engine, "refresh", credential.clone());
    let session = connection
        .create_session(SessionOptions::default())
        .unwrap();
    session.begin(&ctx).unwrap();

    assert_ok!(connection.authenticate_audience(&session, "aud", &ctx));
    assert_ok!(connection.authenticate_audience(&session, "aud", &ctx));
    assert_eq!(credential.calls(), 2);
    assert_eq!(broker.tokens().len(), 2);

    assert_ok!(session.end(&ctx));
    assert_ok!(connection.close(&ctx));
}

#[test]
fn refused_token_fails_the_open() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    broker.reject_tokens(true);
    let connection = open_with_credential(&engine, "refused", CountingCredential::new(HOUR));
    let session = connection
        .create_session(SessionOptions::default())
        .unwrap();
    session.begin(&ctx).unwrap();

    let sender = session.create_message_sender("q", Default::default(), None);
    let err = assert_err!(sender.open(true, &ctx));
    match err {
        SenderOpenError::Authentication(AuthenticationError::Cbs(err)) => match *err {
            CbsError::Status { code, .. } => assert_eq!(code, 401),
            err => panic!("unexpected error {:?}", err),
        },
        err => panic!("unexpected error {:?}", err),
    }
    assert_eq!(broker.link_count(), 0);

    assert_ok!(session.end(&ctx));
    assert_ok!(connection.close(&ctx));
}

#[test]
fn credential_failure_is_propagated() {
    let _serial = serial();
    let (engine, _broker) = setup_broker();
    let ctx = ctx();
    let connection = open_with_credential(&engine, "failing", Arc::new(FailingCredential));
    let session = connection
        .create_session(SessionOptions::default())
        .unwrap();
    session.begin(&ctx).unwrap();

    let receiver = session.create_message_receiver("inbox", Default::default(), None);
    let err = assert_err!(receiver.open(true, &ctx));
    assert!(matches!(
        err,
        fe2o3_amqp_blocking::receiver::ReceiverOpenError::Authentication(
            AuthenticationError::Credential(_)
        )
    ));

    assert_ok!(session.end(&ctx));
    assert_ok!(connection.close(&ctx));
}

#[test]
fn authenticating_without_credential_fails() {
    let _serial = serial();
    let (engine, _broker) = setup_broker();
    let ctx = ctx();
    let connection = common::open_connection(&engine, "no-credential");
    let session = connection
        .create_session(SessionOptions::default())
        .unwrap();
    session.begin(&ctx).unwrap();

    let err = assert_err!(connection.authenticate_audience(&session, "aud", &ctx));
    assert!(matches!(err, AuthenticationError::CredentialNotFound));

    assert_ok!(session.end(&ctx));
    assert_ok!(connection.close(&ctx));
}

#[test]
fn authentication_can_be_skipped_per_sender() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    let credential = CountingCredential::new(HOUR);
    let connection = open_with_credential(&engine, "skip", credential.clone());
    let session = connection
        .create_session(SessionOptions::default())
        .unwrap();
    session.begin(&ctx).unwrap();

    let sender = session.create_message_sender(
        "q",
        fe2o3_amqp_blocking::MessageSenderOptions::default().authenticate(false),
        None,
    );
    assert_ok!(sender.open(true, &ctx));
    assert_eq!(credential.calls(), 0);
    assert!(broker.tokens().is_empty());

    assert_ok!(sender.close(&ctx));
    assert_ok!(session.end(&ctx));
    assert_ok!(connection.close(&ctx));
}

#[test]
fn put_token_through_the_client() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    let connection = common::open_connection(&engine, "cbs-client");
    let session = connection
        .create_session(SessionOptions::default())
        .unwrap();
    session.begin(&ctx).unwrap();

    let cbs = ClaimsBasedSecurity::new(&session);
    assert_eq!(cbs.state(), CbsState::Idle);
    assert_ok!(cbs.open(&ctx));
    assert_eq!(cbs.state(), CbsState::Open);
    for i in 0..2 {
        assert_ok!(cbs.put_token(
            JWT_TOKEN_TYPE,
            "amqp://localhost/q",
            &format!("token-{}", i),
            SystemTime::now() + HOUR,
            &ctx,
        ));
    }
    assert_ok!(cbs.close(&ctx));
    assert_eq!(cbs.state(), CbsState::Closed);

    let tokens = broker.tokens();
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[1].1, "token-1");
    assert_eq!(broker.link_count(), 0);

    assert_ok!(session.end(&ctx));
    assert_ok!(connection.close(&ctx));
}

#[test]
fn different_audiences_authenticate_concurrently() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let credential = CountingCredential::new(HOUR);
    let connection = open_with_credential(&engine, "concurrent", credential.clone());

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let connection = connection.clone();
            thread::spawn(move || {
                let ctx = ctx();
                let session = connection
                    .create_session(SessionOptions::default())
                    .unwrap();
                session.begin(&ctx).unwrap();
                let audience = format!("aud-{}", i);
                connection
                    .authenticate_audience(&session, &audience, &ctx)
                    .unwrap();
                session.end(&ctx).unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(credential.calls(), 4);
    assert_eq!(broker.tokens().len(), 4);
    assert_ok!(connection.close(&ctx()));
}
