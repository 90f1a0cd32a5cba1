//! Session lifecycle against the local broker

mod common;

use std::time::Duration;

use fe2o3_amqp_blocking::{
    session::{BeginError, EndError},
    Context, SessionOptions, SessionState,
};
use tokio_test::{assert_err, assert_ok};

use common::{assert_idle_eventually, ctx, eventually, open_connection, serial, setup_broker};

#[test]
fn localhost_session_with_defaults() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();

    let connection = open_connection(&engine, "test");
    let session = connection
        .create_session(SessionOptions::default())
        .unwrap();
    assert_ok!(session.begin(&ctx));

    assert_eq!(session.incoming_window(), 1);
    assert_eq!(session.outgoing_window(), 1);
    assert_eq!(session.handle_max(), u32::MAX);
    assert_eq!(broker.session_count(), 1);

    assert_ok!(session.end(&ctx));
    assert_ok!(connection.close(&ctx));
    assert_eq!(broker.session_count(), 0);
}

#[test]
fn session_options_are_reflected() {
    let _serial = serial();
    let (engine, _broker) = setup_broker();
    let ctx = ctx();

    let connection = open_connection(&engine, "options");
    let options = SessionOptions::default()
        .initial_incoming_window_size(1909119)
        .initial_outgoing_window_size(1909119)
        .maximum_link_count(37);
    let session = connection.create_session(options).unwrap();
    assert_ok!(session.begin(&ctx));

    assert_eq!(session.incoming_window(), 1909119);
    assert_eq!(session.outgoing_window(), 1909119);
    assert_eq!(session.handle_max(), 37);
    assert!(session.remote_incoming_window().is_some());

    assert_ok!(session.end(&ctx));
    assert_ok!(connection.close(&ctx));
}

#[test]
fn ending_twice_fails() {
    let _serial = serial();
    let (engine, _broker) = setup_broker();
    let ctx = ctx();

    let connection = open_connection(&engine, "end-twice");
    let session = connection
        .create_session(SessionOptions::default())
        .unwrap();
    assert_ok!(session.begin(&ctx));
    assert_ok!(session.end(&ctx));
    assert_eq!(session.state(), SessionState::Ended);

    let err = assert_err!(session.end(&ctx));
    assert!(matches!(err, EndError::AlreadyEnded));
    assert_ok!(connection.close(&ctx));
}

#[test]
fn ending_unbegun_session_fails() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();

    let connection = open_connection(&engine, "unbegun");
    let session = connection
        .create_session(SessionOptions::default())
        .unwrap();
    let err = assert_err!(session.end(&ctx));
    assert!(matches!(err, EndError::NotBegun));
    assert_eq!(broker.end_errors().len(), 0);
    assert_ok!(connection.close(&ctx));
}

#[test]
fn beginning_twice_fails() {
    let _serial = serial();
    let (engine, _broker) = setup_broker();
    let ctx = ctx();

    let connection = open_connection(&engine, "begin-twice");
    let session = connection
        .create_session(SessionOptions::default())
        .unwrap();
    assert_ok!(session.begin(&ctx));
    let err = assert_err!(session.begin(&ctx));
    assert!(matches!(err, BeginError::IllegalState(SessionState::Begun)));
    assert_ok!(session.end(&ctx));
    assert_ok!(connection.close(&ctx));
}

#[test]
fn thirty_sessions_leave_the_connection_reusable() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();

    let connection = open_connection(&engine, "thirty");
    for _ in 0..2 {
        let mut sessions = Vec::new();
        for _ in 0..30 {
            let session = connection
                .create_session(SessionOptions::default())
                .unwrap();
            assert_ok!(session.begin(&ctx));
            sessions.push(session);
        }
        assert_eq!(connection.session_count(), 30);
        assert_eq!(broker.session_count(), 30);

        for session in &sessions {
            assert_ok!(session.end(&ctx));
        }
        assert_eq!(broker.session_count(), 0);
        drop(sessions);
        assert!(eventually(|| connection.session_count() == 0));
    }
    assert!(connection.is_open());
    assert_ok!(connection.close(&ctx));
}

#[test]
fn ending_one_session_leaves_siblings_alive() {
    let _serial = serial();
    let (engine, _broker) = setup_broker();
    let ctx = ctx();

    let connection = open_connection(&engine, "siblings");
    let sessions: Vec<_> = (0..4)
        .map(|_| {
            let session = connection
                .create_session(SessionOptions::default())
                .unwrap();
            session.begin(&ctx).unwrap();
            session
        })
        .collect();

    assert_ok!(sessions[1].end(&ctx));
    assert_ok!(sessions[3].end(&ctx));

    for session in [&sessions[0], &sessions[2]] {
        assert_eq!(session.state(), SessionState::Begun);
        let sender = session.create_message_sender("q", Default::default(), None);
        assert_ok!(sender.open(true, &ctx));
        assert_ok!(sender.close(&ctx));
    }

    assert_ok!(sessions[0].end(&ctx));
    assert_ok!(sessions[2].end(&ctx));
    assert_ok!(connection.close(&ctx));
}

#[test]
fn parent_connection_is_reachable() {
    let _serial = serial();
    let (engine, _broker) = setup_broker();
    let ctx = ctx();

    let connection = open_connection(&engine, "parent");
    let session = connection
        .create_session(SessionOptions::default())
        .unwrap();
    assert_eq!(session.connection().container_id(), "parent");
    assert_ok!(session.begin(&ctx));
    assert!(session.is_begun());
    assert_ok!(session.end(&ctx));
    assert_ok!(connection.close(&ctx));
}

#[test]
fn peer_initiated_session_is_accepted() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();

    let connection = open_connection(&engine, "accepting");
    assert!(broker.begin_session("accepting"));

    let session = assert_ok!(connection.accept_session(SessionOptions::default(), &ctx));
    assert_eq!(session.state(), SessionState::Begun);
    assert_eq!(connection.session_count(), 1);

    assert_ok!(session.end(&ctx));
    assert_ok!(connection.close(&ctx));
}

#[test]
fn nothing_leaks_after_everything_is_dropped() {
    let _serial = serial();
    {
        let (engine, _broker) = setup_broker();
        let ctx = ctx();

        let connection = open_connection(&engine, "leak-check");
        let session = connection
            .create_session(SessionOptions::default())
            .unwrap();
        session.begin(&ctx).unwrap();
        let sender = session.create_message_sender("q", Default::default(), None);
        sender.open(true, &ctx).unwrap();
        sender.close(&ctx).unwrap();
        session.end(&ctx).unwrap();
        connection.close(&ctx).unwrap();
    }
    assert_idle_eventually();
}

#[test]
fn dropping_a_begun_session_ends_it() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();

    let connection = open_connection(&engine, "drop-session");
    {
        let session = connection
            .create_session(SessionOptions::default())
            .unwrap();
        session.begin(&ctx).unwrap();
        assert_eq!(broker.session_count(), 1);
    }
    assert!(eventually(|| connection.session_count() == 0));
    assert!(eventually(|| broker.session_count() == 0));
    assert_ok!(connection.close(&ctx));
}

#[test]
fn unresponsive_peer_times_out_the_end() {
    let _serial = serial();
    {
        let (engine, broker) = setup_broker();
        let ctx = ctx();
        let connection = open_connection(&engine, "end-timeout");
        let session = connection
            .create_session(SessionOptions::default())
            .unwrap();
        assert_ok!(session.begin(&ctx));
        broker.set_unresponsive(true);

        let short = Context::new().with_timeout(Duration::from_millis(100));
        let err = assert_err!(session.end(&short));
        match err {
            EndError::Wait(err) => assert!(err.is_cancelled()),
            err => panic!("unexpected error {:?}", err),
        }
        assert_eq!(session.state(), SessionState::Ended);
        assert!(matches!(
            assert_err!(session.end(&ctx)),
            EndError::AlreadyEnded
        ));

        broker.set_unresponsive(false);
        drop(session);
        assert_ok!(connection.close(&ctx));
    }
    assert_idle_eventually();
}
