//! The networked engine against a port nobody listens on

mod common;

use std::time::Duration;

use fe2o3_amqp_blocking::{
    connection::OpenError, engine::fe2o3::Fe2o3Engine, Connection, ConnectionState, Context,
};
use tokio_test::{assert_err, assert_ok};

use common::{assert_idle_eventually, serial};

#[test]
fn refused_connection_fails_the_open() {
    let _serial = serial();
    {
        let connection = assert_ok!(Connection::builder()
            .container_id("fe2o3-refused")
            .port(1)
            .engine(Fe2o3Engine::new())
            .build("127.0.0.1"));
        assert_eq!(connection.state(), ConnectionState::Unstarted);

        let ctx = Context::new().with_timeout(Duration::from_secs(5));
        let err = assert_err!(connection.open(&ctx));
        assert!(matches!(err, OpenError::Remote(_) | OpenError::Wait(_)));
        assert_eq!(connection.state(), ConnectionState::Error);

        assert_ok!(connection.close(&Context::new()));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }
    assert_idle_eventually();
}

#[test]
fn unopened_connection_releases_the_engine() {
    let _serial = serial();
    {
        let connection = assert_ok!(Connection::builder()
            .container_id("fe2o3-unopened")
            .engine(Fe2o3Engine::new())
            .build("localhost"));
        assert_eq!(connection.port(), 5672);
    }
    assert_idle_eventually();
}
