//! Links, senders and receivers against the local broker

mod common;

use std::{
    sync::{mpsc, Arc},
    time::Duration,
};

use fe2o3_amqp_blocking::{
    engine::local::{LocalBroker, LocalEngine},
    link::{AttachError, DetachError},
    receiver::{MessageReceiverEvents, MessageReceiverState, ReceiveError},
    sender::{MessageSenderState, SendError, SendStatus, SenderCloseError, SenderOpenError},
    session::AllocLinkError,
    AmqpError, AmqpMessage, Connection, Context, DeliveryOutcome, LinkOptions, LinkState,
    MessageReceiverOptions, MessageSenderOptions, MessageSource, MessageTarget, Session,
    SessionOptions, TerminusAddress,
};
use fe2o3_amqp_types::{
    definitions::{Role, SenderSettleMode},
    messaging::Rejected,
    primitives::SimpleValue,
};
use serde_amqp::value::Value;
use tokio_test::{assert_err, assert_ok};

use common::{
    assert_idle_eventually, ctx, eventually, open_connection, serial, setup_broker, PORT,
};

fn begin_session(connection: &Connection, options: SessionOptions) -> Session {
    let session = connection.create_session(options).unwrap();
    session.begin(&ctx()).unwrap();
    session
}

fn teardown(session: Session, connection: Connection) {
    let ctx = ctx();
    session.end(&ctx).unwrap();
    connection.close(&ctx).unwrap();
}

#[test]
fn link_attach_and_detach() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "link");
    let session = begin_session(&connection, SessionOptions::default());

    let link = session
        .create_link(
            Role::Sender,
            None::<MessageSource>,
            MessageTarget::from("q"),
            LinkOptions::default().name("direct"),
        )
        .unwrap();
    assert_eq!(link.name(), "direct");
    assert_eq!(link.state(), LinkState::Detached);
    assert_eq!(session.link_count(), 1);

    assert_ok!(link.attach(&ctx));
    assert_eq!(link.state(), LinkState::Attached);
    assert_eq!(link.target().map(|t| t.address_str()), Some("q"));
    assert_eq!(broker.link_count(), 1);

    assert_ok!(link.detach(&ctx));
    assert_eq!(link.state(), LinkState::Closed);
    assert_eq!(broker.link_count(), 0);
    assert!(matches!(
        assert_err!(link.attach(&ctx)),
        AttachError::IllegalState(LinkState::Closed)
    ));

    drop(link);
    teardown(session, connection);
}

#[test]
fn link_names_are_unique_per_session() {
    let _serial = serial();
    let (engine, _broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "duplicate");
    let session = begin_session(&connection, SessionOptions::default());

    let options = MessageSenderOptions::default().name("same-name");
    let first = session.create_message_sender("q", options.clone(), None);
    assert_ok!(first.open(true, &ctx));

    let second = session.create_message_sender("q", options, None);
    let err = assert_err!(second.open(true, &ctx));
    assert!(matches!(
        err,
        SenderOpenError::Alloc(AllocLinkError::DuplicatedLinkName)
    ));
    assert_eq!(second.state(), MessageSenderState::Error);

    assert_ok!(first.close(&ctx));
    teardown(session, connection);
}

#[test]
fn handle_max_bounds_live_links() {
    let _serial = serial();
    let (engine, _broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "handle-max");
    let session = begin_session(
        &connection,
        SessionOptions::default().maximum_link_count(1),
    );

    let first = session.create_message_sender("q", Default::default(), None);
    assert_ok!(first.open(true, &ctx));
    let second = session.create_message_sender("q", Default::default(), None);
    let err = assert_err!(second.open(true, &ctx));
    assert!(matches!(
        err,
        SenderOpenError::Alloc(AllocLinkError::HandleMaxReached)
    ));

    assert_ok!(first.close(&ctx));
    teardown(session, connection);
}

#[test]
fn links_need_a_begun_session() {
    let _serial = serial();
    let (engine, _broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "unbegun-link");
    let session = connection
        .create_session(SessionOptions::default())
        .unwrap();

    let sender = session.create_message_sender("q", Default::default(), None);
    let err = assert_err!(sender.open(true, &ctx));
    assert!(matches!(
        err,
        SenderOpenError::Alloc(AllocLinkError::IllegalState(_))
    ));
    assert_ok!(connection.close(&ctx));
}

#[test]
fn sent_message_reaches_the_node() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "send");
    let session = begin_session(&connection, SessionOptions::default());

    let sender = session.create_message_sender("q1", Default::default(), None);
    assert_ok!(sender.open(true, &ctx));
    assert_eq!(sender.state(), MessageSenderState::Open);

    let outcome = assert_ok!(sender.send(AmqpMessage::with_value("hello AMQP"), &ctx));
    assert!(matches!(outcome, DeliveryOutcome::Accepted(_)));

    let messages = broker.messages("q1");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].value(), Some(&Value::String("hello AMQP".to_string())));

    assert_ok!(sender.close(&ctx));
    assert_eq!(sender.state(), MessageSenderState::Closed);
    teardown(session, connection);
}

#[test]
fn non_blocking_open_is_observed_later() {
    let _serial = serial();
    let (engine, _broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "non-blocking");
    let session = begin_session(&connection, SessionOptions::default());

    let sender = session.create_message_sender("q", Default::default(), None);
    assert_ok!(sender.open(false, &ctx));
    assert_ok!(sender.wait_for_open(&ctx));
    assert!(matches!(sender.poll_open(), Some(Ok(()))));

    assert_ok!(sender.close(&ctx));
    teardown(session, connection);
}

#[test]
fn open_result_taken_by_poll_is_not_waited_for_again() {
    let _serial = serial();
    let (engine, _broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "poll-then-wait");
    let session = begin_session(&connection, SessionOptions::default());

    let sender = session.create_message_sender("q", Default::default(), None);
    assert_ok!(sender.open(false, &ctx));
    assert!(eventually(|| sender.poll_open().is_some()));

    let short = Context::new().with_timeout(Duration::from_millis(500));
    assert_ok!(sender.wait_for_open(&short));

    let receiver = session.create_message_receiver("q", Default::default(), None);
    assert_ok!(receiver.open(true, &ctx));
    assert_ok!(receiver.wait_for_open(&short));

    assert_ok!(sender.close(&ctx));
    assert_ok!(receiver.close(&ctx));
    teardown(session, connection);
}

#[test]
fn unresponsive_peer_times_out_the_sender_open() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let connection = open_connection(&engine, "sender-timeout");
    let session = begin_session(&connection, SessionOptions::default());
    broker.set_unresponsive(true);

    let sender = session.create_message_sender("q", Default::default(), None);
    let ctx = Context::new().with_timeout(Duration::from_millis(100));
    let err = assert_err!(sender.open(true, &ctx));
    assert!(matches!(err, SenderOpenError::Wait(ref err) if err.is_cancelled()));
    assert_eq!(sender.state(), MessageSenderState::Error);

    broker.set_unresponsive(false);
    drop(sender);
    teardown(session, connection);
}

#[test]
fn send_after_forced_detach_fails_with_the_condition() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "forced");
    let session = begin_session(&connection, SessionOptions::default());

    let sender = session.create_message_sender("q", Default::default(), None);
    assert_ok!(sender.open(true, &ctx));

    let error = AmqpError::from_symbol(
        "amqp:link:detach-forced",
        Some("Forced detach".to_string()),
    );
    assert!(broker.force_detach(sender.link_name(), error));
    assert!(eventually(|| sender.state() == MessageSenderState::Error));

    let err = assert_err!(sender.send(AmqpMessage::with_value("too late"), &ctx));
    assert_eq!(err.status(), SendStatus::Error);
    let error = err.amqp_error().unwrap();
    assert_eq!(error.condition_symbol().as_str(), "amqp:link:detach-forced");
    assert_eq!(sender.error().as_ref(), Some(error));

    assert_ok!(sender.close(&ctx));
    teardown(session, connection);
}

#[test]
fn forced_detach_fails_sends_in_flight() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "in-flight");
    let session = begin_session(&connection, SessionOptions::default());

    let sender = session.create_message_sender("q", Default::default(), None);
    assert_ok!(sender.open(true, &ctx));
    broker.hold_settlements(true);

    let (tx, rx) = mpsc::channel();
    sender.queue_send(AmqpMessage::with_value("held"), move |result| {
        let _ = tx.send(result);
    });
    assert!(rx.try_recv().is_err());

    let error = AmqpError::from_symbol("amqp:link:detach-forced", None);
    assert!(broker.force_detach(sender.link_name(), error));
    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    match result {
        Err(SendError::Detached(error)) => {
            assert_eq!(error.condition_symbol().as_str(), "amqp:link:detach-forced")
        }
        result => panic!("unexpected result {:?}", result),
    }

    assert_ok!(sender.close(&ctx));
    teardown(session, connection);
}

#[test]
fn closing_the_sender_fails_sends_in_flight() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "close-in-flight");
    let session = begin_session(&connection, SessionOptions::default());

    let sender = session.create_message_sender("q", Default::default(), None);
    assert_ok!(sender.open(true, &ctx));
    broker.hold_settlements(true);

    let (tx, rx) = mpsc::channel();
    sender.queue_send(AmqpMessage::with_value("held"), move |result| {
        let _ = tx.send(result);
    });

    assert_ok!(sender.close(&ctx));
    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(result, Err(SendError::Detached(_))));
    teardown(session, connection);
}

#[test]
fn held_settlements_complete_when_released() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "release");
    let session = begin_session(&connection, SessionOptions::default());

    let sender = session.create_message_sender("q", Default::default(), None);
    assert_ok!(sender.open(true, &ctx));
    broker.hold_settlements(true);

    let (tx, rx) = mpsc::channel();
    for i in 0..3 {
        let tx = tx.clone();
        sender.queue_send(AmqpMessage::with_value(i as i32), move |result| {
            let _ = tx.send(result);
        });
    }
    assert_eq!(broker.release_held_settlements(), 3);
    for _ in 0..3 {
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Accepted(_)));
    }

    assert_ok!(sender.close(&ctx));
    teardown(session, connection);
}

#[test]
fn pre_settled_send_completes_on_hand_off() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "pre-settled");
    let session = begin_session(&connection, SessionOptions::default());
    broker.hold_settlements(true);

    let sender = session.create_message_sender(
        "q",
        MessageSenderOptions::default().settle_mode(SenderSettleMode::Settled),
        None,
    );
    assert_ok!(sender.open(true, &ctx));
    let outcome = assert_ok!(sender.send(AmqpMessage::with_value("fire"), &ctx));
    assert!(matches!(outcome, DeliveryOutcome::Accepted(_)));
    assert_eq!(broker.messages("q").len(), 1);
    assert_eq!(broker.release_held_settlements(), 0);

    assert_ok!(sender.close(&ctx));
    teardown(session, connection);
}

#[test]
fn oversized_message_is_refused_locally() {
    let _serial = serial();
    let engine = LocalEngine::new();
    let broker = LocalBroker::builder()
        .max_message_size(1024)
        .listen(&engine, PORT)
        .unwrap();
    let ctx = ctx();
    let connection = open_connection(&engine, "max-message-size");
    let session = begin_session(&connection, SessionOptions::default());

    let sender = session.create_message_sender("q", Default::default(), None);
    assert_ok!(sender.open(true, &ctx));
    assert_eq!(sender.max_message_size(), Some(1024));

    let err = assert_err!(sender.send(AmqpMessage::with_data(vec![0u8; 4096]), &ctx));
    match err {
        SendError::MessageSizeExceeded { size, max } => {
            assert!(size > 4096);
            assert_eq!(max, 1024);
        }
        err => panic!("unexpected error {:?}", err),
    }
    assert!(broker.messages("q").is_empty());
    assert_eq!(sender.state(), MessageSenderState::Open);

    let outcome = assert_ok!(sender.send(AmqpMessage::with_data(vec![0u8; 16]), &ctx));
    assert!(matches!(outcome, DeliveryOutcome::Accepted(_)));

    assert_ok!(sender.close(&ctx));
    teardown(session, connection);
}

#[test]
fn message_at_the_size_limit_is_sent() {
    let _serial = serial();
    let engine = LocalEngine::new();
    let broker = LocalBroker::builder()
        .max_message_size(1008)
        .listen(&engine, PORT)
        .unwrap();
    let ctx = ctx();
    let connection = open_connection(&engine, "exact-size");
    let session = begin_session(&connection, SessionOptions::default());

    let sender = session.create_message_sender("q", Default::default(), None);
    assert_ok!(sender.open(true, &ctx));

    // A 1000 byte data section encodes to exactly 1008 bytes
    let outcome = assert_ok!(sender.send(AmqpMessage::with_data(vec![0u8; 1000]), &ctx));
    assert!(matches!(outcome, DeliveryOutcome::Accepted(_)));
    assert_eq!(broker.messages("q").len(), 1);

    let err = assert_err!(sender.send(AmqpMessage::with_data(vec![0u8; 1001]), &ctx));
    assert!(matches!(
        err,
        SendError::MessageSizeExceeded {
            size: 1009,
            max: 1008
        }
    ));

    assert_ok!(sender.close(&ctx));
    teardown(session, connection);
}

#[test]
fn delivery_ids_are_unique_across_a_session() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "session-delivery-ids");
    let session = begin_session(&connection, SessionOptions::default());

    let first = session.create_message_sender("a", Default::default(), None);
    assert_ok!(first.open(true, &ctx));
    let second = session.create_message_sender("b", Default::default(), None);
    assert_ok!(second.open(true, &ctx));
    broker.hold_settlements(true);

    let (tx, rx) = mpsc::channel();
    for sender in [&first, &second, &first] {
        let tx = tx.clone();
        sender.queue_send(AmqpMessage::with_value("id"), move |result| {
            let _ = tx.send(result);
        });
    }
    let mut ids = broker.held_delivery_ids();
    assert_eq!(ids.len(), 3);
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3);

    assert_eq!(broker.release_held_settlements(), 3);
    for _ in 0..3 {
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Accepted(_)));
    }

    assert_ok!(first.close(&ctx));
    assert_ok!(second.close(&ctx));
    teardown(session, connection);
}

#[test]
fn receiver_gets_queued_messages() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "receive");
    let session = begin_session(&connection, SessionOptions::default());

    for i in 0..3 {
        broker.send("inbox", AmqpMessage::with_value(i as i32));
    }

    let receiver = session.create_message_receiver("inbox", Default::default(), None);
    assert_ok!(receiver.open(true, &ctx));
    assert_eq!(receiver.state(), MessageReceiverState::Open);

    for i in 0..3 {
        let message = assert_ok!(receiver.wait_for_incoming_message(&ctx));
        assert_eq!(message.value(), Some(&Value::Int(i as i32)));
    }
    assert!(eventually(|| broker.dispositions().len() == 3));
    assert!(broker
        .dispositions()
        .iter()
        .all(|(_, outcome)| matches!(outcome, DeliveryOutcome::Accepted(_))));
    assert!(matches!(receiver.try_wait_for_incoming_message(), Ok(None)));

    assert_ok!(receiver.close(&ctx));
    assert_eq!(receiver.state(), MessageReceiverState::Closed);
    teardown(session, connection);
}

#[test]
fn sender_and_receiver_round_trip() {
    let _serial = serial();
    let (engine, _broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "round-trip");
    let session = begin_session(&connection, SessionOptions::default());

    let receiver = session.create_message_receiver(
        "rt",
        MessageReceiverOptions::default().link_credit(10),
        None,
    );
    assert_ok!(receiver.open(true, &ctx));
    let sender = session.create_message_sender("rt", Default::default(), None);
    assert_ok!(sender.open(true, &ctx));

    let message = AmqpMessage::builder()
        .application_property("kind", "greeting")
        .value("hello")
        .build();
    assert_ok!(sender.send(message.clone(), &ctx));

    let received = assert_ok!(receiver.wait_for_incoming_message(&ctx));
    assert_eq!(received.value(), message.value());
    assert_eq!(
        received.application_property("kind"),
        Some(&SimpleValue::String("greeting".to_string()))
    );

    assert_ok!(sender.close(&ctx));
    assert_ok!(receiver.close(&ctx));
    teardown(session, connection);
}

#[derive(Debug)]
struct RejectEverything;

impl MessageReceiverEvents for RejectEverything {
    fn on_message_received(&self, _message: &AmqpMessage) -> Option<DeliveryOutcome> {
        Some(DeliveryOutcome::Rejected(Rejected { error: None }))
    }
}

#[test]
fn receiver_events_decide_the_outcome() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "reject");
    let session = begin_session(&connection, SessionOptions::default());

    broker.send("rejects", AmqpMessage::with_value("unwanted"));
    let receiver = session.create_message_receiver(
        "rejects",
        Default::default(),
        Some(Arc::new(RejectEverything)),
    );
    assert_ok!(receiver.open(true, &ctx));

    assert!(eventually(|| broker.dispositions().len() == 1));
    assert!(matches!(
        broker.dispositions()[0].1,
        DeliveryOutcome::Rejected(_)
    ));
    assert!(matches!(receiver.try_wait_for_incoming_message(), Ok(None)));

    assert_ok!(receiver.close(&ctx));
    teardown(session, connection);
}

#[test]
fn detached_receiver_unblocks_the_waiter() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "receiver-detach");
    let session = begin_session(&connection, SessionOptions::default());

    let receiver = session.create_message_receiver(
        "empty",
        MessageReceiverOptions::default().name("doomed"),
        None,
    );
    assert_ok!(receiver.open(true, &ctx));

    let error = AmqpError::from_symbol("amqp:link:detach-forced", None);
    assert!(broker.force_detach("doomed", error));

    let err = assert_err!(receiver.wait_for_incoming_message(&ctx));
    match err {
        ReceiveError::Detached(error) => {
            assert_eq!(error.condition_symbol().as_str(), "amqp:link:detach-forced")
        }
        err => panic!("unexpected error {:?}", err),
    }
    assert_eq!(receiver.state(), MessageReceiverState::Error);

    assert_ok!(receiver.close(&ctx));
    teardown(session, connection);
}

#[test]
fn ending_the_session_detaches_its_links() {
    let _serial = serial();
    let (engine, broker) = setup_broker();
    let ctx = ctx();
    let connection = open_connection(&engine, "end-detaches");
    let session = begin_session(&connection, SessionOptions::default());

    let sender = session.create_message_sender("q", Default::default(), None);
    assert_ok!(sender.open(true, &ctx));
    assert_ok!(session.end(&ctx));

    assert_eq!(sender.state(), MessageSenderState::Error);
    let err = assert_err!(sender.send(AmqpMessage::with_value("orphan"), &ctx));
    assert!(matches!(err, SendError::Detached(_)));
    assert_eq!(broker.link_count(), 0);

    drop(sender);
    assert_ok!(connection.close(&ctx));
}

#[test]
fn unresponsive_peer_times_out_the_detach() {
    let _serial = serial();
    {
        let (engine, broker) = setup_broker();
        let ctx = ctx();
        let connection = open_connection(&engine, "detach-timeout");
        let session = begin_session(&connection, SessionOptions::default());

        let link = session
            .create_link(
                Role::Sender,
                None::<MessageSource>,
                MessageTarget::from("q"),
                LinkOptions::default().name("stuck"),
            )
            .unwrap();
        assert_ok!(link.attach(&ctx));
        let sender = session.create_message_sender("q", Default::default(), None);
        assert_ok!(sender.open(true, &ctx));
        broker.set_unresponsive(true);

        let short = Context::new().with_timeout(Duration::from_millis(100));
        let err = assert_err!(link.detach(&short));
        assert!(matches!(err, DetachError::Wait(ref err) if err.is_cancelled()));
        assert_eq!(link.state(), LinkState::Closed);

        let err = assert_err!(sender.close(&short));
        assert!(matches!(
            err,
            SenderCloseError::Detach(DetachError::Wait(ref err)) if err.is_cancelled()
        ));
        assert_eq!(sender.state(), MessageSenderState::Closed);

        broker.set_unresponsive(false);
        drop(link);
        drop(sender);
        teardown(session, connection);
    }
    assert_idle_eventually();
}
