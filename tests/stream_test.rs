mod support;

use std::cell::RefCell;
use std::thread;
use std::time::{Duration, Instant};

use ctw::api::{GatewayError, Query};
use ctw::cancel::CancelToken;
use ctw::config::StreamSettings;
use ctw::stream::{
    Backoff, BackoffPolicy, BackoffReset, ConnectionState, DisconnectNotice, Flow, Includes,
    StopReason, StreamConsumer, StreamError, Tweet, STREAM_PATH,
};
use proptest::prelude::*;
use support::{hanging, respond, stream, transport, tweet_line, with_header, ScriptedGateway};

fn fast_settings() -> StreamSettings {
    StreamSettings {
        backoff_initial: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
        backoff_reset_after: None,
        stall_timeout: Duration::from_secs(30),
    }
}

/// Handler that records ids and stops after `limit` tweets.
fn collect_until(
    seen: &mut Vec<String>,
    limit: usize,
) -> impl FnMut(&Tweet, &Includes) -> anyhow::Result<Flow> + '_ {
    move |tweet: &Tweet, _: &Includes| {
        seen.push(tweet.id.clone());
        Ok(if seen.len() >= limit {
            Flow::Stop
        } else {
            Flow::Continue
        })
    }
}

#[test]
fn records_of_one_line_are_delivered_in_order() {
    let gateway = ScriptedGateway::new();
    gateway.push(stream(&tweet_line(&["1", "2"])));

    let mut fields = Query::new();
    fields.insert("tweet.fields".into(), "created_at".into());
    let mut seen = Vec::new();
    let mut consumer = StreamConsumer::new(&gateway, &fast_settings(), CancelToken::new());
    let stats = consumer
        .run(&fields, &mut collect_until(&mut seen, 2))
        .unwrap();

    assert_eq!(seen, vec!["1", "2"]);
    assert_eq!(stats.events, 2);
    assert_eq!(stats.reconnects, 0);
    assert_eq!(stats.stopped_by, StopReason::HandlerStop);

    let calls = gateway.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].path, STREAM_PATH);
    assert_eq!(calls[0].query["tweet.fields"], "created_at");
}

#[test]
fn malformed_line_does_not_end_the_stream() {
    let gateway = ScriptedGateway::new();
    let feed = format!("{}{{\"data\": [oops\n\n{}", tweet_line(&["1"]), tweet_line(&["2"]));
    gateway.push(stream(&feed));

    let mut seen = Vec::new();
    let mut consumer = StreamConsumer::new(&gateway, &fast_settings(), CancelToken::new());
    let stats = consumer
        .run(&Query::new(), &mut collect_until(&mut seen, 2))
        .unwrap();

    assert_eq!(seen, vec!["1", "2"]);
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.reconnects, 0);
}

#[test]
fn eof_and_server_errors_after_connecting_are_retried() {
    let gateway = ScriptedGateway::new();
    gateway
        .push(stream(&tweet_line(&["1"])))
        .push(respond(503, r#"{"title":"Service Unavailable"}"#))
        .push(stream(&tweet_line(&["2"])));

    let mut seen = Vec::new();
    let mut consumer = StreamConsumer::new(&gateway, &fast_settings(), CancelToken::new());
    let stats = consumer
        .run(&Query::new(), &mut collect_until(&mut seen, 2))
        .unwrap();

    assert_eq!(seen, vec!["1", "2"]);
    assert_eq!(stats.reconnects, 2);
    let last = stats.last_disconnect.unwrap();
    assert!(last.contains("status 503"), "{last}");
    assert_eq!(gateway.calls().len(), 3);
}

#[test]
fn backoff_doubles_up_to_the_ceiling() {
    let gateway = ScriptedGateway::new();
    for _ in 0..5 {
        gateway.push(Err(transport("connection reset by peer")));
    }

    let cancel = CancelToken::new();
    let waits = RefCell::new(Vec::new());
    let stopper = cancel.clone();
    let mut consumer = StreamConsumer::new(&gateway, &fast_settings(), cancel)
        .with_backoff(BackoffPolicy {
            initial: Duration::from_millis(2),
            ceiling: Duration::from_millis(8),
            reset: BackoffReset::Never,
        })
        .on_disconnect(|notice: &DisconnectNotice| {
            waits.borrow_mut().push(notice.wait);
            if notice.attempt == 5 {
                stopper.cancel();
            }
        });
    let mut never = |_: &Tweet, _: &Includes| -> anyhow::Result<Flow> { Ok(Flow::Continue) };
    let stats = consumer.run(&Query::new(), &mut never).unwrap();

    let millis: Vec<u128> = waits.borrow().iter().map(Duration::as_millis).collect();
    assert_eq!(millis, vec![2, 4, 8, 8, 8]);
    assert_eq!(stats.reconnects, 5);
    assert_eq!(stats.stopped_by, StopReason::Cancelled);
    assert_eq!(consumer.state(), ConnectionState::Cancelled);
    assert!(stats
        .last_disconnect
        .unwrap()
        .contains("connection reset by peer"));
}

#[test]
fn rejected_first_connection_is_fatal() {
    let gateway = ScriptedGateway::new();
    gateway.push(respond(
        401,
        r#"{"title":"Unauthorized","type":"about:blank","status":401,"detail":"Unauthorized"}"#,
    ));

    let mut consumer = StreamConsumer::new(&gateway, &fast_settings(), CancelToken::new());
    let mut never = |_: &Tweet, _: &Includes| -> anyhow::Result<Flow> { Ok(Flow::Continue) };
    let err = consumer.run(&Query::new(), &mut never).unwrap_err();

    match err {
        StreamError::Connect(GatewayError::Api(api)) => {
            assert_eq!(api.status, 401);
            assert_eq!(api.detail.as_deref(), Some("Unauthorized"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(gateway.calls().len(), 1);
}

#[test]
fn rate_limit_reset_stretches_the_wait() {
    let reset = chrono::Utc::now().timestamp() + 3;
    let gateway = ScriptedGateway::new();
    gateway.push(stream(&tweet_line(&["1"]))).push(with_header(
        respond(429, r#"{"title":"Too Many Requests"}"#),
        "x-rate-limit-reset",
        &reset.to_string(),
    ));

    let cancel = CancelToken::new();
    let stopper = cancel.clone();
    let waits = RefCell::new(Vec::new());
    let mut consumer = StreamConsumer::new(&gateway, &fast_settings(), cancel)
        .with_backoff(BackoffPolicy {
            initial: Duration::from_millis(5),
            ceiling: Duration::from_secs(60),
            reset: BackoffReset::Never,
        })
        .on_disconnect(|notice: &DisconnectNotice| {
            waits.borrow_mut().push(notice.wait);
            if notice.attempt == 2 {
                stopper.cancel();
            }
        });
    let mut seen = Vec::new();
    consumer
        .run(&Query::new(), &mut collect_until(&mut seen, 10))
        .unwrap();

    let waits = waits.borrow();
    assert_eq!(waits[0], Duration::from_millis(5));
    assert!(waits[1] >= Duration::from_secs(2), "{:?}", waits[1]);
    assert!(waits[1] <= Duration::from_secs(3), "{:?}", waits[1]);
}

#[test]
fn cancel_during_backoff_returns_promptly() {
    let gateway = ScriptedGateway::new();
    gateway.push(Err(transport("connection refused")));

    let settings = StreamSettings {
        backoff_initial: Duration::from_secs(60),
        backoff_max: Duration::from_secs(120),
        ..fast_settings()
    };
    let cancel = CancelToken::new();
    let remote = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        remote.cancel();
    });

    let started = Instant::now();
    let mut consumer = StreamConsumer::new(&gateway, &settings, cancel);
    let mut never = |_: &Tweet, _: &Includes| -> anyhow::Result<Flow> { Ok(Flow::Continue) };
    let stats = consumer.run(&Query::new(), &mut never).unwrap();
    canceller.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(stats.stopped_by, StopReason::Cancelled);
    assert_eq!(stats.reconnects, 1);
}

#[test]
fn cancel_while_waiting_for_data_returns_promptly() {
    let gateway = ScriptedGateway::new();
    gateway.push(hanging(&tweet_line(&["1"])));

    let cancel = CancelToken::new();
    let remote = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        remote.cancel();
    });

    let started = Instant::now();
    let mut seen = Vec::new();
    let mut consumer = StreamConsumer::new(&gateway, &fast_settings(), cancel);
    let stats = consumer
        .run(&Query::new(), &mut collect_until(&mut seen, 10))
        .unwrap();
    canceller.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(seen, vec!["1"]);
    assert_eq!(stats.stopped_by, StopReason::Cancelled);
    assert_eq!(stats.reconnects, 0);
}

#[test]
fn stalled_connection_is_replaced() {
    let gateway = ScriptedGateway::new();
    gateway
        .push(hanging(&tweet_line(&["1"])))
        .push(stream(&tweet_line(&["2"])));

    let settings = StreamSettings {
        stall_timeout: Duration::from_millis(50),
        ..fast_settings()
    };
    let mut seen = Vec::new();
    let mut consumer = StreamConsumer::new(&gateway, &settings, CancelToken::new());
    let stats = consumer
        .run(&Query::new(), &mut collect_until(&mut seen, 2))
        .unwrap();

    assert_eq!(seen, vec!["1", "2"]);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.last_disconnect.as_deref(), Some("stalled"));
}

#[test]
fn handler_failure_ends_the_session_with_an_error() {
    let gateway = ScriptedGateway::new();
    gateway.push(stream(&tweet_line(&["1"])));

    let mut consumer = StreamConsumer::new(&gateway, &fast_settings(), CancelToken::new());
    let mut failing =
        |_: &Tweet, _: &Includes| -> anyhow::Result<Flow> { anyhow::bail!("output closed") };
    let err = consumer.run(&Query::new(), &mut failing).unwrap_err();
    assert!(matches!(err, StreamError::Handler(_)));
}

proptest! {
    #[test]
    fn backoff_waits_grow_and_respect_the_ceiling(
        initial_ms in 1u64..5_000,
        ceiling_ms in 1u64..200_000,
        rounds in 1usize..30,
    ) {
        let ceiling = Duration::from_millis(ceiling_ms);
        let mut backoff = Backoff::new(BackoffPolicy {
            initial: Duration::from_millis(initial_ms),
            ceiling,
            reset: BackoffReset::Never,
        });
        let waits: Vec<Duration> = (0..rounds).map(|_| backoff.next_wait(None)).collect();

        prop_assert_eq!(waits[0], Duration::from_millis(initial_ms.min(ceiling_ms)));
        for pair in waits.windows(2) {
            prop_assert!(pair[0] <= pair[1]);
            prop_assert!(pair[1] <= pair[0] * 2);
        }
        prop_assert!(waits.iter().all(|w| *w <= ceiling));
    }
}
