use std::sync::Mutex;

use serde_json::json;

use super::*;
use crate::subscriptions::server_handler;
use crate::topic::handler;
use crate::transport::test_helpers::RecordingTransport;

type Log = Arc<Mutex<Vec<(String, Value)>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<(String, Value)> {
    log.lock().unwrap().clone()
}

/// Handler recording `(published topic, payload)`.
fn recorder(log: &Log) -> Handler {
    let log = Arc::clone(log);
    handler(move |payload, delivery| {
        log.lock().unwrap().push((delivery.topic.to_string(), payload.clone()));
        Ok(())
    })
}

/// Callbacks recording auth payloads and `(error code, detail)` pairs.
fn callbacks(auth: &Log, errors: &Log) -> Callbacks {
    let auth = Arc::clone(auth);
    let errors = Arc::clone(errors);
    Callbacks::default()
        .on_auth(move |payload| {
            auth.lock().unwrap().push(("auth".into(), payload.clone()));
            Ok(())
        })
        .on_error(move |err, detail| {
            errors.lock().unwrap().push((err.error_code().into(), detail.clone()));
            Ok(())
        })
}

fn session_with(callbacks: Callbacks) -> Session<RecordingTransport> {
    Session::new(&ClientConfig::new("key"), RecordingTransport::default(), callbacks)
}

/// Open and authenticate; the authenticate ack is still pending.
fn authenticated(callbacks: Callbacks, max: u64) -> (Session<RecordingTransport>, Instant) {
    let t0 = Instant::now();
    let mut session = session_with(callbacks);
    session.on_open(t0);
    session.on_text(&json!(["system", "authenticateResponse", {"maxSubscriptions": max}]).to_string(), t0);
    assert_eq!(session.state(), ConnectionState::Authenticated);
    (session, t0)
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn open_sends_acked_authenticate_and_arms_timer() {
    let t0 = Instant::now();
    let mut session = session_with(Callbacks::default());
    assert_eq!(session.state(), ConnectionState::NotStarted);

    session.on_open(t0);

    assert_eq!(session.state(), ConnectionState::Authenticating);
    assert!(session.is_connected());
    assert_eq!(session.transport().sent_values(), vec![json!([1, "authenticate", {"apiKey": "key"}])]);
    assert_eq!(session.next_deadline(), Some(t0 + ms(5_000)));
}

#[test]
fn authenticated_session_accepts_five_subscriptions_then_rejects_the_sixth() {
    let (auth, errors) = (log(), log());
    let (mut session, t0) = authenticated(callbacks(&auth, &errors), 5);

    assert_eq!(entries(&auth), vec![("auth".to_string(), json!({"maxSubscriptions": 5}))]);

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(session.make_server_subscription(NewSubscription::new(format!("/p/{i}/")), t0).unwrap());
    }
    let err = session
        .make_server_subscription(NewSubscription::new("/p/5/"), t0)
        .expect_err("capacity reached");

    assert!(matches!(err, ClientError::Capacity { max: 5 }));
    assert_eq!(session.subscription_count(), 5);
    assert_eq!(session.state(), ConnectionState::Authenticated);
    assert_eq!(session.transport().closes, 0);
    assert!(entries(&errors).is_empty(), "synchronous errors bypass the failure path");

    let sent = session.transport().sent_values();
    assert_eq!(sent.len(), 6);
    assert_eq!(sent[1], json!([2, "subscribe", [ids[0], "/p/0/"]]));
}

#[test]
fn server_subscription_before_auth_is_rejected() {
    let mut session = session_with(Callbacks::default());
    session.on_open(Instant::now());
    let err = session
        .make_server_subscription(NewSubscription::new("/scales/"), Instant::now())
        .unwrap_err();
    assert!(matches!(err, ClientError::NotAuthenticated));
}

#[test]
fn auth_error_response_closes_without_failure_path() {
    let (auth, errors, topics) = (log(), log(), log());
    let t0 = Instant::now();
    let mut session = session_with(callbacks(&auth, &errors));
    session.subscribe("authenticate", recorder(&topics), SubscribeOptions::default());
    session.on_open(t0);

    session.on_text(r#"["system","authenticateResponse",{"error":"bad key"}]"#, t0);

    assert_eq!(session.state(), ConnectionState::Unauthenticated);
    assert_eq!(session.transport().closes, 1);
    assert_eq!(entries(&auth), vec![("auth".to_string(), json!({"error": "bad key"}))]);
    assert_eq!(entries(&topics), vec![("authenticate.error".to_string(), json!({"error": "bad key"}))]);
    assert!(entries(&errors).is_empty());
    assert_eq!(session.next_deadline(), None);
}

#[test]
fn auth_timeout_reports_through_auth_callback_then_failure_path() {
    let (auth, errors, error_topic) = (log(), log(), log());
    let t0 = Instant::now();
    let mut session = session_with(callbacks(&auth, &errors));
    session.subscribe(ERROR_TOPIC, recorder(&error_topic), SubscribeOptions::default());
    session.on_open(t0);

    session.poll_timers(t0 + ms(4_999));
    assert_eq!(session.state(), ConnectionState::Authenticating);

    session.poll_timers(t0 + ms(5_000));

    let timeout = json!({"timeout": true, "error": "Server timed out"});
    assert_eq!(session.state(), ConnectionState::Unauthenticated);
    assert_eq!(entries(&auth), vec![("auth".to_string(), timeout.clone())]);
    assert_eq!(entries(&errors), vec![("E_TIMEOUT".to_string(), timeout)]);
    assert_eq!(session.transport().closes, 1);

    let published = entries(&error_topic);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].1["code"], "E_TIMEOUT");
    assert_eq!(session.next_deadline(), None, "teardown cancels every timer");

    session.on_close();
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[test]
fn response_before_deadline_cancels_auth_timer() {
    let (mut session, t0) = authenticated(Callbacks::default(), 5);
    // Only the authenticate ack remains.
    assert_eq!(session.next_deadline(), Some(t0 + ms(10_000)));

    session.poll_timers(t0 + ms(6_000));
    assert_eq!(session.state(), ConnectionState::Authenticated);

    session.on_text(r#"["protocol","ack",1]"#, t0 + ms(40));
    assert_eq!(session.next_deadline(), None);
    let stats = session.debug_info();
    assert_eq!(stats.ack_durations_ms, vec![40]);
    assert_eq!(stats.messages_sent, 1);
}

#[test]
fn ack_timeout_routes_through_failure_path() {
    let (auth, errors) = (log(), log());
    let (mut session, t0) = authenticated(callbacks(&auth, &errors), 5);
    session.on_text(r#"["protocol","ack",1]"#, t0);

    let t1 = t0 + ms(100);
    session.make_server_subscription(NewSubscription::new("/a/"), t1).unwrap();
    session.poll_timers(t1 + ms(9_999));
    assert!(entries(&errors).is_empty());

    session.poll_timers(t1 + ms(10_000));

    let errors = entries(&errors);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "E_TIMEOUT");
    assert_eq!(errors[0].1["timeout"], true);
    assert_eq!(errors[0].1["elapsed"], 10_000);
    assert_eq!(session.transport().closes, 1);
}

#[test]
fn malformed_frames_route_to_failure_path_with_raw_text() {
    let (auth, errors) = (log(), log());
    let mut session = session_with(callbacks(&auth, &errors));
    let t0 = Instant::now();
    session.on_open(t0);

    session.on_text("not json", t0);
    session.on_text("[1,2]", t0);

    let errors = entries(&errors);
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0], ("E_PROTOCOL".to_string(), json!({"timeout": false, "data": "not json"})));
    assert_eq!(errors[1].1["data"], "[1,2]");
    assert_eq!(session.transport().closes, 1, "close is a no-op once closed");
}

#[test]
fn publish_runs_callback_then_republishes_on_extra_and_server_topics() {
    let (local, seen) = (log(), log());
    let (mut session, t0) = authenticated(Callbacks::default(), 5);
    session.subscribe("extra", recorder(&local), SubscribeOptions::default());
    session.subscribe("server", recorder(&local), SubscribeOptions::default());

    let seen_in = Arc::clone(&seen);
    let callback = server_handler(move |payload, delivery| {
        seen_in.lock().unwrap().push((delivery.path.to_owned(), payload.clone()));
        Ok(())
    });
    let id = session
        .make_server_subscription(NewSubscription::new("/s/").callback(callback).topic("extra.local"), t0)
        .unwrap();

    session.on_text(&json!(["publish", ["server.pushed"], [id, {"v": 1}]]).to_string(), t0);

    assert_eq!(entries(&seen), vec![("/s/".to_string(), json!({"v": 1}))]);
    assert_eq!(
        entries(&local),
        vec![
            ("extra.local".to_string(), json!({"v": 1})),
            ("server.pushed".to_string(), json!({"v": 1})),
        ]
    );
}

#[test]
fn server_topics_in_error_hierarchy_are_not_republished() {
    let (auth, errors) = (log(), log());
    let (reserved, local) = (log(), log());
    let (mut session, t0) = authenticated(callbacks(&auth, &errors), 5);
    session.subscribe(ERROR_TOPIC, recorder(&reserved), SubscribeOptions::default());
    session.subscribe("ok", recorder(&local), SubscribeOptions::default());
    let id = session.make_server_subscription(NewSubscription::new("/s/"), t0).unwrap();

    session.on_text(&json!(["publish", ["error", "error.sub", "ok"], [id, {"v": 1}]]).to_string(), t0);

    assert!(entries(&reserved).is_empty());
    assert!(entries(&errors).is_empty());
    assert_eq!(entries(&local), vec![("ok".to_string(), json!({"v": 1}))]);
    assert_eq!(session.state(), ConnectionState::Authenticated);
}

#[test]
fn publish_for_removed_subscription_is_dropped_quietly() {
    let (auth, errors) = (log(), log());
    let (mut session, t0) = authenticated(callbacks(&auth, &errors), 5);
    let id = session.make_server_subscription(NewSubscription::new("/s/"), t0).unwrap();

    assert_eq!(session.remove_server_subscription(&Removal::Id(id), t0), vec![id]);
    let sent = session.transport().sent_values();
    assert_eq!(sent.last().unwrap(), &json!([3, "unsubscribe", [id]]));

    session.on_text(&json!(["publish", [], [id, 1]]).to_string(), t0);
    assert!(entries(&errors).is_empty());
    assert_eq!(session.transport().closes, 0);
}

#[test]
fn removing_nothing_sends_nothing() {
    let (mut session, t0) = authenticated(Callbacks::default(), 5);
    let before = session.transport().sent.len();
    assert!(session.remove_server_subscription(&Removal::Path("/nope/".into()), t0).is_empty());
    assert_eq!(session.transport().sent.len(), before);
}

#[test]
fn failing_subscription_callback_is_reported_and_delivery_continues() {
    let (auth, errors, local) = (log(), log(), log());
    let (mut session, t0) = authenticated(callbacks(&auth, &errors), 5);
    session.subscribe("extra", recorder(&local), SubscribeOptions::default());
    let id = session
        .make_server_subscription(
            NewSubscription::new("/s/")
                .callback(server_handler(|_, _| Err("boom".into())))
                .topic("extra"),
            t0,
        )
        .unwrap();

    session.on_text(&json!(["publish", [], [id, 5]]).to_string(), t0);

    let errors = entries(&errors);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "E_RUNTIME");
    assert_eq!(errors[0].1["exception"], "boom");
    assert_eq!(entries(&local), vec![("extra".to_string(), json!(5))]);
}

#[test]
fn rate_limit_closes_and_reports() {
    let (auth, errors) = (log(), log());
    let (mut session, t0) = authenticated(callbacks(&auth, &errors), 5);

    session.on_text(r#"["system","rateLimit",{"limit":10}]"#, t0);

    assert_eq!(entries(&errors), vec![("E_RATE_LIMIT".to_string(), json!({"limit": 10}))]);
    assert_eq!(session.transport().closes, 1);
}

#[test]
fn unexpected_ack_is_reported_without_closing() {
    let (auth, errors) = (log(), log());
    let (mut session, t0) = authenticated(callbacks(&auth, &errors), 5);

    session.on_text(r#"["protocol","ack",999]"#, t0);

    assert_eq!(entries(&errors).len(), 1);
    assert_eq!(entries(&errors)[0].0, "E_PROTOCOL");
    assert_eq!(session.transport().closes, 0);
    assert_eq!(session.state(), ConnectionState::Authenticated);
}

#[test]
fn unknown_categories_and_tags_are_ignored() {
    let (auth, errors) = (log(), log());
    let (mut session, t0) = authenticated(callbacks(&auth, &errors), 5);

    session.on_text(r#"["mystery","x",1]"#, t0);
    session.on_text(r#"["system","shrug",1]"#, t0);
    session.on_text(r#"["protocol","shrug",1]"#, t0);

    assert!(entries(&errors).is_empty());
    assert_eq!(session.state(), ConnectionState::Authenticated);
}

#[test]
fn hi_updates_connected_flag() {
    let (mut session, t0) = authenticated(Callbacks::default(), 5);
    session.on_text(r#"["system","hi",false]"#, t0);
    assert!(!session.is_connected());
    session.on_text(r#"["system","hi",true]"#, t0);
    assert!(session.is_connected());
}

#[test]
fn close_is_idempotent() {
    let mut session = session_with(Callbacks::default());
    assert!(!session.close(), "never opened");

    session.on_open(Instant::now());
    assert!(session.close());
    assert!(!session.close());
    assert_eq!(session.transport().closes, 1);
}

#[test]
fn failed_close_reports_false() {
    let mut session = session_with(Callbacks::default());
    session.on_open(Instant::now());
    session.transport_mut().fail_close = true;
    assert!(!session.close());
}

#[test]
fn transport_close_is_terminal_and_clears_state() {
    let states = log();
    let (mut session, t0) = authenticated(Callbacks::default(), 5);
    session.subscribe("system.state", recorder(&states), SubscribeOptions::default());
    session.make_server_subscription(NewSubscription::new("/s/"), t0).unwrap();

    session.on_close();
    session.on_close();

    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!session.is_connected());
    assert_eq!(session.subscription_count(), 0);
    assert_eq!(session.next_deadline(), None);
    assert_eq!(entries(&states), vec![("system.state.DISCONNECTED".to_string(), json!("DISCONNECTED"))]);
}

#[test]
fn state_changes_are_published_in_order() {
    let states = log();
    let t0 = Instant::now();
    let mut session = session_with(Callbacks::default());
    session.subscribe("system.state", recorder(&states), SubscribeOptions::default());

    session.on_open(t0);
    session.on_text(r#"["system","authenticateResponse",{}]"#, t0);

    let topics: Vec<String> = entries(&states).into_iter().map(|(t, _)| t).collect();
    assert_eq!(topics, vec!["system.state.AUTHENTICATING", "system.state.AUTHENTICATED"]);
}

#[test]
fn missing_max_subscriptions_means_unbounded() {
    let (mut session, t0) = authenticated(Callbacks::default(), 5);
    session.on_close();

    let t0 = t0 + ms(1);
    let mut session2 = session_with(Callbacks::default());
    session2.on_open(t0);
    session2.on_text(r#"["system","authenticateResponse",{}]"#, t0);
    for i in 0..20 {
        session2.make_server_subscription(NewSubscription::new(format!("/u/{i}/")), t0).unwrap();
    }
    assert_eq!(session2.subscription_count(), 20);
    assert_eq!(session.subscription_count(), 0);
}

#[test]
fn failing_auth_callback_routes_runtime_error() {
    let errors = log();
    let errors_in = Arc::clone(&errors);
    let callbacks = Callbacks::default()
        .on_auth(|_| Err("auth handler broke".into()))
        .on_error(move |err, _| {
            errors_in.lock().unwrap().push((err.to_string(), Value::Null));
            Ok(())
        });
    let t0 = Instant::now();
    let mut session = session_with(callbacks);
    session.on_open(t0);
    session.on_text(r#"["system","authenticateResponse",{}]"#, t0);

    let errors = entries(&errors);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].0.contains("authentication callback"));
    assert_eq!(session.transport().closes, 1);
}

#[test]
fn failing_error_callback_and_error_subscriber_are_contained() {
    let callbacks = Callbacks::default().on_error(|_, _| Err("error handler broke".into()));
    let mut session = session_with(callbacks);
    session.subscribe(ERROR_TOPIC, handler(|_, _| Err("subscriber broke".into())), SubscribeOptions::default());
    session.on_open(Instant::now());

    session.on_text("garbage", Instant::now());

    assert_eq!(session.transport().closes, 1);
}

#[test]
fn local_subscriber_failure_goes_through_failure_path() {
    let (auth, errors, siblings) = (log(), log(), log());
    let mut session = session_with(callbacks(&auth, &errors));
    session.subscribe("app", handler(|_, _| Err("bad".into())), SubscribeOptions::default());
    session.subscribe("app", recorder(&siblings), SubscribeOptions::default());

    assert_eq!(session.publish("app.event", &json!(1)).unwrap(), 2);

    assert_eq!(entries(&siblings).len(), 1, "sibling still receives the payload");
    assert_eq!(entries(&errors).len(), 1);
    assert_eq!(entries(&errors)[0].0, "E_RUNTIME");
}

#[test]
fn publish_with_custom_sink_bypasses_failure_path() {
    let (auth, errors) = (log(), log());
    let mut session = session_with(callbacks(&auth, &errors));
    session.subscribe("app", handler(|_, _| Err("bad".into())), SubscribeOptions::default());

    let mut failures = 0;
    session.publish_with("app", &json!(1), &mut |_| failures += 1).unwrap();

    assert_eq!(failures, 1);
    assert!(entries(&errors).is_empty());
}

#[test]
fn application_cannot_publish_on_error_topic() {
    let mut session = session_with(Callbacks::default());
    assert!(matches!(session.publish("error", &json!(1)), Err(ClientError::Argument(_))));
    assert!(matches!(session.publish("error.sub", &json!(1)), Err(ClientError::Argument(_))));
    assert!(session.publish("errors", &json!(1)).is_ok());
}

#[test]
fn send_failure_rolls_back_registration_and_reports() {
    let (auth, errors) = (log(), log());
    let (mut session, t0) = authenticated(callbacks(&auth, &errors), 5);
    session.transport_mut().fail_sends = true;

    let err = session.make_server_subscription(NewSubscription::new("/s/"), t0).unwrap_err();

    assert!(matches!(err, ClientError::Transport(_)));
    assert_eq!(session.subscription_count(), 0);
    assert_eq!(entries(&errors)[0].0, "E_TRANSPORT");
    assert_eq!(session.debug_info().pending_acks, 0);
}

#[test]
fn scales_factory_registers_and_republishes_on_scales_topic() {
    let local = log();
    let (mut session, t0) = authenticated(Callbacks::default(), 5);
    session.subscribe(crate::paths::SCALES_TOPIC, recorder(&local), SubscribeOptions::default());

    let id = session
        .get_scales(&ScalesQuery::Computer { computer_id: 4 }, None, None, t0)
        .unwrap();
    let sent = session.transport().sent_values();
    assert_eq!(sent.last().unwrap()[2], json!([id, "/computer/4/scales/"]));

    session.on_text(&json!(["publish", [], [id, {"deviceName": "d"}]]).to_string(), t0);
    assert_eq!(entries(&local), vec![("scales".to_string(), json!({"deviceName": "d"}))]);

    let dup = session.get_scales(&ScalesQuery::Computer { computer_id: 4 }, None, None, t0);
    assert!(matches!(dup, Err(ClientError::DuplicatePath(_))));
}

#[test]
fn computer_connections_factory_registers_path() {
    let (mut session, t0) = authenticated(Callbacks::default(), 5);
    let id = session
        .get_computer_connections(&ComputerConnectionsQuery::All, None, None, t0)
        .unwrap();
    let sent = session.transport().sent_values();
    assert_eq!(sent.last().unwrap()[2], json!([id, "/computers/connections/"]));
}

#[test]
fn transport_error_is_published_and_fails_session() {
    let (auth, errors, socket) = (log(), log(), log());
    let (mut session, _) = authenticated(callbacks(&auth, &errors), 5);
    session.subscribe("system.socket.error", recorder(&socket), SubscribeOptions::default());

    session.on_transport_error(&ClientError::Transport("reset by peer".into()));

    assert_eq!(entries(&socket).len(), 1);
    assert_eq!(entries(&errors)[0].0, "E_TRANSPORT");
    assert_eq!(session.transport().closes, 1);
}
