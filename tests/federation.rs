//! End-to-end federation tests over the in-process transport.

use std::time::Duration;

use weave::{
    Broker, BrokerConfig, CommsRegistry, Core, CoreConfig, CoreType, ErrorKind, Federate,
    IterationRequest, IterationResult, NodeConfig, Time,
};

fn broker_config(registry: &std::sync::Arc<CommsRegistry>, name: &str) -> BrokerConfig {
    BrokerConfig::new(NodeConfig::new(name, CoreType::Test).with_registry(registry.clone()))
}

fn core_config(
    registry: &std::sync::Arc<CommsRegistry>,
    name: &str,
    broker: &str,
) -> CoreConfig {
    CoreConfig::new(
        NodeConfig::new(name, CoreType::Test)
            .with_registry(registry.clone())
            .with_broker(broker),
    )
}

/// Two federates on two cores: a global publication, a subscription, one
/// concurrent time step, and a graceful shutdown.
#[test_log::test(tokio::test)]
async fn two_federate_pub_sub() {
    let registry = CommsRegistry::new();
    let mut config = broker_config(&registry, "brk");
    config.min_children = 2;
    let mut broker = Broker::connect(config).await.unwrap();

    let c1 = Core::connect(core_config(&registry, "c1", "brk")).await.unwrap();
    let c2 = Core::connect(core_config(&registry, "c2", "brk")).await.unwrap();

    let mut fed_a = Federate::new(&c1, "A").await.unwrap();
    let mut fed_b = Federate::new(&c2, "B").await.unwrap();

    let pub_handle = fed_a
        .register_publication("p1", "double", "")
        .unwrap();
    let input_handle = fed_b.subscribe("p1").unwrap();

    tokio::try_join!(fed_a.enter_initializing(), fed_b.enter_initializing()).unwrap();
    let (ra, rb) = tokio::try_join!(
        fed_a.enter_executing(IterationRequest::NoIterations),
        fed_b.enter_executing(IterationRequest::NoIterations),
    )
    .unwrap();
    assert_eq!(ra, IterationResult::NextStep);
    assert_eq!(rb, IterationResult::NextStep);
    assert_eq!(fed_a.current_time(), Time::ZERO);

    fed_a.publish(pub_handle, 27.5).unwrap();

    let one = Time::from_seconds(1.0);
    let (granted_a, granted_b) = tokio::try_join!(
        fed_a.request_time(one, IterationRequest::NoIterations),
        fed_b.request_time(one, IterationRequest::NoIterations),
    )
    .unwrap();
    assert_eq!(granted_a.0, one);
    assert_eq!(granted_b.0, one);

    assert!(fed_b.is_updated(input_handle));
    let value = fed_b.get_value(input_handle).unwrap();
    assert_eq!(value.as_double(), 27.5);
    assert!(!fed_b.is_updated(input_handle));

    tokio::try_join!(fed_a.finalize(), fed_b.finalize()).unwrap();
    assert!(broker.wait_for_disconnect(Duration::from_secs(5)).await);
}

/// Executing-entry iteration: initial values force one iterating round, and
/// with no further changes the round after converges at t = 0.
#[test_log::test(tokio::test)]
async fn executing_entry_iterates_to_fixed_point() {
    let registry = CommsRegistry::new();
    let mut broker = Broker::connect(broker_config(&registry, "brk")).await.unwrap();
    let core = Core::connect(core_config(&registry, "c1", "brk")).await.unwrap();

    let mut fed_x = Federate::new(&core, "X").await.unwrap();
    let mut fed_y = Federate::new(&core, "Y").await.unwrap();

    let pub_x = fed_x.register_publication("x_out", "double", "").unwrap();
    let pub_y = fed_y.register_publication("y_out", "double", "").unwrap();
    let in_x = fed_x.subscribe("y_out").unwrap();
    let in_y = fed_y.subscribe("x_out").unwrap();

    tokio::try_join!(fed_x.enter_initializing(), fed_y.enter_initializing()).unwrap();

    // Initial values are exchanged during initialization.
    fed_x.publish(pub_x, 1.0).unwrap();
    fed_y.publish(pub_y, 2.0).unwrap();

    let driver = |mut fed: Federate, input: weave::federate::InputHandle| async move {
        let mut rounds = 0;
        loop {
            let result = fed
                .enter_executing(IterationRequest::IterateIfNeeded)
                .await
                .unwrap();
            match result {
                IterationResult::Iterating => {
                    rounds += 1;
                    // Converged already: read but do not republish.
                    let _ = fed.get_value(input).unwrap();
                    assert!(rounds < 10, "iteration failed to converge");
                }
                IterationResult::NextStep => return (fed, rounds),
                other => panic!("unexpected result {other:?}"),
            }
        }
    };

    let (task_x, task_y) = tokio::join!(
        tokio::spawn(driver(fed_x, in_x)),
        tokio::spawn(driver(fed_y, in_y)),
    );
    let (mut fed_x, rounds_x) = task_x.unwrap();
    let (mut fed_y, rounds_y) = task_y.unwrap();

    assert!(rounds_x >= 1, "X never iterated");
    assert!(rounds_y >= 1, "Y never iterated");
    assert_eq!(fed_x.current_time(), Time::ZERO);
    assert_eq!(fed_y.current_time(), Time::ZERO);

    tokio::try_join!(fed_x.finalize(), fed_y.finalize()).unwrap();
    assert!(broker.wait_for_disconnect(Duration::from_secs(5)).await);
}

/// A barrier below the requested time blocks the grant until it is raised.
#[test_log::test(tokio::test)]
async fn time_barrier_blocks_and_releases() {
    let registry = CommsRegistry::new();
    let mut broker = Broker::connect(broker_config(&registry, "brk")).await.unwrap();
    let core = Core::connect(core_config(&registry, "c1", "brk")).await.unwrap();
    let mut fed = Federate::new(&core, "F").await.unwrap();
    fed.register_publication("f_out", "double", "").unwrap();

    fed.enter_initializing().await.unwrap();
    fed.enter_executing(IterationRequest::NoIterations)
        .await
        .unwrap();

    broker.set_time_barrier(Time::from_seconds(2.0));
    tokio::time::sleep(Duration::from_millis(250)).await;

    // Below the barrier: granted.
    let (granted, _) = fed
        .request_time(Time::from_seconds(1.75), IterationRequest::NoIterations)
        .await
        .unwrap();
    assert_eq!(granted, Time::from_seconds(1.75));

    // At or above the barrier: blocked.
    fed.request_time_async(Time::from_seconds(3.0), IterationRequest::NoIterations)
        .unwrap();
    let blocked =
        tokio::time::timeout(Duration::from_millis(400), fed.request_time_complete()).await;
    assert!(blocked.is_err(), "grant should be held by the barrier");

    // Raising the barrier releases the pending request.
    broker.set_time_barrier(Time::from_seconds(5.0));
    let (granted, result) = fed.request_time_complete().await.unwrap();
    assert_eq!(granted, Time::from_seconds(3.0));
    assert_eq!(result, IterationResult::NextStep);

    fed.finalize().await.unwrap();
    assert!(broker.wait_for_disconnect(Duration::from_secs(5)).await);
}

/// Queries resolve through the tree: the root lists its subordinates, and
/// unknown targets report `#invalid`.
#[test_log::test(tokio::test)]
async fn query_fan_out() {
    let registry = CommsRegistry::new();
    let root = Broker::connect(broker_config(&registry, "root_broker")).await.unwrap();

    let mut sub_config = broker_config(&registry, "brk2");
    sub_config.node.broker_address = Some("root_broker".into());
    let sub = Broker::connect(sub_config).await.unwrap();

    let core = Core::connect(core_config(&registry, "c1", "brk2")).await.unwrap();
    let fed = Federate::new(&core, "A").await.unwrap();

    // Asked of a sub-broker, answered by the root.
    let brokers = sub.query("federation", "brokers").await;
    let parsed: serde_json::Value = serde_json::from_str(&brokers).unwrap();
    let names: Vec<&str> = parsed
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["brk2"]);
    assert!(parsed[0]["state"].is_string());

    let cores = root.query("root", "cores").await;
    assert!(cores.contains("c1"), "cores query missing c1: {cores}");

    let feds = root.query("federation", "federates").await;
    assert!(feds.contains('A'), "federates query missing A: {feds}");

    // Federate-side query routed to the root.
    let count = fed.query("root", "counts").await;
    let parsed: serde_json::Value = serde_json::from_str(&count).unwrap();
    assert_eq!(parsed["federates"], 1);
    assert_eq!(parsed["cores"], 1);

    // A query routed to a named core.
    let state = root.query("c1", "current_state").await;
    assert!(state.contains("Connected"), "unexpected state: {state}");

    // Unknown target.
    let invalid = root.query("nonesuch", "anything").await;
    assert!(invalid.contains("#invalid"), "expected #invalid: {invalid}");
}

/// Graceful shutdown after finalize, and forced termination failing pending
/// calls with a connection failure.
#[test_log::test(tokio::test)]
async fn graceful_and_forced_disconnect() {
    // Graceful path.
    let registry = CommsRegistry::new();
    let mut broker = Broker::connect(broker_config(&registry, "brk")).await.unwrap();
    let mut core = Core::connect(core_config(&registry, "c1", "brk")).await.unwrap();
    let mut fed = Federate::new(&core, "A").await.unwrap();
    fed.register_publication("a_out", "double", "").unwrap();
    fed.enter_initializing().await.unwrap();
    fed.enter_executing(IterationRequest::NoIterations)
        .await
        .unwrap();
    fed.finalize().await.unwrap();
    assert!(core.wait_for_disconnect(Duration::from_secs(5)).await);
    assert!(broker.wait_for_disconnect(Duration::from_secs(5)).await);
    // Idempotent once disconnected.
    assert!(broker.wait_for_disconnect(Duration::from_millis(10)).await);

    // Forced path.
    let registry = CommsRegistry::new();
    let mut broker = Broker::connect(broker_config(&registry, "brk")).await.unwrap();
    let core = Core::connect(core_config(&registry, "c1", "brk")).await.unwrap();
    let mut fed = Federate::new(&core, "A").await.unwrap();
    fed.register_publication("a_out", "double", "").unwrap();
    fed.enter_initializing().await.unwrap();
    fed.enter_executing(IterationRequest::NoIterations)
        .await
        .unwrap();

    broker.force_terminate();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let err = fed
        .request_time(Time::from_seconds(1.0), IterationRequest::NoIterations)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectionFailure);
    assert!(broker.wait_for_disconnect(Duration::from_secs(5)).await);
}

/// Endpoint messaging through the filter pipeline: a destination delay shifts
/// delivery time (and pulls the receiver's grant to it), and a cloning filter
/// taps a copy to a third endpoint.
#[test_log::test(tokio::test)]
async fn endpoint_messages_delay_and_clone() {
    let registry = CommsRegistry::new();
    let mut broker = Broker::connect(broker_config(&registry, "brk")).await.unwrap();
    let core = Core::connect(core_config(&registry, "c1", "brk")).await.unwrap();

    let mut fed_a = Federate::new(&core, "A").await.unwrap();
    let mut fed_b = Federate::new(&core, "B").await.unwrap();

    let ep_a = fed_a.register_endpoint("a_ep", "").unwrap();
    let tap = fed_a.register_endpoint("tap_ep", "").unwrap();
    fed_b.register_endpoint("b_ep", "").unwrap();

    // Destination-side filters on B's endpoint: half-second lag, then a tap.
    fed_b
        .register_filter("lag", "delay", "0.5", "b_ep", true)
        .unwrap();
    fed_b
        .register_cloning_filter("tap_copy", "b_ep", &["tap_ep"])
        .unwrap();

    tokio::try_join!(fed_a.enter_initializing(), fed_b.enter_initializing()).unwrap();
    tokio::try_join!(
        fed_a.enter_executing(IterationRequest::NoIterations),
        fed_b.enter_executing(IterationRequest::NoIterations),
    )
    .unwrap();

    fed_a
        .send_message(ep_a, "b_ep", b"hello".to_vec(), None)
        .unwrap();

    let one = Time::from_seconds(1.0);
    let (granted_a, granted_b) = tokio::try_join!(
        fed_a.request_time(one, IterationRequest::NoIterations),
        fed_b.request_time(one, IterationRequest::NoIterations),
    )
    .unwrap();
    // Both are pulled to the delayed delivery time: B for the message itself,
    // A for the tap copy landing on its own endpoint.
    assert_eq!(granted_b.0, Time::from_seconds(0.5));
    assert_eq!(granted_a.0, Time::from_seconds(0.5));

    let msg = fed_b.get_message().expect("delayed message readable");
    assert_eq!(msg.payload.as_ref(), b"hello");
    assert_eq!(msg.destination, "b_ep");
    assert_eq!(msg.source, "a_ep");
    assert_eq!(msg.time, Time::from_seconds(0.5));
    assert!(fed_b.get_message().is_none());

    let copy = fed_a
        .get_message_for(tap)
        .expect("cloned message readable");
    assert_eq!(copy.payload.as_ref(), b"hello");
    assert_eq!(copy.destination, "tap_ep");

    // With the queues drained, the next step reaches the requested time.
    let (granted_a, granted_b) = tokio::try_join!(
        fed_a.request_time(one, IterationRequest::NoIterations),
        fed_b.request_time(one, IterationRequest::NoIterations),
    )
    .unwrap();
    assert_eq!(granted_a.0, one);
    assert_eq!(granted_b.0, one);

    tokio::try_join!(fed_a.finalize(), fed_b.finalize()).unwrap();
    assert!(broker.wait_for_disconnect(Duration::from_secs(5)).await);
}

/// A registration arriving after initialization is refused.
#[test_log::test(tokio::test)]
async fn registration_is_sealed_after_initialization() {
    let registry = CommsRegistry::new();
    let _broker = Broker::connect(broker_config(&registry, "brk")).await.unwrap();
    let core = Core::connect(core_config(&registry, "c1", "brk")).await.unwrap();
    let mut fed = Federate::new(&core, "A").await.unwrap();
    fed.register_publication("a_out", "double", "").unwrap();
    fed.enter_initializing().await.unwrap();

    // The federation has initialized; late joiners are turned away.
    let late = Core::connect(core_config(&registry, "c2", "brk")).await;
    assert!(late.is_err(), "late core should have been refused");
}

/// Duplicate publication names surface as an error on the second federate.
#[test_log::test(tokio::test)]
async fn duplicate_publication_is_reported() {
    let registry = CommsRegistry::new();
    let mut config = broker_config(&registry, "brk");
    config.min_children = 2;
    let _broker = Broker::connect(config).await.unwrap();
    let c1 = Core::connect(core_config(&registry, "c1", "brk")).await.unwrap();
    let c2 = Core::connect(core_config(&registry, "c2", "brk")).await.unwrap();

    let fed_a = Federate::new(&c1, "A").await.unwrap();
    let mut fed_b = Federate::new(&c2, "B").await.unwrap();

    fed_a.register_publication("p1", "double", "").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    fed_b.register_publication("p1", "double", "").unwrap();

    // The rejection is asynchronous; it lands before initialization can
    // proceed.
    let err = fed_b.enter_initializing().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RegistrationFailure);
}
