// End-to-end command flows through a live hub and loopback clients.
use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use keybus_broker::{ClientOptions, ClientRegistry, Hub, HubHandle, HubOptions};
use keybus_client::{ClientError, LocalClient};
use keybus_storage::MemoryBackend;
use keybus_wire as wire;
use serde_json::{Map, Value, json};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn start_hub(options: HubOptions) -> (HubHandle, Arc<ClientRegistry>) {
    let (hub, handle) = Hub::new(Box::new(MemoryBackend::new()), options);
    let registry = hub.registry();
    tokio::spawn(hub.run());
    (handle, registry)
}

async fn test_client(handle: &HubHandle) -> LocalClient {
    let client = LocalClient::connect(
        handle.clone(),
        ClientOptions {
            namespace: "@test/".to_string(),
        },
    )
    .await
    .expect("connect");
    client.wait().await;
    client
}

fn params(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn expect_broker_error(result: keybus_client::Result<Option<Value>>, code: wire::ErrCode) {
    match result {
        Err(ClientError::Broker(err)) => assert_eq!(err.error, code),
        other => panic!("expected broker error {code}, got {other:?}"),
    }
}

#[tokio::test]
async fn write_then_read_round_trip() -> Result<()> {
    let (handle, _) = start_hub(HubOptions::default());
    let client = test_client(&handle).await;

    let ack = client
        .request(
            wire::CMD_WRITE_KEY,
            params(&[("key", json!("test")), ("data", json!("testvalue"))]),
        )
        .await?;
    assert_eq!(ack, None);

    let value = client
        .request(wire::CMD_READ_KEY, params(&[("key", json!("test"))]))
        .await?;
    assert_eq!(value, Some(json!("testvalue")));
    Ok(())
}

#[tokio::test]
async fn bulk_write_read_and_list() -> Result<()> {
    let (handle, _) = start_hub(HubOptions::default());
    let client = test_client(&handle).await;

    client
        .request(
            wire::CMD_WRITE_BULK,
            params(&[("key1", json!("value1")), ("key2", json!("value2"))]),
        )
        .await?;

    let bulk = client
        .request(
            wire::CMD_READ_BULK,
            params(&[("keys", json!(["key1", "key2"]))]),
        )
        .await?
        .expect("data");
    assert_eq!(bulk["key1"], json!("value1"));
    assert_eq!(bulk["key2"], json!("value2"));

    let all = client
        .request(wire::CMD_READ_PREFIX, params(&[("prefix", json!("key"))]))
        .await?
        .expect("data");
    assert_eq!(all["key1"], json!("value1"));
    assert_eq!(all["key2"], json!("value2"));

    // Listed keys keep the client's namespace, unlike the bulk reads.
    let listed = client
        .request(wire::CMD_LIST_KEYS, params(&[("prefix", json!("key"))]))
        .await?
        .expect("data");
    let listed = listed.as_array().expect("array");
    assert_eq!(listed.len(), 2);
    assert!(listed.contains(&json!("@test/key1")));
    assert!(listed.contains(&json!("@test/key2")));
    Ok(())
}

#[tokio::test]
async fn reading_an_absent_key_yields_empty_string() -> Result<()> {
    let (handle, _) = start_hub(HubOptions::default());
    let client = test_client(&handle).await;

    let value = client
        .request(
            wire::CMD_READ_KEY,
            params(&[("key", json!("__ this key doesn't exist I swear __"))]),
        )
        .await?;
    assert_eq!(value, Some(json!("")));
    Ok(())
}

#[tokio::test]
async fn listing_with_no_matches_yields_empty_array() -> Result<()> {
    let (handle, _) = start_hub(HubOptions::default());
    let client = test_client(&handle).await;

    let listed = client
        .request(wire::CMD_LIST_KEYS, params(&[("prefix", json!("nothing"))]))
        .await?;
    assert_eq!(listed, Some(json!([])));
    Ok(())
}

#[tokio::test]
async fn version_and_uid_need_no_auth() -> Result<()> {
    let (handle, _) = start_hub(HubOptions {
        password: "locked".to_string(),
    });
    let client = test_client(&handle).await;

    let version = client.request(wire::CMD_VERSION, Map::new()).await?;
    assert_eq!(version, Some(json!(wire::PROTO_VERSION)));

    let uid = client.request(wire::CMD_CLIENT_ID, Map::new()).await?;
    assert_eq!(uid, Some(json!(client.uid().to_string())));
    Ok(())
}

#[tokio::test]
async fn key_subscription_delivers_pushes() -> Result<()> {
    let (handle, _) = start_hub(HubOptions::default());
    let subscriber = test_client(&handle).await;
    let writer = test_client(&handle).await;

    let mut pushes = subscriber.subscribe_key("sub-test").await?;
    writer
        .request(
            wire::CMD_WRITE_KEY,
            params(&[("key", json!("sub-test")), ("data", json!("v"))]),
        )
        .await?;

    let push = timeout(RECV_TIMEOUT, pushes.recv())
        .await
        .expect("push in time")
        .expect("push");
    assert_eq!(push.key, "sub-test");
    assert_eq!(push.new_value, "v");
    Ok(())
}

#[tokio::test]
async fn prefix_subscription_delivers_pushes() -> Result<()> {
    let (handle, _) = start_hub(HubOptions::default());
    let subscriber = test_client(&handle).await;
    let writer = test_client(&handle).await;

    let mut pushes = subscriber.subscribe_prefix("sub-").await?;
    writer
        .request(
            wire::CMD_WRITE_KEY,
            params(&[("key", json!("sub-xyz")), ("data", json!("v"))]),
        )
        .await?;

    let push = timeout(RECV_TIMEOUT, pushes.recv())
        .await
        .expect("push in time")
        .expect("push");
    assert_eq!(push.key, "sub-xyz");
    assert_eq!(push.new_value, "v");
    Ok(())
}

#[tokio::test]
async fn delete_notifies_with_empty_value() -> Result<()> {
    let (handle, _) = start_hub(HubOptions::default());
    let client = test_client(&handle).await;

    client
        .request(
            wire::CMD_WRITE_KEY,
            params(&[("key", json!("doomed")), ("data", json!("v"))]),
        )
        .await?;
    let mut pushes = client.subscribe_key("doomed").await?;
    client
        .request(wire::CMD_REMOVE_KEY, params(&[("key", json!("doomed"))]))
        .await?;

    let push = timeout(RECV_TIMEOUT, pushes.recv())
        .await
        .expect("push in time")
        .expect("push");
    assert_eq!(push.key, "doomed");
    assert_eq!(push.new_value, "");

    let value = client
        .request(wire::CMD_READ_KEY, params(&[("key", json!("doomed"))]))
        .await?;
    assert_eq!(value, Some(json!("")));
    Ok(())
}

#[tokio::test]
async fn unsubscribe_stops_future_pushes() -> Result<()> {
    let (handle, _) = start_hub(HubOptions::default());
    let subscriber = test_client(&handle).await;
    let writer = test_client(&handle).await;

    let mut pushes = subscriber.subscribe_key("toggle").await?;
    writer
        .request(
            wire::CMD_WRITE_KEY,
            params(&[("key", json!("toggle")), ("data", json!("first"))]),
        )
        .await?;
    let push = timeout(RECV_TIMEOUT, pushes.recv())
        .await
        .expect("push in time")
        .expect("push");
    assert_eq!(push.new_value, "first");

    // Unsubscribe on the wire but keep the client-side route alive, so an
    // erroneous push would still land on the receiver.
    subscriber
        .request(wire::CMD_UNSUBSCRIBE_KEY, params(&[("key", json!("toggle"))]))
        .await?;
    writer
        .request(
            wire::CMD_WRITE_KEY,
            params(&[("key", json!("toggle")), ("data", json!("second"))]),
        )
        .await?;
    // Barrier: once this ack is in, the second write's fan-out has run.
    subscriber.request(wire::CMD_VERSION, Map::new()).await?;
    assert!(pushes.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn disconnected_subscriber_is_purged() -> Result<()> {
    let (handle, registry) = start_hub(HubOptions::default());
    let subscriber = test_client(&handle).await;
    let writer = test_client(&handle).await;

    subscriber.subscribe_key("ghost").await?;
    let ghost_uid = subscriber.uid();
    subscriber.close().await;

    // Departure events race with commands from other clients, so poll for
    // the record to vanish instead of asserting immediately.
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while registry.contains(ghost_uid).await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "subscriber was never purged"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Writing to the key the ghost watched neither errors nor wedges.
    writer
        .request(
            wire::CMD_WRITE_KEY,
            params(&[("key", json!("ghost")), ("data", json!("v"))]),
        )
        .await?;
    let value = writer
        .request(wire::CMD_READ_KEY, params(&[("key", json!("ghost"))]))
        .await?;
    assert_eq!(value, Some(json!("v")));
    Ok(())
}

#[tokio::test]
async fn namespaces_isolate_clients() -> Result<()> {
    let (handle, _) = start_hub(HubOptions::default());
    let alpha = LocalClient::connect(
        handle.clone(),
        ClientOptions {
            namespace: "@alpha/".to_string(),
        },
    )
    .await?;
    let beta = LocalClient::connect(
        handle.clone(),
        ClientOptions {
            namespace: "@beta/".to_string(),
        },
    )
    .await?;
    alpha.wait().await;
    beta.wait().await;

    alpha
        .request(
            wire::CMD_WRITE_KEY,
            params(&[("key", json!("shared-name")), ("data", json!("alpha-value"))]),
        )
        .await?;

    let seen_by_beta = beta
        .request(wire::CMD_READ_KEY, params(&[("key", json!("shared-name"))]))
        .await?;
    assert_eq!(seen_by_beta, Some(json!("")));

    let listed = beta
        .request(wire::CMD_LIST_KEYS, Map::new())
        .await?;
    assert_eq!(listed, Some(json!([])));
    Ok(())
}

#[tokio::test]
async fn missing_parameters_are_rejected() -> Result<()> {
    let (handle, _) = start_hub(HubOptions::default());
    let client = test_client(&handle).await;

    let commands = [
        wire::CMD_READ_KEY,
        wire::CMD_READ_BULK,
        wire::CMD_READ_PREFIX,
        wire::CMD_WRITE_KEY,
        wire::CMD_SUBSCRIBE_KEY,
        wire::CMD_SUBSCRIBE_PREFIX,
        wire::CMD_UNSUBSCRIBE_KEY,
        wire::CMD_UNSUBSCRIBE_PREFIX,
    ];
    for command in commands {
        let result = client
            .request(command, params(&[("@dingus", json!("bogus"))]))
            .await;
        expect_broker_error(result, wire::ErrCode::MissingParam);
    }
    Ok(())
}

#[tokio::test]
async fn wrong_parameter_types_are_rejected() -> Result<()> {
    let (handle, _) = start_hub(HubOptions::default());
    let client = test_client(&handle).await;

    let cases: Vec<(&str, Map<String, Value>)> = vec![
        (wire::CMD_READ_KEY, params(&[("key", json!(1234))])),
        (wire::CMD_READ_BULK, params(&[("keys", json!(1234))])),
        (wire::CMD_READ_BULK, params(&[("keys", json!(["ok", 1234]))])),
        (wire::CMD_READ_PREFIX, params(&[("prefix", json!(1234))])),
        (
            wire::CMD_WRITE_KEY,
            params(&[("key", json!(1234)), ("data", json!(1234))]),
        ),
        (wire::CMD_SUBSCRIBE_KEY, params(&[("key", json!(1234))])),
        (wire::CMD_SUBSCRIBE_PREFIX, params(&[("prefix", json!(1234))])),
        (wire::CMD_UNSUBSCRIBE_KEY, params(&[("key", json!(1234))])),
        (
            wire::CMD_UNSUBSCRIBE_PREFIX,
            params(&[("prefix", json!(1234))]),
        ),
    ];
    for (command, data) in cases {
        let result = client.request(command, data).await;
        expect_broker_error(result, wire::ErrCode::MissingParam);
    }

    // Bulk writes treat the whole data object as payload, so a bad value
    // is a format error instead.
    let result = client
        .request(wire::CMD_WRITE_BULK, params(&[("test", json!(1234))]))
        .await;
    expect_broker_error(result, wire::ErrCode::InvalidFmt);
    Ok(())
}

fn solve_challenge(password: &str, data: &Value) -> String {
    let challenge = STANDARD
        .decode(data["challenge"].as_str().expect("challenge"))
        .expect("challenge b64");
    let salt = STANDARD
        .decode(data["salt"].as_str().expect("salt"))
        .expect("salt b64");
    let mut key = password.as_bytes().to_vec();
    key.extend_from_slice(&salt);
    let mut mac = Hmac::<Sha256>::new_from_slice(&key).expect("hmac key");
    mac.update(&challenge);
    STANDARD.encode(mac.finalize().into_bytes())
}

#[tokio::test]
async fn password_gates_data_commands() -> Result<()> {
    const PASSWORD: &str = "test";
    let (handle, registry) = start_hub(HubOptions {
        password: PASSWORD.to_string(),
    });
    let client = test_client(&handle).await;

    // Data commands are refused before authentication.
    let result = client
        .request(wire::CMD_READ_KEY, params(&[("key", json!("x"))]))
        .await;
    expect_broker_error(result, wire::ErrCode::AuthRequired);

    // Answering out of order is its own error.
    let result = client
        .request(
            wire::CMD_AUTH_CHALLENGE,
            params(&[("hash", json!(STANDARD.encode([0u8; 32])))]),
        )
        .await;
    expect_broker_error(result, wire::ErrCode::AuthNotInit);

    let challenge = client
        .request(wire::CMD_AUTH_REQUEST, Map::new())
        .await?
        .expect("challenge data");

    // A wrong answer leaves the challenge standing.
    let result = client
        .request(
            wire::CMD_AUTH_CHALLENGE,
            params(&[("hash", json!(solve_challenge("wrong", &challenge)))]),
        )
        .await;
    expect_broker_error(result, wire::ErrCode::AuthFailed);
    assert!(!registry.authenticated(client.uid()).await);

    client
        .request(
            wire::CMD_AUTH_CHALLENGE,
            params(&[("hash", json!(solve_challenge(PASSWORD, &challenge)))]),
        )
        .await?;
    assert!(registry.authenticated(client.uid()).await);

    let value = client
        .request(wire::CMD_READ_KEY, params(&[("key", json!("x"))]))
        .await?;
    assert_eq!(value, Some(json!("")));
    Ok(())
}

#[tokio::test]
async fn reissued_challenge_supersedes_the_old_one() -> Result<()> {
    const PASSWORD: &str = "test";
    let (handle, _) = start_hub(HubOptions {
        password: PASSWORD.to_string(),
    });
    let client = test_client(&handle).await;

    let first = client
        .request(wire::CMD_AUTH_REQUEST, Map::new())
        .await?
        .expect("challenge");
    let second = client
        .request(wire::CMD_AUTH_REQUEST, Map::new())
        .await?
        .expect("challenge");

    // An answer to the superseded challenge fails...
    let result = client
        .request(
            wire::CMD_AUTH_CHALLENGE,
            params(&[("hash", json!(solve_challenge(PASSWORD, &first)))]),
        )
        .await;
    expect_broker_error(result, wire::ErrCode::AuthFailed);

    // ...while the latest one authenticates.
    client
        .request(
            wire::CMD_AUTH_CHALLENGE,
            params(&[("hash", json!(solve_challenge(PASSWORD, &second)))]),
        )
        .await?;
    let value = client
        .request(wire::CMD_READ_KEY, params(&[("key", json!("x"))]))
        .await?;
    assert_eq!(value, Some(json!("")));
    Ok(())
}

#[tokio::test]
async fn duplicate_subscriptions_survive_one_unsubscribe() -> Result<()> {
    let (handle, _) = start_hub(HubOptions::default());
    let subscriber = test_client(&handle).await;
    let writer = test_client(&handle).await;

    let mut first = subscriber.subscribe_key("dup").await?;
    let mut second = subscriber.subscribe_key("dup").await?;
    subscriber.unsubscribe_key("dup").await?;

    writer
        .request(
            wire::CMD_WRITE_KEY,
            params(&[("key", json!("dup")), ("data", json!("still-on"))]),
        )
        .await?;

    // One subscription entry remains in the broker, so a push arrives.
    // The client-side route for the first receiver was removed by the
    // unsubscribe; the second still routes.
    let push = timeout(RECV_TIMEOUT, second.recv())
        .await
        .expect("push in time")
        .expect("push");
    assert_eq!(push.new_value, "still-on");
    assert!(first.try_recv().is_err());
    Ok(())
}
