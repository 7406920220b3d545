use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mcr_client::{
    CasOutcome, Client, ClientConfig, ClientError, Endpoint, EndpointHealth, Expiry,
    StoreOutcome, Verb,
};
use mcr_common::MAX_VALUE_SIZE;
use mcr_stub::StubServer;

fn config_for(stubs: &[&StubServer]) -> ClientConfig {
    ClientConfig::builder()
        .endpoints(stubs.iter().map(|stub| stub.endpoint()))
        .io_timeout(Duration::from_millis(250))
        .connect_timeout(Duration::from_millis(250))
        .build()
}

fn client_for(stubs: &[&StubServer]) -> Client {
    Client::new(config_for(stubs)).expect("client")
}

fn endpoint_of(stub: &StubServer) -> Endpoint {
    stub.endpoint().parse().expect("endpoint")
}

#[test]
fn two_endpoint_set_get_delete() {
    let a = StubServer::start().expect("stub a");
    let b = StubServer::start().expect("stub b");
    let client = client_for(&[&a, &b]);

    client.set("k1", b"v1", 0, Expiry::Never).unwrap();
    let owner = client.route("k1").unwrap();
    let (owning, other) = if owner == endpoint_of(&a) { (&a, &b) } else { (&b, &a) };
    assert_eq!(owning.item_count(), 1);
    assert_eq!(other.item_count(), 0);

    let value = client.get("k1").unwrap().expect("stored value");
    assert_eq!(value.data, b"v1");
    assert_eq!(value.cas, None);

    assert!(client.delete("k1").unwrap());
    assert_eq!(client.get("k1").unwrap(), None);
    assert!(!client.delete("k1").unwrap());
}

#[test]
fn round_trips_flags_and_max_size_value() {
    let stub = StubServer::start().expect("stub");
    let client = client_for(&[&stub]);

    // Payload bytes include CRLF so framing must rely on the length field.
    let payload: Vec<u8> = (0..MAX_VALUE_SIZE).map(|i| b"ab\r\n"[i % 4]).collect();
    client.set("big", &payload, 0xdead_beef, Expiry::Never).unwrap();
    let value = client.get("big").unwrap().expect("stored value");
    assert_eq!(value.flags, 0xdead_beef);
    assert_eq!(value.data.len(), MAX_VALUE_SIZE);
    assert!(value.data == payload);

    client.set("empty", b"", 0, Expiry::Never).unwrap();
    assert_eq!(client.get("empty").unwrap().unwrap().data, b"");
}

#[test]
fn large_multi_get_completes_within_default_timeout() {
    let stub = StubServer::start().expect("stub");
    let client = Client::new(ClientConfig::builder().endpoints([stub.endpoint()]).build()).unwrap();
    let endpoint = endpoint_of(&stub);

    let keys: Vec<String> = (0..16).map(|idx| format!("blob:{idx}")).collect();
    for (idx, key) in keys.iter().enumerate() {
        let payload = vec![b'a' + idx as u8; MAX_VALUE_SIZE];
        client.set(key, &payload, idx as u32, Expiry::Never).unwrap();
    }

    let result = client.get_multi(&keys).unwrap();
    assert!(result.is_complete(), "{:?}", result.errors);
    assert_eq!(result.values.len(), keys.len());
    for (idx, key) in keys.iter().enumerate() {
        let value = result.get(key).expect("value present");
        assert_eq!(value.flags, idx as u32);
        assert_eq!(value.data.len(), MAX_VALUE_SIZE);
        assert!(value.data.iter().all(|&b| b == b'a' + idx as u8));
    }
    assert_eq!(stub.stats().requests(Verb::Get), 1);
    assert_eq!(client.endpoint_health(&endpoint), Some(EndpointHealth::Healthy));
}

#[test]
fn past_absolute_expiry_is_already_expired() {
    let stub = StubServer::start().expect("stub");
    let client = client_for(&[&stub]);

    let long_ago = std::time::UNIX_EPOCH + Duration::from_secs(1);
    client.set("gone", b"v", 0, Expiry::At(long_ago)).unwrap();
    assert_eq!(client.get("gone").unwrap(), None);
}

#[test]
fn values_expire_after_ttl() {
    let stub = StubServer::start().expect("stub");
    let client = client_for(&[&stub]);

    client.set("short", b"lived", 0, Expiry::from_secs(1)).unwrap();
    client.set("long", b"lived", 0, Expiry::Never).unwrap();
    assert!(client.get("short").unwrap().is_some());

    thread::sleep(Duration::from_millis(1500));
    assert_eq!(client.get("short").unwrap(), None);
    assert!(client.get("long").unwrap().is_some());
}

#[test]
fn timed_out_connection_is_never_reused() {
    let stub = StubServer::start().expect("stub");
    let client = client_for(&[&stub]);
    let endpoint = endpoint_of(&stub);

    client.set("k", b"v", 0, Expiry::Never).unwrap();
    assert_eq!(stub.stats().connections_accepted, 1);

    stub.set_stall(true);
    match client.get("k") {
        Err(ClientError::EndpointUnavailable {
            endpoint: failed,
            attempts,
            last,
        }) => {
            assert_eq!(failed, endpoint);
            assert_eq!(attempts, 2);
            assert!(matches!(*last, ClientError::Timeout { .. }), "{last}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.endpoint_health(&endpoint), Some(EndpointHealth::Suspected));
    // The stalled socket plus the one opened for the retry.
    assert_eq!(stub.stats().connections_accepted, 2);

    stub.set_stall(false);
    assert_eq!(client.get("k").unwrap().unwrap().data, b"v");
    assert_eq!(stub.stats().connections_accepted, 3);
    assert_eq!(client.endpoint_health(&endpoint), Some(EndpointHealth::Healthy));

    let stats = client.pool_stats(&endpoint).unwrap();
    assert_eq!(stats.opened, 3);
    assert_eq!(stats.discarded, 2);
    assert_eq!(stats.idle, 1);
}

#[test]
fn timeout_mid_response_retries_on_a_new_connection() {
    let stub = StubServer::start().expect("stub");
    let client = client_for(&[&stub]);
    let endpoint = endpoint_of(&stub);

    client.set("k", b"a value long enough to split", 4, Expiry::Never).unwrap();
    assert_eq!(stub.stats().connections_accepted, 1);

    // Half of the VALUE block arrives, then the socket goes silent.
    stub.truncate_next(1);
    let value = client.get("k").unwrap().expect("stored value");
    assert_eq!(value.data, b"a value long enough to split");
    assert_eq!(value.flags, 4);

    assert_eq!(stub.stats().requests(Verb::Get), 2);
    assert_eq!(stub.stats().connections_accepted, 2);
    let stats = client.pool_stats(&endpoint).unwrap();
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(client.endpoint_health(&endpoint), Some(EndpointHealth::Healthy));
}

#[test]
fn protocol_error_is_not_retried_and_discards_connection() {
    let stub = StubServer::start().expect("stub");
    let client = client_for(&[&stub]);
    let endpoint = endpoint_of(&stub);

    stub.garble_next(1);
    let err = client.delete("k").unwrap_err();
    assert!(matches!(err, ClientError::Protocol { .. }), "{err}");
    assert_eq!(stub.stats().requests(Verb::Delete), 1);

    let stats = client.pool_stats(&endpoint).unwrap();
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.idle, 0);
    assert_eq!(client.endpoint_health(&endpoint), Some(EndpointHealth::Healthy));

    assert!(!client.delete("k").unwrap());
    assert_eq!(stub.stats().connections_accepted, 2);
}

#[test]
fn repeated_exhaustion_marks_endpoint_down() {
    let stub = StubServer::start().expect("stub");
    let config = ClientConfig::builder()
        .endpoints([stub.endpoint()])
        .io_timeout(Duration::from_millis(100))
        .retry_count(0)
        .down_after(2)
        .build();
    let client = Client::new(config).unwrap();
    let endpoint = endpoint_of(&stub);

    stub.set_stall(true);
    assert!(client.get("k").is_err());
    assert_eq!(client.endpoint_health(&endpoint), Some(EndpointHealth::Suspected));
    assert!(client.get("k").is_err());
    assert_eq!(client.endpoint_health(&endpoint), Some(EndpointHealth::Down));

    // Down is advisory: the key still routes to the same endpoint.
    assert_eq!(client.route("k").unwrap(), endpoint);
    stub.set_stall(false);
    assert_eq!(client.get("k").unwrap(), None);
    assert_eq!(client.endpoint_health(&endpoint), Some(EndpointHealth::Healthy));
}

#[test]
fn broken_connection_is_retried_once() {
    let stub = StubServer::start().expect("stub");
    let client = client_for(&[&stub]);
    let endpoint = endpoint_of(&stub);

    client.set("k", b"v", 0, Expiry::Never).unwrap();
    stub.fail_next(1);
    assert_eq!(client.get("k").unwrap().unwrap().data, b"v");

    let stats = stub.stats();
    assert_eq!(stats.connections_accepted, 2);
    assert_eq!(stats.requests(Verb::Get), 2);
    assert_eq!(client.endpoint_health(&endpoint), Some(EndpointHealth::Healthy));
}

#[test]
fn retries_are_bounded_by_retry_count() {
    let stub = StubServer::start().expect("stub");
    let client = client_for(&[&stub]);

    client.set("k", b"v", 0, Expiry::Never).unwrap();
    stub.fail_next(2);
    assert!(matches!(
        client.get("k"),
        Err(ClientError::EndpointUnavailable { attempts: 2, .. })
    ));
    assert_eq!(stub.stats().requests(Verb::Get), 2);
}

#[test]
fn get_multi_sends_one_batch_per_endpoint() {
    let a = StubServer::start().expect("stub a");
    let b = StubServer::start().expect("stub b");
    let client = client_for(&[&a, &b]);

    let keys: Vec<String> = (0..40).map(|i| format!("key-{i}")).collect();
    for key in &keys {
        client.set(key, key.as_bytes(), 0, Expiry::Never).unwrap();
    }

    let mut lookup = keys.clone();
    lookup.push("missing".to_string());
    lookup.push(keys[0].clone());
    let result = client.get_multi(&lookup).unwrap();

    assert!(result.is_complete());
    assert_eq!(result.values.len(), keys.len());
    for key in &keys {
        assert_eq!(result.get(key).unwrap().data, key.as_bytes());
    }
    assert!(result.get("missing").is_none());

    let mut owned: HashMap<Endpoint, usize> = HashMap::new();
    for key in &keys {
        *owned.entry(client.route(key).unwrap()).or_default() += 1;
    }
    for stub in [&a, &b] {
        let expected = u64::from(owned.contains_key(&endpoint_of(stub)));
        assert_eq!(stub.stats().requests(Verb::Get), expected);
    }
}

#[test]
fn get_multi_reports_failed_endpoint_without_failing() {
    let a = StubServer::start().expect("stub a");
    let mut b = StubServer::start().expect("stub b");
    let client = client_for(&[&a, &b]);
    let b_endpoint = endpoint_of(&b);

    let keys: Vec<String> = (0..40).map(|i| format!("key-{i}")).collect();
    for key in &keys {
        client.set(key, b"x", 0, Expiry::Never).unwrap();
    }
    b.stop();

    let result = client.get_multi(&keys).unwrap();
    assert!(!result.is_complete());
    assert_eq!(result.errors.len(), 1);
    let (failed, err) = &result.errors[0];
    assert_eq!(failed, &b_endpoint);
    assert!(matches!(err, ClientError::EndpointUnavailable { .. }), "{err}");

    for key in &keys {
        let on_b = client.route(key).unwrap() == b_endpoint;
        assert_eq!(result.get(key).is_some(), !on_b, "{key}");
    }
    assert_eq!(client.endpoint_health(&b_endpoint), Some(EndpointHealth::Suspected));
}

#[test]
fn get_multi_rejects_invalid_key() {
    let stub = StubServer::start().expect("stub");
    let client = client_for(&[&stub]);
    assert!(matches!(
        client.get_multi(["ok", "not ok"]),
        Err(ClientError::InvalidKey(_))
    ));
    assert_eq!(stub.stats().requests_total(), 0);
}

#[test]
fn counters_increment_and_decrement() {
    let stub = StubServer::start().expect("stub");
    let client = client_for(&[&stub]);

    client.set("n", b"10", 0, Expiry::Never).unwrap();
    assert_eq!(client.increment("n", 5).unwrap(), Some(15));
    assert_eq!(client.decrement("n", 20).unwrap(), Some(0));
    assert_eq!(client.increment("missing", 1).unwrap(), None);
    assert_eq!(client.get("n").unwrap().unwrap().data, b"0");
}

#[test]
fn cas_detects_concurrent_updates() {
    let stub = StubServer::start().expect("stub");
    let client = client_for(&[&stub]);

    client.set("doc", b"v1", 3, Expiry::Never).unwrap();
    let token = client.gets("doc").unwrap().unwrap().cas.expect("cas token");

    assert_eq!(
        client.cas("doc", b"v2", 3, Expiry::Never, token).unwrap(),
        CasOutcome::Stored
    );
    assert_eq!(
        client.cas("doc", b"v3", 3, Expiry::Never, token).unwrap(),
        CasOutcome::Exists
    );
    assert_eq!(
        client.cas("gone", b"v", 0, Expiry::Never, token).unwrap(),
        CasOutcome::NotFound
    );
    assert_eq!(client.get("doc").unwrap().unwrap().data, b"v2");
}

#[test]
fn conditional_stores_report_outcome() {
    let stub = StubServer::start().expect("stub");
    let client = client_for(&[&stub]);

    assert_eq!(client.replace("k", b"x", 0, Expiry::Never).unwrap(), StoreOutcome::NotStored);
    assert_eq!(client.add("k", b"b", 0, Expiry::Never).unwrap(), StoreOutcome::Stored);
    assert_eq!(client.add("k", b"z", 0, Expiry::Never).unwrap(), StoreOutcome::NotStored);
    assert_eq!(client.append("k", b"c").unwrap(), StoreOutcome::Stored);
    assert_eq!(client.prepend("k", b"a").unwrap(), StoreOutcome::Stored);
    assert_eq!(client.get("k").unwrap().unwrap().data, b"abc");
    assert_eq!(client.replace("k", b"new", 0, Expiry::Never).unwrap(), StoreOutcome::Stored);
    assert_eq!(client.append("missing", b"c").unwrap(), StoreOutcome::NotStored);
}

#[test]
fn touch_version_and_flush() {
    let a = StubServer::start().expect("stub a");
    let b = StubServer::start().expect("stub b");
    let client = client_for(&[&a, &b]);

    client.set("k", b"v", 0, Expiry::from_secs(1)).unwrap();
    assert!(client.touch("k", Expiry::Never).unwrap());
    assert!(!client.touch("missing", Expiry::Never).unwrap());
    thread::sleep(Duration::from_millis(1200));
    assert!(client.get("k").unwrap().is_some());

    let versions = client.version().unwrap();
    assert_eq!(versions.len(), 2);
    assert!(versions.iter().all(|(_, version)| version.starts_with("mcr-stub")));

    client.flush_all().unwrap();
    assert_eq!(client.get("k").unwrap(), None);
}

#[test]
fn shared_client_across_threads() {
    let a = StubServer::start().expect("stub a");
    let b = StubServer::start().expect("stub b");
    let config = ClientConfig::builder()
        .endpoints([a.endpoint(), b.endpoint()])
        .max_connections(2)
        .build();
    let client = Arc::new(Client::new(config).unwrap());

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                for i in 0..50 {
                    let key = format!("w{worker}-{i}");
                    client.set(&key, key.as_bytes(), 0, Expiry::Never).unwrap();
                    assert_eq!(client.get(&key).unwrap().unwrap().data, key.as_bytes());
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    for endpoint in client.endpoints() {
        let stats = client.pool_stats(&endpoint).unwrap();
        assert!(stats.opened <= 2, "{endpoint}: {stats:?}");
        assert_eq!(stats.in_use, 0);
    }
    assert_eq!(a.item_count() + b.item_count(), 200);
}

#[test]
fn reaper_closes_idle_connections() {
    let stub = StubServer::start().expect("stub");
    let config = ClientConfig::builder()
        .endpoints([stub.endpoint()])
        .idle_timeout(Duration::from_millis(50))
        .reap_interval(Duration::from_millis(20))
        .build();
    let client = Client::new(config).unwrap();
    let endpoint = endpoint_of(&stub);

    client.set("k", b"v", 0, Expiry::Never).unwrap();
    assert_eq!(client.pool_stats(&endpoint).unwrap().idle, 1);

    thread::sleep(Duration::from_millis(300));
    let stats = client.pool_stats(&endpoint).unwrap();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.reaped, 1);

    // A reaped pool simply opens a new connection.
    assert!(client.get("k").unwrap().is_some());
    assert_eq!(stub.stats().connections_accepted, 2);
}

#[test]
fn added_endpoint_takes_over_some_keys() {
    let a = StubServer::start().expect("stub a");
    let b = StubServer::start().expect("stub b");
    let client = client_for(&[&a]);

    let keys: Vec<String> = (0..200).map(|i| format!("key-{i}")).collect();
    let before: Vec<Endpoint> = keys.iter().map(|key| client.route(key).unwrap()).collect();

    assert!(client.add_endpoint(&b.endpoint()).unwrap());
    let b_endpoint = endpoint_of(&b);
    let mut moved = 0;
    for (key, old) in keys.iter().zip(before) {
        let new = client.route(key).unwrap();
        if new != old {
            assert_eq!(new, b_endpoint);
            moved += 1;
        }
    }
    assert!(moved > 0 && moved < keys.len());

    client.set("key-0", b"v", 0, Expiry::Never).unwrap();
    assert_eq!(client.get("key-0").unwrap().unwrap().data, b"v");
}

#[test]
fn close_releases_connections() {
    let stub = StubServer::start().expect("stub");
    let client = client_for(&[&stub]);
    client.set("k", b"v", 0, Expiry::Never).unwrap();
    client.close();

    assert!(matches!(client.set("k", b"v", 0, Expiry::Never), Err(ClientError::ClientClosed)));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(stub.stats().connections_open, 0);
}
