// Command handlers. Each runs to completion inside the dispatcher, so a
// handler's response and the pushes it triggers are queued before the hub
// looks at the next event.
use crate::auth;
use crate::hub::Hub;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use keybus_storage::StorageError;
use keybus_wire::{self as wire, ErrCode, Request};
use serde_json::{Map, Value, json};
use std::collections::HashMap;

pub(crate) async fn dispatch(hub: &mut Hub, uid: u64, request: Request) {
    match request.command.as_str() {
        wire::CMD_VERSION => proto_version(hub, uid, &request).await,
        wire::CMD_CLIENT_ID => client_id(hub, uid, &request).await,
        wire::CMD_READ_KEY => read_key(hub, uid, &request).await,
        wire::CMD_READ_BULK => read_bulk(hub, uid, &request).await,
        wire::CMD_READ_PREFIX => read_prefix(hub, uid, &request).await,
        wire::CMD_WRITE_KEY => write_key(hub, uid, &request).await,
        wire::CMD_WRITE_BULK => write_bulk(hub, uid, &request).await,
        wire::CMD_REMOVE_KEY => remove_key(hub, uid, &request).await,
        wire::CMD_LIST_KEYS => list_keys(hub, uid, &request).await,
        wire::CMD_SUBSCRIBE_KEY => subscribe_key(hub, uid, &request).await,
        wire::CMD_UNSUBSCRIBE_KEY => unsubscribe_key(hub, uid, &request).await,
        wire::CMD_SUBSCRIBE_PREFIX => subscribe_prefix(hub, uid, &request).await,
        wire::CMD_UNSUBSCRIBE_PREFIX => unsubscribe_prefix(hub, uid, &request).await,
        wire::CMD_AUTH_REQUEST => auth_request(hub, uid, &request).await,
        wire::CMD_AUTH_CHALLENGE => auth_challenge(hub, uid, &request).await,
        other => {
            hub.send_error(
                uid,
                ErrCode::UnknownCmd,
                format!("command \"{other}\" is mistyped or not supported"),
                &request.request_id,
            )
            .await;
        }
    }
}

fn str_param<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.data.get(name).and_then(Value::as_str)
}

fn strip_namespace(key: &str, namespace: &str) -> String {
    key.strip_prefix(namespace).unwrap_or(key).to_string()
}

async fn proto_version(hub: &mut Hub, uid: u64, request: &Request) {
    hub.respond(uid, &request.request_id, Some(json!(wire::PROTO_VERSION)))
        .await;
}

async fn client_id(hub: &mut Hub, uid: u64, request: &Request) {
    hub.respond(uid, &request.request_id, Some(json!(uid.to_string())))
        .await;
}

async fn read_key(hub: &mut Hub, uid: u64, request: &Request) {
    if !hub.require_auth(uid, &request.request_id).await {
        return;
    }
    let Some(key) = str_param(request, "key") else {
        hub.send_error(
            uid,
            ErrCode::MissingParam,
            "invalid or missing 'key' parameter",
            &request.request_id,
        )
        .await;
        return;
    };

    let namespace = hub.namespace(uid).await;
    let real_key = format!("{namespace}{key}");
    match hub.backend.get(&real_key) {
        Ok(value) => {
            tracing::debug!(client = uid, key = %real_key, "get key");
            hub.respond(uid, &request.request_id, Some(Value::String(value)))
                .await;
        }
        // Absent keys read as empty strings, not as errors.
        Err(StorageError::NotFound) => {
            tracing::debug!(client = uid, key = %real_key, "get for non-existent key");
            hub.respond(uid, &request.request_id, Some(Value::String(String::new())))
                .await;
        }
        Err(err) => {
            hub.send_error(uid, ErrCode::ServerError, err.to_string(), &request.request_id)
                .await;
        }
    }
}

async fn read_bulk(hub: &mut Hub, uid: u64, request: &Request) {
    if !hub.require_auth(uid, &request.request_id).await {
        return;
    }
    let Some(keys) = request.data.get("keys").and_then(Value::as_array) else {
        hub.send_error(
            uid,
            ErrCode::MissingParam,
            "invalid or missing 'keys' parameter",
            &request.request_id,
        )
        .await;
        return;
    };

    let namespace = hub.namespace(uid).await;
    let mut real_keys = Vec::with_capacity(keys.len());
    for entry in keys {
        let Some(key) = entry.as_str() else {
            hub.send_error(
                uid,
                ErrCode::MissingParam,
                "invalid entry in 'keys' parameter",
                &request.request_id,
            )
            .await;
            return;
        };
        real_keys.push(format!("{namespace}{key}"));
    }

    match hub.backend.get_bulk(&real_keys) {
        Ok(results) => {
            let out: Map<String, Value> = results
                .into_iter()
                .map(|(key, value)| (strip_namespace(&key, &namespace), Value::String(value)))
                .collect();
            tracing::debug!(client = uid, keys = ?real_keys, "get multi key");
            hub.respond(uid, &request.request_id, Some(Value::Object(out)))
                .await;
        }
        Err(err) => {
            hub.send_error(uid, ErrCode::ServerError, err.to_string(), &request.request_id)
                .await;
        }
    }
}

async fn read_prefix(hub: &mut Hub, uid: u64, request: &Request) {
    if !hub.require_auth(uid, &request.request_id).await {
        return;
    }
    let Some(prefix) = str_param(request, "prefix") else {
        hub.send_error(
            uid,
            ErrCode::MissingParam,
            "invalid or missing 'prefix' parameter",
            &request.request_id,
        )
        .await;
        return;
    };

    let namespace = hub.namespace(uid).await;
    let real_prefix = format!("{namespace}{prefix}");
    match hub.backend.get_prefix(&real_prefix) {
        Ok(results) => {
            let out: Map<String, Value> = results
                .into_iter()
                .map(|(key, value)| (strip_namespace(&key, &namespace), Value::String(value)))
                .collect();
            tracing::debug!(client = uid, prefix, "get all (prefix)");
            hub.respond(uid, &request.request_id, Some(Value::Object(out)))
                .await;
        }
        Err(err) => {
            hub.send_error(uid, ErrCode::ServerError, err.to_string(), &request.request_id)
                .await;
        }
    }
}

async fn write_key(hub: &mut Hub, uid: u64, request: &Request) {
    if !hub.require_auth(uid, &request.request_id).await {
        return;
    }
    let Some(key) = str_param(request, "key") else {
        hub.send_error(
            uid,
            ErrCode::MissingParam,
            "invalid or missing 'key' parameter",
            &request.request_id,
        )
        .await;
        return;
    };
    let Some(data) = str_param(request, "data") else {
        hub.send_error(
            uid,
            ErrCode::MissingParam,
            "invalid or missing 'data' parameter",
            &request.request_id,
        )
        .await;
        return;
    };

    let namespace = hub.namespace(uid).await;
    let real_key = format!("{namespace}{key}");
    if let Err(err) = hub.backend.set(&real_key, data) {
        hub.send_error(uid, ErrCode::ServerError, err.to_string(), &request.request_id)
            .await;
        return;
    }
    // Ack first so the writer's own connection sees it ahead of any push.
    hub.respond(uid, &request.request_id, None).await;
    hub.key_changed(&real_key, data).await;
    tracing::debug!(client = uid, key = %real_key, "modified key");
}

async fn write_bulk(hub: &mut Hub, uid: u64, request: &Request) {
    if !hub.require_auth(uid, &request.request_id).await {
        return;
    }

    // The whole data object is the key/value payload here, which is why a
    // non-string value is a format error rather than a missing parameter.
    let namespace = hub.namespace(uid).await;
    let mut entries = HashMap::with_capacity(request.data.len());
    for (key, value) in &request.data {
        let Some(text) = value.as_str() else {
            hub.send_error(
                uid,
                ErrCode::InvalidFmt,
                format!("invalid value for key \"{key}\""),
                &request.request_id,
            )
            .await;
            return;
        };
        entries.insert(format!("{namespace}{key}"), text.to_string());
    }

    if let Err(err) = hub.backend.set_bulk(&entries) {
        hub.send_error(uid, ErrCode::ServerError, err.to_string(), &request.request_id)
            .await;
        return;
    }
    hub.respond(uid, &request.request_id, None).await;
    for (key, value) in &entries {
        hub.key_changed(key, value).await;
    }
    tracing::debug!(client = uid, "bulk modify keys");
}

async fn remove_key(hub: &mut Hub, uid: u64, request: &Request) {
    if !hub.require_auth(uid, &request.request_id).await {
        return;
    }
    let Some(key) = str_param(request, "key") else {
        hub.send_error(
            uid,
            ErrCode::MissingParam,
            "invalid or missing 'key' parameter",
            &request.request_id,
        )
        .await;
        return;
    };

    let namespace = hub.namespace(uid).await;
    let real_key = format!("{namespace}{key}");
    if let Err(err) = hub.backend.delete(&real_key) {
        hub.send_error(uid, ErrCode::ServerError, err.to_string(), &request.request_id)
            .await;
        return;
    }
    hub.respond(uid, &request.request_id, None).await;
    // Deletion notifies as a write of the empty string.
    hub.key_changed(&real_key, "").await;
    tracing::debug!(client = uid, key = %real_key, "removed key");
}

async fn list_keys(hub: &mut Hub, uid: u64, request: &Request) {
    if !hub.require_auth(uid, &request.request_id).await {
        return;
    }
    // Prefix is optional; a missing or malformed value lists everything.
    let prefix = str_param(request, "prefix").unwrap_or_default();

    let namespace = hub.namespace(uid).await;
    match hub.backend.list(&format!("{namespace}{prefix}")) {
        Ok(keys) => {
            // Note: list results keep their namespace, unlike bulk reads.
            let out: Vec<Value> = keys.into_iter().map(Value::String).collect();
            tracing::debug!(client = uid, prefix, "list keys");
            hub.respond(uid, &request.request_id, Some(Value::Array(out)))
                .await;
        }
        Err(err) => {
            hub.send_error(uid, ErrCode::ServerError, err.to_string(), &request.request_id)
                .await;
        }
    }
}

async fn subscribe_key(hub: &mut Hub, uid: u64, request: &Request) {
    if !hub.require_auth(uid, &request.request_id).await {
        return;
    }
    let Some(key) = str_param(request, "key") else {
        hub.send_error(
            uid,
            ErrCode::MissingParam,
            "invalid or missing 'key' parameter",
            &request.request_id,
        )
        .await;
        return;
    };

    let namespace = hub.namespace(uid).await;
    let real_key = format!("{namespace}{key}");
    hub.subscriptions.subscribe_key(uid, &real_key);
    tracing::debug!(client = uid, key = %real_key, "subscribed to key");
    hub.respond(uid, &request.request_id, None).await;
}

async fn unsubscribe_key(hub: &mut Hub, uid: u64, request: &Request) {
    if !hub.require_auth(uid, &request.request_id).await {
        return;
    }
    let Some(key) = str_param(request, "key") else {
        hub.send_error(
            uid,
            ErrCode::MissingParam,
            "invalid or missing 'key' parameter",
            &request.request_id,
        )
        .await;
        return;
    };

    let namespace = hub.namespace(uid).await;
    let real_key = format!("{namespace}{key}");
    hub.subscriptions.unsubscribe_key(uid, &real_key);
    tracing::debug!(client = uid, key = %real_key, "unsubscribed from key");
    hub.respond(uid, &request.request_id, None).await;
}

async fn subscribe_prefix(hub: &mut Hub, uid: u64, request: &Request) {
    if !hub.require_auth(uid, &request.request_id).await {
        return;
    }
    let Some(prefix) = str_param(request, "prefix") else {
        hub.send_error(
            uid,
            ErrCode::MissingParam,
            "invalid or missing 'prefix' parameter",
            &request.request_id,
        )
        .await;
        return;
    };

    let namespace = hub.namespace(uid).await;
    let real_prefix = format!("{namespace}{prefix}");
    hub.subscriptions.subscribe_prefix(uid, &real_prefix);
    tracing::debug!(client = uid, prefix = %real_prefix, "subscribed to prefix");
    hub.respond(uid, &request.request_id, None).await;
}

async fn unsubscribe_prefix(hub: &mut Hub, uid: u64, request: &Request) {
    if !hub.require_auth(uid, &request.request_id).await {
        return;
    }
    let Some(prefix) = str_param(request, "prefix") else {
        hub.send_error(
            uid,
            ErrCode::MissingParam,
            "invalid or missing 'prefix' parameter",
            &request.request_id,
        )
        .await;
        return;
    };

    let namespace = hub.namespace(uid).await;
    let real_prefix = format!("{namespace}{prefix}");
    hub.subscriptions.unsubscribe_prefix(uid, &real_prefix);
    tracing::debug!(client = uid, prefix = %real_prefix, "unsubscribed from prefix");
    hub.respond(uid, &request.request_id, None).await;
}

async fn auth_request(hub: &mut Hub, uid: u64, request: &Request) {
    let challenge = auth::generate();
    hub.registry.set_challenge(uid, challenge.clone()).await;
    hub.respond(
        uid,
        &request.request_id,
        Some(json!({
            "challenge": STANDARD.encode(challenge.challenge),
            "salt": STANDARD.encode(challenge.salt),
        })),
    )
    .await;
}

async fn auth_challenge(hub: &mut Hub, uid: u64, request: &Request) {
    let Some(hash) = str_param(request, "hash") else {
        hub.send_error(
            uid,
            ErrCode::MissingParam,
            "invalid or missing 'hash' parameter",
            &request.request_id,
        )
        .await;
        return;
    };
    let Ok(hash_bytes) = STANDARD.decode(hash) else {
        hub.send_error(
            uid,
            ErrCode::InvalidFmt,
            "invalid 'hash' parameter",
            &request.request_id,
        )
        .await;
        return;
    };

    let Some(challenge) = hub.registry.challenge(uid).await else {
        hub.send_error(
            uid,
            ErrCode::AuthNotInit,
            "you must start an authentication challenge first",
            &request.request_id,
        )
        .await;
        return;
    };

    if !auth::verify(&hub.options.password, &challenge, &hash_bytes) {
        hub.send_error(
            uid,
            ErrCode::AuthFailed,
            "authentication failed",
            &request.request_id,
        )
        .await;
        return;
    }

    hub.registry.set_authenticated(uid, true).await;
    tracing::debug!(client = uid, "client authenticated");
    hub.respond(uid, &request.request_id, None).await;
}
