use std::collections::BTreeMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use marrow_auth::AuthService;
use marrow_client::Client;
use marrow_cursor::CursorManager;
use marrow_model::Value;
use marrow_server::Server;
use marrow_store::DocumentStore;

fn start_server() -> (String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::open(dir.path()).unwrap();
    let cursors = Arc::new(CursorManager::new());
    let auth = Arc::new(AuthService::new());

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let server = Server::new(store, cursors, auth, addr.clone());
    thread::spawn(move || {
        server.serve().unwrap();
    });

    thread::sleep(Duration::from_millis(50));
    (addr, dir)
}

fn doc(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[test]
fn insert_and_get_round_trips() {
    let (addr, _dir) = start_server();
    let mut client = Client::connect(&addr).unwrap();

    let inserted = client
        .insert("accounts", Some("acct-1".to_string()), doc(&[("name", Value::String("Acme".to_string()))]))
        .unwrap();
    assert_eq!(inserted.id, "acct-1");

    let fetched = client.get("accounts", "acct-1").unwrap();
    assert!(fetched.is_some());
    assert_eq!(fetched.unwrap().data.get("name"), Some(&Value::String("Acme".to_string())));
}

#[test]
fn get_missing_document_returns_none() {
    let (addr, _dir) = start_server();
    let mut client = Client::connect(&addr).unwrap();
    assert!(client.get("accounts", "nonexistent").unwrap().is_none());
}

#[test]
fn insert_duplicate_id_errors() {
    let (addr, _dir) = start_server();
    let mut client = Client::connect(&addr).unwrap();

    client.insert("accounts", Some("acct-1".to_string()), doc(&[])).unwrap();
    let err = client.insert("accounts", Some("acct-1".to_string()), doc(&[])).unwrap_err();
    assert!(matches!(err, marrow_client::ClientError::Server { ref kind, .. } if kind == "DuplicateId"));
}

#[test]
fn update_merges_fields_and_delete_removes_document() {
    let (addr, _dir) = start_server();
    let mut client = Client::connect(&addr).unwrap();

    client
        .insert("accounts", Some("acct-1".to_string()), doc(&[("status", Value::String("active".to_string()))]))
        .unwrap();
    let updated = client
        .update("accounts", "acct-1", doc(&[("score", Value::Int(7))]))
        .unwrap();
    assert_eq!(updated.data.get("status"), Some(&Value::String("active".to_string())));
    assert_eq!(updated.data.get("score"), Some(&Value::Int(7)));

    assert!(client.delete("accounts", "acct-1").unwrap());
    assert!(client.get("accounts", "acct-1").unwrap().is_none());
}

#[test]
fn query_filters_and_paginates_with_cursor() {
    let (addr, _dir) = start_server();
    let mut client = Client::connect(&addr).unwrap();

    for i in 0..25 {
        let status = if i % 2 == 0 { "active" } else { "inactive" };
        client
            .insert(
                "accounts",
                Some(format!("acct-{i}")),
                doc(&[("status", Value::String(status.to_string())), ("score", Value::Int(i))]),
            )
            .unwrap();
    }

    let filter = serde_json::json!({"status": {"$eq": "active"}});
    let sort = serde_json::json!([{"field": "score", "direction": "asc"}]);
    let options = marrow_server::protocol::CursorOptionsWire {
        batch_size: Some(5),
        timeout_minutes: None,
        include_total_count: true,
        resume_token: None,
    };

    let first_batch = client.query("accounts", Some(filter), Some(sort), options).unwrap();
    assert_eq!(first_batch.documents.len(), 5);
    assert_eq!(first_batch.total_count, Some(13));
    assert!(first_batch.has_more);

    let cursor_id = first_batch.cursor_id.expect("expected a live cursor for a partial batch");
    let second_batch = client.cursor_get_more(&cursor_id, None).unwrap();
    assert_eq!(second_batch.documents.len(), 5);
}

#[test]
fn aggregate_pipeline_counts_matching_documents() {
    let (addr, _dir) = start_server();
    let mut client = Client::connect(&addr).unwrap();

    for i in 0..10 {
        client
            .insert("orders", Some(format!("o-{i}")), doc(&[("region", Value::String("west".to_string()))]))
            .unwrap();
    }

    let pipeline = serde_json::json!([
        {"match": {"region": {"$eq": "west"}}},
        {"group": {"by": null, "aggregations": {"total": {"op": "count"}}}},
    ]);
    let result = client.aggregate("orders", pipeline).unwrap();
    assert!(result.success);
    assert_eq!(result.documents[0].get("total"), Some(&Value::Int(10)));
}

#[test]
fn index_and_ttl_round_trip() {
    let (addr, _dir) = start_server();
    let mut client = Client::connect(&addr).unwrap();

    client.create_index("accounts", "status", marrow_model::ValueKind::String, false).unwrap();
    let indexes = client.list_indexes("accounts").unwrap();
    assert_eq!(indexes.len(), 1);
    assert_eq!(indexes[0].field, "status");

    client.set_ttl_policy("sessions", "expires_at", Some(60), true, 5).unwrap();
    client.insert("sessions", Some("sess-1".to_string()), doc(&[])).unwrap();
    let stats = client.ttl_stats().unwrap();
    assert!(stats.documents_tracked >= 1);

    client.remove_ttl_policy("sessions").unwrap();
}

#[test]
fn auth_register_authenticate_and_authorize() {
    let (addr, _dir) = start_server();
    let mut client = Client::connect(&addr).unwrap();

    let user = client.auth_register("alice", "hunter2-hunter2", vec!["service_reader".to_string()]).unwrap();
    assert_eq!(user.username, "alice");

    let token = client.auth_authenticate("alice", "hunter2-hunter2").unwrap();
    assert_eq!(token.user_id, user.id);

    let authorized = client.auth_authorize(&token.token, "read").unwrap();
    assert_eq!(authorized.id, user.id);

    let denied = client.auth_authorize(&token.token, "write").unwrap_err();
    assert!(matches!(denied, marrow_client::ClientError::Server { ref kind, .. } if kind == "InsufficientPermission"));

    assert!(client.auth_user_has_role("alice", "service_reader").unwrap());
    client.auth_assign_role("alice", "service_writer").unwrap();
    assert!(client.auth_user_has_permission("alice", "write").unwrap());
}

#[test]
fn drop_collection_kills_its_live_cursors() {
    let (addr, _dir) = start_server();
    let mut client = Client::connect(&addr).unwrap();

    for i in 0..10 {
        client.insert("temp", Some(format!("t-{i}")), doc(&[])).unwrap();
    }
    let options = marrow_server::protocol::CursorOptionsWire {
        batch_size: Some(2),
        timeout_minutes: None,
        include_total_count: false,
        resume_token: None,
    };
    let batch = client.query("temp", None, None, options).unwrap();
    let cursor_id = batch.cursor_id.expect("partial batch should open a cursor");

    client.drop_collection("temp").unwrap();

    let err = client.cursor_get_more(&cursor_id, None).unwrap_err();
    assert!(matches!(err, marrow_client::ClientError::Server { ref kind, .. } if kind == "CursorNotFound"));
}
