use std::sync::Arc;

use marrow_auth::AuthService;
use marrow_config::Config;
use marrow_cursor::CursorManager;
use marrow_server::Server;
use marrow_store::DocumentStore;

fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = match std::env::var("MARROW_CONFIG") {
        Ok(path) => Config::from_file(&path).unwrap_or_else(|e| panic!("failed to load config at {path}: {e}")),
        Err(_) => Config {
            data_path: std::env::var("MARROW_DATA").unwrap_or_else(|_| "./data".to_string()),
            ..Config::default()
        },
    };
    let addr = std::env::var("MARROW_ADDR").unwrap_or_else(|_| config.bind_address());

    let store = DocumentStore::open(&config.data_path).expect("failed to open document store");
    let cursors = Arc::new(CursorManager::new());
    let auth = Arc::new(AuthService::new());

    let _ttl_sweeper = store.spawn_ttl_sweeper(std::time::Duration::from_secs(30));
    let _cursor_reaper = cursors.spawn_reaper(std::time::Duration::from_secs(60));

    let drop_cursors = Arc::clone(&cursors);
    store.on_collection_dropped(move |collection| {
        drop_cursors.kill_cursors_for_collection(collection);
    });

    let server = Server::new(store, cursors, auth, addr);
    server.serve().expect("server failed");
}
