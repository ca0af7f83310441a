use std::error::Error;
use std::time::Duration;

use neutrino_sdk::config::AppConfig;
use neutrino_sdk::realtime::{ConnectionManager, RealtimeClient, RealtimeOptions};
use secrecy::SecretString;
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let app_id = "REPLACE_WITH_APP_ID".to_string();
    let token = "REPLACE_WITH_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let manager = ConnectionManager::new(RealtimeOptions {
            session_timeout: Some(Duration::from_secs(10)),
            ..RealtimeOptions::default()
        });
        let _shutdown = manager.shutdown_guard();

        let config = AppConfig::new(app_id, SecretString::new(token));
        let todos = RealtimeClient::for_data_type(&manager, config, "todos");

        let _created = todos.on_create_message(None, None, |notification| {
            if let Some(envelope) = notification.envelope {
                println!("created by {:?}: {}", envelope.client_id(), envelope.pld);
            }
        })?;
        let _updated = todos.on_update_message("todo-1", None, |notification| {
            if let Some(envelope) = notification.envelope {
                println!("todo-1 updated: {}", envelope.pld);
            }
        })?;

        let status = todos.send_create(json!({"id": "todo-1", "title": "try neutrino"}), None)?;
        println!("create notification {status:?}");

        let existing = todos.call_read(json!({}), None, None).await?;
        println!("todos: {existing}");

        todos.send_update(json!({"id": "todo-1", "done": true}), None)?;
        tokio::time::sleep(Duration::from_secs(5)).await;

        Ok::<(), Box<dyn Error>>(())
    })
}
