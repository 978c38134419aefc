use std::sync::Arc;

use agentbus::bus::{MessageBus, PublishOptions};
use agentbus::config::load_config;
use agentbus::message::Message;
use agentbus::transport::handler_fn;
use agentbus::utils::logging;
use serde_json::json;
use tracing::{error, info};

const ECHO_TOPIC: &str = "agent.echo";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = load_config()?;
    logging::init(&config.logging.level);

    let bus = Arc::new(MessageBus::from_settings(&config)?);
    bus.connect().await?;

    let responder = bus.clone();
    bus.subscribe(
        ECHO_TOPIC,
        handler_fn(move |message: Message| {
            let bus = responder.clone();
            async move {
                info!(message_id = %message.id, payload = %message.payload, "Echo agent received request");
                bus.reply(&message, json!({ "echo": message.payload }), PublishOptions::new())
                    .await?;
                Ok(())
            }
        }),
    )
    .await?;

    match bus
        .request(ECHO_TOPIC, json!({ "text": "hello" }), PublishOptions::new(), None)
        .await
    {
        Ok(reply) => info!(payload = %reply.payload, "Echo agent answered"),
        Err(err) => error!(error = %err, "Demo request failed"),
    }

    info!(topic = ECHO_TOPIC, "Echo agent running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    bus.disconnect().await?;
    info!("Shut down cleanly");
    Ok(())
}
