//! Discovery beacon: announce ourselves to the broadcast address on a fixed interval.
//! Peers are learned by the dispatcher from any frame, beacons included.

use linkchat_core::{encode_frame, Event, MacAddr, Message};
use tracing::{debug, error};

use crate::engine::Engine;

/// Sends immediately, then once per `discovery_interval`. A send failure ends the task.
pub async fn run_beacon(engine: Engine) -> std::io::Result<()> {
    let frame = encode_frame(MacAddr::BROADCAST, engine.local_address(), &Message::Discovery)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let interval = engine.settings().discovery_interval;
    loop {
        if let Err(e) = engine.link().send(&frame).await {
            error!("discovery beacon stopped: {e}");
            engine.emit(Event::Error(format!("discovery beacon stopped: {e}")));
            return Err(e);
        }
        debug!("beacon sent");
        tokio::time::sleep(interval).await;
    }
}
