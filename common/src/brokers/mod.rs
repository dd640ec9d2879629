pub mod http;
pub mod memory;

use std::sync::Arc;

use url::Url;

use crate::broker::Broker;
use crate::config;
use crate::errors::BrokerError;

pub use http::HttpBroker;
pub use memory::MemoryBroker;

/// Elige el backend por el esquema de la URL (`memory:`, `http://...`).
/// Sin URL usa `DAGQ_BROKER`, y si no está, el broker en memoria.
pub async fn connect(url: Option<&str>) -> Result<Arc<dyn Broker>, BrokerError> {
    let raw = url.map(str::to_string).unwrap_or_else(config::broker_url);
    let parsed = Url::parse(&raw).map_err(|e| BrokerError::InvalidUrl {
        url: raw.clone(),
        reason: e.to_string(),
    })?;

    let broker: Arc<dyn Broker> = match parsed.scheme() {
        "memory" => MemoryBroker::new(),
        "http" | "https" => HttpBroker::connect(parsed).await,
        other => return Err(BrokerError::UnknownScheme(other.to_string())),
    };
    Ok(broker)
}
