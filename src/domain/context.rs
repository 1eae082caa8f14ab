use std::collections::HashMap;
use uuid::Uuid;

/// Process and machine context attached to every outgoing item.
///
/// Collected once per channel; producer-supplied properties win on key
/// collisions.
#[derive(Debug, Clone)]
pub struct TelemetryContext {
    properties: HashMap<String, String>,
}

impl TelemetryContext {
    pub fn collect(product: &str, product_version: &str) -> Self {
        let mut properties = HashMap::new();
        properties.insert("product".to_string(), product.to_string());
        properties.insert("product_version".to_string(), product_version.to_string());
        properties.insert("os".to_string(), std::env::consts::OS.to_string());
        properties.insert("arch".to_string(), std::env::consts::ARCH.to_string());
        properties.insert("process_id".to_string(), std::process::id().to_string());
        properties.insert(
            "session_id".to_string(),
            Uuid::new_v4().simple().to_string(),
        );
        if let Some(host) = host_name() {
            properties.insert("host".to_string(), host);
        }
        Self { properties }
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Context properties overlaid with producer properties.
    pub fn merged(&self, producer: &HashMap<String, String>) -> HashMap<String, String> {
        let mut merged = self.properties.clone();
        for (key, value) in producer {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

fn host_name() -> Option<String> {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_process_context() {
        let context = TelemetryContext::collect("beacon", "1.2.3");
        assert_eq!(context.properties()["product"], "beacon");
        assert_eq!(context.properties()["product_version"], "1.2.3");
        assert_eq!(
            context.properties()["process_id"],
            std::process::id().to_string()
        );
        assert_eq!(context.properties()["session_id"].len(), 32);
    }

    #[test]
    fn producer_properties_win_on_collision() {
        let context = TelemetryContext::collect("beacon", "1.2.3");
        let mut producer = HashMap::new();
        producer.insert("product".to_string(), "override".to_string());
        producer.insert("custom".to_string(), "value".to_string());

        let merged = context.merged(&producer);
        assert_eq!(merged["product"], "override");
        assert_eq!(merged["custom"], "value");
        assert_eq!(merged["os"], std::env::consts::OS);
    }

    #[test]
    fn session_id_is_unique_per_context() {
        let a = TelemetryContext::collect("beacon", "1");
        let b = TelemetryContext::collect("beacon", "1");
        assert_ne!(a.properties()["session_id"], b.properties()["session_id"]);
    }
}
