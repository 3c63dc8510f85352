use fleet_common::types::{self, Capability};

/// Collection features this agent build advertises at registration. The
/// server filters policy metrics down to this set.
pub fn capabilities() -> Vec<Capability> {
    types::KNOWN_METRICS
        .iter()
        .map(|name| Capability {
            name: (*name).to_string(),
            version: "1.0".to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::capabilities;
    use fleet_common::types;

    #[test]
    fn advertises_every_known_metric() {
        let caps = capabilities();
        assert_eq!(caps.len(), types::KNOWN_METRICS.len());
        for name in types::KNOWN_METRICS {
            assert!(caps.iter().any(|c| c.name == name), "missing {name}");
        }
    }
}
