use ingress_controller_k8s_api::ConfigMap;
use std::collections::BTreeMap;

/// Settings read from the controller's main ConfigMap.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendConfiguration {
    /// Words that may not appear in any controller annotation value.
    pub annotation_value_word_blocklist: Vec<String>,
    pub ssl_session_ticket_key: bool,
    pub raw: BTreeMap<String, String>,
}

impl BackendConfiguration {
    pub fn from_config_map(cm: &ConfigMap) -> Self {
        let raw = cm.data.clone().unwrap_or_default();
        let annotation_value_word_blocklist = raw
            .get("annotation-value-word-blocklist")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|w| !w.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let ssl_session_ticket_key = raw
            .get("ssl-session-ticket-key")
            .is_some_and(|v| !v.trim().is_empty());
        Self {
            annotation_value_word_blocklist,
            ssl_session_ticket_key,
            raw,
        }
    }
}
