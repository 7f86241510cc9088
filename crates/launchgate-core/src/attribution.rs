//! Attribution payload and cached remote-config accessors.
//!
//! The attribution SDK writes the conversion payload (and the organic flag)
//! before the orchestrator runs; this module only reads them. The remote
//! config fields and the no-retry flag are written by the config fetcher
//! through [`AttributionStore::save_remote_config`] and
//! [`AttributionStore::lock_out`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::clock::{from_epoch_seconds, to_epoch_seconds};
use crate::error::Result;
use crate::store::{keys, DefaultsStore, WriteBatch};

// ---------------------------------------------------------------------------
// AttributionPayload
// ---------------------------------------------------------------------------

/// Install-time conversion data, forwarded verbatim to the config endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributionPayload {
    fields: BTreeMap<String, Option<Value>>,
}

impl AttributionPayload {
    /// Parse the bytes the attribution SDK persisted.
    ///
    /// Fails unless the bytes are a JSON object.
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        let fields: BTreeMap<String, Option<Value>> = serde_json::from_slice(bytes)?;
        Ok(Self { fields })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).and_then(Option::as_ref)
    }

    /// Every field the SDK produced, with absent values as explicit nulls.
    pub fn sanitized(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|(key, value)| (key.clone(), value.clone().unwrap_or(Value::Null)))
            .collect()
    }

    /// JSON body for the config request.
    pub fn to_request_body(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&Value::Object(self.sanitized()))
    }
}

// ---------------------------------------------------------------------------
// RemoteConfig
// ---------------------------------------------------------------------------

/// The web destination returned by the config endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    pub expires_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

impl RemoteConfig {
    /// A config is trusted only strictly before its expiry instant.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

// ---------------------------------------------------------------------------
// AttributionStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AttributionStore {
    store: DefaultsStore,
}

impl AttributionStore {
    pub fn new(store: DefaultsStore) -> Self {
        Self { store }
    }

    /// The persisted attribution payload, `None` when the SDK never wrote one.
    ///
    /// A stored value that is not a JSON object surfaces as `GateError::Json`.
    pub fn payload(&self) -> Result<Option<AttributionPayload>> {
        match self.store.get_raw(keys::CONVERSION_DATA)? {
            Some(bytes) => Ok(Some(AttributionPayload::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn has_payload(&self) -> Result<bool> {
        self.store.contains(keys::CONVERSION_DATA)
    }

    /// Persist a payload the way the attribution SDK does. Used by hosts that
    /// stand in for the SDK.
    pub fn save_payload(&self, payload: &Map<String, Value>, organic: bool) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        let batch = WriteBatch::new()
            .set_raw(keys::CONVERSION_DATA, &bytes)
            .set(keys::ORGANIC_CONVERSION, &organic)?;
        self.store.commit(batch)
    }

    pub fn clear_payload(&self) -> Result<()> {
        self.store.commit(
            WriteBatch::new()
                .remove(keys::CONVERSION_DATA)
                .remove(keys::ORGANIC_CONVERSION),
        )
    }

    /// Whether the install was attributed as organic. Unreadable means no.
    pub fn is_organic(&self) -> bool {
        match self.store.get::<bool>(keys::ORGANIC_CONVERSION) {
            Ok(value) => value.unwrap_or(false),
            Err(e) => {
                warn!(error = %e, "unreadable organic-conversion flag");
                false
            }
        }
    }

    /// The cached remote config, present only when every field was persisted.
    pub fn remote_config(&self) -> Result<Option<RemoteConfig>> {
        let url: Option<String> = self.store.get(keys::CONFIG_URL)?;
        let expires: Option<f64> = self.store.get(keys::CONFIG_EXPIRES)?;
        let fetched: Option<f64> = self.store.get(keys::CONFIG_FETCHED_AT)?;
        let (Some(url), Some(expires), Some(fetched)) = (url, expires, fetched) else {
            return Ok(None);
        };
        let (Some(expires_at), Some(fetched_at)) =
            (from_epoch_seconds(expires), from_epoch_seconds(fetched))
        else {
            return Ok(None);
        };
        Ok(Some(RemoteConfig {
            url,
            expires_at,
            fetched_at,
        }))
    }

    /// Persist all remote-config fields and clear the lockout in one commit.
    pub fn save_remote_config(&self, config: &RemoteConfig) -> Result<()> {
        let batch = WriteBatch::new()
            .set(keys::CONFIG_URL, &config.url)?
            .set(keys::CONFIG_EXPIRES, &to_epoch_seconds(config.expires_at))?
            .set(keys::CONFIG_FETCHED_AT, &to_epoch_seconds(config.fetched_at))?
            .remove(keys::NO_MORE_REQUESTS);
        self.store.commit(batch)
    }

    pub fn no_retry(&self) -> Result<bool> {
        Ok(self
            .store
            .get::<bool>(keys::NO_MORE_REQUESTS)?
            .unwrap_or(false))
    }

    /// Persist the permanent "do not retry" marker.
    pub fn lock_out(&self) -> Result<()> {
        self.store.set(keys::NO_MORE_REQUESTS, &true)
    }

    /// Manual config reset: forget the cached destination and the lockout so
    /// the next launch fetches again.
    pub fn reset_config(&self) -> Result<()> {
        self.store.commit(
            WriteBatch::new()
                .remove(keys::CONFIG_URL)
                .remove(keys::CONFIG_EXPIRES)
                .remove(keys::CONFIG_FETCHED_AT)
                .remove(keys::NO_MORE_REQUESTS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (AttributionStore, DefaultsStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let defaults = DefaultsStore::open(&dir.path().join("defaults.redb")).unwrap();
        (AttributionStore::new(defaults.clone()), defaults, dir)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn sanitize_keeps_null_fields_as_explicit_nulls() {
        let payload =
            AttributionPayload::from_slice(br#"{"aff_id":"123","campaign":null,"is_first":true}"#)
                .unwrap();
        let body: Value = serde_json::from_slice(&payload.to_request_body().unwrap()).unwrap();
        assert_eq!(
            body,
            json!({"aff_id": "123", "campaign": null, "is_first": true})
        );
        assert_eq!(payload.len(), 3);
        assert_eq!(payload.get("campaign"), None);
    }

    #[test]
    fn non_object_payload_is_rejected() {
        assert!(AttributionPayload::from_slice(b"[1,2,3]").is_err());
        assert!(AttributionPayload::from_slice(b"\"aff\"").is_err());
        assert!(AttributionPayload::from_slice(b"not json").is_err());
    }

    #[test]
    fn missing_payload_reads_as_none() {
        let (attribution, _, _dir) = store();
        assert!(attribution.payload().unwrap().is_none());
        assert!(!attribution.has_payload().unwrap());
    }

    #[test]
    fn malformed_stored_payload_is_an_error() {
        let (attribution, defaults, _dir) = store();
        defaults.set_raw(keys::CONVERSION_DATA, b"[]").unwrap();
        assert!(matches!(
            attribution.payload(),
            Err(crate::GateError::Json(_))
        ));
    }

    #[test]
    fn saved_payload_and_organic_flag_read_back() {
        let (attribution, _, _dir) = store();
        let Value::Object(map) = json!({"aff_id": "123", "media_source": null}) else {
            unreachable!()
        };
        attribution.save_payload(&map, true).unwrap();
        let payload = attribution.payload().unwrap().unwrap();
        assert_eq!(payload.get("aff_id"), Some(&json!("123")));
        assert!(attribution.is_organic());

        attribution.clear_payload().unwrap();
        assert!(!attribution.has_payload().unwrap());
        assert!(!attribution.is_organic());
    }

    #[test]
    fn remote_config_save_clears_lockout() {
        let (attribution, _, _dir) = store();
        attribution.lock_out().unwrap();
        assert!(attribution.no_retry().unwrap());

        let config = RemoteConfig {
            url: "https://example.com/x".into(),
            expires_at: at(1_900_000_000),
            fetched_at: at(1_800_000_000),
        };
        attribution.save_remote_config(&config).unwrap();

        assert!(!attribution.no_retry().unwrap());
        assert_eq!(attribution.remote_config().unwrap(), Some(config));
    }

    #[test]
    fn partial_remote_config_is_ignored() {
        let (attribution, defaults, _dir) = store();
        defaults.set(keys::CONFIG_URL, "https://example.com").unwrap();
        assert_eq!(attribution.remote_config().unwrap(), None);
    }

    #[test]
    fn usable_only_before_expiry() {
        let config = RemoteConfig {
            url: "https://example.com".into(),
            expires_at: at(1_000),
            fetched_at: at(0),
        };
        assert!(config.is_usable(at(999)));
        assert!(!config.is_usable(at(1_000)));
        assert!(!config.is_usable(at(1_000) + Duration::seconds(1)));
    }

    #[test]
    fn reset_forgets_config_and_lockout() {
        let (attribution, _, _dir) = store();
        attribution
            .save_remote_config(&RemoteConfig {
                url: "https://example.com".into(),
                expires_at: at(2_000),
                fetched_at: at(1_000),
            })
            .unwrap();
        attribution.lock_out().unwrap();

        attribution.reset_config().unwrap();

        assert_eq!(attribution.remote_config().unwrap(), None);
        assert!(!attribution.no_retry().unwrap());
    }
}
