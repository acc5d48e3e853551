//! The on-the-wire envelope: `{ className, uuid, data }`.
//!
//! `data` is produced and consumed by the job's own `to_data`/`from_data`
//! contract; the envelope only owns `className` and `uuid`. The worker is
//! responsible for splicing the authoritative `tries`/`maxtries` into
//! `data` before decoding, so a job always sees its current attempt count
//! regardless of what it serialized on the previous attempt.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::registry::{JobObject, Registry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadEnvelope {
    #[serde(rename = "className")]
    pub class_name: String,
    pub uuid: String,
    pub data: Value,
}

/// Encode a freshly-created job into an envelope with a new random uuid.
/// `tries`/`maxtries` are written into `data` so the stored payload is
/// self-describing even before the first attempt.
pub fn encode<T>(job: &T, tries: u32, max_tries: u32) -> PayloadEnvelope
where
    T: crate::registry::Job,
{
    let mut data = job.to_data();
    inject_attempt_counts(&mut data, tries, max_tries);

    PayloadEnvelope {
        class_name: T::NAME.to_string(),
        uuid: uuid::Uuid::new_v4().to_string(),
        data,
    }
}

/// Decode an envelope into a live job instance via the registry. The
/// caller must have already injected `tries`/`maxtries` into
/// `envelope.data` (see `Worker::do_one`).
pub fn decode(registry: &Registry, envelope: &PayloadEnvelope) -> Result<Box<dyn JobObject>> {
    registry.instance(&envelope.class_name, &envelope.data)
}

/// Splice the worker's authoritative attempt counters into a job's `data`
/// object, so `Decode(Encode(job))` always reflects the record's
/// `tries`/`maxtries` rather than whatever the job itself remembered.
pub fn inject_attempt_counts(data: &mut Value, tries: u32, max_tries: u32) {
    if let Value::Object(map) = data {
        map.insert("tries".to_string(), Value::from(tries));
        map.insert("maxtries".to_string(), Value::from(max_tries));
    }
}

/// Parse a serialized envelope, surfacing parse failures as
/// `MalformedPayload`: a corrupt envelope is never a reason to crash the
/// worker.
pub fn parse(raw: &str) -> Result<PayloadEnvelope> {
    serde_json::from_str(raw).map_err(|e| Error::MalformedPayload(e.to_string()))
}

pub fn stringify(envelope: &PayloadEnvelope) -> Result<String> {
    Ok(serde_json::to_string(envelope)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Job;
    use serde_json::json;

    #[derive(Debug, Default, PartialEq)]
    struct Greet {
        name: String,
    }

    impl Job for Greet {
        const NAME: &'static str = "Greet";

        fn handle(&mut self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }

        fn to_data(&self) -> serde_json::Value {
            json!({ "name": self.name })
        }

        fn from_data(data: &serde_json::Value) -> Self {
            Greet {
                name: data
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            }
        }
    }

    #[test]
    fn round_trip_preserves_state_and_attempt_counts() {
        let mut registry = Registry::new();
        registry.register::<Greet>().unwrap();

        let job = Greet {
            name: "world".to_string(),
        };
        let envelope = encode(&job, 0, 5);
        assert_eq!(envelope.class_name, "Greet");
        assert_eq!(envelope.data["tries"], 0);
        assert_eq!(envelope.data["maxtries"], 5);

        let decoded = decode(&registry, &envelope).unwrap();
        assert_eq!(decoded.to_data()["name"], "world");
    }

    #[test]
    fn stringify_and_parse_round_trip() {
        let envelope = PayloadEnvelope {
            class_name: "Greet".to_string(),
            uuid: "abc".to_string(),
            data: json!({ "name": "x" }),
        };
        let raw = stringify(&envelope).unwrap();
        let parsed = parse(&raw).unwrap();
        assert_eq!(parsed.class_name, envelope.class_name);
        assert_eq!(parsed.uuid, envelope.uuid);
    }

    #[test]
    fn malformed_payload_is_reported() {
        assert!(matches!(parse("not json"), Err(Error::MalformedPayload(_))));
    }
}
