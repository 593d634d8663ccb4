use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Maps an uppercase HTTP method token to the URL patterns served under it.
pub type Routes = BTreeMap<String, Vec<String>>;

/// Description of one backend service as stored in the coordination store:
/// a process-unique ID, the base URL requests are forwarded to, and the
/// routes the service answers.
///
/// The canonical serialization is a JSON object with exactly the fields
/// `id`, `address` and `routes`; unknown fields in stored records are
/// ignored on decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub address: String,
    pub routes: Routes,
}

impl ServiceRecord {
    /// The store key this record lives under.
    pub fn key(&self, namespace: &str) -> String {
        format!("{namespace}/{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::{Routes, ServiceRecord};

    fn sample() -> ServiceRecord {
        let mut routes = Routes::new();
        routes.insert("GET".to_owned(), vec!["/users".to_owned(), "/user/:id".to_owned()]);
        routes.insert("POST".to_owned(), vec!["/users".to_owned()]);

        ServiceRecord {
            id: "6ba7b810-9dad-11d1-80b4-00c04fd430c8".to_owned(),
            address: "http://localhost:8080".to_owned(),
            routes,
        }
    }

    #[test]
    fn encodes_canonical_fields() {
        let encoded = serde_json::to_string(&sample()).unwrap();

        assert_eq!(
            encoded,
            concat!(
                r#"{"id":"6ba7b810-9dad-11d1-80b4-00c04fd430c8","#,
                r#""address":"http://localhost:8080","#,
                r#""routes":{"GET":["/users","/user/:id"],"POST":["/users"]}}"#,
            )
        );
    }

    #[test]
    fn round_trips() {
        let record = sample();
        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: ServiceRecord = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded, record);
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let decoded: ServiceRecord = serde_json::from_str(
            r#"{"id":"x","address":"http://b","routes":{},"schema":{"openapi":"3.0"}}"#,
        )
        .unwrap();

        assert_eq!(decoded.id, "x");
        assert!(decoded.routes.is_empty());
    }

    #[test]
    fn decode_rejects_malformed_records() {
        assert!(serde_json::from_str::<ServiceRecord>(r#"{"id":"x"}"#).is_err());
        assert!(serde_json::from_str::<ServiceRecord>("not json").is_err());
    }

    #[test]
    fn key_joins_namespace_and_id() {
        assert_eq!(
            sample().key("services"),
            "services/6ba7b810-9dad-11d1-80b4-00c04fd430c8"
        );
    }
}
