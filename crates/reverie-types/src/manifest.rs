use serde::{Deserialize, Serialize};

/// Service protocol versions spoken on the invocation stream.
pub const MIN_SERVICE_PROTOCOL_VERSION: u16 = 5;
pub const MAX_SERVICE_PROTOCOL_VERSION: u16 = 6;

/// Content type of the invocation stream for the newest protocol version.
pub const INVOCATION_CONTENT_TYPE: &str = "application/vnd.restate.invocation.v6";

/// Discovery manifest versions this SDK can render, newest preferred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ManifestVersion {
    V1,
    V2,
    V3,
}

impl ManifestVersion {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::V1 => "application/vnd.restate.endpointmanifest.v1+json",
            Self::V2 => "application/vnd.restate.endpointmanifest.v2+json",
            Self::V3 => "application/vnd.restate.endpointmanifest.v3+json",
        }
    }

    fn all_descending() -> [Self; 3] {
        [Self::V3, Self::V2, Self::V1]
    }
}

/// Pick the highest manifest version present in an `Accept` header.
///
/// `*/*` and an absent header default to v1; `None` means no mutually
/// supported version and maps to `415 Unsupported Media Type` upstream.
pub fn negotiate(accept: Option<&str>) -> Option<ManifestVersion> {
    let Some(accept) = accept else {
        return Some(ManifestVersion::V1);
    };
    if accept.split(',').any(|part| part.trim().starts_with("*/*")) {
        return Some(ManifestVersion::V1);
    }
    ManifestVersion::all_descending()
        .into_iter()
        .find(|v| accept.contains(v.content_type()))
}

/// How the transport delivers the frame stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolMode {
    BidiStream,
    RequestResponse,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    Service,
    VirtualObject,
    Workflow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerType {
    Exclusive,
    Shared,
    Workflow,
}

/// Input payload schema for a handler.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Output payload schema for a handler.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPayload {
    pub set_content_type_if_empty: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// One handler as advertised through discovery.
///
/// The retention/timeout fields are surfaced to the runtime but not
/// otherwise enforced by the core.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerManifest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ty: Option<HandlerType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<InputPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inactivity_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_retention: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_retention: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_retention: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress_private: Option<bool>,
}

impl HandlerManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: None,
            input: None,
            output: None,
            inactivity_timeout: None,
            abort_timeout: None,
            idempotency_retention: None,
            journal_retention: None,
            workflow_retention: None,
            ingress_private: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceManifest {
    pub name: String,
    pub ty: ServiceType,
    pub handlers: Vec<HandlerManifest>,
}

/// The full discovery document served from `GET /discover`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub protocol_mode: ProtocolMode,
    pub min_protocol_version: u16,
    pub max_protocol_version: u16,
    pub services: Vec<ServiceManifest>,
}

impl Manifest {
    pub fn new(protocol_mode: ProtocolMode, services: Vec<ServiceManifest>) -> Self {
        Self {
            protocol_mode,
            min_protocol_version: MIN_SERVICE_PROTOCOL_VERSION,
            max_protocol_version: MAX_SERVICE_PROTOCOL_VERSION,
            services,
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn negotiation_prefers_newest_offered() {
        let accept = "application/vnd.restate.endpointmanifest.v1+json, \
                      application/vnd.restate.endpointmanifest.v3+json";
        assert_eq!(negotiate(Some(accept)), Some(ManifestVersion::V3));
    }

    #[test]
    fn absent_and_wildcard_default_to_v1() {
        assert_eq!(negotiate(None), Some(ManifestVersion::V1));
        assert_eq!(negotiate(Some("*/*")), Some(ManifestVersion::V1));
        assert_eq!(
            negotiate(Some("text/html, */*;q=0.1")),
            Some(ManifestVersion::V1)
        );
    }

    #[test]
    fn unsupported_accept_yields_none() {
        assert_eq!(negotiate(Some("application/xml")), None);
    }

    #[test]
    fn manifest_serializes_camel_case() {
        let manifest = Manifest::new(
            ProtocolMode::BidiStream,
            vec![ServiceManifest {
                name: "Greeter".to_owned(),
                ty: ServiceType::Service,
                handlers: vec![HandlerManifest {
                    ty: None,
                    input: Some(InputPayload {
                        required: Some(false),
                        content_type: Some("application/json".to_owned()),
                    }),
                    output: Some(OutputPayload {
                        set_content_type_if_empty: false,
                        content_type: Some("application/json".to_owned()),
                    }),
                    ..HandlerManifest::new("greet")
                }],
            }],
        );

        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["protocolMode"], "BIDI_STREAM");
        assert_eq!(json["minProtocolVersion"], 5);
        assert_eq!(json["maxProtocolVersion"], 6);
        assert_eq!(json["services"][0]["ty"], "SERVICE");
        let handler = &json["services"][0]["handlers"][0];
        assert_eq!(handler["name"], "greet");
        assert_eq!(handler["input"]["contentType"], "application/json");
        assert_eq!(handler["output"]["setContentTypeIfEmpty"], false);
    }
}
