use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Header map: name to ordered value list. Duplicate header lines append to
/// the list in wire order, which the YAML round-trip preserves.
pub type HeaderMap = BTreeMap<String, Vec<String>>;

/// Structured HTTP request as captured off the wire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpReq {
    pub method: String,
    #[serde(default)]
    pub proto_major: u8,
    #[serde(default)]
    pub proto_minor: u8,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub url_params: BTreeMap<String, String>,
    #[serde(default)]
    pub header: HeaderMap,
    #[serde(default, with = "body_repr")]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
}

/// Structured HTTP response as captured off the wire. The body is stored in
/// its decoded form; gzip re-encoding happens at replay time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpResp {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_message: String,
    #[serde(default)]
    pub proto_major: u8,
    #[serde(default)]
    pub proto_minor: u8,
    #[serde(default)]
    pub header: HeaderMap,
    #[serde(default, with = "body_repr")]
    pub body: Vec<u8>,
}

impl HttpReq {
    /// Path portion of the url: query string stripped, and for absolute-form
    /// urls the scheme and authority as well.
    pub fn path(&self) -> &str {
        let url = self.url.split('?').next().unwrap_or(&self.url);
        let stripped = url
            .strip_prefix("http://")
            .or_else(|| url.strip_prefix("https://"));
        match stripped {
            Some(rest) => rest.find('/').map_or("/", |i| &rest[i..]),
            None => url,
        }
    }

    /// First value of a header, looked up case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        header_lookup(&self.header, name)
    }
}

impl HttpResp {
    /// First value of a header, looked up case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        header_lookup(&self.header, name)
    }

    /// Whether the recorded response was gzip-encoded on the wire.
    pub fn is_gzipped(&self) -> bool {
        self.header_value("Content-Encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("gzip"))
    }
}

fn header_lookup<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, vs)| vs.first())
        .map(String::as_str)
}

/// Body persistence: UTF-8 text bodies serialize as plain YAML strings so the
/// artifacts stay human-readable; anything else round-trips through base64.
mod body_repr {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Binary { base64: String },
    }

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(body) {
            Ok(text) => Repr::Text(text.to_string()).serialize(serializer),
            Err(_) => Repr::Binary {
                base64: STANDARD.encode(body),
            }
            .serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => Ok(text.into_bytes()),
            Repr::Binary { base64 } => STANDARD
                .decode(base64.as_bytes())
                .map_err(serde::de::Error::custom),
        }
    }
}
