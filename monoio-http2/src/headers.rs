//! Header blocks as exchanged with the peer.
//!
//! A [`Headers`] value maps lower-cased field names to either one string or a
//! list of strings. Pseudo-headers (`:status`, `:path`, ...) are plain entries
//! whose name starts with a colon; they are split out only when a block is
//! handed to the engine.
use http::{
    header::{HeaderName, HeaderValue},
    HeaderMap, Method, StatusCode, Uri, Version,
};
use indexmap::IndexMap;

use crate::error::{Error, Result};

pub const STATUS: &str = ":status";
pub const METHOD: &str = ":method";
pub const PATH: &str = ":path";
pub const SCHEME: &str = ":scheme";
pub const AUTHORITY: &str = ":authority";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Single(String),
    Multi(Vec<String>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Single(s) => Some(s),
            Self::Multi(_) => None,
        }
    }

    pub fn as_slice(&self) -> Option<&[String]> {
        match self {
            Self::Single(_) => None,
            Self::Multi(v) => Some(v),
        }
    }

    /// Every value carried, in order.
    pub fn values(&self) -> &[String] {
        match self {
            Self::Single(s) => std::slice::from_ref(s),
            Self::Multi(v) => v,
        }
    }

    fn push(&mut self, value: String) {
        match self {
            Self::Single(s) => {
                let first = std::mem::take(s);
                *self = Self::Multi(vec![first, value]);
            }
            Self::Multi(v) => v.push(value),
        }
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Single(s)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Single(s.to_owned())
    }
}

impl From<&String> for FieldValue {
    fn from(s: &String) -> Self {
        Self::Single(s.clone())
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(v: Vec<String>) -> Self {
        Self::Multi(v)
    }
}

impl From<Vec<&str>> for FieldValue {
    fn from(v: Vec<&str>) -> Self {
        Self::Multi(v.into_iter().map(str::to_owned).collect())
    }
}

macro_rules! numeric_field_value {
    ($($t: ty),*) => {
        $(
            impl From<$t> for FieldValue {
                fn from(n: $t) -> Self {
                    Self::Single(n.to_string())
                }
            }
        )*
    };
}

numeric_field_value!(u16, u32, u64, usize, i32, i64);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: IndexMap<String, FieldValue>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a header block from `(name, value)` pairs. Nothing is validated
    /// here; a malformed name or value is reported when the block is sent.
    pub fn from_record<I, K, V>(record: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<FieldValue>,
    {
        record.into_iter().collect()
    }

    pub fn insert<K: AsRef<str>, V: Into<FieldValue>>(
        &mut self,
        name: K,
        value: V,
    ) -> Option<FieldValue> {
        self.fields
            .insert(name.as_ref().to_ascii_lowercase(), value.into())
    }

    /// Adds a value, turning an existing scalar entry into a list.
    pub fn append<K: AsRef<str>>(&mut self, name: K, value: String) {
        let name = name.as_ref().to_ascii_lowercase();
        match self.fields.get_mut(&name) {
            Some(existing) => existing.push(value),
            None => {
                self.fields.insert(name, FieldValue::Single(value));
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.shift_remove(&name.to_ascii_lowercase())
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        match self.fields.get(name) {
            Some(v) => Some(v),
            None if name.bytes().any(|b| b.is_ascii_uppercase()) => {
                self.fields.get(&name.to_ascii_lowercase())
            }
            None => None,
        }
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The value of `name` when present and scalar.
    pub fn value_string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_str)
    }

    /// The value of `name` when present and a list.
    pub fn value_array(&self, name: &str) -> Option<&[String]> {
        self.get(name).and_then(FieldValue::as_slice)
    }

    /// Numeric value of the `:status` pseudo-header.
    pub fn status(&self) -> Option<u16> {
        self.value_string(STATUS)?.trim().parse().ok()
    }

    pub(crate) fn to_header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::with_capacity(self.fields.len());
        for (name, value) in self.fields.iter().filter(|(n, _)| !n.starts_with(':')) {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::InvalidHeader(name.clone()))?;
            for v in value.values() {
                let header_value =
                    HeaderValue::from_str(v).map_err(|_| Error::InvalidHeader(name.clone()))?;
                map.append(header_name.clone(), header_value);
            }
        }
        Ok(map)
    }

    pub(crate) fn from_header_map(map: &HeaderMap) -> Self {
        let mut headers = Self::new();
        headers.extend_from_header_map(map);
        headers
    }

    fn extend_from_header_map(&mut self, map: &HeaderMap) {
        for (name, value) in map.iter() {
            // Values that are not valid UTF-8 are kept lossily.
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            self.append(name.as_str(), value);
        }
    }

    /// Builds the engine request; missing pseudo-headers fall back to `GET /`
    /// on the given scheme and authority.
    pub(crate) fn to_request(&self, scheme: &str, authority: &str) -> Result<http::Request<()>> {
        let method = self.value_string(METHOD).unwrap_or("GET");
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| Error::InvalidHeader(METHOD.to_owned()))?;
        let uri = Uri::builder()
            .scheme(self.value_string(SCHEME).unwrap_or(scheme))
            .authority(self.value_string(AUTHORITY).unwrap_or(authority))
            .path_and_query(self.value_string(PATH).unwrap_or("/"))
            .build()?;
        let mut request = http::Request::builder()
            .method(method)
            .uri(uri)
            .version(Version::HTTP_2)
            .body(())?;
        *request.headers_mut() = self.to_header_map()?;
        Ok(request)
    }

    pub(crate) fn from_request<B>(request: &http::Request<B>) -> Self {
        let mut headers = Self::new();
        let uri = request.uri();
        headers.insert(METHOD, request.method().as_str());
        if let Some(scheme) = uri.scheme_str() {
            headers.insert(SCHEME, scheme);
        }
        if let Some(authority) = uri.authority() {
            headers.insert(AUTHORITY, authority.as_str());
        }
        headers.insert(
            PATH,
            uri.path_and_query().map(|p| p.as_str()).unwrap_or("/"),
        );
        headers.extend_from_header_map(request.headers());
        headers
    }

    /// Builds the engine response; `:status` defaults to 200.
    pub(crate) fn to_response(&self) -> Result<http::Response<()>> {
        let status = match self.get(STATUS) {
            None => StatusCode::OK,
            Some(_) => self
                .status()
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| Error::InvalidHeader(STATUS.to_owned()))?,
        };
        let mut response = http::Response::builder()
            .status(status)
            .version(Version::HTTP_2)
            .body(())?;
        *response.headers_mut() = self.to_header_map()?;
        Ok(response)
    }

    pub(crate) fn from_response<B>(response: &http::Response<B>) -> Self {
        let mut headers = Self::new();
        headers.insert(STATUS, response.status().as_u16());
        headers.extend_from_header_map(response.headers());
        headers
    }
}

impl<K: AsRef<str>, V: Into<FieldValue>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Self::new();
        headers.extend(iter);
        headers
    }
}

impl<K: AsRef<str>, V: Into<FieldValue>> Extend<(K, V)> for Headers {
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}
