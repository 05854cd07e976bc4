//! Per-operation configuration.
//!
//! Each operation takes its own struct listing exactly the options it acts
//! on. All of them deserialize with serde, missing fields taking defaults.
use serde::Deserialize;

/// HTTP/2 settings and buffer limits applied to the engine connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SettingsOptions {
    pub initial_window_size: Option<u32>,
    pub initial_connection_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_concurrent_streams: Option<u32>,
    pub max_send_buffer_size: Option<usize>,
}

macro_rules! apply_settings {
    ($settings: expr, $builder: expr) => {{
        let settings = $settings;
        let builder = $builder;
        if let Some(sz) = settings.initial_window_size {
            builder.initial_window_size(sz);
        }
        if let Some(sz) = settings.initial_connection_window_size {
            builder.initial_connection_window_size(sz);
        }
        if let Some(sz) = settings.max_frame_size {
            builder.max_frame_size(sz);
        }
        if let Some(max) = settings.max_concurrent_streams {
            builder.max_concurrent_streams(max);
        }
        if let Some(sz) = settings.max_send_buffer_size {
            builder.max_send_buffer_size(sz);
        }
        builder
    }};
}

impl SettingsOptions {
    pub(crate) fn client_builder(&self) -> monoio_http::h2::client::Builder {
        let mut builder = monoio_http::h2::client::Builder::new();
        apply_settings!(self, &mut builder);
        builder
    }

    pub(crate) fn server_builder(&self) -> monoio_http::h2::server::Builder {
        let mut builder = monoio_http::h2::server::Builder::new();
        apply_settings!(self, &mut builder);
        builder
    }
}

/// Options of [`Session::connect`](crate::Session::connect).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Accept server pushes. Pushed streams are reported through
    /// [`Session::wait_push`](crate::Session::wait_push).
    pub enable_push: bool,
    /// Pushes kept for a later `wait_push` while nobody waits. Further
    /// pushes are reset.
    pub max_unclaimed_pushes: usize,
    #[serde(flatten)]
    pub settings: SettingsOptions,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            enable_push: true,
            max_unclaimed_pushes: 16,
            settings: SettingsOptions::default(),
        }
    }
}

/// Options of [`Server::listen`](crate::Server::listen).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ListenOptions {
    pub hostname: String,
    /// `0` picks an ephemeral port.
    pub port: u16,
    #[serde(flatten)]
    pub settings: SettingsOptions,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_owned(),
            port: 0,
            settings: SettingsOptions::default(),
        }
    }
}

impl ListenOptions {
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }
}

/// Options of [`Session::request`](crate::Session::request).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    /// The request has no body; the sending side is finished right away.
    pub end_stream: bool,
    /// The body will be followed by trailers sent with
    /// [`Stream::send_trailers`](crate::Stream::send_trailers).
    pub wait_for_trailers: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            end_stream: true,
            wait_for_trailers: false,
        }
    }
}

impl RequestOptions {
    /// Keeps the stream open for a request body.
    pub fn with_body() -> Self {
        Self {
            end_stream: false,
            ..Default::default()
        }
    }
}

/// Options of [`Stream::respond`](crate::Stream::respond).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RespondOptions {
    /// The response has no body.
    pub end_stream: bool,
    /// The body will be followed by trailers.
    pub wait_for_trailers: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        assert!(ConnectOptions::default().enable_push);
        assert_eq!(ConnectOptions::default().max_unclaimed_pushes, 16);
        assert!(RequestOptions::default().end_stream);
        assert!(!RequestOptions::with_body().end_stream);
        assert!(!RespondOptions::default().end_stream);
        assert_eq!(ListenOptions::default().hostname, "127.0.0.1");
        assert_eq!(ListenOptions::with_port(8080).port, 8080);
    }

    #[test]
    fn deserialize_partial() {
        let opts: ConnectOptions =
            serde_json::from_str(r#"{"enable_push": false, "max_frame_size": 32768}"#).unwrap();
        assert!(!opts.enable_push);
        assert_eq!(opts.settings.max_frame_size, Some(32768));
        assert_eq!(opts.settings.initial_window_size, None);

        let opts: ListenOptions = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(opts.port, 9000);
        assert_eq!(opts.hostname, "127.0.0.1");

        let opts: RequestOptions = serde_json::from_str(r#"{"wait_for_trailers": true}"#).unwrap();
        assert!(opts.end_stream);
        assert!(opts.wait_for_trailers);
    }
}
