//! URL construction for the backend's HTTP and socket endpoints.

use agent_link_core::TransportError;
use url::Url;

/// Resolves every backend URL from one API base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    base: Url,
}

impl Endpoints {
    /// Parse the API base.
    ///
    /// # Errors
    /// Returns error if `api_base` is not an absolute http(s) URL.
    pub fn new(api_base: &str) -> Result<Self, TransportError> {
        let mut base = Url::parse(api_base)
            .map_err(|e| TransportError::Connect(format!("invalid API base {api_base}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(TransportError::Connect(format!(
                "unsupported API scheme: {}",
                base.scheme()
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { base })
    }

    fn join(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path)
            .map_err(|e| TransportError::Connect(format!("invalid endpoint path {path}: {e}")))
    }

    /// `GET {base}/config`
    pub fn config(&self) -> Result<Url, TransportError> {
        self.join("config")
    }

    /// `GET {base}/sessions?externalId=`
    pub fn sessions(&self, external_id: &str) -> Result<Url, TransportError> {
        let mut url = self.join("sessions")?;
        url.query_pairs_mut().append_pair("externalId", external_id);
        Ok(url)
    }

    /// `GET {base}/session?sessionId=`
    pub fn session(&self, session_id: &str) -> Result<Url, TransportError> {
        let mut url = self.join("session")?;
        url.query_pairs_mut().append_pair("sessionId", session_id);
        Ok(url)
    }

    /// `POST {base}/session/{id}/stream`, or `{base}/session/stream` with no id yet.
    pub fn stream(
        &self,
        session_id: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<Url, TransportError> {
        let mut url = self.join("session/stream")?;
        if let Some(id) = session_id {
            url.path_segments_mut()
                .map_err(|()| TransportError::Connect("API base cannot hold a path".into()))?
                .pop()
                .push(id)
                .push("stream");
        }
        append_query(&mut url, &[("requestId", request_id)]);
        Ok(url)
    }

    /// Chat socket URL.
    ///
    /// `override_url` comes from the remote config or the local config and
    /// replaces the default `{base}/ws`.
    pub fn socket(
        &self,
        override_url: Option<&str>,
        session_id: Option<&str>,
        request_id: Option<&str>,
        token: Option<&str>,
    ) -> Result<Url, TransportError> {
        let mut url = self.socket_base(override_url, "ws")?;
        append_query(
            &mut url,
            &[("sessionId", session_id), ("requestId", request_id), ("token", token)],
        );
        Ok(url)
    }

    /// Call signaling socket URL. Defaults to `{base}/call`.
    pub fn signaling(
        &self,
        override_url: Option<&str>,
        session_id: Option<&str>,
        token: Option<&str>,
    ) -> Result<Url, TransportError> {
        let mut url = self.socket_base(override_url, "call")?;
        append_query(&mut url, &[("sessionId", session_id), ("token", token)]);
        Ok(url)
    }

    fn socket_base(&self, override_url: Option<&str>, path: &str) -> Result<Url, TransportError> {
        let url = match override_url {
            Some(raw) => Url::parse(raw)
                .map_err(|e| TransportError::Connect(format!("invalid socket URL {raw}: {e}")))?,
            None => self.join(path)?,
        };
        to_socket_scheme(url)
    }
}

fn append_query(url: &mut Url, pairs: &[(&str, Option<&str>)]) {
    let present: Vec<_> = pairs
        .iter()
        .filter_map(|(key, value)| value.map(|v| (*key, v)))
        .collect();
    if !present.is_empty() {
        url.query_pairs_mut().extend_pairs(present);
    }
}

fn to_socket_scheme(mut url: Url) -> Result<Url, TransportError> {
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(TransportError::Connect(format!("unsupported socket scheme: {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| TransportError::Connect(format!("cannot switch {url} to {scheme}")))?;
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Endpoints {
        Endpoints::new("https://bot.example.com/api").unwrap()
    }

    #[test]
    fn test_http_endpoints() {
        let e = endpoints();
        assert_eq!(e.config().unwrap().as_str(), "https://bot.example.com/api/config");
        assert_eq!(
            e.sessions("user 1").unwrap().as_str(),
            "https://bot.example.com/api/sessions?externalId=user+1"
        );
        assert_eq!(
            e.session("s1").unwrap().as_str(),
            "https://bot.example.com/api/session?sessionId=s1"
        );
    }

    #[test]
    fn test_stream_endpoint() {
        let e = endpoints();
        assert_eq!(
            e.stream(None, None).unwrap().as_str(),
            "https://bot.example.com/api/session/stream"
        );
        assert_eq!(
            e.stream(Some("s1"), Some("r1")).unwrap().as_str(),
            "https://bot.example.com/api/session/s1/stream?requestId=r1"
        );
    }

    #[test]
    fn test_socket_scheme_follows_base() {
        let e = endpoints();
        assert_eq!(
            e.socket(None, Some("s1"), None, Some("t")).unwrap().as_str(),
            "wss://bot.example.com/api/ws?sessionId=s1&token=t"
        );
        let local = Endpoints::new("http://127.0.0.1:8080").unwrap();
        assert_eq!(
            local.signaling(None, None, None).unwrap().as_str(),
            "ws://127.0.0.1:8080/call"
        );
    }

    #[test]
    fn test_socket_override() {
        let e = endpoints();
        let url = e
            .socket(Some("https://rt.example.com/chat"), None, Some("r9"), None)
            .unwrap();
        assert_eq!(url.as_str(), "wss://rt.example.com/chat?requestId=r9");
    }

    #[test]
    fn test_rejects_non_http_base() {
        assert!(Endpoints::new("ftp://example.com").is_err());
        assert!(Endpoints::new("not a url").is_err());
    }
}
