//! Provider-specific endpoint and authentication handling.
//!
//! Gemini models are reachable either directly through Google AI or through
//! a gateway that mirrors the Google AI paths but expects bearer tokens.

/// Supported model providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Google AI (generativelanguage.googleapis.com)
    GoogleAi,
    /// Gateway exposing Google AI compatible paths
    Gateway,
}

/// Generation endpoint flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `:generateContent`
    Generate,
    /// `:streamGenerateContent?alt=sse`
    Stream,
}

impl Provider {
    /// Detect provider from base URL.
    ///
    /// # Example
    ///
    /// ```rust
    /// use phantom_terminal::llm::Provider;
    ///
    /// let provider = Provider::detect_from_url("https://generativelanguage.googleapis.com");
    /// assert_eq!(provider, Provider::GoogleAi);
    /// ```
    #[must_use]
    pub fn detect_from_url(base_url: &str) -> Self {
        let host = url::Url::parse(base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase));

        match host {
            Some(h) if h == "googleapis.com" || h.ends_with(".googleapis.com") => Self::GoogleAi,
            _ => Self::Gateway,
        }
    }

    /// Build the model URL for this provider.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The base URL (trailing slash tolerated)
    /// * `model` - The model name, e.g. `gemini-2.5-flash`
    /// * `method` - Which generation endpoint to hit
    #[must_use]
    pub fn build_model_url(self, base_url: &str, model: &str, method: Method) -> String {
        let base = base_url.trim_end_matches('/');
        match method {
            Method::Generate => format!("{base}/v1beta/models/{model}:generateContent"),
            Method::Stream => format!("{base}/v1beta/models/{model}:streamGenerateContent?alt=sse"),
        }
    }

    /// Attach the credential the way this provider expects it.
    #[must_use]
    pub fn authorize(self, rb: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
        match self {
            Self::GoogleAi => rb.header("x-goog-api-key", api_key),
            Self::Gateway => rb.bearer_auth(api_key),
        }
    }
}
