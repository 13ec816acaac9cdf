use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::{header, Client, ClientBuilder};

/// All outbound traffic (identity providers, config source) goes through one
/// shared client with a bounded timeout, so a wedged upstream can never hold
/// a request slot forever.
pub fn make_http_request(method: reqwest::Method, url: &str) -> Result<reqwest::RequestBuilder, crate::error::Error> {
    let Ok(url) = url::Url::parse(url) else {
        err!("Invalid URL");
    };
    if url.host().is_none() {
        err!("Invalid host");
    }

    static INSTANCE: Lazy<Client> = Lazy::new(|| get_reqwest_client_builder().build().expect("Failed to build client"));

    Ok(INSTANCE.request(method, url))
}

pub fn get_reqwest_client_builder() -> ClientBuilder {
    let mut headers = header::HeaderMap::new();
    headers.insert(header::USER_AGENT, header::HeaderValue::from_static("Gridgate"));

    let redirect_policy = reqwest::redirect::Policy::custom(|attempt| {
        if attempt.previous().len() >= 5 {
            return attempt.error("Too many redirects");
        }
        attempt.follow()
    });

    Client::builder().default_headers(headers).redirect(redirect_policy).timeout(Duration::from_secs(10))
}

/// Transient outbound failures worth a bounded retry: connect problems and
/// timeouts. HTTP status errors, 4xx in particular, never are.
pub fn is_transient_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout()
}
