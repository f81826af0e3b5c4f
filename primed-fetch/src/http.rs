use reqwest::{Client, Request, StatusCode, header::ACCEPT};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::{
    FetchError, Page, Problem, ProblemsApi, ProblemsClient, ProblemsConfig, ProblemsMetadata,
    ProblemsRequest, QueryCache,
};

const PROBLEMS_ENDPOINT: &str = "/problems";
const METADATA_ENDPOINT: &str = "/problems/metadata";

/// [`ProblemsApi`] over the JSON HTTP API at [`ProblemsConfig::base_url`].
#[derive(Debug, Clone)]
pub struct HttpProblemsApi {
    client: Client,
    base_url: String,
}

impl HttpProblemsApi {
    /// Create a client using the url and timeout of `config`.
    pub fn new(config: &ProblemsConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("primed-fetch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, &config.base_url))
    }

    /// Use an already configured [`reqwest::Client`].
    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// The base url endpoints are appended to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn problems_request(&self, request: &ProblemsRequest) -> Result<Request, FetchError> {
        Ok(self
            .client
            .get(format!("{}{}", self.base_url, PROBLEMS_ENDPOINT))
            .header(ACCEPT, "application/json")
            .query(request)
            .build()?)
    }

    fn metadata_request(&self) -> Result<Request, FetchError> {
        Ok(self
            .client
            .get(format!("{}{}", self.base_url, METADATA_ENDPOINT))
            .header(ACCEPT, "application/json")
            .build()?)
    }

    async fn send<T: DeserializeOwned>(&self, request: Request) -> Result<T, FetchError> {
        debug!(method = %request.method(), url = %request.url(), "sending request");
        let response = self.client.execute(request).await?;
        let status = response.status();
        let body = response.bytes().await?;
        decode_response(status, &body)
    }
}

/// Check the status, then decode the JSON body.
fn decode_response<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> Result<T, FetchError> {
    if !status.is_success() {
        let body = String::from_utf8_lossy(body).into_owned();
        warn!(status = status.as_u16(), "request failed");
        return Err(FetchError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(serde_json::from_slice(body)?)
}

impl ProblemsApi for HttpProblemsApi {
    async fn get_problems(&self, request: &ProblemsRequest) -> Result<Page<Problem>, FetchError> {
        let request = self.problems_request(request)?;
        self.send(request).await
    }

    async fn get_problems_metadata(&self) -> Result<ProblemsMetadata, FetchError> {
        let request = self.metadata_request()?;
        self.send(request).await
    }
}

impl ProblemsClient<HttpProblemsApi> {
    /// A client talking to the HTTP API described by `config`.
    pub fn from_config(cache: QueryCache, config: ProblemsConfig) -> Result<Self, FetchError> {
        let api = HttpProblemsApi::new(&config)?;
        Ok(Self::new(cache, api, config))
    }
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;
    use crate::{Difficulty, ProblemFilters};

    fn api() -> HttpProblemsApi {
        HttpProblemsApi::new(&ProblemsConfig {
            base_url: "https://primed.dev/api/".into(),
            ..ProblemsConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_problems_request_query() {
        let request = api()
            .problems_request(&ProblemsRequest {
                filters: ProblemFilters::default()
                    .with_difficulty(Difficulty::Easy)
                    .with_search("two sum"),
                limit: 20,
                offset: 40,
                user_id: "default_user".into(),
            })
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(request.url().path(), "/api/problems");
        assert_eq!(
            request.url().query(),
            Some("difficulty=easy&search=two+sum&limit=20&offset=40&user_id=default_user")
        );
    }

    #[test]
    fn test_metadata_request() {
        let request = api().metadata_request().unwrap();
        assert_eq!(
            request.url().as_str(),
            "https://primed.dev/api/problems/metadata"
        );
        assert_eq!(request.url().query(), None);
    }

    #[test]
    fn test_decode_page() {
        let page: Page<Problem> = decode_response(
            StatusCode::OK,
            br#"{"items": [{"id": 7, "title": "Two Sum"}], "offset": 0, "limit": 20, "has_more": false}"#,
        )
        .unwrap();
        assert_eq!(page.items[0].title.as_deref(), Some("Two Sum"));
        assert_eq!(page.next_offset(), None);
    }

    #[rstest]
    #[case::server_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "boom",
        FetchError::Status { status: 500, body: "boom".into() }
    )]
    #[case::not_found(
        StatusCode::NOT_FOUND,
        "",
        FetchError::Status { status: 404, body: String::new() }
    )]
    fn test_decode_error_status(
        #[case] status: StatusCode,
        #[case] body: &str,
        #[case] expected: FetchError,
    ) {
        assert_eq!(
            decode_response::<ProblemsMetadata>(status, body.as_bytes()),
            Err(expected)
        );
    }

    #[test]
    fn test_decode_bad_json() {
        let result = decode_response::<Page<Problem>>(StatusCode::OK, b"<html>");
        assert!(matches!(result, Err(FetchError::Decode { .. })));
    }
}
