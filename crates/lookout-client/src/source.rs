//! Source definitions: how one endpoint turns an identifier into a payload.

use std::collections::BTreeMap;
use std::time::Duration;

use lookout_core::error::AppError;
use reqwest::header::ACCEPT;
use reqwest::{Client, Response, StatusCode};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use url::Url;

use crate::error::FetchError;

const ID_PLACEHOLDER: &str = "{id}";
const DEFAULT_BLOCK_MARKERS: &[&str] = &["captcha", "access denied", "unusual traffic"];
const JSON_LD_SELECTOR: &str = r#"script[type="application/ld+json"]"#;
const TITLE_SELECTOR: &str = "head > title";

/// Serialized form of a source, as found under `sources` in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// JSON API. `fields` maps output names to dotted paths into the response
    /// (`items.0.volumeInfo.title`); an empty map returns the whole document.
    Api {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        fields: BTreeMap<String, String>,
    },
    /// HTML page carrying JSON-LD structured data.
    Page {
        url: String,
        #[serde(default)]
        block_markers: Vec<String>,
    },
}

/// URL with an `{id}` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlTemplate {
    template: String,
}

impl UrlTemplate {
    pub fn new(template: impl Into<String>) -> Result<Self, AppError> {
        let template = template.into();
        if !template.contains(ID_PLACEHOLDER) {
            return Err(AppError::ConfigError(format!(
                "source URL '{template}' has no {ID_PLACEHOLDER} placeholder"
            )));
        }
        let probe = template.replace(ID_PLACEHOLDER, "0");
        let url = Url::parse(&probe)
            .map_err(|e| AppError::ConfigError(format!("invalid source URL '{template}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::ConfigError(format!(
                "source URL '{template}' must use http or https"
            )));
        }
        Ok(Self { template })
    }

    /// Substitute the URL-encoded identifier.
    pub fn render(&self, identifier: &str) -> Result<Url, FetchError> {
        let encoded: String = url::form_urlencoded::byte_serialize(identifier.trim().as_bytes()).collect();
        let raw = self.template.replace(ID_PLACEHOLDER, &encoded);
        Url::parse(&raw).map_err(|e| FetchError::InvalidRequest(format!("{raw}: {e}")))
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }
}

#[derive(Debug, Clone)]
pub struct ApiSource {
    url: UrlTemplate,
    headers: BTreeMap<String, String>,
    fields: BTreeMap<String, String>,
}

impl ApiSource {
    pub fn new(url: UrlTemplate) -> Self {
        Self {
            url,
            headers: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.fields.insert(name.into(), path.into());
        self
    }

    async fn fetch(
        &self,
        identifier: &str,
        client: &Client,
        timeout: Duration,
    ) -> Result<Value, FetchError> {
        let url = self.url.render(identifier)?;
        let mut request = client.get(url.clone()).header(ACCEPT, "application/json");
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(e, timeout))?;
        let body = read_body(response, identifier, timeout).await?;

        let document: Value =
            serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))?;
        if self.fields.is_empty() {
            return Ok(json!({ "url": url.as_str(), "data": document }));
        }

        let record: Map<String, Value> = self
            .fields
            .iter()
            .filter_map(|(name, path)| {
                lookup_path(&document, path)
                    .filter(|v| !v.is_null())
                    .map(|v| (name.clone(), v.clone()))
            })
            .collect();
        if record.is_empty() {
            return Err(FetchError::NotFound(identifier.to_string()));
        }
        Ok(json!({ "url": url.as_str(), "fields": record }))
    }
}

#[derive(Debug, Clone)]
pub struct PageSource {
    url: UrlTemplate,
    block_markers: Vec<String>,
}

impl PageSource {
    pub fn new(url: UrlTemplate) -> Self {
        Self {
            url,
            block_markers: DEFAULT_BLOCK_MARKERS.iter().map(|m| m.to_string()).collect(),
        }
    }

    /// Replace the phrases that identify an anti-bot interstitial.
    pub fn with_block_markers(mut self, markers: Vec<String>) -> Self {
        self.block_markers = markers.into_iter().map(|m| m.to_lowercase()).collect();
        self
    }

    async fn fetch(
        &self,
        identifier: &str,
        client: &Client,
        timeout: Duration,
    ) -> Result<Value, FetchError> {
        let url = self.url.render(identifier)?;
        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(e, timeout))?;
        let html = read_body(response, identifier, timeout).await?;

        let lower = html.to_lowercase();
        if let Some(marker) = self.block_markers.iter().find(|m| lower.contains(m.as_str())) {
            return Err(FetchError::Blocked(format!("'{marker}' on {url}")));
        }

        let page = parse_page(&html)?;
        if page.structured.is_empty() {
            return Err(FetchError::MissingData(format!("no JSON-LD on {url}")));
        }
        Ok(json!({
            "url": url.as_str(),
            "title": page.title,
            "structured_data": page.structured,
        }))
    }
}

/// The closed set of source kinds.
#[derive(Debug, Clone)]
pub enum SourceExtractor {
    Api(ApiSource),
    Page(PageSource),
}

impl SourceExtractor {
    pub fn from_config(config: &SourceConfig) -> Result<Self, AppError> {
        Ok(match config {
            SourceConfig::Api {
                url,
                headers,
                fields,
            } => SourceExtractor::Api(ApiSource {
                url: UrlTemplate::new(url.as_str())?,
                headers: headers.clone(),
                fields: fields.clone(),
            }),
            SourceConfig::Page { url, block_markers } => {
                let page = PageSource::new(UrlTemplate::new(url.as_str())?);
                SourceExtractor::Page(if block_markers.is_empty() {
                    page
                } else {
                    page.with_block_markers(block_markers.clone())
                })
            }
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceExtractor::Api(_) => "api",
            SourceExtractor::Page(_) => "page",
        }
    }

    pub async fn fetch(
        &self,
        identifier: &str,
        client: &Client,
        timeout: Duration,
    ) -> Result<Value, FetchError> {
        match self {
            SourceExtractor::Api(source) => source.fetch(identifier, client, timeout).await,
            SourceExtractor::Page(source) => source.fetch(identifier, client, timeout).await,
        }
    }
}

async fn read_body(
    response: Response,
    identifier: &str,
    timeout: Duration,
) -> Result<String, FetchError> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return Err(FetchError::NotFound(identifier.to_string()));
    }
    if !status.is_success() {
        return Err(FetchError::Status {
            status: status.as_u16(),
            url: response.url().to_string(),
        });
    }
    response
        .text()
        .await
        .map_err(|e| FetchError::from_reqwest(e, timeout))
}

/// Follow a dotted path; numeric segments index into arrays.
fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// What a page source keeps from a parsed HTML document.
#[derive(Debug)]
struct PageData {
    structured: Vec<Value>,
    title: Option<String>,
}

fn selector(css: &str) -> Result<Selector, FetchError> {
    Selector::parse(css).map_err(|e| FetchError::Decode(format!("invalid selector '{css}': {e}")))
}

/// Collect every JSON-LD script and the document title. Broken blocks are skipped.
fn parse_page(html: &str) -> Result<PageData, FetchError> {
    let document = Html::parse_document(html);
    let json_ld = selector(JSON_LD_SELECTOR)?;
    let head_title = selector(TITLE_SELECTOR)?;

    let mut structured = Vec::new();
    for script in document.select(&json_ld) {
        let text: String = script.text().collect();
        match serde_json::from_str::<Value>(text.trim()) {
            Ok(Value::Array(items)) => structured.extend(items),
            Ok(value) => structured.push(value),
            Err(e) => tracing::debug!(error = %e, "Skipping unparsable JSON-LD block"),
        }
    }

    let title = document
        .select(&head_title)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|title| !title.is_empty());

    Ok(PageData { structured, title })
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Serve one canned HTTP response on a loopback port.
    async fn serve_once(status_line: &str, body: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}")
    }

    fn client() -> Client {
        Client::builder().no_proxy().build().unwrap()
    }

    #[test]
    fn test_template_requires_placeholder() {
        assert!(UrlTemplate::new("https://books.example/isbn/{id}").is_ok());
        assert!(matches!(
            UrlTemplate::new("https://books.example/isbn/"),
            Err(AppError::ConfigError(_))
        ));
        assert!(matches!(
            UrlTemplate::new("ftp://books.example/{id}"),
            Err(AppError::ConfigError(_))
        ));
    }

    #[test]
    fn test_template_encodes_identifier() {
        let t = UrlTemplate::new("https://books.example/search?q={id}").unwrap();
        let url = t.render(" 978-5 17&x ").unwrap();
        assert_eq!(url.as_str(), "https://books.example/search?q=978-5+17%26x");
    }

    #[test]
    fn test_lookup_path() {
        let doc = json!({"items": [{"volumeInfo": {"title": "Dune", "pages": 412}}]});
        assert_eq!(lookup_path(&doc, "items.0.volumeInfo.title"), Some(&json!("Dune")));
        assert_eq!(lookup_path(&doc, "items.0.volumeInfo.pages"), Some(&json!(412)));
        assert_eq!(lookup_path(&doc, "items.1.volumeInfo"), None);
        assert_eq!(lookup_path(&doc, "items.first"), None);
    }

    #[test]
    fn test_json_ld_blocks_and_title() {
        let html = r#"<html><head><title> Dune | Shop </title>
            <script type="application/ld+json">{"@type": "Book", "isbn": "9780441013593"}</script>
            <SCRIPT type="application/ld+json">[{"@type": "Offer"}, {"@type": "Review"}]</SCRIPT>
            <script type="application/ld+json">{broken</script>
            </head></html>"#;
        let page = parse_page(html).unwrap();
        assert_eq!(page.structured.len(), 3);
        assert_eq!(page.structured[0]["isbn"], "9780441013593");
        assert_eq!(page.structured[2]["@type"], "Review");
        assert_eq!(page.title.as_deref(), Some("Dune | Shop"));
        assert_eq!(parse_page("<html></html>").unwrap().title, None);
    }

    #[test]
    fn test_json_ld_type_mentioned_outside_script_is_ignored() {
        let html = r#"<html><head>
            <meta name="format" content="application/ld+json">
            <title>Dune</title>
            </head><body>
            <p>application/ld+json</p><script>{"a":1}</script>
            <svg><title>cart icon</title></svg>
            <script type="application/ld+json">{"@type": "Book"}</script>
            </body></html>"#;
        let page = parse_page(html).unwrap();
        assert_eq!(page.structured, vec![json!({"@type": "Book"})]);
        assert_eq!(page.title.as_deref(), Some("Dune"));

        let svg_only = r#"<html><body><svg><title>cart icon</title></svg></body></html>"#;
        assert_eq!(parse_page(svg_only).unwrap().title, None);
    }

    #[test]
    fn test_source_config_serde() {
        let raw = r#"{"kind": "api", "url": "https://books.example/{id}", "fields": {"title": "title"}}"#;
        let config: SourceConfig = serde_json::from_str(raw).unwrap();
        let extractor = SourceExtractor::from_config(&config).unwrap();
        assert_eq!(extractor.kind(), "api");

        let raw = r#"{"kind": "page", "url": "https://shop.example/p/{id}"}"#;
        let config: SourceConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(SourceExtractor::from_config(&config).unwrap().kind(), "page");
    }

    #[tokio::test]
    async fn test_api_maps_fields() {
        let base = serve_once("200 OK", r#"{"items": [{"title": "Dune", "year": null}]}"#).await;
        let source = ApiSource::new(UrlTemplate::new(format!("{base}/isbn/{{id}}")).unwrap())
            .with_field("title", "items.0.title")
            .with_field("year", "items.0.year");

        let payload = source.fetch("9780441013593", &client(), TIMEOUT).await.unwrap();
        assert_eq!(payload["fields"], json!({"title": "Dune"}));
        assert!(payload["url"].as_str().unwrap().ends_with("/isbn/9780441013593"));
    }

    #[tokio::test]
    async fn test_api_empty_mapping_is_not_found() {
        let base = serve_once("200 OK", r#"{"totalItems": 0}"#).await;
        let source = ApiSource::new(UrlTemplate::new(format!("{base}/{{id}}")).unwrap())
            .with_field("title", "items.0.title");

        let err = source.fetch("123", &client(), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound(id) if id == "123"));
    }

    #[tokio::test]
    async fn test_api_404_is_not_found() {
        let base = serve_once("404 Not Found", "").await;
        let source = ApiSource::new(UrlTemplate::new(format!("{base}/{{id}}")).unwrap());
        let err = source.fetch("123", &client(), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_api_503_is_status() {
        let base = serve_once("503 Service Unavailable", "busy").await;
        let source = ApiSource::new(UrlTemplate::new(format!("{base}/{{id}}")).unwrap());
        let err = source.fetch("123", &client(), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_api_bad_json_is_decode_error() {
        let base = serve_once("200 OK", "<html>not json</html>").await;
        let source = ApiSource::new(UrlTemplate::new(format!("{base}/{{id}}")).unwrap());
        let err = source.fetch("123", &client(), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }

    #[tokio::test]
    async fn test_page_block_marker() {
        let base = serve_once("200 OK", "<html>Please solve the CAPTCHA</html>").await;
        let source = PageSource::new(UrlTemplate::new(format!("{base}/p/{{id}}")).unwrap());
        let err = source.fetch("123", &client(), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, FetchError::Blocked(_)));
    }

    #[tokio::test]
    async fn test_page_returns_structured_data() {
        let body = r#"<html><head><title>Dune</title></head><body>
            <p>application/ld+json</p>
            <script type="application/ld+json">{"@type": "Book", "isbn": "9780441013593"}</script>
            </body></html>"#;
        let base = serve_once("200 OK", body).await;
        let source = PageSource::new(UrlTemplate::new(format!("{base}/p/{{id}}")).unwrap());

        let payload = source.fetch("9780441013593", &client(), TIMEOUT).await.unwrap();
        assert_eq!(payload["title"], "Dune");
        assert_eq!(payload["structured_data"].as_array().unwrap().len(), 1);
        assert_eq!(payload["structured_data"][0]["isbn"], "9780441013593");
    }

    #[tokio::test]
    async fn test_page_without_json_ld() {
        let base = serve_once("200 OK", "<html><title>Dune</title></html>").await;
        let source = PageSource::new(UrlTemplate::new(format!("{base}/p/{{id}}")).unwrap());
        let err = source.fetch("123", &client(), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, FetchError::MissingData(_)));
    }
}
