use sinkwatch_scanner::{HttpRenderer, ScanConfig, ScanError, Scanner, SinkKind, SourceType};
use std::sync::Arc;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

fn html_response(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html")
        .set_body_string(body)
}

fn js_response(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "application/javascript")
        .set_body_string(body)
}

fn http_scanner(max_script_bytes: usize) -> Scanner {
    let renderer = HttpRenderer::new("sinkwatch-tests", max_script_bytes).unwrap();
    Scanner::new(Arc::new(renderer), ScanConfig::default().with_wait(0))
}

#[tokio::test]
async fn test_inline_eval_yields_one_finding() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html_response(
            r#"<html><body><script>eval("1+1")</script></body></html>"#,
        ))
        .mount(&server)
        .await;

    let scan = http_scanner(1 << 20).scan(&server.uri()).await.unwrap();

    assert_eq!(scan.sinks.len(), 1, "findings: {:?}", scan.sinks);
    let finding = &scan.sinks[0];
    assert_eq!(finding.kind, SinkKind::Eval);
    assert_eq!(finding.source_type, SourceType::Inline);
    assert!(finding.snippet.contains("eval("));
    assert!(scan.errors.is_empty());
}

#[tokio::test]
async fn test_external_scripts_feed_paths_and_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html_response(
            r#"<html><head>
                <script src="/static/app.js"></script>
                <script src="/static/gone.js"></script>
              </head><body><a href="/login">login</a></body></html>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/static/app.js"))
        .respond_with(js_response(
            "const u = \"/api/users\";\ndocument.getElementById('out').innerHTML = u;",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/static/gone.js"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let scan = http_scanner(1 << 20).scan(&server.uri()).await.unwrap();
    let app = format!("{}/static/app.js", server.uri());
    let gone = format!("{}/static/gone.js", server.uri());

    assert_eq!(scan.script_urls, vec![app.clone(), gone.clone()]);
    assert!(scan.endpoints.contains(&"/login".to_string()));
    assert!(scan.endpoints.contains(&"/api/users".to_string()));
    assert!(scan.endpoints.contains(&"/static/app.js".to_string()));

    assert_eq!(scan.errors.len(), 1);
    assert!(scan.errors[0].starts_with(&format!("{} -> ", gone)));
    assert!(scan.errors[0].contains("404"));

    let kinds: Vec<_> = scan
        .sinks
        .iter()
        .filter(|s| s.source_url == app)
        .map(|s| (s.kind, s.source_type, s.line))
        .collect();
    assert!(kinds.contains(&(SinkKind::InnerHtml, SourceType::Script, 2)));
    assert!(kinds.contains(&(SinkKind::DirectDom, SourceType::Script, 2)));
}

#[tokio::test]
async fn test_oversized_script_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html_response(r#"<script src="/big.js"></script>"#))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/big.js"))
        .respond_with(js_response(&"x".repeat(4096)))
        .mount(&server)
        .await;

    let scan = http_scanner(1024).scan(&server.uri()).await.unwrap();
    assert_eq!(scan.errors.len(), 1);
    assert!(scan.errors[0].contains("byte limit"));
}

#[tokio::test]
async fn test_unreachable_page_fails_scan() {
    let result = http_scanner(1024).scan("http://127.0.0.1:1/").await;
    assert!(matches!(result, Err(ScanError::Navigation(_))));
}
