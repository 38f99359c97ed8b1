use bytes::Bytes;
use serde_json::{Value as JsonValue, json};

use vxproxy_provider_core::{
    Credential, HttpMethod, InboundRequest, ResolveError, UpstreamProvider, header_get,
};
use vxproxy_provider_impl::{
    BodyOp, ModelPattern, RewriteRule, RewriteTable, VertexExpressConfig, VertexExpressProvider,
};

fn inbound(model: &str, action: &str, body: &'static str) -> InboundRequest {
    InboundRequest {
        method: HttpMethod::Post,
        model: model.to_string(),
        action: action.to_string(),
        query: None,
        headers: vec![
            ("Host".to_string(), "gateway.local".to_string()),
            ("x-goog-api-key".to_string(), "proxy-secret".to_string()),
            ("content-length".to_string(), "42".to_string()),
            ("user-agent".to_string(), "client/1.0".to_string()),
        ],
        body: Bytes::from_static(body.as_bytes()),
    }
}

fn body_json(body: &Option<Bytes>) -> JsonValue {
    serde_json::from_slice(body.as_ref().unwrap()).unwrap()
}

#[test]
fn generate_request_shape() {
    let provider = VertexExpressProvider::default();
    let req = inbound(
        "gemini-2.5-pro",
        "generateContent",
        r#"{"contents":[{"parts":[{"text":"hi"}]}]}"#,
    );

    let out = provider.build_generate(&req, "backend-key", "proj-7").unwrap();
    assert_eq!(out.method, HttpMethod::Post);
    assert_eq!(
        out.url,
        "https://aiplatform.googleapis.com/v1/projects/proj-7/locations/global/publishers/google/models/gemini-2.5-pro:generateContent"
    );
    assert!(!out.is_stream);
    assert_eq!(header_get(&out.headers, "x-goog-api-key"), Some("backend-key"));
    assert_eq!(header_get(&out.headers, "host"), None);
    assert_eq!(header_get(&out.headers, "content-length"), None);
    assert_eq!(header_get(&out.headers, "user-agent"), Some("client/1.0"));
    assert_eq!(header_get(&out.headers, "content-type"), Some("application/json"));

    let body = body_json(&out.body);
    assert_eq!(body["contents"][0]["role"], json!("user"));
    assert!(body["generationConfig"].is_object());
    assert_eq!(body["safetySettings"].as_array().unwrap().len(), 8);
}

#[test]
fn proxy_secret_never_reaches_backend() {
    let provider = VertexExpressProvider::default();
    let mut req = inbound("gemini-2.5-pro", "streamGenerateContent", "{}");
    req.query = Some("key=proxy-secret".to_string());

    let out = provider.build_generate(&req, "backend-key", "p").unwrap();
    assert!(!out.url.contains("proxy-secret"));
    assert!(out.url.ends_with(":streamGenerateContent?alt=sse"));
    assert!(out.is_stream);
    for (_, value) in &out.headers {
        assert_ne!(value, "proxy-secret");
    }
}

#[test]
fn models_prefix_is_stripped() {
    let provider = VertexExpressProvider::default();
    let req = inbound("models/gemini-2.5-flash", "countTokens", r#"{"contents":[]}"#);
    let out = provider.build_generate(&req, "k", "p").unwrap();
    assert!(out.url.ends_with("/models/gemini-2.5-flash:countTokens"));
    // countTokens bodies are forwarded without generation rewrites.
    assert_eq!(body_json(&out.body), json!({ "contents": [] }));
}

#[test]
fn model_rule_adds_stream_flag() {
    let table = RewriteTable::new().with_rule(
        RewriteRule::new(ModelPattern::exact("modelX")).op(BodyOp::set("stream", json!(true))),
    );
    let provider = VertexExpressProvider::with_rewrites(VertexExpressConfig::default(), table);

    let out = provider
        .build_generate(&inbound("modelX", "generateContent", r#"{"prompt": "hi"}"#), "k", "p")
        .unwrap();
    assert_eq!(body_json(&out.body), json!({ "prompt": "hi", "stream": true }));

    let out = provider
        .build_generate(&inbound("modelY", "generateContent", r#"{"prompt": "hi"}"#), "k", "p")
        .unwrap();
    assert_eq!(body_json(&out.body), json!({ "prompt": "hi" }));
}

#[test]
fn image_generation_alias_changes_target_model() {
    let provider = VertexExpressProvider::default();
    let out = provider
        .build_generate(
            &inbound("gemini-2.0-flash-exp-image-generation", "generateContent", "{}"),
            "k",
            "p",
        )
        .unwrap();
    assert!(out.url.contains("/models/gemini-2.5-flash-image-preview:generateContent"));
    assert_eq!(
        body_json(&out.body)["generationConfig"]["responseModalities"],
        json!(["TEXT", "IMAGE"])
    );
}

#[test]
fn non_json_body_is_forwarded_verbatim() {
    let provider = VertexExpressProvider::default();
    let out = provider
        .build_generate(&inbound("gemini-2.5-pro", "generateContent", "not-json"), "k", "p")
        .unwrap();
    assert_eq!(out.body.as_deref(), Some(&b"not-json"[..]));
}

#[test]
fn custom_location_and_base_url() {
    let provider = VertexExpressProvider::new(VertexExpressConfig {
        base_url: "http://127.0.0.1:9000/".to_string(),
        location: "us-central1".to_string(),
        probe_model: "probe-model".to_string(),
    });
    let out = provider
        .build_generate(&inbound("m", "generateContent", "{}"), "k", "p")
        .unwrap();
    assert_eq!(
        out.url,
        "http://127.0.0.1:9000/v1/projects/p/locations/us-central1/publishers/google/models/m:generateContent"
    );

    let probe = provider.build_project_probe(&Credential::new(0, "probe-key")).unwrap();
    assert_eq!(
        probe.url,
        "http://127.0.0.1:9000/v1/publishers/google/models/probe-model:generateContent"
    );
    assert_eq!(header_get(&probe.headers, "x-goog-api-key"), Some("probe-key"));
    assert_eq!(probe.body.as_deref(), Some(&b"{}"[..]));
}

#[test]
fn probe_answers_are_classified() {
    let provider = VertexExpressProvider::default();
    let found = br#"{"error":{"code":404,"message":"Publisher Model `projects/abc/locations/global/publishers/google/models/gemini-2.6-pro` not found.","status":"NOT_FOUND"}}"#;
    assert_eq!(provider.parse_project_probe(404, found), Ok("abc".to_string()));
    assert!(matches!(
        provider.parse_project_probe(404, b"{}"),
        Err(ResolveError::Unresolvable(_))
    ));
    assert!(matches!(
        provider.parse_project_probe(502, b""),
        Err(ResolveError::Transient(_))
    ));
}

#[test]
fn empty_model_is_rejected() {
    let provider = VertexExpressProvider::default();
    assert!(provider
        .build_generate(&inbound("models/", "generateContent", "{}"), "k", "p")
        .is_err());
}
