//! Shared fixtures: a deterministic Ed25519 signer, its JWKS document, and
//! a gateway spawner bound to an ephemeral port.

#![allow(dead_code)]

use std::sync::Arc;

use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use ed25519_dalek::{Signer, SigningKey};

use botauth_gateway::config::Config;
use botauth_gateway::server::Server;
use botauth_gateway::server::router::{AppState, create_router};

/// The fixture key's identifier.
pub const KID: &str = "K1";

/// Directory URL the fixture JWKS is primed under.
pub const JWKS_URL: &str = "https://idp.example/jwks/alice.json";

/// Deterministic signing key shared by signer and JWKS fixture.
pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

/// JWKS document body matching [`signing_key`].
pub fn jwks_json() -> String {
    let x = URL_SAFE_NO_PAD.encode(signing_key().verifying_key().to_bytes());
    format!(
        r#"{{"keys":[{{"kty":"OKP","crv":"Ed25519","kid":"{KID}","x":"{x}"}}],"client_name":"Alice Bot"}}"#
    )
}

/// The signature headers produced for one request.
pub struct SignedHeaders {
    pub signature_input: String,
    pub signature: String,
}

/// Sign `components` over a request the way an RFC 9421 agent would.
///
/// Supported components: `@method`, `@target-uri`, `@path`, `@authority`,
/// plain header names (looked up in `headers`), and the literal
/// `signature-agent;key=sig1` selector (serialized from
/// `agent_header_value`, which must be the `sig1="…"` dictionary form).
pub fn sign(
    method: &str,
    url: &str,
    components: &[&str],
    headers: &[(&str, &str)],
    nonce: &str,
    agent_header_value: &str,
    now: i64,
) -> SignedHeaders {
    let parsed = url::Url::parse(url).expect("signable URL");

    let mut idents = Vec::new();
    let mut lines = Vec::new();
    for component in components {
        let (ident, value) = match *component {
            "@method" => ("\"@method\"".to_string(), method.to_uppercase()),
            "@target-uri" => ("\"@target-uri\"".to_string(), url.to_string()),
            "@path" => ("\"@path\"".to_string(), parsed.path().to_string()),
            "@authority" => {
                let host = parsed.host_str().expect("URL host").to_lowercase();
                let authority = match parsed.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host,
                };
                ("\"@authority\"".to_string(), authority)
            }
            "signature-agent;key=sig1" => (
                "\"signature-agent\";key=\"sig1\"".to_string(),
                agent_header_value
                    .strip_prefix("sig1=")
                    .expect("dictionary-form agent value")
                    .to_string(),
            ),
            name => (
                format!("\"{name}\""),
                headers
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, v)| v.trim().to_string())
                    .unwrap_or_default(),
            ),
        };
        idents.push(ident.clone());
        lines.push(format!("{ident}: {value}"));
    }

    let params = format!(
        "({});created={now};keyid=\"{KID}\";alg=\"ed25519\";nonce=\"{nonce}\"",
        idents.join(" ")
    );
    let base = format!("{}\n\"@signature-params\": {params}", lines.join("\n"));
    let signature = signing_key().sign(base.as_bytes());

    SignedHeaders {
        signature_input: format!("sig1={params}"),
        signature: format!("sig1=:{}:", STANDARD.encode(signature.to_bytes())),
    }
}

/// Unix seconds now.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Spawn a gateway on an ephemeral port; returns its base URL and state.
pub async fn spawn_gateway(config: Config) -> (String, Arc<AppState>) {
    let server = Server::new(config).expect("server wiring");
    let state = server.state();
    let router = create_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("ephemeral bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });

    (format!("http://{addr}"), state)
}

/// A gateway primed with the fixture JWKS and trusting its directory.
pub async fn spawn_primed_gateway(mutate: impl FnOnce(&mut Config)) -> (String, Arc<AppState>) {
    let mut config = Config {
        trusted_directories: vec!["idp.example".to_string()],
        telemetry_log_path: std::env::temp_dir()
            .join(format!("botauth-test-{}.log", uuid::Uuid::new_v4()))
            .display()
            .to_string(),
        ..Config::default()
    };
    mutate(&mut config);

    let (base, state) = spawn_gateway(config).await;
    state.jwks.prime(
        JWKS_URL,
        botauth_gateway::jwks::JwksDocument::parse(jwks_json().as_bytes()).expect("fixture JWKS"),
    );
    (base, state)
}
