pub mod llms;

use std::{net::SocketAddr, sync::Arc, sync::Once, time::Duration};

use config::Config;
use llm::Gateway;
use llms::{LlmMock, provider_config};
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde_json::Value;
use server::ServeConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

static INIT: Once = Once::new();

fn init_crypto_provider() {
    INIT.call_once(|| {
        rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .expect("Failed to install default crypto provider");
    });
}

/// Test client for making HTTP requests to the test server
#[derive(Clone)]
pub struct TestClient {
    base_url: String,
    client: reqwest::Client,
    api_key: Option<String>,
}

impl TestClient {
    /// Create a new test client for the given base URL
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
            api_key: None,
        }
    }

    /// A client sending `Authorization: Bearer <key>`.
    pub fn with_api_key(&self, key: &str) -> Self {
        Self {
            api_key: Some(key.to_string()),
            ..self.clone()
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));

        match &self.api_key {
            Some(key) => builder.header(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {key}")).unwrap()),
            None => builder,
        }
    }

    /// Send a POST request to the given path with JSON body
    pub async fn post(&self, path: &str, body: &Value) -> reqwest::Response {
        self.request(reqwest::Method::POST, path).json(body).send().await.unwrap()
    }

    /// Send a POST request with extra headers
    pub async fn post_with_header(&self, path: &str, body: &Value, name: &'static str, value: &str) -> reqwest::Response {
        self.request(reqwest::Method::POST, path)
            .header(name, value)
            .json(body)
            .send()
            .await
            .unwrap()
    }

    /// Send a GET request to the given path
    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.request(reqwest::Method::GET, path).send().await.unwrap()
    }

    /// POST and decode the JSON answer, whatever the status.
    pub async fn post_json(&self, path: &str, body: &Value) -> (u16, Value) {
        let response = self.post(path, body).await;
        let status = response.status().as_u16();

        (status, response.json().await.unwrap())
    }
}

/// The `data:` payloads of an SSE body, in order.
pub fn sse_data(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim_start().to_string())
        .collect()
}

/// The `event:` names of an SSE body, in order.
pub fn sse_event_names(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("event:"))
        .map(|name| name.trim().to_string())
        .collect()
}

/// Test server that manages the lifecycle of a server instance
pub struct TestServer {
    pub client: TestClient,
    pub address: SocketAddr,
    pub gateway: Arc<Gateway>,
    shutdown: CancellationToken,
    _handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub fn builder() -> TestServerBuilder {
        TestServerBuilder::default()
    }

    /// Start a new test server with the given TOML configuration
    pub async fn start(config_toml: &str) -> Self {
        init_crypto_provider();

        let config = Config::parse(config_toml).unwrap();
        let gateway = Arc::new(Gateway::new(&config).unwrap());

        // Find an available port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let shutdown = CancellationToken::new();

        let serve_config = ServeConfig {
            listen_address: address,
            config,
            gateway: gateway.clone(),
            shutdown: shutdown.clone(),
        };

        let handle = tokio::spawn(async move {
            // Drop the listener so the server can bind to the address
            drop(listener);

            if let Err(e) = server::serve(serve_config).await {
                eprintln!("Server failed to start: {e}");
            }
        });

        let client = TestClient::new(format!("http://{address}"));

        // Wait until the server answers
        for _ in 0..50 {
            let ready = reqwest::get(format!("http://{address}/health")).await;

            if ready.is_ok() {
                break;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        TestServer {
            client,
            address,
            gateway,
            shutdown,
            _handle: handle,
        }
    }

    /// Reloads the gateway from TOML, as SIGHUP does from the file.
    pub fn reload(&self, config_toml: &str) -> Result<u64, llm::SnapshotError> {
        let config = Config::parse(config_toml).map_err(llm::SnapshotError::Invalid)?;
        self.gateway.reload(&config)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Collects provider sections from spawned mocks in front of the test's own configuration.
#[derive(Default)]
pub struct TestServerBuilder {
    providers: String,
}

impl TestServerBuilder {
    /// Starts a mock upstream and registers it as a provider.
    pub async fn spawn_llm(&mut self, mock: LlmMock) {
        let spawned = mock.spawn().await.unwrap();
        self.providers.push_str(&provider_config(&spawned));
    }

    pub async fn build(self, config_toml: &str) -> TestServer {
        let config = format!("{config_toml}\n{}", self.providers);
        TestServer::start(&config).await
    }
}
