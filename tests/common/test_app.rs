use reqwest::Client;
use reqwest::multipart::{Form, Part};
use std::time::Duration;
use tokio::net::TcpListener;

use syncbox::{AppState, Config, build_app};

/// HTTP test application wrapper
///
/// Runs the real router on a random port over tempdir-backed storage. Each
/// test gets its own server instance so tests run in parallel.
pub struct TestApp {
    /// Server base URL (e.g., "http://127.0.0.1:54321")
    pub address: String,
    /// HTTP client for making requests
    pub client: Client,
    /// The served application state, for white-box assertions on storage.
    pub state: AppState,
    _root: tempfile::TempDir,
}

impl TestApp {
    /// Create a test app with default configuration.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test app, tweaking the configuration first.
    ///
    /// # Example
    /// ```rust,ignore
    /// let app = TestApp::with_config(|c| c.server.max_upload_bytes = 1024).await;
    /// ```
    pub async fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let root = tempfile::tempdir().expect("Failed to create temp storage root");

        let mut config = Config::default();
        config.storage.shared_root = root.path().to_string_lossy().into_owned();
        tweak(&mut config);

        let state = AppState::new(config);
        state.init_storage().await.expect("Failed to init storage");

        let app = build_app(state.clone());

        // Bind to random port (port 0 tells OS to assign an available port)
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind random port");
        let port = listener.local_addr().unwrap().port();
        let address = format!("http://127.0.0.1:{port}");

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Give the server a moment to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            address,
            client,
            state,
            _root: root,
        }
    }

    /// Get the full URL for an API endpoint
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    /// POST /files/upload-safe with the standard multipart fields.
    pub async fn upload_safe(
        &self,
        file_name: &str,
        bytes: &[u8],
        client_id: &str,
        last_modified: &str,
    ) -> reqwest::Response {
        let form = Form::new()
            .part(
                "file",
                Part::bytes(bytes.to_vec()).file_name(file_name.to_string()),
            )
            .text("file_name", file_name.to_string())
            .text("client_id", client_id.to_string())
            .text("last_modified", last_modified.to_string());

        self.client
            .post(self.url("/files/upload-safe"))
            .multipart(form)
            .send()
            .await
            .unwrap()
    }

    /// POST /files/chunk for one numbered part.
    #[allow(clippy::too_many_arguments)]
    pub async fn upload_chunk(
        &self,
        file_id: &str,
        chunk_number: u64,
        total_chunks: u64,
        file_name: &str,
        client_id: &str,
        last_modified: &str,
        bytes: &[u8],
    ) -> reqwest::Response {
        let form = Form::new()
            .part(
                "chunk",
                Part::bytes(bytes.to_vec()).file_name(file_name.to_string()),
            )
            .text("file_id", file_id.to_string())
            .text("chunk_number", chunk_number.to_string())
            .text("total_chunks", total_chunks.to_string())
            .text("file_name", file_name.to_string())
            .text("client_id", client_id.to_string())
            .text("last_modified", last_modified.to_string());

        self.client
            .post(self.url("/files/chunk"))
            .multipart(form)
            .send()
            .await
            .unwrap()
    }

    /// GET /files/{name}/download
    pub async fn download(&self, file_name: &str) -> reqwest::Response {
        self.client
            .get(self.url(&format!("/files/{}/download", file_name)))
            .send()
            .await
            .unwrap()
    }
}
