//! Browser Session Management
//!
//! One CDP connection, one default context, any number of isolated contexts.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::cdp::{CDPClient, CDPError, CdpBackend};
use crate::config::ContextConfig;
use crate::context::BrowserContext;
use crate::error::{ContextError, Result};
use crate::launch::{self, PersistentLaunchOptions};
use crate::watcher::{ContextScope, IsolatedContextIds};

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub id: String,
    pub cdp_url: String,
    /// Configuration of the default context
    pub context: ContextConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            cdp_url: "ws://localhost:9222".to_string(),
            context: ContextConfig::default(),
        }
    }
}

/// Browser Session - connection to the browser and its contexts
pub struct BrowserSession {
    pub config: SessionConfig,

    client: RwLock<Option<Arc<CDPClient>>>,
    backend: RwLock<Option<Arc<dyn CdpBackend>>>,

    default_context: RwLock<Option<BrowserContext>>,
    /// Contexts created through `new_context`, by browserContextId
    contexts: RwLock<HashMap<String, BrowserContext>>,
    /// Shared with every context scope so targets are owned exactly once
    isolated: IsolatedContextIds,
}

impl BrowserSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            backend: RwLock::new(None),
            default_context: RwLock::new(None),
            contexts: RwLock::new(HashMap::new()),
            isolated: IsolatedContextIds::default(),
        }
    }

    /// Validate `options`, prepare the profile and connect.
    ///
    /// Profile preparation, the connection and the default context setup
    /// share one timeout, `options.timeout` or the default wait timeout.
    pub async fn start_persistent(&self, options: &PersistentLaunchOptions) -> Result<BrowserContext> {
        options.launch_args()?;
        let timeout = options
            .timeout
            .or(self.config.context.default_timeout)
            .unwrap_or_else(crate::config::default_timeout);

        launch::with_launch_timeout(timeout, async {
            options.prepare_user_data_dir().await?;
            self.start().await
        })
        .await
    }

    /// Connect to `config.cdp_url` and attach the default context
    pub async fn start(&self) -> Result<BrowserContext> {
        let client = CDPClient::connect(&self.config.cdp_url).await?;
        *self.client.write().await = Some(client.clone());
        self.attach_backend(client).await
    }

    /// Attach the default context over an already established backend
    pub async fn attach_backend(&self, backend: Arc<dyn CdpBackend>) -> Result<BrowserContext> {
        let contexts = backend
            .send_request("Target.getBrowserContexts", None, None)
            .await?;
        let default_id = contexts["defaultBrowserContextId"]
            .as_str()
            .map(str::to_string);

        let scope = ContextScope {
            browser_context_id: default_id,
            is_default: true,
            isolated: self.isolated.clone(),
        };
        let context =
            BrowserContext::attach_scoped(backend.clone(), scope, self.config.context.clone()).await?;

        *self.backend.write().await = Some(backend);
        *self.default_context.write().await = Some(context.clone());
        tracing::info!(session = %self.config.id, "[BrowserSession] Started");
        Ok(context)
    }

    async fn backend(&self) -> Result<Arc<dyn CdpBackend>> {
        self.backend
            .read()
            .await
            .clone()
            .ok_or(ContextError::ContextClosed)
    }

    /// The persistent default context
    pub async fn default_context(&self) -> Result<BrowserContext> {
        self.default_context
            .read()
            .await
            .clone()
            .ok_or(ContextError::ContextClosed)
    }

    /// Create an isolated browser context
    pub async fn new_context(&self, config: ContextConfig) -> Result<BrowserContext> {
        let backend = self.backend().await?;
        let result = backend
            .send_request(
                "Target.createBrowserContext",
                Some(json!({ "disposeOnDetach": true })),
                None,
            )
            .await?;
        let id = result["browserContextId"]
            .as_str()
            .ok_or_else(|| CDPError::Protocol {
                code: -1,
                message: "Target.createBrowserContext returned no browserContextId".to_string(),
            })?
            .to_string();

        let scope = ContextScope {
            browser_context_id: Some(id.clone()),
            is_default: false,
            isolated: self.isolated.clone(),
        };
        let context = BrowserContext::attach_scoped(backend, scope, config).await?;
        self.contexts.write().await.insert(id, context.clone());
        Ok(context)
    }

    /// Every context still tracked by the session, default first
    pub async fn contexts(&self) -> Vec<BrowserContext> {
        let mut all: Vec<BrowserContext> = self.default_context.read().await.iter().cloned().collect();
        all.extend(self.contexts.read().await.values().cloned());
        all
    }

    /// Close every context, then the connection
    pub async fn stop(&self) -> Result<()> {
        let isolated: Vec<BrowserContext> = self.contexts.write().await.drain().map(|(_, c)| c).collect();
        for context in isolated {
            context.close().await?;
        }

        if let Some(context) = self.default_context.write().await.take() {
            context.close().await?;
        }

        self.backend.write().await.take();
        if let Some(client) = self.client.write().await.take() {
            // The browser may already have dropped the socket after Browser.close
            if let Err(e) = client.close().await {
                tracing::debug!("[BrowserSession] Connection close: {}", e);
            }
        }

        tracing::info!(session = %self.config.id, "[BrowserSession] Stopped");
        Ok(())
    }
}
