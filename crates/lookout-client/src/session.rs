use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lookout_core::error::AppError;
use lookout_core::traits::SessionFactory;
use reqwest::{Client, Proxy};

const DEFAULT_USER_AGENT: &str = "lookout/0.1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One pooled HTTP context: its own connection pool and cookie jar.
#[derive(Debug)]
pub struct HttpSession {
    client: Client,
    group: String,
    timeout: Duration,
    created_at: Instant,
}

impl HttpSession {
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Request timeout configured on the client.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Builds a fresh `reqwest` client per session.
///
/// Sessions never share cookies, so a session that picked up a block or a
/// poisoned cookie is discarded together with its jar when the pool destroys
/// it. A proxy can be configured per pool group.
#[derive(Debug, Clone)]
pub struct HttpSessionFactory {
    user_agent: String,
    timeout: Duration,
    proxies: Arc<HashMap<String, String>>,
    use_env_proxy: bool,
}

impl Default for HttpSessionFactory {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            proxies: Arc::new(HashMap::new()),
            use_env_proxy: true,
        }
    }
}

impl HttpSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Route every session of `group` through `proxy` (`http://`, `socks5://`).
    pub fn with_proxy(mut self, group: impl Into<String>, proxy: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.proxies).insert(group.into(), proxy.into());
        self
    }

    /// Ignore `HTTP_PROXY`/`HTTPS_PROXY` from the environment.
    pub fn without_env_proxy(mut self) -> Self {
        self.use_env_proxy = false;
        self
    }

    fn build_client(&self, group: &str) -> Result<Client, AppError> {
        let mut builder = Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.timeout)
            .cookie_store(true);

        if let Some(proxy) = self.proxies.get(group) {
            let proxy = Proxy::all(proxy)
                .map_err(|e| AppError::ConfigError(format!("invalid proxy for group {group}: {e}")))?;
            builder = builder.proxy(proxy);
        } else if !self.use_env_proxy {
            builder = builder.no_proxy();
        }

        builder
            .build()
            .map_err(|e| AppError::SessionError(format!("cannot build HTTP client: {e}")))
    }
}

impl SessionFactory for HttpSessionFactory {
    type Session = HttpSession;

    async fn create(&self, group: &str) -> Result<HttpSession, AppError> {
        let client = self.build_client(group)?;
        tracing::debug!(%group, "HTTP session created");
        Ok(HttpSession {
            client,
            group: group.to_string(),
            timeout: self.timeout,
            created_at: Instant::now(),
        })
    }

    async fn destroy(&self, session: HttpSession) {
        tracing::debug!(
            group = %session.group,
            age_ms = session.age().as_millis() as u64,
            "HTTP session destroyed"
        );
    }
}
