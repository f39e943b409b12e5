// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Page renderers
//!
//! [`HttpRenderer`] returns the server HTML as-is. With the `headless`
//! feature, [`ChromiumRenderer`] drives one shared Chromium process and gives
//! every page its own isolated browser context.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::Client;
use std::time::Duration;

use super::config::FetchConfig;
use super::fetcher::{build_client, FetchError, RenderedPage};

/// Produces the HTML of a page after whatever rendering the backend does
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &str) -> Result<RenderedPage, FetchError>;

    fn name(&self) -> &'static str;

    /// Release backend resources; no renders may follow
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Plain GET renderer; no script execution
pub struct HttpRenderer {
    client: Client,
}

impl HttpRenderer {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = build_client(config, Duration::from_secs(config.page_timeout_secs))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageRenderer for HttpRenderer {
    async fn render(&self, url: &str) -> Result<RenderedPage, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let final_url = response.url().to_string();
        let html = response
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;

        Ok(RenderedPage { final_url, html })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(feature = "headless")]
pub use headless::ChromiumRenderer;

#[cfg(feature = "headless")]
mod headless {
    use super::*;
    use chromiumoxide::browser::{Browser, BrowserConfig};
    use chromiumoxide::cdp::browser_protocol::browser::CloseParams;
    use chromiumoxide::cdp::browser_protocol::target::{
        CreateBrowserContextParams, CreateTargetParams,
    };
    use chromiumoxide::Page;
    use futures::StreamExt;
    use tokio::task::JoinHandle;
    use tracing::{debug, warn};

    const SCROLL_SCRIPT: &str = "window.scrollTo(0, document.body.scrollHeight)";

    /// Headless Chromium renderer, one isolated context per page
    pub struct ChromiumRenderer {
        browser: Browser,
        handler_task: JoinHandle<()>,
        page_timeout: Duration,
        settle: Duration,
        scroll: bool,
    }

    impl ChromiumRenderer {
        /// Launch the shared browser process
        pub async fn launch(config: &FetchConfig) -> anyhow::Result<Self> {
            let browser_config = BrowserConfig::builder()
                .no_sandbox()
                .build()
                .map_err(|e| anyhow::anyhow!("invalid browser config: {}", e))?;
            let (browser, mut handler) = Browser::launch(browser_config).await?;
            let handler_task = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if event.is_err() {
                        break;
                    }
                }
            });

            Ok(Self {
                browser,
                handler_task,
                page_timeout: Duration::from_secs(config.page_timeout_secs),
                settle: Duration::from_millis(config.settle_millis),
                scroll: config.scroll_for_lazy_load,
            })
        }

        /// Shut the browser down; shared handles may still be alive
        pub async fn close(&self) -> anyhow::Result<()> {
            let result = self.browser.execute(CloseParams::default()).await;
            self.handler_task.abort();
            result?;
            debug!("Chromium browser closed");
            Ok(())
        }

        async fn render_in_page(&self, page: &Page, url: &str) -> Result<RenderedPage, FetchError> {
            let render_err = |message: String| FetchError::Render {
                url: url.to_string(),
                message,
            };

            tokio::time::timeout(self.page_timeout, async {
                page.goto(url).await.map_err(|e| render_err(e.to_string()))?;
                page.wait_for_navigation()
                    .await
                    .map_err(|e| render_err(e.to_string()))?;
                Ok::<(), FetchError>(())
            })
            .await
            .map_err(|_| FetchError::Timeout(url.to_string()))??;

            if self.scroll {
                if let Err(e) = page.evaluate(SCROLL_SCRIPT).await {
                    debug!("Scroll failed for {}: {}", url, e);
                }
            }
            tokio::time::sleep(self.settle).await;

            let html = page.content().await.map_err(|e| render_err(e.to_string()))?;
            let final_url = page
                .url()
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| url.to_string());

            Ok(RenderedPage { final_url, html })
        }
    }

    #[async_trait]
    impl PageRenderer for ChromiumRenderer {
        async fn render(&self, url: &str) -> Result<RenderedPage, FetchError> {
            let render_err = |message: String| FetchError::Render {
                url: url.to_string(),
                message,
            };

            let context_id = self
                .browser
                .create_browser_context(CreateBrowserContextParams::default())
                .await
                .map_err(|e| render_err(e.to_string()))?;

            let params = CreateTargetParams::builder()
                .url("about:blank")
                .browser_context_id(context_id.clone())
                .build()
                .map_err(render_err)?;

            let result = match self.browser.new_page(params).await {
                Ok(page) => {
                    let result = self.render_in_page(&page, url).await;
                    if let Err(e) = page.close().await {
                        warn!("Failed to close page for {}: {} (non-fatal)", url, e);
                    }
                    result
                }
                Err(e) => Err(render_err(e.to_string())),
            };

            if let Err(e) = self.browser.dispose_browser_context(context_id).await {
                warn!("Failed to dispose browser context for {}: {}", url, e);
            }
            result
        }

        fn name(&self) -> &'static str {
            "chromium"
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            self.close().await
        }
    }
}
