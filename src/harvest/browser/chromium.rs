//! Chromium-backed `BrowserDriver` using chromiumoxide.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use url::Url;

use super::{BrowserDriver, DomCandidate, DriverError, DriverResult, PageStatus};

/// Reads grid entries on a feed page and media on an opened post.
const COLLECT_REFERENCES_JS: &str = r#"(() => {
    const out = [];
    const seen = new Set();
    const push = (url, container, cover) => {
        if (url && !seen.has(url)) {
            seen.add(url);
            out.push({ url: url, looks_like_container: container, cover: cover || null });
        }
    };
    if (/\/(p|reel|tv)\//.test(location.pathname)) {
        document
            .querySelectorAll('article img, div[role="button"] img, img[src*="cdninstagram"], img[src*="scontent"]')
            .forEach(img => push(img.currentSrc || img.src, false));
        return out;
    }
    document.querySelectorAll('a[href*="/p/"], a[href*="/reel/"]').forEach(a => {
        const multi = a.querySelector('svg[aria-label="Carousel"], svg[aria-label*="carousel"]') !== null;
        const img = a.querySelector('img');
        if (multi || !img) {
            push(a.href, true, img ? (img.currentSrc || img.src) : null);
        } else {
            push(img.currentSrc || img.src, false);
        }
    });
    return out;
})()"#;

const PAGE_STATUS_JS: &str = r#"(() => {
    const text = document.body ? document.body.innerText : '';
    if (text.includes("Sorry, this page isn't available")) return 'unavailable';
    if (location.pathname.includes('/accounts/login')) return 'login';
    if (document.querySelector('input[name="password"]') !== null) return 'login';
    return 'ready';
})()"#;

/// Launch options for [`ChromiumDriver`]
#[derive(Debug, Clone)]
pub struct ChromiumOptions {
    pub headless: bool,
    pub executable: Option<PathBuf>,
    pub user_agent: String,
    pub window_size: (u32, u32),
    /// Extra wait after the document reports complete, for lazy-loaded grids.
    pub settle_delay: Duration,
    /// Upper bound on any single scripted action (scroll, click, read).
    pub action_timeout: Duration,
}

impl Default for ChromiumOptions {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            window_size: (1366, 768),
            settle_delay: Duration::from_millis(2000),
            action_timeout: Duration::from_secs(30),
        }
    }
}

/// One Chromium tab driven through the DevTools protocol.
pub struct ChromiumDriver {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    settle_delay: Duration,
    action_timeout: Duration,
}

impl ChromiumDriver {
    /// Launch Chromium and open a blank tab.
    pub async fn launch(options: ChromiumOptions) -> DriverResult<Self> {
        let mut builder = BrowserConfig::builder()
            .arg("--no-sandbox")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg(format!("--window-size={},{}", options.window_size.0, options.window_size.1))
            .arg(format!("--user-agent={}", options.user_agent));
        if !options.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &options.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder
            .build()
            .map_err(|e| DriverError::Browser(format!("failed to build browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| DriverError::Browser(format!("failed to launch Chromium: {e}")))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Chromium handler event error: {}", e);
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| DriverError::Browser(format!("failed to open tab: {e}")))?;

        info!(headless = options.headless, "Chromium launched");

        Ok(Self {
            browser,
            page,
            handler_task,
            settle_delay: options.settle_delay,
            action_timeout: options.action_timeout,
        })
    }

    /// Close the browser and stop the event handler.
    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Failed to close Chromium cleanly: {}", e);
        }
        self.handler_task.abort();
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, script: &str) -> DriverResult<T> {
        let result = within(self.action_timeout, async {
            self.page
                .evaluate(script)
                .await
                .map_err(|e| DriverError::Script(e.to_string()))
        })
        .await?;
        result
            .into_value()
            .map_err(|e| DriverError::Script(format!("failed to convert JS result: {e:?}")))
    }

    async fn run(&self, script: &str) -> DriverResult<()> {
        within(self.action_timeout, async {
            self.page
                .evaluate(script)
                .await
                .map(|_| ())
                .map_err(|e| DriverError::Script(e.to_string()))
        })
        .await
    }

    pub async fn current_url(&self) -> DriverResult<String> {
        let url = within(self.action_timeout, async {
            self.page.url().await.map_err(|e| DriverError::Browser(e.to_string()))
        })
        .await?;
        Ok(url.map(|u| u.to_string()).unwrap_or_default())
    }
}

/// Bound one browser action by `limit`.
async fn within<T>(limit: Duration, action: impl Future<Output = DriverResult<T>>) -> DriverResult<T> {
    timeout(limit, action).await.map_err(|_| DriverError::Timeout(limit))?
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn navigate(&mut self, url: &Url, limit: Duration) -> DriverResult<()> {
        let start = Instant::now();
        match timeout(limit, self.page.goto(url.as_str())).await {
            Ok(Ok(_)) => {
                debug!(url = %url, elapsed_ms = start.elapsed().as_millis() as u64, "Navigated");
                Ok(())
            }
            Ok(Err(e)) => Err(DriverError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(DriverError::Timeout(limit)),
        }
    }

    async fn scroll_by(&mut self, pixels: i64) -> DriverResult<()> {
        self.run(&format!("window.scrollBy(0, {pixels})")).await
    }

    async fn click(&mut self, selector: &str) -> DriverResult<bool> {
        let quoted = serde_json::to_string(selector)
            .map_err(|e| DriverError::Script(e.to_string()))?;
        let script = format!(
            "(() => {{ const el = document.querySelector({quoted}); if (!el) return false; el.click(); return true; }})()"
        );
        self.eval(&script).await
    }

    async fn current_references(&mut self) -> DriverResult<Vec<DomCandidate>> {
        self.eval(COLLECT_REFERENCES_JS).await
    }

    async fn wait_for_load(&mut self, limit: Duration) -> DriverResult<()> {
        let deadline = Instant::now() + limit;
        loop {
            let state: String = self.eval("document.readyState").await?;
            if state == "complete" {
                break;
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout(limit));
            }
            sleep(Duration::from_millis(100)).await;
        }
        sleep(self.settle_delay).await;
        Ok(())
    }

    async fn go_back(&mut self, limit: Duration) -> DriverResult<()> {
        let before = self.current_url().await?;
        self.run("history.back()").await?;
        let deadline = Instant::now() + limit;
        while self.current_url().await? == before {
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout(limit));
            }
            sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    async fn page_status(&mut self) -> DriverResult<PageStatus> {
        let status: String = self.eval(PAGE_STATUS_JS).await?;
        Ok(match status.as_str() {
            "login" => PageStatus::LoginRequired,
            "unavailable" => PageStatus::Unavailable,
            _ => PageStatus::Ready,
        })
    }

    async fn export_session(&mut self) -> DriverResult<serde_json::Value> {
        let cookies = self
            .page
            .get_cookies()
            .await
            .map_err(|e| DriverError::Session(e.to_string()))?;
        serde_json::to_value(&cookies).map_err(|e| DriverError::Session(e.to_string()))
    }

    async fn import_session(&mut self, blob: &serde_json::Value) -> DriverResult<()> {
        if blob.is_null() {
            return Ok(());
        }
        let cookies: Vec<CookieParam> = serde_json::from_value(blob.clone())
            .map_err(|e| DriverError::Session(format!("unreadable cookie jar: {e}")))?;
        let count = cookies.len();
        self.page
            .set_cookies(cookies)
            .await
            .map_err(|e| DriverError::Session(e.to_string()))?;
        debug!("Imported {} cookies", count);
        Ok(())
    }
}
