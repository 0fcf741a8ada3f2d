use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use headless_chrome::{Browser, LaunchOptions, Tab};
use tracing::{debug, info, warn};

use super::{
    CHALLENGE_PATH, ChallengeError, ChallengeResult, ChallengeSolver, Credentials, domain_hint,
    site_cookies,
};
use crate::kruoka::rate_limiter::Sleeper;

/// Seconds into the wait at which the widget gets clicked.
const CLICK_AT_SECS: [u64; 2] = [5, 30];

const WIDGET_SELECTOR: &str = "iframe[src*='challenges.cloudflare.com'], .cf-turnstile";

/// Launch settings shared by every browser-backed strategy.
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub headless: bool,
    pub profile_dir: Option<PathBuf>,
    pub wait: Duration,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: false,
            profile_dir: None,
            wait: Duration::from_secs(90),
        }
    }
}

/// True while the page still shows the interstitial.
pub(crate) fn is_challenge_title(title: &str) -> bool {
    let lower = title.to_lowercase();
    lower.contains("moment") || lower.contains("verif")
}

fn browser_err(context: &str, e: impl std::fmt::Display) -> ChallengeError {
    ChallengeError::Browser(format!("{context}: {e}"))
}

/// An open browser pointed at the challenge page.
pub(crate) struct ChallengePage {
    // Held so the browser process outlives the tab.
    _browser: Browser,
    tab: Arc<Tab>,
    domain: String,
    sleeper: Arc<dyn Sleeper>,
}

impl ChallengePage {
    pub(crate) fn open(
        site_url: &str,
        options: &BrowserOptions,
        sleeper: Arc<dyn Sleeper>,
    ) -> ChallengeResult<Self> {
        if let Some(dir) = &options.profile_dir {
            std::fs::create_dir_all(dir)
                .map_err(|e| browser_err("Failed to create profile directory", e))?;
        }

        let launch_options = LaunchOptions {
            headless: options.headless,
            sandbox: false,
            window_size: Some((1920, 1080)),
            user_data_dir: options.profile_dir.clone(),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
            ],
            ..Default::default()
        };

        let browser =
            Browser::new(launch_options).map_err(|e| browser_err("Failed to launch browser", e))?;
        let tab = browser
            .new_tab()
            .map_err(|e| browser_err("Failed to create new tab", e))?;

        let url = format!("{}{}", site_url.trim_end_matches('/'), CHALLENGE_PATH);
        info!(url = %url, "Navigating browser to challenge page");
        tab.navigate_to(&url)
            .map_err(|e| browser_err("Failed to navigate", e))?;
        tab.wait_until_navigated()
            .map_err(|e| browser_err("Failed to wait for navigation", e))?;

        Ok(Self {
            _browser: browser,
            tab,
            domain: domain_hint(site_url),
            sleeper,
        })
    }

    pub(crate) fn evaluate(&self, script: &str) -> ChallengeResult<Option<serde_json::Value>> {
        let result = self
            .tab
            .evaluate(script, false)
            .map_err(|e| browser_err("Script evaluation failed", e))?;
        Ok(result.value)
    }

    /// Poll the page title once per second until the interstitial is gone,
    /// clicking the widget at the scheduled moments.
    pub(crate) fn wait_for_clearance(&self, wait: Duration, click: bool) -> ChallengeResult<()> {
        for second in 0..wait.as_secs() {
            let title = match self.tab.get_title() {
                Ok(title) => title,
                Err(_) => {
                    info!("Page navigating... waiting for reload");
                    self.sleeper.sleep(Duration::from_secs(3));
                    if let Err(e) = self.tab.wait_until_navigated() {
                        debug!(error = %e, "Navigation wait failed, polling again");
                    }
                    continue;
                }
            };

            if !is_challenge_title(&title) {
                info!(title = %title, "Challenge cleared");
                return Ok(());
            }

            if click && CLICK_AT_SECS.contains(&second) {
                if second == CLICK_AT_SECS[0] {
                    warn!("Challenge detected, attempting widget click");
                }
                self.click_widget();
            }

            self.sleeper.sleep(Duration::from_secs(1));
        }

        Err(ChallengeError::Browser(format!(
            "Challenge did not resolve within {}s",
            wait.as_secs()
        )))
    }

    fn click_widget(&self) {
        match self.tab.find_element(WIDGET_SELECTOR) {
            Ok(element) => match element.click() {
                Ok(_) => info!("Clicked challenge widget"),
                Err(e) => warn!(error = %e, "Widget click failed"),
            },
            Err(_) => warn!("Challenge widget not found"),
        }
    }

    /// Site cookies and the browser's user agent.
    pub(crate) fn harvest(&self) -> ChallengeResult<Credentials> {
        let cookies = self
            .tab
            .get_cookies()
            .map_err(|e| browser_err("Failed to read cookies", e))?;
        let cookies = site_cookies(
            cookies
                .iter()
                .map(|c| (c.name.as_str(), c.value.as_str(), c.domain.as_str())),
            &self.domain,
        );

        let user_agent = self
            .evaluate("navigator.userAgent")?
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        Ok(Credentials::new(cookies, user_agent))
    }
}

/// Drives a real browser and waits for the challenge to clear itself,
/// clicking the widget if it does not. Unreliable; used last.
pub struct BrowserSolver {
    site_url: String,
    options: BrowserOptions,
    sleeper: Arc<dyn Sleeper>,
}

impl BrowserSolver {
    pub fn new(site_url: &str, options: BrowserOptions, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            site_url: site_url.to_string(),
            options,
            sleeper,
        }
    }
}

impl ChallengeSolver for BrowserSolver {
    fn name(&self) -> &str {
        "Browser"
    }

    fn solve(&self) -> ChallengeResult<Credentials> {
        info!(headless = self.options.headless, "Launching browser for direct bypass");
        let page = ChallengePage::open(&self.site_url, &self.options, self.sleeper.clone())?;
        page.wait_for_clearance(self.options.wait, true)?;
        page.harvest()?.require_clearance(self.name())
    }
}
