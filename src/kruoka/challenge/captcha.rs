use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::info;

use super::browser::{BrowserOptions, ChallengePage};
use super::{CHALLENGE_PATH, ChallengeError, ChallengeResult, ChallengeSolver, Credentials};
use crate::kruoka::rate_limiter::Sleeper;

const SUBMIT_URL: &str = "https://2captcha.com/in.php";
const RESULT_URL: &str = "https://2captcha.com/res.php";
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_TIMEOUT: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_POLLS: usize = 40;
const NOT_READY: &str = "CAPCHA_NOT_READY";

/// Settle time after the token has been injected.
const INJECT_SETTLE: Duration = Duration::from_secs(5);
const INJECT_WAIT: Duration = Duration::from_secs(30);

const PAGE_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

lazy_static! {
    static ref SITEKEY_PATTERNS: [Regex; 3] = [
        Regex::new(r#"data-sitekey="([^"]+)""#).unwrap(),
        Regex::new(r#"site[Kk]ey["\s:]+["']([^"']+)["']"#).unwrap(),
        Regex::new(r#"turnstile\.render\([^)]*sitekey["\s:]+["']([^"']+)"#).unwrap(),
    ];
}

#[derive(Debug, Deserialize)]
struct ServiceReply {
    status: i64,
    request: String,
}

/// Pull the widget sitekey out of the challenge page HTML.
pub(crate) fn extract_sitekey(html: &str) -> Option<String> {
    SITEKEY_PATTERNS
        .iter()
        .find_map(|re| re.captures(html).map(|caps| caps[1].to_string()))
}

/// Script that hands a solved token to the widget.
fn injection_script(token: &str) -> ChallengeResult<String> {
    let token = serde_json::to_string(token)?;
    Ok(format!(
        r#"(() => {{
            const el = document.querySelector(
                'input[name="cf-turnstile-response"], textarea[name="cf-turnstile-response"]'
            );
            if (el) el.value = {token};
            if (typeof window._cf_chl_opt !== 'undefined' && window._cf_chl_opt.chlApiCb) {{
                window._cf_chl_opt.chlApiCb({token});
            }}
        }})()"#
    ))
}

/// Ask for the solution every [`POLL_INTERVAL`] until the service has one,
/// reports an error, or [`MAX_POLLS`] checks have passed.
fn poll_until_solved<F>(sleeper: &dyn Sleeper, mut check: F) -> ChallengeResult<String>
where
    F: FnMut() -> ChallengeResult<ServiceReply>,
{
    for _ in 0..MAX_POLLS {
        sleeper.sleep(POLL_INTERVAL);
        let reply = check()?;

        if reply.status == 1 {
            return Ok(reply.request);
        }
        if reply.request != NOT_READY {
            return Err(ChallengeError::Strategy(format!(
                "CAPTCHA service error: {}",
                reply.request
            )));
        }
    }

    Err(ChallengeError::Strategy(
        "CAPTCHA service did not return a solution in time".into(),
    ))
}

/// Solves the widget through a paid CAPTCHA service, then injects the
/// token into a browser to collect the resulting cookies.
pub struct CaptchaSolver {
    api_key: String,
    page_url: String,
    site_url: String,
    options: BrowserOptions,
    sleeper: Arc<dyn Sleeper>,
}

impl CaptchaSolver {
    pub fn new(
        api_key: &str,
        site_url: &str,
        options: BrowserOptions,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let site_url = site_url.trim_end_matches('/').to_string();
        Self {
            api_key: api_key.to_string(),
            page_url: format!("{site_url}{CHALLENGE_PATH}"),
            site_url,
            options,
            sleeper,
        }
    }

    fn fetch_sitekey(&self) -> ChallengeResult<String> {
        let html = Client::builder()
            .timeout(POLL_TIMEOUT)
            .user_agent(PAGE_USER_AGENT)
            .build()?
            .get(&self.page_url)
            .send()?
            .text()?;

        extract_sitekey(&html)
            .ok_or_else(|| ChallengeError::Strategy("Could not find sitekey in page HTML".into()))
    }

    fn submit(&self, sitekey: &str) -> ChallengeResult<String> {
        let reply: ServiceReply = Client::builder()
            .timeout(SUBMIT_TIMEOUT)
            .build()?
            .post(SUBMIT_URL)
            .form(&[
                ("key", self.api_key.as_str()),
                ("method", "turnstile"),
                ("sitekey", sitekey),
                ("pageurl", self.page_url.as_str()),
                ("json", "1"),
            ])
            .send()?
            .json()?;

        if reply.status != 1 {
            return Err(ChallengeError::Strategy(format!(
                "CAPTCHA submit failed: {}",
                reply.request
            )));
        }
        Ok(reply.request)
    }

    fn poll(&self, task_id: &str) -> ChallengeResult<String> {
        let client = Client::builder().timeout(POLL_TIMEOUT).build()?;

        poll_until_solved(self.sleeper.as_ref(), || {
            Ok(client
                .get(RESULT_URL)
                .query(&[
                    ("key", self.api_key.as_str()),
                    ("action", "get"),
                    ("id", task_id),
                    ("json", "1"),
                ])
                .send()?
                .json()?)
        })
    }

    fn inject(&self, token: &str) -> ChallengeResult<Credentials> {
        let page = ChallengePage::open(&self.site_url, &self.options, self.sleeper.clone())?;
        self.sleeper.sleep(Duration::from_secs(3));
        page.evaluate(&injection_script(token)?)?;
        self.sleeper.sleep(INJECT_SETTLE);
        page.wait_for_clearance(INJECT_WAIT, false)?;
        page.harvest()
    }
}

impl ChallengeSolver for CaptchaSolver {
    fn name(&self) -> &str {
        "2Captcha"
    }

    fn solve(&self) -> ChallengeResult<Credentials> {
        let sitekey = self.fetch_sitekey()?;
        info!(sitekey = %sitekey.chars().take(20).collect::<String>(), "Submitting widget to CAPTCHA service");

        let task_id = self.submit(&sitekey)?;
        info!(task_id = %task_id, "CAPTCHA task submitted, polling");

        let token = self.poll(&task_id)?;
        info!("CAPTCHA solved, injecting token via browser");

        self.inject(&token)?.require_clearance(self.name())
    }
}
