use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{CHALLENGE_PATH, ChallengeError, ChallengeResult, ChallengeSolver, Credentials};

/// FlareSolverr gives up on its own after this many milliseconds.
const MAX_TIMEOUT_MS: u64 = 90_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
struct SolveRequest<'a> {
    cmd: &'a str,
    url: String,
    #[serde(rename = "maxTimeout")]
    max_timeout: u64,
}

#[derive(Debug, Deserialize)]
struct SolveResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    solution: Option<Solution>,
}

#[derive(Debug, Deserialize)]
struct Solution {
    #[serde(default)]
    cookies: Vec<SolutionCookie>,
    #[serde(rename = "userAgent", default)]
    user_agent: String,
}

#[derive(Debug, Deserialize)]
struct SolutionCookie {
    name: String,
    value: String,
}

/// Delegates the challenge to an external FlareSolverr service.
pub struct FlareSolverrSolver {
    endpoint: String,
    target: String,
}

impl FlareSolverrSolver {
    pub fn new(endpoint: &str, site_url: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            target: format!("{}{}", site_url.trim_end_matches('/'), CHALLENGE_PATH),
        }
    }

    fn parse(body: &str) -> ChallengeResult<Credentials> {
        let response: SolveResponse = serde_json::from_str(body)?;
        if response.status != "ok" {
            return Err(ChallengeError::Strategy(format!(
                "FlareSolverr returned status={}: {}",
                response.status,
                response.message.unwrap_or_default()
            )));
        }

        let solution = response
            .solution
            .ok_or_else(|| ChallengeError::Strategy("FlareSolverr response has no solution".into()))?;

        let cookies: BTreeMap<String, String> = solution
            .cookies
            .into_iter()
            .map(|c| (c.name, c.value))
            .collect();

        Ok(Credentials::new(cookies, solution.user_agent))
    }
}

impl ChallengeSolver for FlareSolverrSolver {
    fn name(&self) -> &str {
        "FlareSolverr"
    }

    fn solve(&self) -> ChallengeResult<Credentials> {
        info!(endpoint = %self.endpoint, "FlareSolverr request");

        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let body = client
            .post(&self.endpoint)
            .json(&SolveRequest {
                cmd: "request.get",
                url: self.target.clone(),
                max_timeout: MAX_TIMEOUT_MS,
            })
            .send()?
            .text()?;

        let credentials = Self::parse(&body)?.require_clearance(self.name())?;
        info!(
            cookies = credentials.cookies().len(),
            user_agent = %credentials.fingerprint().chars().take(60).collect::<String>(),
            "FlareSolverr OK"
        );
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_solution() {
        let body = r#"{
            "status": "ok",
            "solution": {
                "cookies": [
                    {"name": "cf_clearance", "value": "abc", "domain": ".k-ruoka.fi"},
                    {"name": "__cf_bm", "value": "def"}
                ],
                "userAgent": "Mozilla/5.0 Test"
            }
        }"#;

        let creds = FlareSolverrSolver::parse(body).unwrap();
        assert!(creds.has_clearance());
        assert_eq!(creds.fingerprint(), "Mozilla/5.0 Test");
        assert_eq!(creds.cookies().len(), 2);
    }

    #[test]
    fn test_parse_error_status() {
        let body = r#"{"status": "error", "message": "Challenge not solved"}"#;
        let err = FlareSolverrSolver::parse(body).unwrap_err();
        assert!(err.to_string().contains("Challenge not solved"));
    }

    #[test]
    fn test_target_url() {
        let solver = FlareSolverrSolver::new("http://localhost:8191/v1", "https://www.k-ruoka.fi/");
        assert_eq!(solver.target, "https://www.k-ruoka.fi/kauppa");
    }
}
